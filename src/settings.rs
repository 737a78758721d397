use encoding::EncodingRef;
use encoding::types::Encoding;
use serde::{Deserialize, Serialize};

use std::fmt::{self, Debug};
use std::str::FromStr;
use std::time::Duration;

/// `ReadEventLog` never returns more than this many bytes in one call.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 0x7FFFF;

/// Where an engine starts when its provider has no checkpoint yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Deliver every record currently in the log.
    #[default]
    Beginning,
    /// Skip what is already there and only deliver new records.
    End,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "beginning" | "start" | "oldest" => Ok(StartPosition::Beginning),
            "end" | "newest" | "tail" => Ok(StartPosition::End),
            other => Err(format!("unknown start position `{other}`")),
        }
    }
}

/// Exponential backoff between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before the engine gives up.
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetrySettings {
    /// Delay before attempt `attempt + 1`, where `attempt` counts the failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct EngineSettings {
    /// Maximum number of records per batch.
    batch_size: usize,
    /// Maximum number of bytes read per batch.
    max_batch_bytes: usize,
    poll_interval: Duration,
    start_position: StartPosition,
    retry: RetrySettings,
    /// Preferred language of message templates, `0` for language neutral.
    language_id: u32,
    /// Codec used to decode ANSI message table entries.
    ansi_codec: EncodingRef,
    /// `0` - use the global thread pool for message resolution.
    num_threads: usize,
}

impl Debug for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSettings")
            .field("batch_size", &self.batch_size)
            .field("max_batch_bytes", &self.max_batch_bytes)
            .field("poll_interval", &self.poll_interval)
            .field("start_position", &self.start_position)
            .field("retry", &self.retry)
            .field("language_id", &self.language_id)
            .field("ansi_codec", &self.ansi_codec.name())
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl PartialEq for EngineSettings {
    fn eq(&self, other: &Self) -> bool {
        self.ansi_codec.name() == other.ansi_codec.name()
            && self.batch_size == other.batch_size
            && self.max_batch_bytes == other.max_batch_bytes
            && self.poll_interval == other.poll_interval
            && self.start_position == other.start_position
            && self.retry == other.retry
            && self.language_id == other.language_id
            && self.num_threads == other.num_threads
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            batch_size: 100,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            poll_interval: Duration::from_secs(1),
            start_position: StartPosition::Beginning,
            retry: RetrySettings::default(),
            language_id: 0,
            ansi_codec: encoding::all::WINDOWS_1252,
            num_threads: 0,
        }
    }
}

impl EngineSettings {
    pub fn new() -> Self {
        EngineSettings::default()
    }

    /// Sets the number of records read per batch. `0` is treated as `1`.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes.max(1);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn language_id(mut self, language_id: u32) -> Self {
        self.language_id = language_id;
        self
    }

    pub fn ansi_codec(mut self, ansi_codec: EncodingRef) -> Self {
        self.ansi_codec = ansi_codec;
        self
    }

    /// Sets the number of worker threads used to resolve messages.
    /// `0` will use the global rayon pool.
    ///
    /// Has no effect without the `multithreading` feature.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = if cfg!(feature = "multithreading") {
            num_threads
        } else {
            1
        };
        self
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get_max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    pub fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn get_start_position(&self) -> StartPosition {
        self.start_position
    }

    pub fn get_retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn get_language_id(&self) -> u32 {
        self.language_id
    }

    pub fn get_ansi_codec(&self) -> EncodingRef {
        self.ansi_codec
    }

    pub fn get_num_threads(&self) -> usize {
        self.num_threads
    }
}
