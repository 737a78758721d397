use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Errors raised while decoding a single `EVENTLOGRECORD`.
///
/// A record that fails to decode is never partially usable.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(
        "truncated record: reading {what} at offset {offset} needs {need} bytes, {have} available"
    )]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("malformed record: {reason}")]
    Malformed { reason: String },
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the on-disk log container.
#[derive(Debug, Error)]
pub enum LogFileError {
    #[error("An I/O error has occurred: {0}")]
    Io(#[from] io::Error),

    #[error("invalid log file header: {reason}")]
    InvalidHeader { reason: String },

    #[error("record of {size} bytes does not fit in the log (max size {max_size})")]
    LogFull { size: usize, max_size: u32 },

    #[error("failed to encode record: {0}")]
    Encode(#[from] DecodeError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to access registry file `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("registry file `{}` is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("`{name}` is not a valid log or source name")]
    InvalidName { name: String },
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to open log `{log}` at `{}`: {source}", path.display())]
    LogFile {
        log: String,
        path: PathBuf,
        source: LogFileError,
    },
}

#[derive(Debug, Error)]
pub enum ReadError {
    /// The log was cleared or replaced while the session was open.
    #[error("log `{log}` was cleared or rotated while it was being read")]
    Invalidated { log: String },

    /// The framing of the log is damaged; the next record boundary is unknown.
    #[error("log `{log}` is corrupt at offset {offset}: {reason}")]
    Corrupt {
        log: String,
        offset: u64,
        reason: String,
    },

    #[error("session is closed")]
    Closed,

    #[error("An I/O error has occurred: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while loading a message file.
///
/// These never escape the resolver: a file that fails to load is treated as a
/// file without templates.
#[derive(Debug, Error)]
pub enum MessageFileError {
    #[error("failed to read message file `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("input is not a valid PE file: {message}")]
    InvalidPe { message: &'static str },

    #[error("malformed PE file: {message}")]
    MalformedPe { message: &'static str },

    #[error("failed to map RVA 0x{rva:08x} to a file offset")]
    UnmappedRva { rva: u32 },

    #[error("resource directory is malformed: {message}")]
    MalformedResource { message: &'static str },

    #[error("failed to decode UTF-16 resource name")]
    InvalidResourceName,

    #[error("message table is malformed: {message}")]
    MalformedTable { message: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to access checkpoint `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("checkpoint `{}` is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher rejected the batch: {0}")]
    Rejected(String),

    #[error("An I/O error has occurred: {0}")]
    Io(#[from] io::Error),

    #[error("`serde_json` failed with error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that stop an engine. Everything else is handled inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider `{provider}` is unavailable after {attempts} attempts: {source}")]
    ProviderUnavailable {
        provider: String,
        attempts: u32,
        source: OpenError,
    },

    #[error("failed to persist checkpoint for provider `{provider}`: {source}")]
    Checkpoint {
        provider: String,
        source: CheckpointError,
    },

    #[error("publisher failed {attempts} times in a row for provider `{provider}`: {source}")]
    PublisherUnavailable {
        provider: String,
        attempts: u32,
        source: PublishError,
    },

    #[error("reading provider `{provider}` failed {attempts} times in a row: {source}")]
    ReadFailed {
        provider: String,
        attempts: u32,
        source: ReadError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("config file `{}` is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}
