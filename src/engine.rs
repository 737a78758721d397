//! The tailing engine: a state machine that reads one provider's log, resolves messages, hands
//! events to a publisher and persists its position.
//!
//! ```text
//! Idle -> Opening -> Reading <-> Waiting
//!            |         |  ^        |
//!            |         v  |        |
//!            +----> Recovering <---+
//! (any running state) -> Closing (flush checkpoint) -> Idle
//! ```
//!
//! Events are published in record order and the checkpoint only advances after the publisher
//! accepted a batch, so a restart resumes exactly after the last delivered record.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::err::{EngineError, OpenError, PublishError, ReadError};
use crate::event::{Discontinuity, Event};
use crate::evt_record::Record;
use crate::message::{MessageFileSet, MessageResolver};
use crate::publisher::Publisher;
use crate::registry::{Registry, SourceMessageFiles};
use crate::session::Session;
use crate::settings::{EngineSettings, StartPosition};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use hashbrown::HashMap;
use jiff::Timestamp;
use log::{debug, error, info, trace, warn};

#[cfg(feature = "multithreading")]
use rayon::prelude::*;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    Opening,
    Reading,
    Waiting,
    Recovering,
    Closing,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Opening => "opening",
            EngineState::Reading => "reading",
            EngineState::Waiting => "waiting",
            EngineState::Recovering => "recovering",
            EngineState::Closing => "closing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Events accepted by the publisher.
    pub emitted: u64,
    /// Records that could not be decoded.
    pub skipped: u64,
    /// Events published with a fallback message.
    pub unresolved: u64,
    pub discontinuities: u64,
    /// Non-empty batches read.
    pub batches: u64,
    pub publish_failures: u64,
}

/// Cancellation for running engines. Cheap to clone; all clones observe the same stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: Receiver<()>,
}

/// Triggers the [`StopSignal`]s created with it.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Arc<Mutex<Option<Sender<()>>>>,
}

/// Create a connected stop handle and signal.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (sender, receiver) = crossbeam_channel::bounded(0);
    (
        StopHandle {
            sender: Arc::new(Mutex::new(Some(sender))),
        },
        StopSignal { receiver },
    )
}

impl StopHandle {
    /// Stop every engine watching the matching signal. Stopping twice is a no-op.
    pub fn stop(&self) {
        // Dropping the only sender disconnects every receiver at once.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> StopSignal {
        StopSignal {
            receiver: crossbeam_channel::never(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(
            self.receiver.try_recv(),
            Ok(()) | Err(TryRecvError::Disconnected)
        )
    }

    /// Sleep for `duration` or until stopped. Returns `true` when stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        !matches!(
            self.receiver.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Open,
    Read,
    Publish,
}

/// Consecutive failures per operation. Each resets on its own success.
#[derive(Debug, Clone, Copy, Default)]
struct Failures {
    open: u32,
    read: u32,
    publish: u32,
}

impl Failures {
    fn of(&mut self, operation: Operation) -> &mut u32 {
        match operation {
            Operation::Open => &mut self.open,
            Operation::Read => &mut self.read,
            Operation::Publish => &mut self.publish,
        }
    }
}

/// Why the engine is recovering: where it was, for the discontinuity marker.
#[derive(Debug, Clone)]
struct RecoveryCause {
    log_name: String,
    previous_record_number: u32,
    previous_log_created: Option<Timestamp>,
}

pub struct TailingEngine<P: Publisher, C: CheckpointStore> {
    provider: String,
    registry: Registry,
    settings: EngineSettings,
    resolver: MessageResolver,
    publisher: P,
    checkpoints: C,

    state: EngineState,
    session: Option<Session>,
    /// Last persisted checkpoint, loaded once.
    checkpoint: Option<Checkpoint>,
    checkpoint_loaded: bool,
    recovery: Option<RecoveryCause>,
    failures: Failures,
    stats: EngineStats,

    #[cfg(feature = "multithreading")]
    thread_pool: Option<rayon::ThreadPool>,
}

impl<P: Publisher, C: CheckpointStore> fmt::Debug for TailingEngine<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailingEngine")
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("checkpoint", &self.checkpoint)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<P: Publisher, C: CheckpointStore> TailingEngine<P, C> {
    pub fn new(
        registry: Registry,
        provider: impl Into<String>,
        settings: EngineSettings,
        publisher: P,
        checkpoints: C,
    ) -> Self {
        let resolver =
            MessageResolver::new(settings.get_language_id(), settings.get_ansi_codec());

        #[cfg(feature = "multithreading")]
        let thread_pool = match settings.get_num_threads() {
            0 => None,
            n => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| warn!("failed to create a thread pool, using the global one: {e}"))
                .ok(),
        };

        TailingEngine {
            provider: provider.into(),
            registry,
            settings,
            resolver,
            publisher,
            checkpoints,
            state: EngineState::Idle,
            session: None,
            checkpoint: None,
            checkpoint_loaded: false,
            recovery: None,
            failures: Failures::default(),
            stats: EngineStats::default(),
            #[cfg(feature = "multithreading")]
            thread_pool,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// The last persisted checkpoint.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    pub fn into_publisher(self) -> P {
        self.publisher
    }

    /// Leave `Idle`. The next [`TailingEngine::step`] opens the log.
    pub fn start(&mut self) {
        if self.state == EngineState::Idle {
            self.failures = Failures::default();
            self.set_state(EngineState::Opening);
        }
    }

    /// Run until stopped or until a fatal error.
    pub fn run(&mut self, stop: &StopSignal) -> Result<EngineStats, EngineError> {
        self.start();
        while self.step(stop)? != EngineState::Idle {}
        info!(
            "engine for `{}` stopped: {} emitted, {} skipped, {} unresolved, {} discontinuities",
            self.provider,
            self.stats.emitted,
            self.stats.skipped,
            self.stats.unresolved,
            self.stats.discontinuities
        );
        Ok(self.stats)
    }

    /// Perform a single transition and return the new state.
    ///
    /// May block for the poll interval or a retry backoff, both of which end early when `stop`
    /// fires. A fatal error closes the engine and leaves it `Idle`.
    pub fn step(&mut self, stop: &StopSignal) -> Result<EngineState, EngineError> {
        let running = !matches!(self.state, EngineState::Idle | EngineState::Closing);
        if running && stop.is_stopped() {
            self.set_state(EngineState::Closing);
            return Ok(self.state);
        }

        let next = match self.state {
            EngineState::Idle => Ok(EngineState::Idle),
            EngineState::Opening => self.open(stop),
            EngineState::Reading => self.read(stop),
            EngineState::Waiting => Ok(if stop.sleep(self.settings.get_poll_interval()) {
                EngineState::Closing
            } else {
                EngineState::Reading
            }),
            EngineState::Recovering => self.recover(stop),
            EngineState::Closing => {
                let flushed = self.flush_checkpoint();
                self.close();
                flushed.map(|()| EngineState::Idle)
            }
        };

        match next {
            Ok(state) => {
                self.set_state(state);
                Ok(state)
            }
            Err(e) => {
                error!("engine for `{}` failed: {}", self.provider, e);
                self.close();
                self.set_state(EngineState::Idle);
                Err(e)
            }
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            trace!("`{}`: {} -> {}", self.provider, self.state, state);
            self.state = state;
        }
    }

    /// Count a failure of `operation` and sleep before the next attempt. Returns
    /// `Err(attempts)` when the retry budget is spent, `Ok(true)` when stopped while waiting.
    fn backoff(&mut self, operation: Operation, stop: &StopSignal) -> Result<bool, u32> {
        let failures = self.failures.of(operation);
        *failures += 1;
        let attempts = *failures;

        let retry = self.settings.get_retry();
        if attempts >= retry.max_attempts {
            return Err(attempts);
        }
        let delay = retry.backoff(attempts);
        debug!(
            "`{}`: {:?} attempt {} failed, retrying in {:?}",
            self.provider, operation, attempts, delay
        );
        Ok(stop.sleep(delay))
    }

    fn open_session(&self, resume_after: u32) -> Result<Session, OpenError> {
        Ok(Session::open(&self.registry, &self.provider, resume_after)?
            .with_batch_limits(
                self.settings.get_batch_size(),
                self.settings.get_max_batch_bytes(),
            ))
    }

    fn open(&mut self, stop: &StopSignal) -> Result<EngineState, EngineError> {
        if !self.checkpoint_loaded {
            self.checkpoint = self
                .checkpoints
                .load(&self.provider)
                .map_err(|source| EngineError::Checkpoint {
                    provider: self.provider.clone(),
                    source,
                })?;
            self.checkpoint_loaded = true;
            match &self.checkpoint {
                Some(cp) => info!(
                    "`{}`: resuming after record {}",
                    self.provider, cp.last_record_number
                ),
                None => info!(
                    "`{}`: no checkpoint, starting at {:?}",
                    self.provider,
                    self.settings.get_start_position()
                ),
            }
        }

        let resume_after = self
            .checkpoint
            .as_ref()
            .map_or(0, |cp| cp.last_record_number);

        let mut session = match self.open_session(resume_after) {
            Ok(session) => session,
            Err(e) => {
                warn!("`{}`: failed to open log: {}", self.provider, e);
                return match self.backoff(Operation::Open, stop) {
                    Ok(true) => Ok(EngineState::Closing),
                    Ok(false) => Ok(EngineState::Opening),
                    Err(attempts) => Err(EngineError::ProviderUnavailable {
                        provider: self.provider.clone(),
                        attempts,
                        source: e,
                    }),
                };
            }
        };

        let newest = match session.newest_record_number() {
            Ok(newest) => newest,
            Err(ReadError::Invalidated { .. }) => {
                // Cleared between open and now; try again.
                return Ok(EngineState::Opening);
            }
            Err(e) => {
                warn!("`{}`: failed to read log header: {}", self.provider, e);
                return match self.backoff(Operation::Read, stop) {
                    Ok(true) => Ok(EngineState::Closing),
                    Ok(false) => Ok(EngineState::Opening),
                    Err(attempts) => Err(EngineError::ReadFailed {
                        provider: self.provider.clone(),
                        attempts,
                        source: e,
                    }),
                };
            }
        };
        self.failures.open = 0;

        let created = session.log_created();
        let log_name = session.log_name().to_string();

        match self.checkpoint.clone() {
            Some(cp) if cp.last_record_number > 0 => {
                let other_log = cp.log_created.is_some_and(|c| c != created);
                if other_log || cp.last_record_number > newest {
                    info!(
                        "`{}`: checkpoint at record {} does not match log `{}` (newest {}, created {})",
                        self.provider, cp.last_record_number, log_name, newest, created
                    );
                    self.recovery = Some(RecoveryCause {
                        log_name,
                        previous_record_number: cp.last_record_number,
                        previous_log_created: cp.log_created,
                    });
                    self.session = Some(session);
                    return Ok(EngineState::Recovering);
                }
            }
            Some(_) => {}
            None if self.settings.get_start_position() == StartPosition::End => {
                let last = session.skip_to_end().map_err(|source| EngineError::ReadFailed {
                    provider: self.provider.clone(),
                    attempts: 1,
                    source,
                })?;
                self.save_checkpoint(Checkpoint {
                    provider: self.provider.clone(),
                    last_record_number: last,
                    log_created: Some(created),
                })?;
                info!(
                    "`{}`: skipped to the end of `{}` (record {})",
                    self.provider, log_name, last
                );
            }
            None => {}
        }

        self.session = Some(session);
        Ok(EngineState::Reading)
    }

    fn read(&mut self, stop: &StopSignal) -> Result<EngineState, EngineError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(EngineState::Opening);
        };

        let batch = match session.read_batch() {
            Ok(batch) => batch,
            Err(ReadError::Invalidated { log }) => {
                let previous = self.checkpoint.as_ref();
                self.recovery = Some(RecoveryCause {
                    log_name: log,
                    previous_record_number: previous.map_or(0, |cp| cp.last_record_number),
                    previous_log_created: previous.and_then(|cp| cp.log_created),
                });
                return Ok(EngineState::Recovering);
            }
            Err(ReadError::Closed) => return Ok(EngineState::Opening),
            Err(e) => {
                warn!("`{}`: read failed: {}", self.provider, e);
                self.close_session();
                return match self.backoff(Operation::Read, stop) {
                    Ok(true) => Ok(EngineState::Closing),
                    Ok(false) => Ok(EngineState::Opening),
                    Err(attempts) => Err(EngineError::ReadFailed {
                        provider: self.provider.clone(),
                        attempts,
                        source: e,
                    }),
                };
            }
        };

        self.failures.read = 0;
        if batch.is_empty() {
            return Ok(EngineState::Waiting);
        }
        self.stats.batches += 1;
        self.stats.skipped += batch.skipped.len() as u64;

        let log_created = session.log_created();
        let log_name = session.log_name().to_string();
        let last_record_number = batch.last_record_number();

        let mut files: HashMap<String, SourceMessageFiles> = HashMap::new();
        for record in &batch.records {
            if !files.contains_key(&record.source_name) {
                files.insert(
                    record.source_name.clone(),
                    session.message_files(&record.source_name),
                );
            }
        }

        let events = self.resolve_records(&log_name, &files, batch.records);
        let unresolved = events.iter().filter(|e| e.resolved_file().is_none()).count() as u64;
        let count = events.len() as u64;

        if !events.is_empty() {
            if let Err(e) = self.publisher.publish(events) {
                return self.publish_failed(stop, e);
            }
        }
        self.failures.publish = 0;
        self.stats.emitted += count;
        self.stats.unresolved += unresolved;

        if let Some(last) = last_record_number {
            self.save_checkpoint(Checkpoint {
                provider: self.provider.clone(),
                last_record_number: last,
                log_created: Some(log_created),
            })?;
        }
        Ok(EngineState::Reading)
    }

    /// Redeliver from the last checkpoint after a backoff.
    fn publish_failed(
        &mut self,
        stop: &StopSignal,
        e: PublishError,
    ) -> Result<EngineState, EngineError> {
        self.stats.publish_failures += 1;
        warn!("`{}`: publisher failed: {}", self.provider, e);
        self.close_session();
        match self.backoff(Operation::Publish, stop) {
            Ok(true) => Ok(EngineState::Closing),
            Ok(false) => Ok(EngineState::Opening),
            Err(attempts) => Err(EngineError::PublisherUnavailable {
                provider: self.provider.clone(),
                attempts,
                source: e,
            }),
        }
    }

    fn resolve_records(
        &self,
        log_name: &str,
        files: &HashMap<String, SourceMessageFiles>,
        records: Vec<Record>,
    ) -> Vec<Event> {
        let resolver = &self.resolver;
        let provider = self.provider.as_str();
        let resolve = |record: Record| resolve_record(resolver, provider, log_name, files, record);

        #[cfg(feature = "multithreading")]
        {
            match &self.thread_pool {
                Some(pool) => pool.install(|| records.into_par_iter().map(resolve).collect()),
                None => records.into_par_iter().map(resolve).collect(),
            }
        }
        #[cfg(not(feature = "multithreading"))]
        {
            records.into_iter().map(resolve).collect()
        }
    }

    fn recover(&mut self, stop: &StopSignal) -> Result<EngineState, EngineError> {
        self.close_session();

        let session = match self.open_session(0) {
            Ok(session) => session,
            Err(e) => {
                warn!("`{}`: failed to reopen log: {}", self.provider, e);
                return match self.backoff(Operation::Open, stop) {
                    Ok(true) => Ok(EngineState::Closing),
                    Ok(false) => Ok(EngineState::Recovering),
                    Err(attempts) => Err(EngineError::ProviderUnavailable {
                        provider: self.provider.clone(),
                        attempts,
                        source: e,
                    }),
                };
            }
        };

        let cause = self.recovery.clone().unwrap_or_else(|| RecoveryCause {
            log_name: session.log_name().to_string(),
            previous_record_number: self
                .checkpoint
                .as_ref()
                .map_or(0, |cp| cp.last_record_number),
            previous_log_created: self.checkpoint.as_ref().and_then(|cp| cp.log_created),
        });
        let marker = Discontinuity {
            provider: self.provider.clone(),
            log_name: cause.log_name,
            previous_record_number: cause.previous_record_number,
            previous_log_created: cause.previous_log_created,
            log_created: Some(session.log_created()),
        };
        warn!(
            "`{}`: {}, restarting from the oldest record",
            self.provider, marker
        );

        if let Err(e) = self.publisher.discontinuity(&marker) {
            self.stats.publish_failures += 1;
            warn!("`{}`: publisher failed: {}", self.provider, e);
            return match self.backoff(Operation::Publish, stop) {
                Ok(true) => Ok(EngineState::Closing),
                Ok(false) => Ok(EngineState::Recovering),
                Err(attempts) => Err(EngineError::PublisherUnavailable {
                    provider: self.provider.clone(),
                    attempts,
                    source: e,
                }),
            };
        }

        self.failures.open = 0;
        self.failures.publish = 0;
        self.recovery = None;
        self.stats.discontinuities += 1;
        self.save_checkpoint(Checkpoint {
            provider: self.provider.clone(),
            last_record_number: 0,
            log_created: marker.log_created,
        })?;
        self.session = Some(session);
        Ok(EngineState::Reading)
    }

    fn save_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        self.checkpoints
            .save(&checkpoint)
            .map_err(|source| EngineError::Checkpoint {
                provider: self.provider.clone(),
                source,
            })?;
        self.checkpoint = Some(checkpoint);
        Ok(())
    }

    /// Persist the last checkpoint once more before closing.
    fn flush_checkpoint(&mut self) -> Result<(), EngineError> {
        match self.checkpoint.clone() {
            Some(checkpoint) => self.save_checkpoint(checkpoint),
            None => Ok(()),
        }
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn close(&mut self) {
        self.close_session();
        self.resolver.clear_cache();
        debug!("`{}`: closed", self.provider);
    }
}

fn resolve_record(
    resolver: &MessageResolver,
    provider: &str,
    log_name: &str,
    files: &HashMap<String, SourceMessageFiles>,
    record: Record,
) -> Event {
    let unregistered;
    let files = match files.get(&record.source_name) {
        Some(files) => files,
        None => {
            unregistered = SourceMessageFiles {
                event: MessageFileSet::empty(provider, record.source_name.as_str()),
                ..SourceMessageFiles::default()
            };
            &unregistered
        }
    };

    let inserts = resolver.expand_parameter_inserts(&files.parameter, &record.parameters);
    let resolution = resolver.resolve(&files.event, record.event_code, record.qualifier, &inserts);
    let category = resolver.resolve_category(&files.category, record.event_category);
    Event::from_record(
        provider,
        log_name,
        record,
        resolution.message,
        resolution.status,
        category,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_wakes_every_clone() {
        let (handle, signal) = stop_signal();
        let other = signal.clone();
        assert!(!signal.is_stopped());
        assert!(!signal.sleep(Duration::from_millis(1)));

        handle.stop();
        handle.stop();
        assert!(signal.is_stopped());
        assert!(other.is_stopped());
        assert!(other.sleep(Duration::from_secs(60)));
    }

    #[test]
    fn test_never_signal() {
        let signal = StopSignal::never();
        assert!(!signal.is_stopped());
        assert!(!signal.sleep(Duration::from_millis(1)));
    }
}
