#![deny(unused_must_use)]
#![allow(clippy::upper_case_acronyms)]
// Don't allow dbg! prints in release.
#![cfg_attr(not(debug_assertions), deny(clippy::dbg_macro))]

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{Config, ProviderConfig, ProviderOptions};
pub use engine::{
    EngineState, EngineStats, StopHandle, StopSignal, TailingEngine, stop_signal,
};
pub use event::{Discontinuity, Event};
pub use evt_record::{EventType, Record, UserSid};
pub use log_file::LogFile;
pub use log_file_header::{HeaderFlags, LogFileHeader};
pub use message::{MessageFileSet, MessageResolver, MessageTable, Resolution, ResolutionStatus};
pub use publisher::{CollectingPublisher, JsonLinesPublisher, Publisher};
pub use registry::{LogRegistration, Registry, RegistryData, SourceRegistration};
pub use session::{Batch, Session, SkippedRecord};
pub use settings::{EngineSettings, RetrySettings, StartPosition};
pub use writer::EventLogWriter;

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod err;
pub mod event;
pub mod evt_record;
pub mod log_file;
pub mod log_file_header;
pub mod message;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod settings;
mod utils;
pub mod writer;

#[cfg(test)]
use std::sync::Once;
#[cfg(test)]
static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
#[cfg(test)]
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}
