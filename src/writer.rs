//! Appends events to a log, the way `ReportEvent` does for a registered event source.

use crate::err::{LogFileError, OpenError};
use crate::evt_record::{EventType, Record, UserSid};
use crate::log_file::LogFile;
use crate::registry::Registry;

use jiff::Timestamp;
use log::{debug, warn};

use std::env;
use std::path::Path;

/// Name of the local machine as stamped into written records.
pub fn local_computer_name() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug)]
pub struct EventLogWriter {
    log_name: String,
    source_name: String,
    computer_name: String,
    file: LogFile,
}

impl EventLogWriter {
    /// Open the log `source` is registered in. Unregistered sources write to `Application`.
    pub fn open(registry: &Registry, source: &str) -> Result<EventLogWriter, OpenError> {
        let data = registry.load()?;
        let resolved = data.resolve_provider(source);
        if resolved.fallback {
            warn!(
                "source `{}` is not registered, writing to the `{}` log",
                source, resolved.log_name
            );
        }
        let max_size = data
            .log(&resolved.log_name)
            .map_or(0, |(_, log)| log.max_size);
        let path = registry.log_path(&resolved.log_name)?;
        let file = LogFile::open_or_create(&path, max_size).map_err(|source| OpenError::LogFile {
            log: resolved.log_name.clone(),
            path: path.clone(),
            source,
        })?;

        Ok(EventLogWriter {
            log_name: resolved.log_name,
            source_name: source.to_string(),
            computer_name: local_computer_name(),
            file,
        })
    }

    pub fn with_computer_name(mut self, computer_name: impl Into<String>) -> Self {
        self.computer_name = computer_name.into();
        self
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Write one event and return its record number.
    pub fn report<S: AsRef<str>>(
        &mut self,
        event_type: EventType,
        event_id: u32,
        strings: &[S],
    ) -> Result<u32, LogFileError> {
        self.report_with(event_type, 0, event_id, None, strings, &[])
    }

    /// Write one event with every optional field.
    pub fn report_with<S: AsRef<str>>(
        &mut self,
        event_type: EventType,
        category: u16,
        event_id: u32,
        user_sid: Option<UserSid>,
        strings: &[S],
        raw_data: &[u8],
    ) -> Result<u32, LogFileError> {
        let (event_code, qualifier) = Record::split_event_id(event_id);
        let now = Timestamp::now();
        let mut record = Record {
            record_number: 0,
            time_generated: now,
            time_written: now,
            event_code,
            qualifier,
            event_type,
            event_category: category,
            source_name: self.source_name.clone(),
            computer_name: self.computer_name.clone(),
            user_sid,
            parameters: strings.iter().map(|s| s.as_ref().to_string()).collect(),
            raw_data: raw_data.to_vec(),
        };
        self.report_record(&mut record)
    }

    /// Append a prepared record as is. Its record number is overwritten.
    pub fn report_record(&mut self, record: &mut Record) -> Result<u32, LogFileError> {
        let record_number = self.file.append(record)?;
        debug!(
            "`{}` wrote event {} as record {} of `{}`",
            record.source_name,
            record.event_id(),
            record_number,
            self.log_name
        );
        Ok(record_number)
    }

    pub fn info<S: AsRef<str>>(&mut self, event_id: u32, strings: &[S]) -> Result<u32, LogFileError> {
        self.report(EventType::Info, event_id, strings)
    }

    pub fn success<S: AsRef<str>>(
        &mut self,
        event_id: u32,
        strings: &[S],
    ) -> Result<u32, LogFileError> {
        self.report(EventType::Success, event_id, strings)
    }

    pub fn warning<S: AsRef<str>>(
        &mut self,
        event_id: u32,
        strings: &[S],
    ) -> Result<u32, LogFileError> {
        self.report(EventType::Warning, event_id, strings)
    }

    pub fn error<S: AsRef<str>>(&mut self, event_id: u32, strings: &[S]) -> Result<u32, LogFileError> {
        self.report(EventType::Error, event_id, strings)
    }
}
