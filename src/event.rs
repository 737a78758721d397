use crate::evt_record::{EventType, Record};
use crate::message::ResolutionStatus;

use jiff::Timestamp;
use serde::Serialize;

use std::fmt;
use std::path::PathBuf;

/// A record together with its rendered message, as handed to a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub provider: String,
    pub log_name: String,
    pub record_number: u32,
    /// Composite id, `(qualifier << 16) | code`.
    pub event_id: u32,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub source_name: String,
    pub computer_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_sid: Option<String>,
    /// When the event was generated.
    pub timestamp: Timestamp,
    pub time_written: Timestamp,
    pub message: String,
    pub resolution: ResolutionStatus,
    pub parameters: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw_data: Vec<u8>,
}

impl Event {
    pub fn from_record(
        provider: &str,
        log_name: &str,
        record: Record,
        message: String,
        resolution: ResolutionStatus,
        category: Option<String>,
    ) -> Event {
        Event {
            provider: provider.to_string(),
            log_name: log_name.to_string(),
            record_number: record.record_number,
            event_id: record.event_id(),
            event_type: record.event_type,
            category,
            source_name: record.source_name,
            computer_name: record.computer_name,
            user_sid: record.user_sid.map(|sid| sid.to_string()),
            timestamp: record.time_generated,
            time_written: record.time_written,
            message,
            resolution,
            parameters: record.parameters,
            raw_data: record.raw_data,
        }
    }

    /// The 16-bit event code, without the qualifier.
    pub fn event_code(&self) -> u16 {
        Record::split_event_id(self.event_id).0
    }

    pub fn resolved_file(&self) -> Option<&PathBuf> {
        match &self.resolution {
            ResolutionStatus::Resolved { file } => Some(file),
            ResolutionStatus::Fallback => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventID={} Type={} Source={} Message={}",
            self.event_id, self.event_type, self.source_name, self.message
        )
    }
}

/// Marker emitted when the engine had to restart a log from its beginning, because the log was
/// cleared or rotated underneath it. Events between the previous position and the restart may
/// have been lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discontinuity {
    pub provider: String,
    pub log_name: String,
    /// Last record number delivered before the discontinuity.
    pub previous_record_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_log_created: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_created: Option<Timestamp>,
}

impl fmt::Display for Discontinuity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "log `{}` restarted after record {}",
            self.log_name, self.previous_record_number
        )
    }
}
