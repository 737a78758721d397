//! Decoding and encoding of `EVENTLOGRECORD` entries.
//!
//! This is the record layout returned by `ReadEventLog` and stored back-to-back in a log
//! container. All integers are little-endian and all strings are NUL-terminated UTF-16LE.
//!
//! ```text
//! 0x00 Length               0x1c EventCategory (u16)
//! 0x04 Reserved ("LfLe")    0x1e ReservedFlags (u16)
//! 0x08 RecordNumber         0x20 ClosingRecordNumber
//! 0x0c TimeGenerated        0x24 StringOffset
//! 0x10 TimeWritten          0x28 UserSidLength
//! 0x14 EventID              0x2c UserSidOffset
//! 0x18 EventType (u16)      0x30 DataLength
//! 0x1a NumStrings (u16)     0x34 DataOffset
//! 0x38 SourceName, Computername, UserSid, Strings, Data, Pad, Length
//! ```

use crate::err::{DecodeError, DecodeResult};
use crate::utils::{
    bytes, push_utf16le_z, read_utf16z_r, timestamp_to_unix_secs, unix_secs_to_timestamp,
};

use byteorder::{LittleEndian, WriteBytesExt};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// `Reserved` field of every record (`"LfLe"`).
pub const EVENTLOGRECORD_MAGIC: u32 = 0x654c_664c;
/// Size of the fixed part of a record.
pub const EVENTLOGRECORD_HEADER_SIZE: usize = 0x38;
/// Fixed header, two empty strings and the trailing length.
pub const MIN_RECORD_SIZE: usize = EVENTLOGRECORD_HEADER_SIZE + 2 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Success,
    Error,
    Warning,
    Info,
    AuditSuccess,
    AuditFailure,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Success,
        EventType::Error,
        EventType::Warning,
        EventType::Info,
        EventType::AuditSuccess,
        EventType::AuditFailure,
    ];

    pub fn from_u16(value: u16) -> Option<EventType> {
        match value {
            0x0000 => Some(EventType::Success),
            0x0001 => Some(EventType::Error),
            0x0002 => Some(EventType::Warning),
            0x0004 => Some(EventType::Info),
            0x0008 => Some(EventType::AuditSuccess),
            0x0010 => Some(EventType::AuditFailure),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            EventType::Success => 0x0000,
            EventType::Error => 0x0001,
            EventType::Warning => 0x0002,
            EventType::Info => 0x0004,
            EventType::AuditSuccess => 0x0008,
            EventType::AuditFailure => 0x0010,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Success => "Success",
            EventType::Error => "Error",
            EventType::Warning => "Warning",
            EventType::Info => "Information",
            EventType::AuditSuccess => "Audit Success",
            EventType::AuditFailure => "Audit Failure",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '_', '-'], "").as_str() {
            "success" => Ok(EventType::Success),
            "error" => Ok(EventType::Error),
            "warning" => Ok(EventType::Warning),
            "info" | "information" => Ok(EventType::Info),
            "auditsuccess" => Ok(EventType::AuditSuccess),
            "auditfailure" => Ok(EventType::AuditFailure),
            other => Err(format!("unknown event type `{other}`")),
        }
    }
}

/// Binary SID as stored in a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserSid(Vec<u8>);

impl UserSid {
    pub fn from_bytes(bytes: Vec<u8>) -> DecodeResult<UserSid> {
        if bytes.len() < 8 {
            return Err(bytes::truncated("user sid", 0, 8, bytes.len()));
        }
        let need = 8 + usize::from(bytes[1]) * 4;
        if bytes.len() != need {
            return Err(DecodeError::malformed(format!(
                "user sid has {} sub-authorities but is {} bytes long",
                bytes[1],
                bytes.len()
            )));
        }
        Ok(UserSid(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UserSid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = &self.0;
        let revision = bytes[0];
        let sub_count = bytes[1] as usize;

        // IdentifierAuthority is a 48-bit big-endian integer.
        let mut authority: u64 = 0;
        for &b in &bytes[2..8] {
            authority = (authority << 8) | u64::from(b);
        }

        write!(f, "S-{}-{}", revision, authority)?;

        for i in 0..sub_count {
            let sub = bytes::read_u32_le(bytes, 8 + i * 4).ok_or(fmt::Error)?;
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl FromStr for UserSid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("`{s}` is not a SID string");
        let mut parts = s.split('-');
        if parts.next() != Some("S") {
            return Err(invalid());
        }
        let revision: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let authority: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .filter(|a| *a < (1 << 48))
            .ok_or_else(invalid)?;
        let subs = parts
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if subs.len() > 15 {
            return Err(invalid());
        }

        let mut out = Vec::with_capacity(8 + subs.len() * 4);
        out.push(revision);
        out.push(subs.len() as u8);
        out.extend_from_slice(&authority.to_be_bytes()[2..]);
        for sub in subs {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        Ok(UserSid(out))
    }
}

/// A decoded event log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub record_number: u32,
    pub time_generated: Timestamp,
    pub time_written: Timestamp,
    pub event_code: u16,
    pub qualifier: u16,
    pub event_type: EventType,
    pub event_category: u16,
    pub source_name: String,
    pub computer_name: String,
    pub user_sid: Option<UserSid>,
    pub parameters: Vec<String>,
    pub raw_data: Vec<u8>,
}

impl Record {
    /// The 32-bit Event ID, `(qualifier << 16) | event_code`.
    pub fn event_id(&self) -> u32 {
        (u32::from(self.qualifier) << 16) | u32::from(self.event_code)
    }

    /// Split a 32-bit Event ID into `(event_code, qualifier)`.
    pub fn split_event_id(event_id: u32) -> (u16, u16) {
        ((event_id & 0xffff) as u16, (event_id >> 16) as u16)
    }

    /// Decode a single record from the start of `buf`.
    ///
    /// `buf` may extend past the record; only the declared length is consumed.
    pub fn decode(buf: &[u8]) -> DecodeResult<Record> {
        let length = bytes::read_u32_le_r(buf, 0, "record length")? as usize;
        if length < MIN_RECORD_SIZE {
            return Err(DecodeError::malformed(format!(
                "declared length {length} is smaller than the minimum record size {MIN_RECORD_SIZE}"
            )));
        }
        let record = bytes::slice_r(buf, 0, length, "record")?;

        let magic = bytes::read_u32_le_r(record, 0x04, "record magic")?;
        if magic != EVENTLOGRECORD_MAGIC {
            return Err(DecodeError::malformed(format!(
                "invalid record magic, expected `{EVENTLOGRECORD_MAGIC:08x}`, found `{magic:08x}`"
            )));
        }

        let trailing = bytes::read_u32_le_r(record, length - 4, "trailing length")? as usize;
        if trailing != length {
            return Err(DecodeError::malformed(format!(
                "trailing length {trailing} disagrees with leading length {length}"
            )));
        }

        let record_number = bytes::read_u32_le_r(record, 0x08, "record number")?;
        let time_generated = bytes::read_u32_le_r(record, 0x0c, "time generated")?;
        let time_written = bytes::read_u32_le_r(record, 0x10, "time written")?;
        let event_id = bytes::read_u32_le_r(record, 0x14, "event id")?;
        let raw_event_type = bytes::read_u16_le_r(record, 0x18, "event type")?;
        let num_strings = bytes::read_u16_le_r(record, 0x1a, "string count")?;
        let event_category = bytes::read_u16_le_r(record, 0x1c, "event category")?;
        let string_offset = bytes::read_u32_le_r(record, 0x24, "string offset")? as usize;
        let sid_length = bytes::read_u32_le_r(record, 0x28, "user sid length")? as usize;
        let sid_offset = bytes::read_u32_le_r(record, 0x2c, "user sid offset")? as usize;
        let data_length = bytes::read_u32_le_r(record, 0x30, "data length")? as usize;
        let data_offset = bytes::read_u32_le_r(record, 0x34, "data offset")? as usize;

        let event_type = EventType::from_u16(raw_event_type).ok_or_else(|| {
            DecodeError::malformed(format!("unknown event type 0x{raw_event_type:04x}"))
        })?;

        // Variable-length fields live between the fixed header and the trailing length.
        let body_end = length - 4;
        let body = &record[..body_end];

        let (source_name, used) =
            read_utf16z_r(record, EVENTLOGRECORD_HEADER_SIZE, body_end, "source name")?;
        let (computer_name, _) = read_utf16z_r(
            record,
            EVENTLOGRECORD_HEADER_SIZE + used,
            body_end,
            "computer name",
        )?;

        let user_sid = if sid_length > 0 {
            let sid = bytes::slice_r(body, sid_offset, sid_length, "user sid")?;
            Some(UserSid::from_bytes(sid.to_vec())?)
        } else {
            None
        };

        let mut parameters = Vec::with_capacity(usize::from(num_strings));
        let mut pos = string_offset;
        for _ in 0..num_strings {
            let (s, used) = read_utf16z_r(record, pos, body_end, "insert string")?;
            parameters.push(s);
            pos += used;
        }

        let raw_data = bytes::slice_r(body, data_offset, data_length, "data")?.to_vec();
        let (event_code, qualifier) = Record::split_event_id(event_id);

        Ok(Record {
            record_number,
            time_generated: unix_secs_to_timestamp(time_generated),
            time_written: unix_secs_to_timestamp(time_written),
            event_code,
            qualifier,
            event_type,
            event_category,
            source_name,
            computer_name,
            user_sid,
            parameters,
            raw_data,
        })
    }

    /// Encode the record in the layout `ReportEvent` produces.
    pub fn encode(&self) -> DecodeResult<Vec<u8>> {
        let num_strings = u16::try_from(self.parameters.len()).map_err(|_| {
            DecodeError::malformed(format!("{} insert strings", self.parameters.len()))
        })?;

        let mut strings = Vec::new();
        push_utf16le_z(&mut strings, &self.source_name);
        push_utf16le_z(&mut strings, &self.computer_name);

        let sid_offset = bytes::align4(EVENTLOGRECORD_HEADER_SIZE + strings.len());
        let sid = self.user_sid.as_ref().map(UserSid::as_bytes).unwrap_or(&[]);
        let string_offset = sid_offset + sid.len();

        let mut inserts = Vec::new();
        for p in &self.parameters {
            push_utf16le_z(&mut inserts, p);
        }
        let data_offset = string_offset + inserts.len();
        let length = bytes::align4(data_offset + self.raw_data.len()) + 4;
        let length32 = u32::try_from(length)
            .map_err(|_| DecodeError::malformed(format!("record of {length} bytes is too large")))?;

        let mut out = Vec::with_capacity(length);
        let header: [u32; 5] = [
            length32,
            EVENTLOGRECORD_MAGIC,
            self.record_number,
            timestamp_to_unix_secs(self.time_generated),
            timestamp_to_unix_secs(self.time_written),
        ];
        for v in header {
            out.write_u32::<LittleEndian>(v)?;
        }
        out.write_u32::<LittleEndian>(self.event_id())?;
        out.write_u16::<LittleEndian>(self.event_type.as_u16())?;
        out.write_u16::<LittleEndian>(num_strings)?;
        out.write_u16::<LittleEndian>(self.event_category)?;
        out.write_u16::<LittleEndian>(0)?; // reserved flags
        out.write_u32::<LittleEndian>(0)?; // closing record number
        out.write_u32::<LittleEndian>(string_offset as u32)?;
        out.write_u32::<LittleEndian>(sid.len() as u32)?;
        out.write_u32::<LittleEndian>(sid_offset as u32)?;
        out.write_u32::<LittleEndian>(self.raw_data.len() as u32)?;
        out.write_u32::<LittleEndian>(data_offset as u32)?;
        debug_assert_eq!(out.len(), EVENTLOGRECORD_HEADER_SIZE);

        out.extend_from_slice(&strings);
        out.resize(sid_offset, 0);
        out.extend_from_slice(sid);
        out.extend_from_slice(&inserts);
        out.extend_from_slice(&self.raw_data);
        out.resize(length - 4, 0);
        out.write_u32::<LittleEndian>(length32)?;

        Ok(out)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Record={} EventID={} Type={} Source={} Parameters={:?}",
            self.record_number,
            self.event_id(),
            self.event_type,
            self.source_name,
            self.parameters
        )
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        // Writes into a `Vec<u8>` cannot fail; keep the conversion total anyway.
        DecodeError::malformed(err.to_string())
    }
}
