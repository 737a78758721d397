use crate::err::LogFileError;
use crate::utils::{bytes, filetime_to_timestamp, timestamp_to_filetime};

use bitflags::bitflags;
use byteorder::{LittleEndian, WriteBytesExt};
use jiff::Timestamp;

/// Signature shared with `EVENTLOGRECORD` (`"LfLe"`).
pub const LOG_FILE_SIGNATURE: u32 = 0x654c_664c;
pub const LOG_FILE_HEADER_SIZE: usize = 0x30;
pub const LOG_FILE_MAJOR_VERSION: u32 = 1;
pub const LOG_FILE_MINOR_VERSION: u32 = 1;

bitflags! {
    /// Same bit assignments as `ELF_LOGFILE_HEADER.Flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const DIRTY = 0x0001;
        const WRAP = 0x0002;
        const LOGFULL_WRITTEN = 0x0004;
        const ARCHIVE_SET = 0x0008;
    }
}

/// Fixed header at the start of a log container.
///
/// Modelled on `ELF_LOGFILE_HEADER`, with the start offset and retention fields replaced by
/// the creation time of the log, which changes every time the log is cleared.
///
/// ```text
/// 0x00 HeaderSize (0x30)     0x18 EndOffset
/// 0x04 Signature ("LfLe")    0x1c CurrentRecordNumber
/// 0x08 MajorVersion          0x20 OldestRecordNumber
/// 0x0c MinorVersion          0x24 MaxSize
/// 0x10 Created (FILETIME)    0x28 Flags
///                            0x2c EndHeaderSize (0x30)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LogFileHeader {
    pub created: Timestamp,
    /// Offset one past the last complete record.
    pub end_offset: u32,
    /// Number that will be assigned to the next record.
    pub current_record_number: u32,
    pub oldest_record_number: u32,
    /// Maximum container size in bytes, `0` for unbounded.
    pub max_size: u32,
    pub flags: HeaderFlags,
}

impl LogFileHeader {
    pub fn new(created: Timestamp, max_size: u32) -> Self {
        LogFileHeader {
            created,
            end_offset: LOG_FILE_HEADER_SIZE as u32,
            current_record_number: 1,
            oldest_record_number: 1,
            max_size,
            flags: HeaderFlags::empty(),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<LogFileHeader, LogFileError> {
        let invalid = |reason: String| LogFileError::InvalidHeader { reason };
        let read_u32 = |offset: usize| {
            bytes::read_u32_le(buf, offset)
                .ok_or_else(|| invalid(format!("header truncated at offset {offset}")))
        };

        let header_size = read_u32(0x00)?;
        let signature = read_u32(0x04)?;
        let major = read_u32(0x08)?;
        let minor = read_u32(0x0c)?;
        let created = bytes::read_u64_le(buf, 0x10)
            .ok_or_else(|| invalid("header truncated at offset 16".to_string()))?;
        let end_offset = read_u32(0x18)?;
        let current_record_number = read_u32(0x1c)?;
        let oldest_record_number = read_u32(0x20)?;
        let max_size = read_u32(0x24)?;
        let flags = read_u32(0x28)?;
        let end_header_size = read_u32(0x2c)?;

        if signature != LOG_FILE_SIGNATURE {
            return Err(invalid(format!(
                "expected signature `{LOG_FILE_SIGNATURE:08x}`, found `{signature:08x}`"
            )));
        }
        if header_size as usize != LOG_FILE_HEADER_SIZE || end_header_size != header_size {
            return Err(invalid(format!(
                "unexpected header sizes {header_size}/{end_header_size}"
            )));
        }
        if major != LOG_FILE_MAJOR_VERSION {
            return Err(invalid(format!("unsupported version {major}.{minor}")));
        }
        if (end_offset as usize) < LOG_FILE_HEADER_SIZE {
            return Err(invalid(format!("end offset {end_offset} is inside the header")));
        }
        if oldest_record_number == 0 || current_record_number < oldest_record_number {
            return Err(invalid(format!(
                "record numbers are inconsistent (oldest {oldest_record_number}, current {current_record_number})"
            )));
        }

        Ok(LogFileHeader {
            created: filetime_to_timestamp(created)
                .ok_or_else(|| invalid(format!("creation time {created} is out of range")))?,
            end_offset,
            current_record_number,
            oldest_record_number,
            max_size,
            flags: HeaderFlags::from_bits_retain(flags),
        })
    }

    pub fn to_bytes(&self) -> [u8; LOG_FILE_HEADER_SIZE] {
        let mut out = Vec::with_capacity(LOG_FILE_HEADER_SIZE);
        // Writes into a Vec are infallible.
        let _ = self.write_to(&mut out);
        let mut header = [0_u8; LOG_FILE_HEADER_SIZE];
        header.copy_from_slice(&out);
        header
    }

    fn write_to(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(LOG_FILE_HEADER_SIZE as u32)?;
        out.write_u32::<LittleEndian>(LOG_FILE_SIGNATURE)?;
        out.write_u32::<LittleEndian>(LOG_FILE_MAJOR_VERSION)?;
        out.write_u32::<LittleEndian>(LOG_FILE_MINOR_VERSION)?;
        out.write_u64::<LittleEndian>(timestamp_to_filetime(self.created))?;
        out.write_u32::<LittleEndian>(self.end_offset)?;
        out.write_u32::<LittleEndian>(self.current_record_number)?;
        out.write_u32::<LittleEndian>(self.oldest_record_number)?;
        out.write_u32::<LittleEndian>(self.max_size)?;
        out.write_u32::<LittleEndian>(self.flags.bits())?;
        out.write_u32::<LittleEndian>(LOG_FILE_HEADER_SIZE as u32)?;
        Ok(())
    }

    /// Number of records currently stored.
    pub fn record_count(&self) -> u32 {
        self.current_record_number - self.oldest_record_number
    }

    /// Number of the newest stored record, `0` when the log is empty.
    pub fn newest_record_number(&self) -> u32 {
        if self.record_count() == 0 {
            0
        } else {
            self.current_record_number - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_header_it_wrote() {
        let mut header = LogFileHeader::new("2024-01-02T03:04:05.5Z".parse().unwrap(), 1 << 20);
        header.end_offset = 0x200;
        header.current_record_number = 7;
        header.flags = HeaderFlags::DIRTY | HeaderFlags::ARCHIVE_SET;

        let bytes = header.to_bytes();
        assert_eq!(&bytes[4..8], b"LfLe");
        assert_eq!(LogFileHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.record_count(), 6);
        assert_eq!(header.newest_record_number(), 6);
    }

    #[test]
    fn test_empty_log_has_no_newest_record() {
        let header = LogFileHeader::new(Timestamp::UNIX_EPOCH, 0);
        assert_eq!(header.record_count(), 0);
        assert_eq!(header.newest_record_number(), 0);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut bytes = LogFileHeader::new(Timestamp::UNIX_EPOCH, 0).to_bytes();
        bytes[4..8].copy_from_slice(b"ElfF");
        assert!(matches!(
            LogFileHeader::from_bytes(&bytes),
            Err(LogFileError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let bytes = LogFileHeader::new(Timestamp::UNIX_EPOCH, 0).to_bytes();
        assert!(LogFileHeader::from_bytes(&bytes[..0x20]).is_err());
    }
}
