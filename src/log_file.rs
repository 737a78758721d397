//! On-disk container for one event log: a [`LogFileHeader`] followed by back-to-back
//! `EVENTLOGRECORD`s.
//!
//! Writers append the record bytes first and publish them by rewriting the header, so a reader
//! that only trusts bytes below `end_offset` never observes a partially written record.

use crate::err::LogFileError;
use crate::evt_record::{EVENTLOGRECORD_MAGIC, MIN_RECORD_SIZE, Record};
use crate::log_file_header::{HeaderFlags, LOG_FILE_HEADER_SIZE, LogFileHeader};
use crate::utils::{bytes, timestamp_to_filetime};

use jiff::{SignedDuration, Timestamp};
use log::{debug, info, trace};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the part of a record needed to walk the log (`Length`, `Reserved`, `RecordNumber`).
const RECORD_PREFIX_SIZE: usize = 12;

#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    /// Open an existing log container, creating an empty one if it does not exist yet.
    pub fn open_or_create(path: impl AsRef<Path>, max_size: u32) -> Result<LogFile, LogFileError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let header = LogFileHeader::new(Timestamp::now(), max_size);
            file.write_all(&header.to_bytes())?;
            file.sync_data()?;
            info!("created log file `{}`", path.display());
        }

        let mut log = LogFile { path, file };
        // Validate early so a foreign file is rejected at open time.
        log.read_header()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_header(&mut self) -> Result<LogFileHeader, LogFileError> {
        let mut buf = [0_u8; LOG_FILE_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => LogFileError::InvalidHeader {
                reason: "file is shorter than the header".to_string(),
            },
            _ => LogFileError::Io(e),
        })?;
        LogFileHeader::from_bytes(&buf)
    }

    fn write_header(&mut self, header: &LogFileHeader) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.to_bytes())?;
        self.file.sync_data()
    }

    /// Read up to `len` bytes at `offset`. Returns fewer bytes only at end of file.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        (&mut self.file).take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Return the offset of the first record whose number is greater than `after`.
    ///
    /// Only the record prefixes are read. Returns `header.end_offset` when no such record exists.
    pub fn offset_after(
        &mut self,
        header: &LogFileHeader,
        after: u32,
    ) -> Result<u64, LogFileError> {
        let end = u64::from(header.end_offset);
        let mut offset = LOG_FILE_HEADER_SIZE as u64;

        if after < header.oldest_record_number {
            return Ok(offset);
        }
        if after >= header.newest_record_number() {
            return Ok(end);
        }

        while offset < end {
            let prefix = self.read_at(offset, RECORD_PREFIX_SIZE)?;
            let corrupt = |reason: &str| LogFileError::InvalidHeader {
                reason: format!("record framing is damaged at offset {offset}: {reason}"),
            };
            let length = bytes::read_u32_le(&prefix, 0).ok_or_else(|| corrupt("short read"))?;
            let magic = bytes::read_u32_le(&prefix, 4).ok_or_else(|| corrupt("short read"))?;
            let number = bytes::read_u32_le(&prefix, 8).ok_or_else(|| corrupt("short read"))?;

            if (length as usize) < MIN_RECORD_SIZE || magic != EVENTLOGRECORD_MAGIC {
                return Err(corrupt("invalid record prefix"));
            }
            if number > after {
                break;
            }
            offset += u64::from(length);
        }

        trace!("first record after {} is at offset {}", after, offset);
        Ok(offset.min(end))
    }

    /// Append a record, assigning its record number. Returns the assigned number.
    pub fn append(&mut self, record: &mut Record) -> Result<u32, LogFileError> {
        let mut header = self.read_header()?;
        record.record_number = header.current_record_number;
        let bytes = record.encode()?;

        let new_end = u64::from(header.end_offset) + bytes.len() as u64;
        if header.max_size != 0 && new_end > u64::from(header.max_size) {
            header.flags |= HeaderFlags::LOGFULL_WRITTEN;
            self.write_header(&header)?;
            return Err(LogFileError::LogFull {
                size: bytes.len(),
                max_size: header.max_size,
            });
        }
        let new_end = u32::try_from(new_end).map_err(|_| LogFileError::LogFull {
            size: bytes.len(),
            max_size: u32::MAX,
        })?;

        self.file.seek(SeekFrom::Start(u64::from(header.end_offset)))?;
        self.file.write_all(&bytes)?;

        header.end_offset = new_end;
        header.current_record_number += 1;
        self.write_header(&header)?;

        trace!(
            "appended record {} ({} bytes) to `{}`",
            record.record_number,
            bytes.len(),
            self.path.display()
        );
        Ok(record.record_number)
    }

    /// Empty the log, optionally copying its current contents to `backup` first.
    ///
    /// Record numbering restarts at 1 and the creation time changes, which invalidates every
    /// session that still points into the previous contents.
    pub fn clear(&mut self, backup: Option<&Path>) -> Result<LogFileHeader, LogFileError> {
        let old = self.read_header()?;

        if let Some(backup) = backup {
            if backup.exists() {
                return Err(LogFileError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("backup file `{}` already exists", backup.display()),
                )));
            }
            fs::copy(&self.path, backup)?;
            info!(
                "backed up `{}` to `{}` before clearing",
                self.path.display(),
                backup.display()
            );
        }

        // The header keeps 100ns ticks, so compare at that precision.
        let mut created = Timestamp::now();
        if timestamp_to_filetime(created) <= timestamp_to_filetime(old.created) {
            created = old.created + SignedDuration::from_micros(1);
        }
        let mut header = LogFileHeader::new(created, old.max_size);
        if backup.is_some() {
            header.flags |= HeaderFlags::ARCHIVE_SET;
        }

        self.file.set_len(LOG_FILE_HEADER_SIZE as u64)?;
        self.write_header(&header)?;

        debug!(
            "cleared `{}` ({} records dropped)",
            self.path.display(),
            old.record_count()
        );
        self.read_header()
    }
}
