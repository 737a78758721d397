//! An open handle to one log.

use crate::err::{DecodeError, LogFileError, OpenError, ReadError};
use crate::evt_record::{EVENTLOGRECORD_MAGIC, MIN_RECORD_SIZE, Record};
use crate::log_file::LogFile;
use crate::log_file_header::LogFileHeader;
use crate::registry::{LogRegistration, Registry, SourceMessageFiles};
use crate::settings::DEFAULT_MAX_BATCH_BYTES;
use crate::utils::bytes;

use jiff::Timestamp;
use log::{debug, info, trace, warn};

use std::path::{Path, PathBuf};

/// A record that could not be decoded. Its bytes are skipped; the session continues with the
/// next record.
#[derive(Debug)]
pub struct SkippedRecord {
    pub offset: u64,
    /// Record number from the record prefix, when it is the number expected at this position.
    pub record_number: Option<u32>,
    pub error: DecodeError,
}

/// The result of one [`Session::read_batch`]. An empty batch means the reader caught up.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    pub skipped: Vec<SkippedRecord>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.skipped.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.skipped.len()
    }

    /// Highest record number in the batch, decoded or skipped with a trusted number.
    pub fn last_record_number(&self) -> Option<u32> {
        let decoded = self.records.last().map(|r| r.record_number);
        let skipped = self.skipped.iter().filter_map(|s| s.record_number).max();
        decoded.max(skipped)
    }
}

#[derive(Debug)]
pub struct Session {
    provider: String,
    log_name: String,
    fallback: bool,
    registration: LogRegistration,
    file: Option<LogFile>,
    created: Timestamp,
    /// Offset of the next record to read.
    offset: u64,
    last_record_number: u32,
    batch_size: usize,
    max_batch_bytes: usize,
}

impl Session {
    /// Open the log of `provider`, positioned after record `resume_after` (`0` reads from the
    /// oldest record).
    ///
    /// Unknown providers open the `Application` log. The log container is created when it does
    /// not exist yet.
    pub fn open(
        registry: &Registry,
        provider: &str,
        resume_after: u32,
    ) -> Result<Session, OpenError> {
        let data = registry.load()?;
        let resolved = data.resolve_provider(provider);
        if resolved.fallback {
            warn!(
                "provider `{}` is not registered, reading the `{}` log instead",
                provider, resolved.log_name
            );
        }

        let registration = data
            .log(&resolved.log_name)
            .map(|(_, log)| log.clone())
            .unwrap_or_default();
        let path = registry.log_path(&resolved.log_name)?;

        let log_err = |source: LogFileError| OpenError::LogFile {
            log: resolved.log_name.clone(),
            path: path.clone(),
            source,
        };
        let mut file = LogFile::open_or_create(&path, registration.max_size).map_err(log_err)?;
        let header = file.read_header().map_err(log_err)?;
        let offset = file.offset_after(&header, resume_after).map_err(log_err)?;

        info!(
            "opened log `{}` for provider `{}` after record {} ({} records, oldest {})",
            resolved.log_name,
            provider,
            resume_after,
            header.record_count(),
            header.oldest_record_number
        );

        Ok(Session {
            provider: provider.to_string(),
            log_name: resolved.log_name,
            fallback: resolved.fallback,
            registration,
            file: Some(file),
            created: header.created,
            offset,
            last_record_number: resume_after,
            batch_size: 100,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        })
    }

    /// Bound the size of the batches returned by [`Session::read_batch`].
    pub fn with_batch_limits(mut self, batch_size: usize, max_batch_bytes: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_batch_bytes = max_batch_bytes.max(MIN_RECORD_SIZE);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// `true` when the provider was unknown and the `Application` log was opened instead.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Creation time of the log at open (or at the last clear through this session).
    pub fn log_created(&self) -> Timestamp {
        self.created
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(LogFile::path)
    }

    /// Number of the last record returned (or skipped), or the resume position.
    pub fn last_record_number(&self) -> u32 {
        self.last_record_number
    }

    /// Message files of `source_name`, from the registrations as they were at open.
    pub fn message_files(&self, source_name: &str) -> SourceMessageFiles {
        self.registration
            .message_files(&self.provider, source_name)
    }

    fn file(&mut self) -> Result<&mut LogFile, ReadError> {
        self.file.as_mut().ok_or(ReadError::Closed)
    }

    /// Current header, checked against the log this session opened.
    fn current_header(&mut self) -> Result<LogFileHeader, ReadError> {
        let log = self.log_name.clone();
        let created = self.created;
        let header = self.file()?.read_header().map_err(|e| match e {
            LogFileError::Io(e) => ReadError::Io(e),
            other => ReadError::Corrupt {
                log: log.clone(),
                offset: 0,
                reason: other.to_string(),
            },
        })?;

        if header.created != created {
            info!(
                "log `{}` was recreated at {} (opened at {})",
                log, header.created, created
            );
            return Err(ReadError::Invalidated { log });
        }
        Ok(header)
    }

    pub fn record_count(&mut self) -> Result<u32, ReadError> {
        Ok(self.current_header()?.record_count())
    }

    pub fn oldest_record_number(&mut self) -> Result<u32, ReadError> {
        Ok(self.current_header()?.oldest_record_number)
    }

    /// Number of the newest record, `0` for an empty log.
    pub fn newest_record_number(&mut self) -> Result<u32, ReadError> {
        Ok(self.current_header()?.newest_record_number())
    }

    /// Position the session after the newest record. Returns that record's number.
    pub fn skip_to_end(&mut self) -> Result<u32, ReadError> {
        let header = self.current_header()?;
        self.offset = u64::from(header.end_offset);
        self.last_record_number = self.last_record_number.max(header.newest_record_number());
        Ok(self.last_record_number)
    }

    /// Read the next batch of records.
    ///
    /// Returns an empty batch when there is nothing new. Records that fail to decode are
    /// reported in [`Batch::skipped`] and never stop the batch.
    pub fn read_batch(&mut self) -> Result<Batch, ReadError> {
        let header = self.current_header()?;
        let end = u64::from(header.end_offset);

        if self.offset > end {
            // Shorter than where we are, with the same creation time.
            return Err(ReadError::Invalidated {
                log: self.log_name.clone(),
            });
        }
        if self.offset == end {
            trace!("log `{}` has nothing after offset {}", self.log_name, end);
            return Ok(Batch::default());
        }

        let want = usize::try_from(end - self.offset)
            .unwrap_or(usize::MAX)
            .min(self.max_batch_bytes);
        let start = self.offset;
        let mut buf = self.file()?.read_at(start, want)?;
        let capped = (buf.len() as u64) < end - start;

        let log = self.log_name.clone();
        let mut batch = Batch::default();
        let mut pos = 0_usize;

        while batch.len() < self.batch_size && pos < buf.len() {
            let offset = start + pos as u64;
            let corrupt = |reason: String| ReadError::Corrupt {
                log: log.clone(),
                offset,
                reason,
            };

            let Some(length) = bytes::read_u32_le(&buf, pos) else {
                if capped {
                    break;
                }
                return Err(corrupt("log ends inside a record length".to_string()));
            };
            let length = length as usize;
            if length < MIN_RECORD_SIZE {
                return Err(corrupt(format!("record length {length} is too small")));
            }

            if pos + length > buf.len() {
                if length as u64 > end - offset {
                    return Err(corrupt(format!(
                        "record of {length} bytes extends past the end of the log"
                    )));
                }
                if pos > 0 {
                    break;
                }
                // A single record larger than the byte budget.
                buf = self.file()?.read_at(offset, length)?;
                if buf.len() < length {
                    return Err(corrupt("log ends inside a record".to_string()));
                }
            }

            let slice = &buf[pos..pos + length];
            match Record::decode(slice) {
                Ok(record) => {
                    if record.record_number <= self.last_record_number {
                        warn!(
                            "log `{}` went back from record {} to {}",
                            log, self.last_record_number, record.record_number
                        );
                        return Err(ReadError::Invalidated { log });
                    }
                    self.last_record_number = record.record_number;
                    batch.records.push(record);
                }
                Err(error) => {
                    // Numbers are assigned consecutively; anything else in a damaged record is
                    // not trusted to move the position.
                    let expected = self.last_record_number.checked_add(1);
                    let record_number = bytes::read_u32_le(slice, 8).filter(|n| {
                        bytes::read_u32_le(slice, 4) == Some(EVENTLOGRECORD_MAGIC)
                            && Some(*n) == expected
                    });
                    if let Some(n) = record_number {
                        self.last_record_number = n;
                    }
                    warn!(
                        "skipping undecodable record {:?} at offset {} of `{}`: {}",
                        record_number, offset, log, error
                    );
                    batch.skipped.push(SkippedRecord {
                        offset,
                        record_number,
                        error,
                    });
                }
            }

            pos += length;
            self.offset = offset + length as u64;
        }

        debug!(
            "read {} records ({} skipped) from `{}`, next offset {}",
            batch.records.len(),
            batch.skipped.len(),
            self.log_name,
            self.offset
        );
        Ok(batch)
    }

    /// Clear the log, optionally backing it up to `backup` first.
    ///
    /// The session stays open and continues with the emptied log.
    pub fn clear(&mut self, backup: Option<&Path>) -> Result<(), LogFileError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| LogFileError::Io(std::io::Error::other("session is closed")))?;
        let header = file.clear(backup)?;
        info!("cleared log `{}`", self.log_name);

        self.created = header.created;
        self.offset = u64::from(header.end_offset);
        self.last_record_number = 0;
        Ok(())
    }

    /// Release the log handle. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            debug!("closed log `{}` ({})", self.log_name, file.path().display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Path of a backup file next to the log, named after the current time.
pub fn default_backup_path(session: &Session) -> Option<PathBuf> {
    let path = session.path()?;
    let stamp = Timestamp::now().strftime("%Y%m%dT%H%M%S").to_string();
    Some(path.with_file_name(format!("{}-{stamp}.evt", session.log_name())))
}
