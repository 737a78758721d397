//! Persisted resume positions, one per provider.

use crate::err::CheckpointError;

use jiff::Timestamp;
use log::trace;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub provider: String,
    /// Last record number that was published, `0` for none.
    pub last_record_number: u32,
    /// Creation time of the log the record number belongs to.
    #[serde(default)]
    pub log_created: Option<Timestamp>,
}

impl Checkpoint {
    pub fn new(provider: impl Into<String>) -> Self {
        Checkpoint {
            provider: provider.into(),
            last_record_number: 0,
            log_created: None,
        }
    }
}

pub trait CheckpointStore: Send + Sync {
    /// The last saved checkpoint of `provider`, if any.
    fn load(&self, provider: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replace the checkpoint of `checkpoint.provider`. Readers never observe a partial write.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

/// Stores one `<provider>.json` per provider in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileCheckpointStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name of a provider's checkpoint. Characters that are unsafe in file names are
    /// replaced, so `Microsoft-Windows-X/Operational` still maps to a single file.
    pub fn path_for(&self, provider: &str) -> PathBuf {
        let name: String = provider
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, provider: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(provider);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let checkpoint = serde_json::from_slice(&data)
            .map_err(|source| CheckpointError::Json { path, source })?;
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.provider);
        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_vec(checkpoint).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        trace!(
            "saved checkpoint for `{}` at record {}",
            checkpoint.provider, checkpoint.last_record_number
        );
        Ok(())
    }
}

/// In-memory store, mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        MemoryCheckpointStore::default()
    }

    pub fn get(&self, provider: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
            .cloned()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, provider: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.get(provider))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkpoint.provider.clone(), checkpoint.clone());
        Ok(())
    }
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for &T {
    fn load(&self, provider: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        (**self).load(provider)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        (**self).save(checkpoint)
    }
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    fn load(&self, provider: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        (**self).load(provider)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        (**self).save(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_roundtrip_and_replace() {
        let d = tempdir().unwrap();
        let store = FileCheckpointStore::new(d.path().join("checkpoints"));
        assert_eq!(store.load("Application").unwrap(), None);

        let mut checkpoint = Checkpoint::new("Application");
        checkpoint.last_record_number = 41;
        checkpoint.log_created = Some(Timestamp::from_second(1_600_000_000).unwrap());
        store.save(&checkpoint).unwrap();

        checkpoint.last_record_number = 42;
        store.save(&checkpoint).unwrap();

        assert_eq!(store.load("Application").unwrap(), Some(checkpoint));
        // Only the checkpoint itself is left behind, no temporary files.
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_provider_names_map_to_safe_file_names() {
        let store = FileCheckpointStore::new("/tmp/cp");
        assert_eq!(
            store.path_for("Microsoft-Windows-PowerShell/Operational"),
            PathBuf::from("/tmp/cp/Microsoft-Windows-PowerShell_Operational.json")
        );
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let d = tempdir().unwrap();
        let store = FileCheckpointStore::new(d.path());
        fs::write(store.path_for("System"), b"{not json").unwrap();
        assert!(matches!(
            store.load("System"),
            Err(CheckpointError::Json { .. })
        ));
    }
}
