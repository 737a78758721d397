//! Registration of logs and event sources.
//!
//! `registry.json` in the store root plays the role of the
//! `HKLM\SYSTEM\CurrentControlSet\Services\EventLog` hive: every log has a set of sources, and
//! every source lists the message files used to render its events.

use crate::err::RegistryError;
use crate::message::MessageFileSet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE_NAME: &str = "registry.json";
pub const LOG_FILE_EXTENSION: &str = "evt";
/// Log used for providers nobody registered.
pub const DEFAULT_LOG: &str = "Application";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryData {
    #[serde(default)]
    pub logs: BTreeMap<String, LogRegistration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRegistration {
    /// Maximum size of the log container in bytes, `0` for unbounded.
    #[serde(default)]
    pub max_size: u32,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceRegistration>,
}

/// The values of one `EventLog\<log>\<source>` key.
///
/// Message file values are `;`-separated lists and may contain `%VAR%` references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_message_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_message_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_message_file: Option<String>,
    #[serde(default)]
    pub category_count: u32,
    #[serde(default)]
    pub types_supported: u16,
}

/// The log a provider name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLog {
    pub log_name: String,
    /// `true` when the provider is unknown and [`DEFAULT_LOG`] was picked instead.
    pub fallback: bool,
}

/// Message files registered for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMessageFiles {
    pub event: MessageFileSet,
    pub parameter: MessageFileSet,
    pub category: MessageFileSet,
}

impl RegistryData {
    pub fn log(&self, name: &str) -> Option<(&str, &LogRegistration)> {
        self.logs
            .iter()
            .find(|(log, _)| log.eq_ignore_ascii_case(name))
            .map(|(log, registration)| (log.as_str(), registration))
    }

    fn log_mut(&mut self, name: &str) -> Option<&mut LogRegistration> {
        self.logs
            .iter_mut()
            .find(|(log, _)| log.eq_ignore_ascii_case(name))
            .map(|(_, registration)| registration)
    }

    /// Resolve a provider name to a log.
    ///
    /// Log names win over source names. Unknown names resolve to [`DEFAULT_LOG`], the way
    /// `OpenEventLog` does.
    pub fn resolve_provider(&self, provider: &str) -> ResolvedLog {
        if let Some((log_name, _)) = self.log(provider) {
            return ResolvedLog {
                log_name: log_name.to_string(),
                fallback: false,
            };
        }

        for (log_name, log) in &self.logs {
            if log.source(provider).is_some() {
                return ResolvedLog {
                    log_name: log_name.clone(),
                    fallback: false,
                };
            }
        }

        let log_name = self
            .log(DEFAULT_LOG)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| DEFAULT_LOG.to_string());
        ResolvedLog {
            log_name,
            fallback: true,
        }
    }
}

impl LogRegistration {
    pub fn source(&self, name: &str) -> Option<&SourceRegistration> {
        self.sources
            .iter()
            .find(|(source, _)| source.eq_ignore_ascii_case(name))
            .map(|(_, registration)| registration)
    }

    /// Message files for `source`. Unregistered sources get empty sets.
    pub fn message_files(&self, provider: &str, source: &str) -> SourceMessageFiles {
        let Some(registration) = self.source(source) else {
            return SourceMessageFiles {
                event: MessageFileSet::empty(provider, source),
                parameter: MessageFileSet::empty(provider, source),
                category: MessageFileSet::empty(provider, source),
            };
        };

        let set = |value: &Option<String>| match value {
            Some(value) => MessageFileSet::from_registry_value(provider, source, value),
            None => MessageFileSet::empty(provider, source),
        };

        SourceMessageFiles {
            event: set(&registration.event_message_file),
            parameter: set(&registration.parameter_message_file),
            category: set(&registration.category_message_file),
        }
    }
}

/// Expand `%VAR%` references from the process environment.
///
/// Unknown variables are kept verbatim, like `ExpandEnvironmentStrings`.
pub fn expand_environment_strings(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                match (!name.is_empty()).then(|| std::env::var(name).ok()).flatten() {
                    Some(expanded) => out.push_str(&expanded),
                    None => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// A log store rooted at a directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Registry { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE_NAME)
    }

    /// Path of the container backing `log`.
    pub fn log_path(&self, log: &str) -> Result<PathBuf, RegistryError> {
        validate_name(log)?;
        Ok(self.root.join(format!("{log}.{LOG_FILE_EXTENSION}")))
    }

    /// Take a snapshot of the registrations. A store without `registry.json` is empty.
    pub fn load(&self) -> Result<RegistryData, RegistryError> {
        let path = self.registry_path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("`{}` does not exist, using an empty registry", path.display());
                return Ok(RegistryData::default());
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        serde_json::from_slice(&data).map_err(|source| RegistryError::Json { path, source })
    }

    /// Replace `registry.json` atomically.
    pub fn save(&self, data: &RegistryData) -> Result<(), RegistryError> {
        let path = self.registry_path();
        let io_err = |source| RegistryError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.root).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(data).map_err(|source| RegistryError::Json {
            path: path.clone(),
            source,
        })?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Register `source` under `log`, creating the log registration if needed.
    ///
    /// Returns `true` when the source already existed. Its registration is replaced either way.
    pub fn install_source(
        &self,
        log: &str,
        source: &str,
        registration: SourceRegistration,
    ) -> Result<bool, RegistryError> {
        validate_name(log)?;
        validate_name(source)?;

        let mut data = self.load()?;
        if data.log(log).is_none() {
            data.logs.insert(log.to_string(), LogRegistration::default());
        }

        for (other, registration) in &data.logs {
            if !other.eq_ignore_ascii_case(log) && registration.source(source).is_some() {
                warn!("source `{source}` is also registered in log `{other}`");
            }
        }

        let entry = data
            .log_mut(log)
            .ok_or_else(|| RegistryError::InvalidName {
                name: log.to_string(),
            })?;
        let existing = entry
            .sources
            .keys()
            .find(|name| name.eq_ignore_ascii_case(source))
            .cloned();
        let already_exists = existing.is_some();
        entry
            .sources
            .insert(existing.unwrap_or_else(|| source.to_string()), registration);

        self.save(&data)?;
        info!("registered source `{source}` in log `{log}`");
        Ok(already_exists)
    }

    /// Remove a source registration. Removing an unknown source is not an error.
    pub fn remove_source(&self, log: &str, source: &str) -> Result<(), RegistryError> {
        let mut data = self.load()?;
        if let Some(entry) = data.log_mut(log) {
            entry
                .sources
                .retain(|name, _| !name.eq_ignore_ascii_case(source));
            self.save(&data)?;
            info!("removed source `{source}` from log `{log}`");
        }
        Ok(())
    }

    /// Remove a log registration together with its container.
    pub fn remove_log(&self, log: &str) -> Result<(), RegistryError> {
        let path = self.log_path(log)?;
        let mut data = self.load()?;
        data.logs.retain(|name, _| !name.eq_ignore_ascii_case(log));
        self.save(&data)?;

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(RegistryError::Io { path, source }),
        }
        info!("removed log `{log}`");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn registration(event_message_file: &str) -> SourceRegistration {
        SourceRegistration {
            event_message_file: Some(event_message_file.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_install_and_resolve() {
        let d = tempdir().unwrap();
        let registry = Registry::new(d.path());

        assert!(!registry
            .install_source("Integration Test", "Test Source", registration("a.bin"))
            .unwrap());
        assert!(registry
            .install_source("integration test", "test source", registration("b.bin"))
            .unwrap());

        let data = registry.load().unwrap();
        assert_eq!(data.logs.len(), 1);

        let by_log = data.resolve_provider("INTEGRATION TEST");
        assert_eq!(by_log.log_name, "Integration Test");
        assert!(!by_log.fallback);

        let by_source = data.resolve_provider("Test Source");
        assert_eq!(by_source.log_name, "Integration Test");
        assert!(!by_source.fallback);

        let unknown = data.resolve_provider("Does Not Exist");
        assert_eq!(unknown.log_name, DEFAULT_LOG);
        assert!(unknown.fallback);

        let (_, log) = data.log("Integration Test").unwrap();
        let files = log.message_files("Integration Test", "Test Source");
        assert_eq!(files.event.paths, vec![PathBuf::from("b.bin")]);
        assert!(files.parameter.paths.is_empty());
    }

    #[test]
    fn test_remove_log_deletes_container() {
        let d = tempdir().unwrap();
        let registry = Registry::new(d.path());
        registry
            .install_source("Removed", "Source", SourceRegistration::default())
            .unwrap();
        let path = registry.log_path("Removed").unwrap();
        fs::write(&path, b"x").unwrap();

        registry.remove_log("Removed").unwrap();
        assert!(!path.exists());
        assert!(registry.load().unwrap().logs.is_empty());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let registry = Registry::new("/nonexistent");
        assert!(registry.log_path("../escape").is_err());
        assert!(registry.log_path("").is_err());
        assert!(registry.log_path("System").is_ok());
    }

    #[test]
    fn test_expand_environment_strings() {
        // SAFETY: tests in this module do not read this variable concurrently.
        unsafe { std::env::set_var("EVT_REGISTRY_TEST_ROOT", "C:\\Windows") };
        assert_eq!(
            expand_environment_strings("%EVT_REGISTRY_TEST_ROOT%\\system32\\a.dll"),
            "C:\\Windows\\system32\\a.dll"
        );
        assert_eq!(
            expand_environment_strings("%EVT_REGISTRY_TEST_UNSET%\\a.dll"),
            "%EVT_REGISTRY_TEST_UNSET%\\a.dll"
        );
        assert_eq!(expand_environment_strings("100%"), "100%");
        assert_eq!(expand_environment_strings("%%"), "%%");
    }
}
