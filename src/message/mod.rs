//! Message template resolution.
//!
//! An event only stores its numeric id and insert strings. The text lives in message tables
//! inside the files registered for the event's source, which are searched in registration order.
//!
//! - `table`: `MESSAGE_RESOURCE_DATA` parsing, plus a builder used by tests and tooling
//! - `pe`: `RT_MESSAGETABLE` extraction from PE images
//! - `format`: `FormatMessage` insert semantics

mod format;
mod pe;
mod table;

pub use self::format::format_message;
pub use self::pe::{MessageTableResource, RT_MESSAGETABLE, extract_message_table_resources};
pub use self::table::{
    EntryEncoding, LANG_EN_US, LANG_NEUTRAL, MessageTable, MessageTableBuilder,
    parse_message_resource_data,
};

use crate::err::MessageFileError;
use crate::registry::expand_environment_strings;

use encoding::EncodingRef;
use encoding::types::Encoding;
use hashbrown::HashMap;
use log::{debug, trace, warn};
use serde::Serialize;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Ordered list of message files for one `(provider, source)`. The first file that has a
/// template wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFileSet {
    pub provider: String,
    pub source_name: String,
    pub paths: Vec<PathBuf>,
}

impl MessageFileSet {
    pub fn new(
        provider: impl Into<String>,
        source_name: impl Into<String>,
        paths: Vec<PathBuf>,
    ) -> Self {
        MessageFileSet {
            provider: provider.into(),
            source_name: source_name.into(),
            paths,
        }
    }

    pub fn empty(provider: impl Into<String>, source_name: impl Into<String>) -> Self {
        MessageFileSet::new(provider, source_name, Vec::new())
    }

    /// Build a set from a `;`-separated registry value, expanding `%VAR%` references.
    pub fn from_registry_value(
        provider: impl Into<String>,
        source_name: impl Into<String>,
        value: &str,
    ) -> Self {
        let paths = value
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| PathBuf::from(expand_environment_strings(p)))
            .collect();
        MessageFileSet::new(provider, source_name, paths)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// A template was found in `file`.
    Resolved { file: PathBuf },
    /// No file had a template; the message was synthesized from the insert strings.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub message: String,
    pub status: ResolutionStatus,
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        self.status == ResolutionStatus::Fallback
    }
}

/// Text used when none of the message files has a template for an event.
pub fn fallback_message<S: AsRef<str>>(event_code: u16, source_name: &str, inserts: &[S]) -> String {
    let inserts = inserts
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "The description for Event ID ({event_code}) in Source ({source_name}) cannot be found. \
         The local computer may not have the necessary registry information or message DLL files \
         to display messages from a remote computer. \
         The following information is part of the event: {inserts}"
    )
}

type TableCache = HashMap<PathBuf, Option<Arc<MessageTable>>, ahash::RandomState>;

/// Resolves event ids to text, caching every message file it loads.
///
/// Files that fail to load are cached as empty, so a broken file is only read once. The cache
/// is never invalidated implicitly; call [`MessageResolver::clear_cache`] when the registrations
/// it was built from go away.
pub struct MessageResolver {
    language_id: u32,
    ansi_codec: EncodingRef,
    cache: RwLock<TableCache>,
}

impl fmt::Debug for MessageResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageResolver")
            .field("language_id", &self.language_id)
            .field("ansi_codec", &self.ansi_codec.name())
            .field("cached_files", &self.cached_files())
            .finish()
    }
}

impl MessageResolver {
    pub fn new(language_id: u32, ansi_codec: EncodingRef) -> Self {
        MessageResolver {
            language_id,
            ansi_codec,
            cache: RwLock::new(TableCache::default()),
        }
    }

    pub fn language_id(&self) -> u32 {
        self.language_id
    }

    /// Resolve `(qualifier << 16) | event_code` against `files` and render it with `inserts`.
    ///
    /// Never fails: when no file has a template, a fallback text carrying the event code, the
    /// source name and every insert is returned.
    pub fn resolve<S: AsRef<str>>(
        &self,
        files: &MessageFileSet,
        event_code: u16,
        qualifier: u16,
        inserts: &[S],
    ) -> Resolution {
        let message_id = (u32::from(qualifier) << 16) | u32::from(event_code);

        match self.lookup(files, message_id) {
            Some((file, template)) => Resolution {
                message: format_message(&template, inserts),
                status: ResolutionStatus::Resolved { file },
            },
            None => {
                debug!(
                    "no template for event {} of source `{}` in {} file(s)",
                    message_id,
                    files.source_name,
                    files.paths.len()
                );
                Resolution {
                    message: fallback_message(event_code, &files.source_name, inserts),
                    status: ResolutionStatus::Fallback,
                }
            }
        }
    }

    /// Text of `category`, looked up in the category message files.
    pub fn resolve_category(&self, files: &MessageFileSet, category: u16) -> Option<String> {
        if category == 0 {
            return None;
        }
        let none: [&str; 0] = [];
        self.lookup(files, u32::from(category))
            .map(|(_, template)| format_message(&template, &none))
    }

    /// Replace `%%<id>` tokens in insert strings with messages from the parameter message files.
    ///
    /// Tokens without a matching message are kept verbatim.
    pub fn expand_parameter_inserts(&self, files: &MessageFileSet, inserts: &[String]) -> Vec<String> {
        if files.is_empty() {
            return inserts.to_vec();
        }
        inserts
            .iter()
            .map(|insert| self.expand_parameter_insert(files, insert))
            .collect()
    }

    fn expand_parameter_insert(&self, files: &MessageFileSet, insert: &str) -> String {
        if !insert.contains("%%") {
            return insert.to_string();
        }

        let mut out = String::with_capacity(insert.len());
        let mut rest = insert;
        while let Some(start) = rest.find("%%") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();

            let replacement = after[..digits]
                .parse::<u32>()
                .ok()
                .and_then(|id| self.lookup(files, id));
            match replacement {
                Some((_, text)) => out.push_str(text.trim_end_matches(['\r', '\n'])),
                None => out.push_str(&rest[start..start + 2 + digits]),
            }
            rest = &after[digits..];
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, files: &MessageFileSet, message_id: u32) -> Option<(PathBuf, String)> {
        files.paths.iter().find_map(|path| {
            let table = self.table(path)?;
            let text = table.lookup(message_id, self.language_id)?;
            trace!("message {message_id:#x} found in `{}`", path.display());
            Some((path.clone(), text.to_string()))
        })
    }

    /// The parsed table of `path`, loading it on first use. `None` when the file is missing or
    /// unreadable.
    pub fn table(&self, path: &Path) -> Option<Arc<MessageTable>> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(path) {
                return entry.clone();
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have loaded it while we waited for the write lock.
        if let Some(entry) = cache.get(path) {
            return entry.clone();
        }

        let entry = match self.load(path) {
            Ok(table) => Some(Arc::new(table)),
            Err(e) => {
                warn!("message file `{}` is unusable: {}", path.display(), e);
                None
            }
        };
        cache.insert(path.to_path_buf(), entry.clone());
        entry
    }

    fn load(&self, path: &Path) -> Result<MessageTable, MessageFileError> {
        let data = fs::read(path).map_err(|source| MessageFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        MessageTable::from_bytes(&data, self.ansi_codec)
    }

    /// Number of files in the cache, including the ones that failed to load.
    pub fn cached_files(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding::all::WINDOWS_1252;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn write_table(dir: &Path, name: &str, builder: MessageTableBuilder) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, builder.build()).unwrap();
        path
    }

    #[test]
    fn test_first_file_with_template_wins() {
        let d = tempdir().unwrap();
        let first = write_table(d.path(), "first.bin", MessageTableBuilder::new().message(1, "first %1"));
        let second = write_table(
            d.path(),
            "second.bin",
            MessageTableBuilder::new()
                .message(1, "second %1")
                .message(2, "only in second %1"),
        );
        let files = MessageFileSet::new("Test", "Test", vec![first.clone(), second.clone()]);
        let resolver = MessageResolver::new(LANG_EN_US, WINDOWS_1252);

        let r = resolver.resolve(&files, 1, 0, &["x"]);
        assert_eq!(r.message, "first x");
        assert_eq!(r.status, ResolutionStatus::Resolved { file: first });

        let r = resolver.resolve(&files, 2, 0, &["y"]);
        assert_eq!(r.message, "only in second y");
        assert_eq!(r.status, ResolutionStatus::Resolved { file: second });
    }

    #[test]
    fn test_missing_files_are_cached_as_empty() {
        let d = tempdir().unwrap();
        let missing = d.path().join("missing.dll");
        let files = MessageFileSet::new("Test", "Source", vec![missing.clone()]);
        let resolver = MessageResolver::new(LANG_EN_US, WINDOWS_1252);

        let r = resolver.resolve(&files, 1000, 0, &["Test Message"]);
        assert!(r.is_fallback());
        assert_eq!(r.message, fallback_message(1000, "Source", &["Test Message"]));
        assert_eq!(resolver.cached_files(), 1);

        // Still negative after the file appears, until the cache is cleared.
        write_table(d.path(), "missing.dll", MessageTableBuilder::new().message(1000, "now %1"));
        assert!(resolver.resolve(&files, 1000, 0, &["here"]).is_fallback());

        resolver.clear_cache();
        assert_eq!(resolver.cached_files(), 0);
        assert_eq!(resolver.resolve(&files, 1000, 0, &["here"]).message, "now here");
    }

    #[test]
    fn test_concurrent_resolution_loads_each_file_once() {
        let d = tempdir().unwrap();
        let mut builder = MessageTableBuilder::new();
        for id in 1..=8 {
            builder = builder.message(id, format!("message {id}: %1"));
        }
        let first = write_table(d.path(), "first.bin", MessageTableBuilder::new());
        let second = write_table(d.path(), "second.bin", builder);
        let files = MessageFileSet::new("Test", "Test", vec![first.clone(), second.clone()]);
        let resolver = MessageResolver::new(LANG_EN_US, WINDOWS_1252);
        let barrier = std::sync::Barrier::new(8);

        let tables: Vec<Arc<MessageTable>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (1..=8_u16)
                .map(|code| {
                    let (resolver, files, barrier) = (&resolver, &files, &barrier);
                    let second = second.as_path();
                    scope.spawn(move || {
                        barrier.wait();
                        let r = resolver.resolve(files, code, 0, &[code.to_string()]);
                        assert_eq!(r.message, format!("message {code}: {code}"));
                        resolver.table(second).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(resolver.cached_files(), 2);
        assert!(tables.iter().all(|t| Arc::ptr_eq(t, &tables[0])));
    }

    #[test]
    fn test_fallback_lists_every_insert() {
        let msg = fallback_message(7, "Src", &["a", "b", "c"]);
        assert!(msg.starts_with("The description for Event ID (7) in Source (Src) cannot be found."));
        assert!(msg.ends_with("The following information is part of the event: a, b, c"));
    }

    #[test]
    fn test_parameter_and_category_files() {
        let d = tempdir().unwrap();
        let params = write_table(
            d.path(),
            "params.bin",
            MessageTableBuilder::new().message(1936, "Success\r\n"),
        );
        let categories = write_table(
            d.path(),
            "categories.bin",
            MessageTableBuilder::new().message(3, "Logon/Logoff\r\n"),
        );
        let resolver = MessageResolver::new(LANG_EN_US, WINDOWS_1252);

        let param_files = MessageFileSet::new("Security", "Security", vec![params]);
        assert_eq!(
            resolver.expand_parameter_inserts(
                &param_files,
                &["%%1936".to_string(), "x %%9999 y".to_string(), "100%".to_string()]
            ),
            vec!["Success".to_string(), "x %%9999 y".to_string(), "100%".to_string()]
        );

        let category_files = MessageFileSet::new("Security", "Security", vec![categories]);
        assert_eq!(
            resolver.resolve_category(&category_files, 3).as_deref(),
            Some("Logon/Logoff")
        );
        assert_eq!(resolver.resolve_category(&category_files, 0), None);
        assert_eq!(resolver.resolve_category(&category_files, 4), None);
    }

    #[test]
    fn test_registry_value_is_split_and_trimmed() {
        let set = MessageFileSet::from_registry_value("P", "S", "a.dll; b.dll;;");
        assert_eq!(set.paths, vec![PathBuf::from("a.dll"), PathBuf::from("b.dll")]);
    }
}
