//! JSON configuration of the `evt_tail` service.
//!
//! ```json
//! {
//!   "log_root": "/var/lib/evt",
//!   "checkpoint_dir": "/var/lib/evt/checkpoints",
//!   "defaults": { "batch_size": 100, "poll_interval_ms": 1000 },
//!   "providers": [
//!     { "name": "Application" },
//!     { "name": "System", "start_position": "end", "poll_interval_ms": 250 }
//!   ]
//! }
//! ```

use crate::err::ConfigError;
use crate::settings::{EngineSettings, RetrySettings, StartPosition};

use encoding::all::encodings;
use encoding::types::Encoding;
use serde::{Deserialize, Serialize};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding `registry.json` and the log containers.
    pub log_root: PathBuf,
    /// Directory for checkpoint files. Defaults to `<log_root>/checkpoints`.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub defaults: ProviderOptions,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(flatten)]
    pub options: ProviderOptions,
}

/// Every option is optional; unset options fall back to `defaults`, then to built-in values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<StartPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<u32>,
    /// Name of an `encoding` codec, e.g. `windows-1252`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansi_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOptions>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl ProviderOptions {
    /// Options of `self`, with unset ones taken from `fallback`.
    fn or(&self, fallback: &ProviderOptions) -> ProviderOptions {
        let retry = match (self.retry, fallback.retry) {
            (Some(r), Some(f)) => Some(RetryOptions {
                initial_backoff_ms: r.initial_backoff_ms.or(f.initial_backoff_ms),
                max_backoff_ms: r.max_backoff_ms.or(f.max_backoff_ms),
                max_attempts: r.max_attempts.or(f.max_attempts),
            }),
            (r, f) => r.or(f),
        };
        ProviderOptions {
            batch_size: self.batch_size.or(fallback.batch_size),
            max_batch_bytes: self.max_batch_bytes.or(fallback.max_batch_bytes),
            poll_interval_ms: self.poll_interval_ms.or(fallback.poll_interval_ms),
            start_position: self.start_position.or(fallback.start_position),
            language_id: self.language_id.or(fallback.language_id),
            ansi_codec: self.ansi_codec.clone().or_else(|| fallback.ansi_codec.clone()),
            retry,
        }
    }

    fn apply(&self, mut settings: EngineSettings) -> Result<EngineSettings, ConfigError> {
        if let Some(batch_size) = self.batch_size {
            settings = settings.batch_size(batch_size);
        }
        if let Some(max_batch_bytes) = self.max_batch_bytes {
            settings = settings.max_batch_bytes(max_batch_bytes);
        }
        if let Some(ms) = self.poll_interval_ms {
            settings = settings.poll_interval(Duration::from_millis(ms));
        }
        if let Some(start_position) = self.start_position {
            settings = settings.start_position(start_position);
        }
        if let Some(language_id) = self.language_id {
            settings = settings.language_id(language_id);
        }
        if let Some(name) = &self.ansi_codec {
            let codec = encodings()
                .iter()
                .find(|c| c.name() == name.as_str())
                .ok_or_else(|| ConfigError::Invalid {
                    reason: format!("unknown ANSI codec `{name}`"),
                })?;
            settings = settings.ansi_codec(*codec);
        }
        if let Some(retry) = self.retry {
            let defaults = *settings.get_retry();
            let retry = RetrySettings {
                initial_backoff: retry
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: retry
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_backoff),
                max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
            };
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid {
                    reason: "retry.max_attempts must be at least 1".to_string(),
                });
            }
            settings = settings.retry(retry);
        }
        Ok(settings)
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_slice(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "no providers configured".to_string(),
            });
        }
        for (i, provider) in self.providers.iter().enumerate() {
            if self.providers[..i]
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&provider.name))
            {
                return Err(ConfigError::Invalid {
                    reason: format!("provider `{}` is configured twice", provider.name),
                });
            }
            self.engine_settings(provider)?;
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.log_root.join("checkpoints"))
    }

    /// Settings for one provider: its own options, then `defaults`, then built-in values.
    pub fn engine_settings(&self, provider: &ProviderConfig) -> Result<EngineSettings, ConfigError> {
        provider
            .options
            .or(&self.defaults)
            .apply(EngineSettings::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
        "log_root": "/var/lib/evt",
        "defaults": { "batch_size": 50, "poll_interval_ms": 1000, "retry": { "max_attempts": 3 } },
        "providers": [
            { "name": "Application" },
            { "name": "System", "start_position": "end", "poll_interval_ms": 250,
              "retry": { "initial_backoff_ms": 10 } }
        ]
    }"#;

    #[test]
    fn test_provider_options_override_defaults() {
        let config: Config = serde_json::from_str(CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/var/lib/evt/checkpoints"));

        let application = config.engine_settings(&config.providers[0]).unwrap();
        assert_eq!(application.get_batch_size(), 50);
        assert_eq!(application.get_poll_interval(), Duration::from_secs(1));
        assert_eq!(application.get_start_position(), StartPosition::Beginning);
        assert_eq!(application.get_retry().max_attempts, 3);

        let system = config.engine_settings(&config.providers[1]).unwrap();
        assert_eq!(system.get_batch_size(), 50);
        assert_eq!(system.get_poll_interval(), Duration::from_millis(250));
        assert_eq!(system.get_start_position(), StartPosition::End);
        assert_eq!(system.get_retry().max_attempts, 3);
        assert_eq!(system.get_retry().initial_backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let duplicate: Config = serde_json::from_str(
            r#"{ "log_root": "x", "providers": [ { "name": "A" }, { "name": "a" } ] }"#,
        )
        .unwrap();
        assert!(matches!(duplicate.validate(), Err(ConfigError::Invalid { .. })));

        let codec: Config = serde_json::from_str(
            r#"{ "log_root": "x", "providers": [ { "name": "A", "ansi_codec": "klingon" } ] }"#,
        )
        .unwrap();
        assert!(matches!(codec.validate(), Err(ConfigError::Invalid { .. })));

        assert!(serde_json::from_str::<Config>(r#"{ "log_root": "x", "providers": [], "extra": 1 }"#).is_err());
    }
}
