//! Batch configuration and the process-wide compatibility switch.

use once_cell::sync::Lazy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::formatter::FormatterKind;

pub const TGI_COMPAT_ENV: &str = "OPTION_TGI_COMPAT";
pub const OUTPUT_FORMATTER_ENV: &str = "OPTION_OUTPUT_FORMATTER";
pub const MAX_ROLLING_BATCH_SIZE_ENV: &str = "OPTION_MAX_ROLLING_BATCH_SIZE";
pub const MAX_NEW_TOKENS_ENV: &str = "OPTION_MAX_NEW_TOKENS";

static STRICT_COMPAT_MODE: Lazy<AtomicBool> = Lazy::new(|| {
    let on = std::env::var(TGI_COMPAT_ENV)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(false);
    AtomicBool::new(on)
});

/// Current value of the process-wide strict compatibility switch.
///
/// Requests read it once when built; flipping it later does not affect
/// requests already in flight.
pub fn strict_compat_mode() -> bool {
    STRICT_COMPAT_MODE.load(Ordering::Relaxed)
}

pub fn set_strict_compat_mode(on: bool) {
    STRICT_COMPAT_MODE.store(on, Ordering::Relaxed);
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },
}

/// Settings of a [`RollingBatch`](crate::RollingBatch).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    /// Wrap document output in a one-element array.
    pub strict_compat_mode: bool,
    /// Formatter for requests that name neither a formatter nor `stream`.
    pub output_formatter: Option<FormatterKind>,
    pub max_rolling_batch_size: usize,
    /// Used when a request carries no `max_new_tokens` parameter.
    pub max_new_tokens: usize,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            strict_compat_mode: false,
            output_formatter: None,
            max_rolling_batch_size: 32,
            max_new_tokens: 256,
        }
    }
}

impl RollingConfig {
    /// Load configuration from a TOML file containing a `[rolling]` table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "loaded rolling config");
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Root {
            #[serde(default)]
            rolling: RollingConfig,
        }
        let root: Root = toml::from_str(text)?;
        Ok(root.rolling)
    }

    /// Apply `OPTION_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `OPTION_*` overrides from `lookup`. Empty values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get(TGI_COMPAT_ENV) {
            self.strict_compat_mode = parse_bool(&value).ok_or(ConfigError::Env {
                key: TGI_COMPAT_ENV,
                value,
            })?;
        }
        if let Some(value) = get(OUTPUT_FORMATTER_ENV) {
            let kind = value.trim().parse::<FormatterKind>().map_err(|_| ConfigError::Env {
                key: OUTPUT_FORMATTER_ENV,
                value,
            })?;
            self.output_formatter = Some(kind);
        }
        if let Some(value) = get(MAX_ROLLING_BATCH_SIZE_ENV) {
            self.max_rolling_batch_size = parse_usize(MAX_ROLLING_BATCH_SIZE_ENV, value)?;
        }
        if let Some(value) = get(MAX_NEW_TOKENS_ENV) {
            self.max_new_tokens = parse_usize(MAX_NEW_TOKENS_ENV, value)?;
        }
        Ok(self)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_usize(key: &'static str, value: String) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn toml_table_with_defaults() {
        let cfg = RollingConfig::from_toml_str(
            "[rolling]\nstrict_compat_mode = true\noutput_formatter = \"jsonlines\"\n",
        )
        .unwrap();
        assert!(cfg.strict_compat_mode);
        assert_eq!(cfg.output_formatter, Some(FormatterKind::JsonLines));
        assert_eq!(cfg.max_new_tokens, 256);
    }

    #[test]
    fn missing_table_is_default() {
        let cfg = RollingConfig::from_toml_str("[other]\nx = 1\n").unwrap();
        assert_eq!(cfg, RollingConfig::default());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = RollingConfig::default()
            .with_overrides(lookup(&[
                (TGI_COMPAT_ENV, "true"),
                (OUTPUT_FORMATTER_ENV, "sse"),
                (MAX_ROLLING_BATCH_SIZE_ENV, "4"),
                (MAX_NEW_TOKENS_ENV, ""),
            ]))
            .unwrap();
        assert!(cfg.strict_compat_mode);
        assert_eq!(cfg.output_formatter, Some(FormatterKind::Sse));
        assert_eq!(cfg.max_rolling_batch_size, 4);
        assert_eq!(cfg.max_new_tokens, 256);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = RollingConfig::default()
            .with_overrides(lookup(&[(TGI_COMPAT_ENV, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: TGI_COMPAT_ENV, .. }));
    }
}
