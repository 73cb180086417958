//! Configuration loading and defaults for dotnet-bridge.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::process::RunnerSettings;

pub const DEFAULT_DOTNET_PATH: &str = "dotnet";
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 1_000_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
/// Thirty days.
pub const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_STOP_GRACE_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
const CONFIG_PATH_ENV: &str = "DOTNET_BRIDGE_CONFIG";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

// === Types ===

/// Raw configuration as read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub dotnet_path: Option<String>,
    pub max_output_chars: Option<usize>,
    pub cache_ttl_secs: Option<u64>,
    pub stop_grace_period_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub default_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
    pub redact_output: Option<bool>,
}

/// Configuration with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub dotnet_path: String,
    pub max_output_chars: usize,
    pub cache_ttl: Duration,
    pub stop_grace_period: Duration,
    pub drain_timeout: Duration,
    pub default_timeout: Option<Duration>,
    pub log_level: String,
    pub redact_output: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Config::default().resolve()
    }
}

impl ResolvedConfig {
    #[must_use]
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            max_output_chars: self.max_output_chars,
            drain_timeout: self.drain_timeout,
        }
    }
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    ///
    /// An explicit `path` must exist. The default locations are optional.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let explicit = path.is_some();
        let path = path.or_else(default_config_path);

        let mut config = match path.as_ref() {
            Some(path) if explicit || path.exists() => load_config_file(path)?,
            _ => Config::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the bridge misbehave.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.dotnet_path
            && path.trim().is_empty()
        {
            anyhow::bail!("dotnet_path cannot be empty");
        }
        if self.max_output_chars == Some(0) {
            anyhow::bail!("max_output_chars must be greater than zero");
        }
        if self.cache_ttl_secs == Some(0) {
            anyhow::bail!("cache_ttl_secs must be greater than zero");
        }
        if let Some(ttl) = self.cache_ttl_secs
            && ttl > MAX_CACHE_TTL_SECS
        {
            anyhow::bail!("cache_ttl_secs must be at most {MAX_CACHE_TTL_SECS}");
        }
        if self.default_timeout_secs == Some(0) {
            anyhow::bail!("default_timeout_secs must be greater than zero when set");
        }
        if let Some(level) = &self.log_level
            && !LOG_LEVELS.contains(&level.trim().to_ascii_lowercase().as_str())
        {
            anyhow::bail!(
                "Unknown log_level '{level}'. Expected one of: {}",
                LOG_LEVELS.join(", ")
            );
        }
        Ok(())
    }

    /// Apply defaults.
    #[must_use]
    pub fn resolve(&self) -> ResolvedConfig {
        ResolvedConfig {
            dotnet_path: self
                .dotnet_path
                .as_deref()
                .map(str::trim)
                .unwrap_or(DEFAULT_DOTNET_PATH)
                .to_string(),
            max_output_chars: self.max_output_chars.unwrap_or(DEFAULT_MAX_OUTPUT_CHARS),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS)),
            stop_grace_period: Duration::from_millis(
                self.stop_grace_period_ms
                    .unwrap_or(DEFAULT_STOP_GRACE_PERIOD_MS),
            ),
            drain_timeout: Duration::from_millis(
                self.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
            ),
            default_timeout: self.default_timeout_secs.map(Duration::from_secs),
            log_level: self
                .log_level
                .as_deref()
                .map(|level| level.trim().to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            redact_output: self.redact_output.unwrap_or(true),
        }
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

// === Defaults ===

/// Config file consulted when `--config` is not given.
pub fn default_config_path() -> Option<PathBuf> {
    env_config_path().or_else(user_config_path)
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dotnet-bridge").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    let path = std::env::var(CONFIG_PATH_ENV).ok()?;
    let trimmed = path.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(value) = lookup("DOTNET_BRIDGE_DOTNET_PATH") {
        config.dotnet_path = Some(value);
    }
    if let Some(value) = lookup("DOTNET_BRIDGE_MAX_OUTPUT_CHARS")
        && let Ok(parsed) = value.trim().parse::<usize>()
    {
        config.max_output_chars = Some(parsed);
    }
    if let Some(value) = lookup("DOTNET_BRIDGE_CACHE_TTL_SECS")
        && let Ok(parsed) = value.trim().parse::<u64>()
    {
        config.cache_ttl_secs = Some(parsed);
    }
    if let Some(value) = lookup("DOTNET_BRIDGE_LOG_LEVEL") {
        config.log_level = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_resolve_without_a_file() {
        let resolved = Config::default().resolve();
        assert_eq!(resolved.dotnet_path, "dotnet");
        assert_eq!(resolved.max_output_chars, 1_000_000);
        assert_eq!(resolved.cache_ttl, Duration::from_secs(300));
        assert_eq!(resolved.stop_grace_period, Duration::from_secs(5));
        assert_eq!(resolved.drain_timeout, Duration::from_secs(2));
        assert_eq!(resolved.default_timeout, None);
        assert_eq!(resolved.log_level, "info");
        assert!(resolved.redact_output);
    }

    #[test]
    fn explicit_file_is_parsed() -> Result<()> {
        let tmp = tempdir()?;
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            "dotnet_path = \"/usr/share/dotnet/dotnet\"\nmax_output_chars = 5000\ndefault_timeout_secs = 600\nredact_output = false\n",
        )?;

        let config = load_config_file(&path)?;
        config.validate()?;
        let resolved = config.resolve();
        assert_eq!(resolved.dotnet_path, "/usr/share/dotnet/dotnet");
        assert_eq!(resolved.max_output_chars, 5000);
        assert_eq!(resolved.default_timeout, Some(Duration::from_secs(600)));
        assert!(!resolved.redact_output);
        Ok(())
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let tmp = tempdir().expect("tempdir");
        let err = Config::load(Some(tmp.path().join("absent.toml"))).expect_err("should fail");
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn unknown_keys_are_rejected() -> Result<()> {
        let tmp = tempdir()?;
        let path = tmp.path().join("config.toml");
        fs::write(&path, "max_output = 10\n")?;
        let err = load_config_file(&path).expect_err("unknown key");
        assert!(err.to_string().contains("Failed to parse config file"));
        Ok(())
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = Config {
            dotnet_path: Some("dotnet".to_string()),
            cache_ttl_secs: Some(60),
            ..Config::default()
        };
        apply_env_overrides(
            &mut config,
            env_from(&[
                ("DOTNET_BRIDGE_DOTNET_PATH", "/opt/dotnet/dotnet"),
                ("DOTNET_BRIDGE_CACHE_TTL_SECS", "30"),
                ("DOTNET_BRIDGE_MAX_OUTPUT_CHARS", "not-a-number"),
                ("DOTNET_BRIDGE_LOG_LEVEL", "DEBUG"),
            ]),
        );
        assert_eq!(config.dotnet_path.as_deref(), Some("/opt/dotnet/dotnet"));
        assert_eq!(config.cache_ttl_secs, Some(30));
        assert_eq!(config.max_output_chars, None);
        assert_eq!(config.resolve().log_level, "debug");
    }

    #[test]
    fn validation_rejects_nonsense() {
        let zero_budget = Config {
            max_output_chars: Some(0),
            ..Config::default()
        };
        assert!(zero_budget.validate().is_err());

        let zero_ttl = Config {
            cache_ttl_secs: Some(0),
            ..Config::default()
        };
        assert!(zero_ttl.validate().is_err());

        let endless_ttl = Config {
            cache_ttl_secs: Some(u64::MAX),
            ..Config::default()
        };
        assert!(endless_ttl.validate().is_err());
        let month_ttl = Config {
            cache_ttl_secs: Some(MAX_CACHE_TTL_SECS),
            ..Config::default()
        };
        assert!(month_ttl.validate().is_ok());

        let blank_path = Config {
            dotnet_path: Some("  ".to_string()),
            ..Config::default()
        };
        assert!(blank_path.validate().is_err());

        let bad_level = Config {
            log_level: Some("loud".to_string()),
            ..Config::default()
        };
        assert!(bad_level.validate().is_err());
    }
}
