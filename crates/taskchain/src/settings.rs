// ChainSettings: tunables shared by the engine and the reference host.
// Persisted as JSON and overridable from the environment.

use crate::error::ChainError;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Environment variable overriding `callback_timeout_ticks` (`0` or `none` disables it).
pub const ENV_CALLBACK_TIMEOUT_TICKS: &str = "TASKCHAIN_CALLBACK_TIMEOUT_TICKS";
/// Environment variable overriding `tick_millis`.
pub const ENV_TICK_MILLIS: &str = "TASKCHAIN_TICK_MILLIS";
/// Environment variable overriding `background_workers`.
pub const ENV_BACKGROUND_WORKERS: &str = "TASKCHAIN_BACKGROUND_WORKERS";

/// Default length of one host tick in milliseconds.
pub const DEFAULT_TICK_MILLIS: u64 = 50;
/// Default number of background worker threads.
pub const DEFAULT_BACKGROUND_WORKERS: usize = 4;

/// Settings for chain execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Ticks a callback step may take before the chain fails with a timeout.
    /// `None` keeps the unbounded wait.
    #[serde(default, rename = "CallbackTimeoutTicks")]
    pub callback_timeout_ticks: Option<u64>,

    /// Length of one host tick.
    #[serde(default = "default_tick_millis", rename = "TickMillis")]
    pub tick_millis: u64,

    /// Worker threads for the background context.
    #[serde(default = "default_background_workers", rename = "BackgroundWorkers")]
    pub background_workers: usize,
}

fn default_tick_millis() -> u64 {
    DEFAULT_TICK_MILLIS
}

fn default_background_workers() -> usize {
    DEFAULT_BACKGROUND_WORKERS
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            callback_timeout_ticks: None,
            tick_millis: DEFAULT_TICK_MILLIS,
            background_workers: DEFAULT_BACKGROUND_WORKERS,
        }
    }
}

impl ChainSettings {
    /// Load settings from a JSON file and validate them.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read task chain settings from {:?}", path))?;

        let settings: ChainSettings = serde_json::from_str(&json)
            .with_context(|| "Failed to deserialize task chain settings")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, &json)
            .with_context(|| format!("Failed to write task chain settings to {:?}", path))?;
        Ok(())
    }

    /// Apply `TASKCHAIN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_CALLBACK_TIMEOUT_TICKS) {
            let raw = raw.trim();
            self.callback_timeout_ticks = if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
                None
            } else {
                match raw.parse::<u64>() {
                    Ok(0) => None,
                    Ok(ticks) => Some(ticks),
                    Err(_) => {
                        return Err(ChainError::InvalidSettings(format!(
                            "{} must be a tick count, got '{}'",
                            ENV_CALLBACK_TIMEOUT_TICKS, raw
                        ))
                        .into())
                    }
                }
            };
        }

        if let Some(raw) = lookup(ENV_TICK_MILLIS) {
            self.tick_millis = raw.trim().parse().map_err(|_| {
                ChainError::InvalidSettings(format!(
                    "{} must be an integer, got '{}'",
                    ENV_TICK_MILLIS, raw
                ))
            })?;
        }

        if let Some(raw) = lookup(ENV_BACKGROUND_WORKERS) {
            self.background_workers = raw.trim().parse().map_err(|_| {
                ChainError::InvalidSettings(format!(
                    "{} must be an integer, got '{}'",
                    ENV_BACKGROUND_WORKERS, raw
                ))
            })?;
        }

        self.validate()?;
        Ok(())
    }

    /// Reject settings the host cannot run with.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.tick_millis == 0 {
            return Err(ChainError::InvalidSettings("tick length must be positive".into()));
        }
        if self.background_workers == 0 {
            return Err(ChainError::InvalidSettings(
                "at least one background worker is required".into(),
            ));
        }
        Ok(())
    }
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
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = ChainSettings::default();
        assert_eq!(settings.callback_timeout_ticks, None);
        assert_eq!(settings.tick_millis, 50);
        assert_eq!(settings.background_workers, 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskchain.json");
        let settings = ChainSettings {
            callback_timeout_ticks: Some(200),
            tick_millis: 20,
            background_workers: 2,
        };
        settings.save(&path).unwrap();
        assert_eq!(ChainSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{ "CallbackTimeoutTicks": 40 }"#).unwrap();
        let settings = ChainSettings::load(&path).unwrap();
        assert_eq!(settings.callback_timeout_ticks, Some(40));
        assert_eq!(settings.tick_millis, DEFAULT_TICK_MILLIS);
        assert_eq!(settings.background_workers, DEFAULT_BACKGROUND_WORKERS);
    }

    #[test]
    fn test_load_rejects_zero_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "TickMillis": 0 }"#).unwrap();
        assert!(ChainSettings::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ChainSettings::load(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut settings = ChainSettings::default();
        settings
            .apply_overrides_from(lookup(&[
                (ENV_CALLBACK_TIMEOUT_TICKS, "100"),
                (ENV_TICK_MILLIS, "10"),
                (ENV_BACKGROUND_WORKERS, "8"),
            ]))
            .unwrap();
        assert_eq!(settings.callback_timeout_ticks, Some(100));
        assert_eq!(settings.tick_millis, 10);
        assert_eq!(settings.background_workers, 8);
    }

    #[test]
    fn test_timeout_override_can_disable() {
        let mut settings = ChainSettings {
            callback_timeout_ticks: Some(5),
            ..ChainSettings::default()
        };
        settings
            .apply_overrides_from(lookup(&[(ENV_CALLBACK_TIMEOUT_TICKS, "none")]))
            .unwrap();
        assert_eq!(settings.callback_timeout_ticks, None);

        settings.callback_timeout_ticks = Some(5);
        settings
            .apply_overrides_from(lookup(&[(ENV_CALLBACK_TIMEOUT_TICKS, "0")]))
            .unwrap();
        assert_eq!(settings.callback_timeout_ticks, None);
    }

    #[test]
    fn test_invalid_override() {
        let mut settings = ChainSettings::default();
        assert!(settings
            .apply_overrides_from(lookup(&[(ENV_BACKGROUND_WORKERS, "many")]))
            .is_err());
        assert!(settings
            .apply_overrides_from(lookup(&[(ENV_BACKGROUND_WORKERS, "0")]))
            .is_err());
    }
}
