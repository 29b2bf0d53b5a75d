//! Configuration for echo-loop
//!
//! Configuration is stored as YAML in the user's config directory.
//! Default location: ~/.config/echo-loop/config.yaml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use echo_core::config::{CheckedConfig, MAX_DELAY_MS, MIN_DELAY_MS};
use echo_core::{EngineConfig, EngineError, EngineResult};

use crate::driver::DriverKind;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Engine settings (format, pool, initial echo)
    pub engine: EngineConfig,
    /// Driver settings (which devices, how long to run)
    pub driver: DriverConfig,
}

/// Driver configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Device backend
    pub kind: DriverKind,
    /// How long to stream before stopping
    pub run_seconds: f32,
    /// Delay to switch to halfway through the run (none keeps the initial delay)
    pub sweep_delay_ms: Option<u32>,
    /// Frequency of the loopback test tone
    pub tone_hz: f32,
    /// Peak amplitude of the loopback test tone (0.0 - 1.0)
    pub tone_level: f32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Loopback,
            run_seconds: 5.0,
            sweep_delay_ms: Some(300),
            tone_hz: 440.0,
            tone_level: 0.5,
        }
    }
}

impl CheckedConfig for LoopConfig {
    fn check(&self) -> EngineResult<()> {
        self.engine.validate()?;
        self.driver.check()
    }
}

impl DriverConfig {
    fn check(&self) -> EngineResult<()> {
        if !self.run_seconds.is_finite() || self.run_seconds < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "run_seconds {} must be a non-negative number",
                self.run_seconds
            )));
        }
        if let Some(delay_ms) = self.sweep_delay_ms {
            if !(MIN_DELAY_MS..=MAX_DELAY_MS).contains(&delay_ms) {
                return Err(EngineError::InvalidDelay {
                    delay_ms,
                    min_ms: MIN_DELAY_MS,
                    max_ms: MAX_DELAY_MS,
                });
            }
        }
        if !(0.0..=1.0).contains(&self.tone_level) {
            return Err(EngineError::InvalidConfig(format!(
                "tone_level {} must be in [0, 1]",
                self.tone_level
            )));
        }
        Ok(())
    }
}

/// Get the default config file path
///
/// Returns ~/.config/echo-loop/config.yaml on Linux
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("echo-loop")
        .join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_core::config::{load_config, save_config};

    #[test]
    fn test_default_config() {
        let config = LoopConfig::default();
        assert_eq!(config.driver.kind, DriverKind::Loopback);
        assert_eq!(config.driver.sweep_delay_ms, Some(300));
        assert!(config.engine.validate().is_ok());
    }

    #[test]
    fn test_sections_fill_defaults() {
        let yaml = "driver:\n  run_seconds: 1.5\n  kind: cpal\n";
        let config: LoopConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.driver.run_seconds, 1.5);
        assert_eq!(config.driver.kind, DriverKind::Cpal);
        assert_eq!(config.driver.tone_hz, 440.0);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = LoopConfig::default();
        config.engine.initial_delay_ms = 420;
        config.driver.sweep_delay_ms = None;
        save_config(&config, &path).unwrap();

        let loaded: LoopConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_out_of_range_driver_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "driver:\n  sweep_delay_ms: 9000\n").unwrap();

        let loaded: LoopConfig = load_config(&path);
        assert_eq!(loaded, LoopConfig::default());

        let mut config = LoopConfig::default();
        config.driver.tone_level = 2.0;
        assert!(config.check().is_err());
        assert!(save_config(&config, &path).is_err());
    }
}
