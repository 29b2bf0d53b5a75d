//! YAML configuration I/O
//!
//! A config file is only taken if it parses and every value is in range.
//! [`load_config`] never fails: a missing, unreadable, malformed or
//! out-of-range file falls back to `T::default()` with a log line, so a bad
//! edit can never keep the engine from starting. [`read_config`] reports
//! why a file was rejected.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::EngineConfig;
use crate::error::EngineResult;

/// A config type that can check its own values after deserializing
pub trait CheckedConfig {
    fn check(&self) -> EngineResult<()>;
}

impl CheckedConfig for EngineConfig {
    fn check(&self) -> EngineResult<()> {
        self.validate()
    }
}

/// Read and check a YAML config file; `Ok(None)` if it does not exist
pub fn read_config<T>(path: &Path) -> Result<Option<T>>
where
    T: DeserializeOwned + CheckedConfig,
{
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };

    let config: T = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse {:?}", path))?;
    config
        .check()
        .with_context(|| format!("Out-of-range value in {:?}", path))?;
    Ok(Some(config))
}

/// Load a config file, falling back to defaults on any problem
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + CheckedConfig + Default,
{
    match read_config(path) {
        Ok(Some(config)) => {
            log::info!("Loaded config from {:?}", path);
            config
        }
        Ok(None) => {
            log::info!("No config at {:?}, using defaults", path);
            T::default()
        }
        Err(e) => {
            log::warn!("{:#}; using defaults", e);
            T::default()
        }
    }
}

/// Check a config and write it as YAML, creating parent directories
///
/// An out-of-range config is refused rather than written, since
/// [`load_config`] would ignore it on the next start.
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize + CheckedConfig,
{
    config.check().context("Refusing to save an invalid config")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write {:?}", path))?;
    log::info!("Saved config to {:?}", path);
    Ok(())
}
