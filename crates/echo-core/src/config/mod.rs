//! Engine configuration and YAML persistence
//!
//! ```ignore
//! use echo_core::config::{load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&path);
//! config.validate()?;
//! ```

mod engine;
mod io;

pub use engine::{
    EngineConfig, SampleFormat, DEFAULT_FRAMES_PER_BUFFER, DEFAULT_KICKSTART, DEFAULT_POOL_SIZE,
    DEFAULT_SAMPLE_RATE, MAX_DELAY_MS, MIN_DELAY_MS,
};
pub(crate) use engine::{validate_decay, validate_delay};
pub use io::{load_config, read_config, save_config, CheckedConfig};
