//! Engine error types
//!
//! Only control-thread operations return these. The capture and playback
//! callbacks resolve every condition locally and record it in
//! [`PipelineAtomics`](crate::engine::PipelineAtomics) instead.

use thiserror::Error;

/// Errors that can occur while building or controlling the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A configuration value is out of range
    #[error("Invalid engine config: {0}")]
    InvalidConfig(String),

    /// Requested echo delay is outside the supported range
    #[error("Invalid delay time: {delay_ms}ms (supported {min_ms}-{max_ms}ms)")]
    InvalidDelay { delay_ms: u32, min_ms: u32, max_ms: u32 },

    /// Requested decay weight is outside [0, 1)
    #[error("Invalid decay weight: {0} (must be in [0, 1))")]
    InvalidDecay(f32),

    /// The sample buffer pool could not be created
    #[error("Failed to allocate {requested} sample buffers: {reason}")]
    PoolAllocation { requested: usize, reason: String },

    /// The delay line could not be (re)allocated; the previous one is still active
    #[error("Failed to allocate {bytes} byte delay line: {reason}")]
    DelayLineAllocation { bytes: usize, reason: String },

    /// The capture/playback paths are lent to a driver
    #[error("Capture and playback paths are detached; attach them before {0}")]
    StreamsDetached(&'static str),

    /// Paths handed to `attach` were built by a different engine
    #[error("Paths belong to engine #{found}, not engine #{expected}")]
    ForeignStreams { expected: u64, found: u64 },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
