//! Echo Core - real-time capture -> echo -> playback buffer circulation
//!
//! ```ignore
//! use echo_core::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default(), mic, speaker)?;
//! engine.start()?;
//! // driver calls capture.on_buffer_full() / playback.on_buffer_consumed()
//! engine.reconfigure(250, 0.5)?;
//! engine.stop()?;
//! ```

pub mod buffer;
pub mod circulation;
pub mod config;
pub mod effect;
pub mod engine;
pub mod error;
pub mod ring;

pub use buffer::{SampleBuffer, SampleBufferPool};
pub use circulation::{BufferCensus, CaptureDevice, CapturePath, PlaybackDevice, PlaybackPath};
pub use config::{EngineConfig, SampleFormat};
pub use effect::{EchoEffect, EffectHook};
pub use engine::{Engine, EngineControl, PipelineStats};
pub use error::{EngineError, EngineResult};
