//! Echo engine - wires the pool, the queues, and the echo together
//!
//! - Engine: owns everything, exposes start/stop/reconfigure and the census
//! - EngineControl: cloneable handle for the control thread
//! - PipelineAtomics: lock-free counters written by the real-time paths

mod atomics;
mod engine;

pub use atomics::*;
pub use engine::*;
