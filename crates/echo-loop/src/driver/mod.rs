//! Device drivers for echo-loop
//!
//! A driver owns the real devices (or a simulation of them), calls the
//! engine paths from its callback threads, and reports what it heard.

#[cfg(feature = "cpal-backend")]
pub mod cpal;
pub mod loopback;

use serde::{Deserialize, Serialize};

use echo_core::{BufferCensus, PipelineStats};

/// Which device backend drives the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Simulated microphone and speaker on two threads, no hardware needed
    Loopback,
    /// Default system input and output via CPAL
    Cpal,
}

/// What a finished run looked like
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Census after the final stop
    pub census: BufferCensus,
    pub stats: PipelineStats,
    /// Buffers the output device consumed, silence included
    pub buffers_out: u64,
    /// Loudest sample the output device played
    pub peak_out: i16,
    /// Whether the capture path starved during the run
    pub capture_starved: bool,
    /// Stop + Start cycles the driver ran to recover from starvation
    pub restarts: u32,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} | out={} peak={} restarts={}{}",
            self.census,
            self.stats,
            self.buffers_out,
            self.peak_out,
            self.restarts,
            if self.capture_starved { " (capture starved)" } else { "" }
        )
    }
}
