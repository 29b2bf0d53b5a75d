//! Lock-free pipeline counters
//!
//! Written by the capture and playback callbacks, read by the control
//! thread. Every access is `Ordering::Relaxed`: the counters are for
//! visibility only and never guard other memory.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Counters shared by both real-time paths
#[derive(Debug, Default)]
pub struct PipelineAtomics {
    /// Buffers pushed onto the captured queue
    pub buffers_captured: AtomicU64,
    /// Captured buffers the playback device finished with
    pub buffers_played: AtomicU64,
    /// Times the silent buffer was handed to the playback device
    pub silence_inserted: AtomicU64,
    /// Times the capture path ran out of free buffers and stopped its device
    pub capture_starvations: AtomicU64,
    /// Completions that did not match the shadow queue (or a push that could not land)
    pub shadow_desyncs: AtomicU64,
    /// Capture device is stopped waiting for a control-thread restart
    pub capture_starved: AtomicBool,
    /// Silence entries currently in the playback shadow queue
    pub silent_in_flight: AtomicUsize,
    /// A path saw a desync; the control thread should take a census
    pub census_requested: AtomicBool,
}

impl PipelineAtomics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the capture path stopped itself (lock-free)
    #[inline]
    pub fn capture_starved(&self) -> bool {
        self.capture_starved.load(Ordering::Relaxed)
    }

    /// Count a shadow desync and flag it for the control thread
    #[inline]
    pub fn record_desync(&self) {
        self.shadow_desyncs.fetch_add(1, Ordering::Relaxed);
        self.census_requested.store(true, Ordering::Relaxed);
    }

    /// Clear and return the census request flag
    #[inline]
    pub fn take_census_request(&self) -> bool {
        self.census_requested.swap(false, Ordering::Relaxed)
    }

    #[inline]
    pub fn silent_in_flight(&self) -> usize {
        self.silent_in_flight.load(Ordering::Relaxed)
    }

    /// Copy every counter out
    pub fn snapshot(&self, effect_skips: u64) -> PipelineStats {
        PipelineStats {
            buffers_captured: self.buffers_captured.load(Ordering::Relaxed),
            buffers_played: self.buffers_played.load(Ordering::Relaxed),
            silence_inserted: self.silence_inserted.load(Ordering::Relaxed),
            capture_starvations: self.capture_starvations.load(Ordering::Relaxed),
            shadow_desyncs: self.shadow_desyncs.load(Ordering::Relaxed),
            effect_skips,
        }
    }
}

/// Point-in-time copy of [`PipelineAtomics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub buffers_captured: u64,
    pub buffers_played: u64,
    pub silence_inserted: u64,
    pub capture_starvations: u64,
    pub shadow_desyncs: u64,
    /// Echo calls that passed audio through unmodified
    pub effect_skips: u64,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "captured={} played={} silence={} starvations={} desyncs={} effect_skips={}",
            self.buffers_captured,
            self.buffers_played,
            self.silence_inserted,
            self.capture_starvations,
            self.shadow_desyncs,
            self.effect_skips
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desync_requests_one_census() {
        let atomics = PipelineAtomics::new();
        assert!(!atomics.take_census_request());

        atomics.record_desync();
        atomics.record_desync();
        assert!(atomics.take_census_request());
        assert!(!atomics.take_census_request());
        assert_eq!(atomics.snapshot(0).shadow_desyncs, 2);
    }
}
