//! Buffer conservation check
//!
//! Every pool buffer sits in exactly one of Free, Captured, RecordShadow or
//! PlayShadow. The census counts all four from the control thread without
//! touching the buffers. It is exact while the devices are stopped; while
//! streaming, a buffer between a pop and the matching push is briefly in
//! no queue, so a single short count is not by itself a leak.

use std::fmt;

use crate::buffer::SampleBuffer;
use crate::engine::PipelineAtomics;
use crate::ring::RingProbe;

use super::playback::Outgoing;

/// Queue occupancy at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCensus {
    pub free: usize,
    pub captured: usize,
    pub record_shadow: usize,
    /// Captured buffers queued on the playback device (silence excluded)
    pub play_shadow: usize,
    /// Silence entries queued on the playback device
    pub silent_in_flight: usize,
    pub pool_size: usize,
}

impl BufferCensus {
    /// Pool buffers accounted for
    pub fn total(&self) -> usize {
        self.free + self.captured + self.record_shadow + self.play_shadow
    }

    /// Whether every pool buffer is accounted for exactly once
    pub fn is_balanced(&self) -> bool {
        self.total() == self.pool_size
    }
}

impl fmt::Display for BufferCensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free={} captured={} record_shadow={} play_shadow={} (+{} silent) total={}/{}",
            self.free,
            self.captured,
            self.record_shadow,
            self.play_shadow,
            self.silent_in_flight,
            self.total(),
            self.pool_size
        )
    }
}

/// Read-only view of the four queues, shareable with the control thread
#[derive(Debug, Clone)]
pub(crate) struct QueueProbes {
    pub free: RingProbe<Box<SampleBuffer>>,
    pub captured: RingProbe<Box<SampleBuffer>>,
    pub record_shadow: RingProbe<Box<SampleBuffer>>,
    pub play_shadow: RingProbe<Outgoing>,
}

impl QueueProbes {
    pub fn count(&self, atomics: &PipelineAtomics, pool_size: usize) -> BufferCensus {
        let silent_in_flight = atomics.silent_in_flight();
        let play_entries = self.play_shadow.len();
        BufferCensus {
            free: self.free.len(),
            captured: self.captured.len(),
            record_shadow: self.record_shadow.len(),
            play_shadow: play_entries.saturating_sub(silent_in_flight),
            silent_in_flight,
            pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance() {
        let census = BufferCensus {
            free: 5,
            captured: 0,
            record_shadow: 3,
            play_shadow: 0,
            silent_in_flight: 3,
            pool_size: 8,
        };
        assert_eq!(census.total(), 8);
        assert!(census.is_balanced());
        assert!(census.to_string().contains("total=8/8"));

        let leaked = BufferCensus {
            record_shadow: 2,
            ..census
        };
        assert!(!leaked.is_balanced());
    }
}
