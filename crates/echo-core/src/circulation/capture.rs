//! Capture side of the circulation protocol
//!
//! Owns the consuming end of Free, the producing end of Captured, and both
//! ends of RecordShadow. RecordShadow mirrors the capture device's own
//! queue: its head is always the buffer the device is filling.
//!
//! A buffer that cannot be pushed where it belongs is parked in a spare list
//! sized for the whole pool. Parked buffers go back to the device on the next
//! refill, or to Free on Stop; the callback never frees a pool buffer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::SampleBuffer;
use crate::effect::EffectHook;
use crate::engine::PipelineAtomics;
use crate::ring::{Consumer, Producer};

use super::device::CaptureDevice;

/// Real-time half driven by the capture callback
///
/// `Send` so it can be moved into a driver thread or callback; see
/// [`Engine::detach`](crate::engine::Engine::detach).
pub struct CapturePath<D> {
    pub(crate) engine_id: u64,
    device: D,
    free: Consumer<Box<SampleBuffer>>,
    captured: Producer<Box<SampleBuffer>>,
    shadow_in: Producer<Box<SampleBuffer>>,
    shadow_out: Consumer<Box<SampleBuffer>>,
    /// Buffers that fell out of the queues on a desync
    parked: Vec<Box<SampleBuffer>>,
    hook: EffectHook,
    atomics: Arc<PipelineAtomics>,
}

impl<D: CaptureDevice> CapturePath<D> {
    pub(crate) fn new(
        engine_id: u64,
        device: D,
        free: Consumer<Box<SampleBuffer>>,
        captured: Producer<Box<SampleBuffer>>,
        shadow: (Producer<Box<SampleBuffer>>, Consumer<Box<SampleBuffer>>),
        hook: EffectHook,
        atomics: Arc<PipelineAtomics>,
    ) -> Self {
        let pool_size = free.capacity();
        Self {
            engine_id,
            device,
            free,
            captured,
            shadow_in: shadow.0,
            shadow_out: shadow.1,
            parked: Vec::with_capacity(pool_size),
            hook,
            atomics,
        }
    }

    /// The capture device just filled the buffer at the head of its queue
    ///
    /// Retire it to Captured (after the effect hook), then top the device back
    /// up from Free. If no buffer is left for the device, stop it and raise
    /// `capture_starved`; the control thread restarts it with Stop + Start.
    ///
    /// While starved the device may still report one trailing completion.
    /// It is ignored: nothing is handed to a stopped device.
    pub fn on_buffer_full(&mut self) {
        if self.atomics.capture_starved() {
            return;
        }

        match self.shadow_out.pop() {
            Some(mut buffer) => {
                buffer.mark_full();
                (self.hook)(&mut *buffer);

                match self.captured.push(buffer) {
                    Ok(()) => {
                        self.atomics.buffers_captured.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(buffer) => {
                        // Captured is sized for the whole pool, so this is a
                        // lost buffer somewhere else. Record over it instead.
                        self.atomics.record_desync();
                        self.hand_to_device(buffer);
                    }
                }
            }
            None => {
                self.atomics.record_desync();
            }
        }

        self.refill(usize::MAX);

        if self.shadow_out.is_empty() {
            self.device.stop();
            self.atomics.capture_starved.store(true, Ordering::Relaxed);
            self.atomics
                .capture_starvations
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Buffer the device is currently recording into
    pub fn device_buffer_mut(&mut self) -> Option<&mut SampleBuffer> {
        self.shadow_out.front_mut().map(|buffer| &mut **buffer)
    }

    /// Buffers currently enqueued with the device
    pub fn in_flight(&self) -> usize {
        self.shadow_out.len()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Move up to `limit` free buffers to the device, stopping early when its
    /// queue is full or Free runs dry
    fn refill(&mut self, limit: usize) -> usize {
        let mut moved = 0;
        while moved < limit && !self.shadow_in.is_full() {
            let Some(buffer) = self.parked.pop().or_else(|| self.free.pop()) else {
                break;
            };
            self.hand_to_device(buffer);
            moved += 1;
        }
        moved
    }

    fn hand_to_device(&mut self, mut buffer: Box<SampleBuffer>) {
        if self.shadow_in.is_full() {
            // Only reachable if a completion was reported without a pop
            self.atomics.record_desync();
            self.park(buffer);
            return;
        }
        buffer.clear();
        self.device.enqueue(&buffer);
        if let Err(buffer) = self.shadow_in.push(buffer) {
            self.park(buffer);
        }
    }

    fn park(&mut self, buffer: Box<SampleBuffer>) {
        // Capacity covers the whole pool, so this never reallocates
        debug_assert!(self.parked.len() < self.parked.capacity());
        self.parked.push(buffer);
    }

    /// Buffers parked after a desync, waiting for the next refill or Stop
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Seed the device with up to `count` buffers; returns how many were seeded
    pub(crate) fn prime(&mut self, count: usize) -> usize {
        self.refill(count)
    }

    /// Take back the next buffer the device holds, then any parked one
    /// (control thread, device stopped)
    pub(crate) fn reclaim(&mut self) -> Option<Box<SampleBuffer>> {
        self.shadow_out.pop().or_else(|| self.parked.pop())
    }

    pub(crate) fn set_hook(&mut self, hook: EffectHook) -> EffectHook {
        std::mem::replace(&mut self.hook, hook)
    }

    pub(crate) fn start_device(&mut self) {
        self.atomics.capture_starved.store(false, Ordering::Relaxed);
        self.device.start();
    }

    pub(crate) fn stop_device(&mut self) {
        self.device.stop();
    }
}

impl<D> std::fmt::Debug for CapturePath<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePath")
            .field("engine_id", &self.engine_id)
            .field("free", &self.free.len())
            .field("in_flight", &self.shadow_out.len())
            .field("parked", &self.parked.len())
            .finish()
    }
}
