//! Playback side of the circulation protocol
//!
//! Owns the consuming end of Captured, the producing end of Free, both ends
//! of PlayShadow, and the silent buffer. The silent buffer is never boxed
//! into a queue: PlayShadow records it as [`Outgoing::Silence`], so it cannot
//! leak into Free or Captured.
//!
//! If Free ever refuses a buffer, the buffer is parked and offered to Free
//! again on the next completion; Stop returns whatever is still parked.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::SampleBuffer;
use crate::engine::PipelineAtomics;
use crate::ring::{Consumer, Producer};

use super::device::PlaybackDevice;

/// An entry in the playback device's queue
#[derive(Debug)]
pub enum Outgoing {
    /// A captured buffer, returned to Free once played
    Captured(Box<SampleBuffer>),
    /// The path's own silent buffer
    Silence,
}

/// Real-time half driven by the playback callback
pub struct PlaybackPath<D> {
    pub(crate) engine_id: u64,
    device: D,
    captured: Consumer<Box<SampleBuffer>>,
    free: Producer<Box<SampleBuffer>>,
    shadow_in: Producer<Outgoing>,
    shadow_out: Consumer<Outgoing>,
    silence: SampleBuffer,
    /// Buffers Free refused, waiting to be returned
    parked: Vec<Box<SampleBuffer>>,
    atomics: Arc<PipelineAtomics>,
}

impl<D: PlaybackDevice> PlaybackPath<D> {
    pub(crate) fn new(
        engine_id: u64,
        device: D,
        captured: Consumer<Box<SampleBuffer>>,
        free: Producer<Box<SampleBuffer>>,
        shadow: (Producer<Outgoing>, Consumer<Outgoing>),
        buffer_bytes: usize,
        atomics: Arc<PipelineAtomics>,
    ) -> Self {
        let pool_size = free.capacity();
        Self {
            engine_id,
            device,
            captured,
            free,
            shadow_in: shadow.0,
            shadow_out: shadow.1,
            silence: SampleBuffer::silence(buffer_bytes),
            parked: Vec::with_capacity(pool_size),
            atomics,
        }
    }

    /// The playback device finished the buffer at the head of its queue
    ///
    /// Return it to Free, then keep the device fed: captured data in capture
    /// order while there is any, otherwise one silent buffer.
    pub fn on_buffer_consumed(&mut self) {
        self.unpark();

        match self.shadow_out.pop() {
            Some(Outgoing::Captured(buffer)) => {
                self.atomics.buffers_played.fetch_add(1, Ordering::Relaxed);
                self.release(buffer);
            }
            Some(Outgoing::Silence) => {
                self.atomics.silent_in_flight.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                // Completion with nothing tracked: re-arm below
                self.atomics.record_desync();
            }
        }

        self.arm(1);
    }

    /// Buffer the device is currently playing from
    pub fn device_buffer(&self) -> Option<&SampleBuffer> {
        self.shadow_out.front().map(|entry| match entry {
            Outgoing::Captured(buffer) => &**buffer,
            Outgoing::Silence => &self.silence,
        })
    }

    /// Entries currently enqueued with the device, silence included
    pub fn in_flight(&self) -> usize {
        self.shadow_out.len()
    }

    /// Captured buffers waiting to be played
    pub fn backlog(&self) -> usize {
        self.captured.len()
    }

    /// Buffers Free refused, waiting for the next completion or Stop
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn silence(&self) -> &SampleBuffer {
        &self.silence
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Queue captured buffers until the device queue is full, falling back to
    /// silence so at least `min_entries` were queued
    fn arm(&mut self, min_entries: usize) -> usize {
        let mut queued = 0;
        while !self.shadow_in.is_full() {
            let Some(buffer) = self.captured.pop() else {
                break;
            };
            self.device.enqueue(&buffer);
            self.push_shadow(Outgoing::Captured(buffer));
            queued += 1;
        }

        while queued < min_entries && !self.shadow_in.is_full() {
            self.device.enqueue(&self.silence);
            self.atomics.silent_in_flight.fetch_add(1, Ordering::Relaxed);
            self.atomics.silence_inserted.fetch_add(1, Ordering::Relaxed);
            self.push_shadow(Outgoing::Silence);
            queued += 1;
        }
        queued
    }

    fn push_shadow(&mut self, entry: Outgoing) {
        if let Err(entry) = self.shadow_in.push(entry) {
            self.atomics.record_desync();
            self.retire(entry);
        }
    }

    fn retire(&mut self, entry: Outgoing) {
        match entry {
            Outgoing::Captured(buffer) => self.release(buffer),
            Outgoing::Silence => {
                self.atomics.silent_in_flight.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Return a buffer to Free, parking it if Free is full
    fn release(&mut self, mut buffer: Box<SampleBuffer>) {
        buffer.clear();
        if let Err(buffer) = self.free.push(buffer) {
            self.atomics.record_desync();
            // Capacity covers the whole pool, so this never reallocates
            debug_assert!(self.parked.len() < self.parked.capacity());
            self.parked.push(buffer);
        }
    }

    /// Offer parked buffers to Free again
    fn unpark(&mut self) {
        while !self.free.is_full() {
            let Some(buffer) = self.parked.pop() else {
                break;
            };
            if let Err(buffer) = self.free.push(buffer) {
                self.parked.push(buffer);
                break;
            }
        }
    }

    /// Arm the device before it starts: captured data first, then silence,
    /// `count` entries in all (bounded by the shadow depth)
    pub(crate) fn prime(&mut self, count: usize) -> usize {
        self.arm(count)
    }

    /// Return a buffer to Free (control thread, devices stopped)
    pub(crate) fn recycle(&mut self, buffer: Box<SampleBuffer>) {
        self.release(buffer);
    }

    /// Move everything queued for playback, and anything parked, back to Free
    pub(crate) fn drain(&mut self) {
        self.unpark();
        while let Some(entry) = self.shadow_out.pop() {
            self.retire(entry);
        }
        while let Some(buffer) = self.captured.pop() {
            self.recycle(buffer);
        }
    }

    pub(crate) fn start_device(&mut self) {
        self.device.start();
    }

    pub(crate) fn stop_device(&mut self) {
        self.device.stop();
    }
}

impl<D> std::fmt::Debug for PlaybackPath<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackPath")
            .field("engine_id", &self.engine_id)
            .field("backlog", &self.captured.len())
            .field("in_flight", &self.shadow_out.len())
            .field("parked", &self.parked.len())
            .finish()
    }
}
