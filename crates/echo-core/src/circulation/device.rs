//! Narrow interface to the platform audio devices
//!
//! A device owns a short FIFO of buffers the host handed to it. It reports
//! completions by having its driver call
//! [`CapturePath::on_buffer_full`](super::CapturePath::on_buffer_full) or
//! [`PlaybackPath::on_buffer_consumed`](super::PlaybackPath::on_buffer_consumed),
//! always in the order the buffers were enqueued.
//!
//! Implementations are called from the real-time callback threads and must
//! not block or allocate in `enqueue`.

use crate::buffer::SampleBuffer;

/// Input device fed with empty buffers to record into
pub trait CaptureDevice: Send {
    /// Hand an empty buffer to the device
    ///
    /// The samples are written through
    /// [`CapturePath::device_buffer_mut`](super::CapturePath::device_buffer_mut)
    /// while the buffer is at the head of the device's queue.
    fn enqueue(&mut self, buffer: &SampleBuffer);

    /// Start firing completions
    fn start(&mut self);

    /// Stop firing completions; buffers already enqueued stay tracked by the host
    fn stop(&mut self);
}

/// Output device fed with filled buffers to play
pub trait PlaybackDevice: Send {
    /// Hand a filled buffer (possibly the silent buffer) to the device
    fn enqueue(&mut self, buffer: &SampleBuffer);

    fn start(&mut self);

    fn stop(&mut self);
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn enqueue(&mut self, buffer: &SampleBuffer) {
        (**self).enqueue(buffer)
    }

    fn start(&mut self) {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

impl<D: PlaybackDevice + ?Sized> PlaybackDevice for Box<D> {
    fn enqueue(&mut self, buffer: &SampleBuffer) {
        (**self).enqueue(buffer)
    }

    fn start(&mut self) {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}
