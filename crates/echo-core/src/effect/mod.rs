//! In-flight processing of captured buffers
//!
//! The capture path runs one [`EffectHook`] on every buffer after it is
//! marked full and before it is queued for playback. The hook runs on the
//! capture thread, so it must not allocate, block, or log.

mod echo;

use std::sync::Arc;

use crate::buffer::SampleBuffer;

pub use echo::{delay_frames_for, mix_sample, EchoEffect, MAX_DELAY_LINE_BYTES, MIX_SCALE};

/// Callback invoked on each captured buffer
pub type EffectHook = Box<dyn FnMut(&mut SampleBuffer) + Send + 'static>;

/// Hook that runs the shared echo effect
pub fn echo_hook(effect: Arc<EchoEffect>) -> EffectHook {
    Box::new(move |buffer: &mut SampleBuffer| {
        effect.process_buffer(buffer);
    })
}
