//! Integer feedback delay ("echo")
//!
//! The delay line holds exactly `delay_ms` worth of interleaved 16-bit
//! frames. Each processed sample is swapped with the sample stored at the
//! write cursor: the stored sample becomes the output and the mix of live
//! input and stored sample is written back, so every echo comes back one
//! line length later, attenuated by the decay weight.
//!
//! Mixing is done in fixed point with weights that always sum to
//! [`MIX_SCALE`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, TryLockError};

use crate::buffer::SampleBuffer;
use crate::config::{validate_decay, validate_delay, SampleFormat};
use crate::error::{EngineError, EngineResult};

/// Fixed-point scale shared by the feedback and live weights
pub const MIX_SCALE: i32 = 128;

const MS_PER_SEC: u64 = 1000;

/// Largest delay line the effect will allocate (64 MiB)
pub const MAX_DELAY_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Mix one stored sample with one live sample, clamped to 16 bits
#[inline]
pub fn mix_sample(delayed: i16, live: i16, feedback_factor: i32, live_factor: i32) -> i16 {
    let mixed = (delayed as i32 * feedback_factor + live as i32 * live_factor) / MIX_SCALE;
    mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Frames needed for `delay_ms` at `sample_rate`, rounded to nearest
pub fn delay_frames_for(delay_ms: u32, sample_rate: u32) -> usize {
    let frames = (delay_ms as u64 * sample_rate as u64 + MS_PER_SEC / 2) / MS_PER_SEC;
    frames.max(1) as usize
}

/// Split a decay weight into (feedback, live) factors
fn mix_factors(decay: f32) -> (i32, i32) {
    let feedback = ((decay * MIX_SCALE as f32).round() as i32).clamp(0, MIX_SCALE);
    (feedback, MIX_SCALE - feedback)
}

struct DelayLine {
    samples: Vec<i16>,
    /// Write position in frames
    cursor: usize,
    frames: usize,
    delay_ms: u32,
    decay: f32,
    feedback_factor: i32,
    live_factor: i32,
}

impl DelayLine {
    fn allocate(format: &SampleFormat, delay_ms: u32, decay: f32) -> EngineResult<Self> {
        let channels = format.channels as usize;
        let frames = delay_frames_for(delay_ms, format.sample_rate);
        let sample_count = frames * channels;
        let bytes = sample_count * std::mem::size_of::<i16>();
        if bytes > MAX_DELAY_LINE_BYTES {
            return Err(EngineError::DelayLineAllocation {
                bytes,
                reason: format!("exceeds the {} byte limit", MAX_DELAY_LINE_BYTES),
            });
        }

        let mut samples = Vec::new();
        samples
            .try_reserve_exact(sample_count)
            .map_err(|e| EngineError::DelayLineAllocation {
                bytes,
                reason: e.to_string(),
            })?;
        samples.resize(sample_count, 0);

        let (feedback_factor, live_factor) = mix_factors(decay);
        Ok(Self {
            samples,
            cursor: 0,
            frames,
            delay_ms,
            decay,
            feedback_factor,
            live_factor,
        })
    }

    fn set_decay(&mut self, decay: f32) {
        let (feedback_factor, live_factor) = mix_factors(decay);
        self.decay = decay;
        self.feedback_factor = feedback_factor;
        self.live_factor = live_factor;
    }

    fn process(&mut self, live: &mut [i16], frames: usize, channels: usize) {
        if self.cursor + frames > self.frames {
            self.cursor = 0;
        }

        let start = self.cursor * channels;
        let stored = &mut self.samples[start..start + frames * channels];
        for (out, slot) in live.iter_mut().zip(stored.iter_mut()) {
            let delayed = *slot;
            *slot = mix_sample(delayed, *out, self.feedback_factor, self.live_factor);
            *out = delayed;
        }

        self.cursor = (self.cursor + frames) % self.frames;
    }
}

/// Echo effect shared between the capture thread and the control thread
///
/// `process` never blocks: if the control thread is swapping the delay line,
/// the call passes audio through untouched and counts a skip.
pub struct EchoEffect {
    line: Mutex<DelayLine>,
    format: SampleFormat,
    skipped: AtomicU64,
}

impl EchoEffect {
    /// Allocate a zero-filled delay line for `delay_ms` at `format`
    pub fn new(format: SampleFormat, delay_ms: u32, decay: f32) -> EngineResult<Self> {
        validate_delay(delay_ms)?;
        validate_decay(decay)?;
        let line = DelayLine::allocate(&format, delay_ms, decay)?;
        Ok(Self {
            line: Mutex::new(line),
            format,
            skipped: AtomicU64::new(0),
        })
    }

    /// Apply the echo to `frames` interleaved frames of `samples` in place
    ///
    /// Returns `false` when the call was skipped (delay line busy or the block
    /// is longer than the whole line); the samples are then left unmodified.
    pub fn process(&self, samples: &mut [i16], frames: usize) -> bool {
        let channels = self.format.channels as usize;
        let frames = frames.min(samples.len() / channels);

        let mut line = match self.line.try_lock() {
            Ok(line) => line,
            Err(TryLockError::WouldBlock) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if frames > line.frames {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        line.process(&mut samples[..frames * channels], frames, channels);
        true
    }

    /// Apply the echo to the valid part of a captured buffer
    pub fn process_buffer(&self, buffer: &mut SampleBuffer) -> bool {
        let frames = buffer.len() / self.format.bytes_per_frame();
        self.process(buffer.samples_mut(), frames)
    }

    /// Change delay and decay together
    ///
    /// A new line is allocated before the lock is taken; the lock is held only
    /// for the swap. On error the current line and weights are unchanged.
    pub fn reconfigure(&self, delay_ms: u32, decay: f32) -> EngineResult<()> {
        validate_delay(delay_ms)?;
        validate_decay(decay)?;

        if self.delay_time_ms() == delay_ms {
            self.lock_line().set_decay(decay);
            return Ok(());
        }

        let fresh = DelayLine::allocate(&self.format, delay_ms, decay)?;
        let old = std::mem::replace(&mut *self.lock_line(), fresh);
        drop(old);
        Ok(())
    }

    /// Change the delay time, keeping the current decay
    pub fn set_delay_time(&self, delay_ms: u32) -> EngineResult<()> {
        self.reconfigure(delay_ms, self.decay_weight())
    }

    /// Change the decay weight, keeping the current delay line
    pub fn set_decay_weight(&self, decay: f32) -> EngineResult<()> {
        validate_decay(decay)?;
        self.lock_line().set_decay(decay);
        Ok(())
    }

    pub fn delay_time_ms(&self) -> u32 {
        self.lock_line().delay_ms
    }

    pub fn decay_weight(&self) -> f32 {
        self.lock_line().decay
    }

    /// Delay line length in frames
    pub fn delay_frames(&self) -> usize {
        self.lock_line().frames
    }

    /// Delay line length in bytes
    pub fn delay_bytes(&self) -> usize {
        self.lock_line().samples.len() * std::mem::size_of::<i16>()
    }

    /// Calls that passed audio through unmodified
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    fn lock_line(&self) -> std::sync::MutexGuard<'_, DelayLine> {
        self.line.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EchoEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let line = self.lock_line();
        f.debug_struct("EchoEffect")
            .field("delay_ms", &line.delay_ms)
            .field("decay", &line.decay)
            .field("frames", &line.frames)
            .field("skipped", &self.skipped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(sample_rate: u32, channels: u16) -> SampleFormat {
        SampleFormat {
            sample_rate,
            channels,
            bits_per_sample: 16,
            frames_per_buffer: 4,
        }
    }

    #[test]
    fn test_delay_line_sizing() {
        let echo = EchoEffect::new(format(48000, 1), 250, 0.5).unwrap();
        assert_eq!(echo.delay_frames(), 12000);
        assert_eq!(echo.delay_bytes(), 24000);

        let stereo = EchoEffect::new(format(44100, 2), 10, 0.5).unwrap();
        assert_eq!(stereo.delay_frames(), 441);
        assert_eq!(stereo.delay_bytes(), 441 * 4);
    }

    #[test]
    fn test_frames_round_to_nearest() {
        assert_eq!(delay_frames_for(1, 22050), 22);
        assert_eq!(delay_frames_for(1, 22500), 23);
        assert_eq!(delay_frames_for(1, 100), 1);
    }

    #[test]
    fn test_mix_factors_sum_to_scale() {
        for decay in [0.0, 0.1, 0.25, 0.5, 0.75, 0.999] {
            let (feedback, live) = mix_factors(decay);
            assert_eq!(feedback + live, MIX_SCALE);
        }
        assert_eq!(mix_factors(0.5), (64, 64));
        assert_eq!(mix_factors(0.0), (0, 128));
    }

    #[test]
    fn test_zero_decay_is_pure_delay() {
        // 4ms at 1kHz: a four frame line
        let echo = EchoEffect::new(format(1000, 1), 4, 0.0).unwrap();

        let mut block = [1, 2, 3, 4];
        assert!(echo.process(&mut block, 4));
        assert_eq!(block, [0, 0, 0, 0]);

        let mut block = [5, 6, 7, 8];
        assert!(echo.process(&mut block, 4));
        assert_eq!(block, [1, 2, 3, 4]);

        let mut block = [0, 0, 0, 0];
        assert!(echo.process(&mut block, 4));
        assert_eq!(block, [5, 6, 7, 8]);
    }

    #[test]
    fn test_feedback_decays_each_pass() {
        let echo = EchoEffect::new(format(1000, 1), 4, 0.5).unwrap();

        let mut block = [100; 4];
        echo.process(&mut block, 4);
        assert_eq!(block, [0; 4]);

        let mut block = [0; 4];
        echo.process(&mut block, 4);
        assert_eq!(block, [50; 4]);

        let mut block = [0; 4];
        echo.process(&mut block, 4);
        assert_eq!(block, [25; 4]);
    }

    #[test]
    fn test_mix_stays_in_range() {
        let extremes = [i16::MIN, -1, 0, 1, i16::MAX];
        for feedback in [0, 1, 64, 127, MIX_SCALE] {
            let live_factor = MIX_SCALE - feedback;
            for &delayed in &extremes {
                for &live in &extremes {
                    let mixed = mix_sample(delayed, live, feedback, live_factor) as i32;
                    let lo = (delayed as i32).min(live as i32);
                    let hi = (delayed as i32).max(live as i32);
                    assert!(mixed >= lo - 1 && mixed <= hi + 1);
                }
            }
        }
        assert_eq!(mix_sample(i16::MIN, i16::MIN, 64, 64), i16::MIN);
        assert_eq!(mix_sample(i16::MAX, i16::MAX, 64, 64), i16::MAX);
        assert_eq!(mix_sample(1234, -50, MIX_SCALE, 0), 1234);
    }

    #[test]
    fn test_cursor_resets_when_block_overruns_line() {
        let echo = EchoEffect::new(format(1000, 1), 4, 0.0).unwrap();

        let mut first = [1, 2, 3];
        echo.process(&mut first, 3);
        // Only one frame left before the end: restart at 0
        let mut second = [4, 5, 6];
        echo.process(&mut second, 3);
        assert_eq!(second, [1, 2, 3]);
    }

    #[test]
    fn test_stereo_interleaved() {
        let echo = EchoEffect::new(format(1000, 2), 2, 0.0).unwrap();
        let mut block = [1, -1, 2, -2];
        echo.process(&mut block, 2);
        let mut block = [0; 4];
        echo.process(&mut block, 2);
        assert_eq!(block, [1, -1, 2, -2]);
    }

    #[test]
    fn test_oversized_block_is_skipped() {
        let echo = EchoEffect::new(format(1000, 1), 2, 0.5).unwrap();
        let mut block = [7; 4];
        assert!(!echo.process(&mut block, 4));
        assert_eq!(block, [7; 4]);
        assert_eq!(echo.skipped(), 1);
    }

    #[test]
    fn test_contention_skips_without_blocking() {
        let echo = EchoEffect::new(format(1000, 1), 4, 0.5).unwrap();
        let guard = echo.line.lock().unwrap();

        let mut block = [9; 4];
        assert!(!echo.process(&mut block, 4));
        assert_eq!(block, [9; 4]);
        drop(guard);

        assert_eq!(echo.skipped(), 1);
        assert!(echo.process(&mut block, 4));
    }

    #[test]
    fn test_process_buffer_uses_valid_length() {
        let echo = EchoEffect::new(format(1000, 1), 4, 0.0).unwrap();
        let mut buffer = SampleBuffer::new(8);
        buffer.samples_mut().copy_from_slice(&[1, 2, 3, 4]);

        // Nothing valid yet: processes zero frames
        assert!(echo.process_buffer(&mut buffer));
        assert_eq!(buffer.samples(), &[1, 2, 3, 4]);

        buffer.mark_full();
        assert!(echo.process_buffer(&mut buffer));
        assert_eq!(buffer.samples(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_invalid_reconfigure_keeps_line() {
        let echo = EchoEffect::new(format(48000, 1), 100, 0.25).unwrap();

        assert!(matches!(
            echo.reconfigure(0, 0.5),
            Err(EngineError::InvalidDelay { delay_ms: 0, .. })
        ));
        assert!(matches!(
            echo.reconfigure(200, 1.5),
            Err(EngineError::InvalidDecay(_))
        ));
        assert_eq!(echo.delay_time_ms(), 100);
        assert_eq!(echo.decay_weight(), 0.25);
        assert_eq!(echo.delay_frames(), 4800);
    }

    #[test]
    fn test_failed_allocation_keeps_line() {
        // 5s of stereo at 4MHz needs 80MB, past the delay line limit
        let echo = EchoEffect::new(format(4_000_000, 2), 100, 0.25).unwrap();
        assert_eq!(echo.delay_frames(), 400_000);

        let mut block = [300i16; 8];
        assert!(echo.process(&mut block, 4));

        assert!(matches!(
            echo.reconfigure(5000, 0.5),
            Err(EngineError::DelayLineAllocation { bytes: 80_000_000, .. })
        ));
        assert!(echo.set_delay_time(4500).is_err());
        assert_eq!(echo.delay_time_ms(), 100);
        assert_eq!(echo.decay_weight(), 0.25);
        assert_eq!(echo.delay_frames(), 400_000);
        assert_eq!(echo.delay_bytes(), 1_600_000);

        // The old line still runs
        assert!(echo.process(&mut block, 4));
        assert_eq!(echo.skipped(), 0);
    }

    #[test]
    fn test_reconfigure_replaces_line() {
        let echo = EchoEffect::new(format(48000, 1), 100, 0.25).unwrap();
        echo.reconfigure(300, 0.5).unwrap();
        assert_eq!(echo.delay_time_ms(), 300);
        assert_eq!(echo.delay_frames(), 14400);

        echo.set_decay_weight(0.75).unwrap();
        assert_eq!(echo.delay_frames(), 14400);
        assert_eq!(echo.decay_weight(), 0.75);

        echo.set_delay_time(50).unwrap();
        assert_eq!(echo.delay_frames(), 2400);
        assert_eq!(echo.decay_weight(), 0.75);
    }

    #[test]
    fn test_reconfigure_while_processing() {
        let echo = EchoEffect::new(format(48000, 1), 100, 0.5).unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);

        let (processed, skipped) = std::thread::scope(|s| {
            let audio = s.spawn(|| {
                let mut block = [1000i16; 240];
                let mut processed = 0u64;
                let mut skipped = 0u64;
                while !done.load(Ordering::Acquire) {
                    if echo.process(&mut block, 240) {
                        processed += 1;
                    } else {
                        skipped += 1;
                    }
                    assert!(block.iter().all(|s| s.abs() <= 1000));
                }
                (processed, skipped)
            });

            for i in 0..200 {
                let delay = if i % 2 == 0 { 300 } else { 100 };
                echo.reconfigure(delay, 0.5).unwrap();
            }
            done.store(true, Ordering::Release);
            audio.join().unwrap()
        });

        assert_eq!(echo.delay_time_ms(), 100);
        assert_eq!(echo.delay_frames(), 4800);
        assert_eq!(echo.skipped(), skipped);
        assert!(processed + skipped > 0);
    }
}
