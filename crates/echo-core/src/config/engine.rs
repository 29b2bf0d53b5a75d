//! Engine configuration
//!
//! Everything here is fixed for the life of an engine except the echo delay
//! and decay, which [`Engine::reconfigure`](crate::engine::Engine::reconfigure)
//! can change while streaming.

use serde::{Deserialize, Serialize};

use crate::buffer::MIN_POOL_BUFFERS;
use crate::error::{EngineError, EngineResult};

/// Default capture/playback sample rate (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default device buffer length in frames (5ms at 48kHz)
pub const DEFAULT_FRAMES_PER_BUFFER: u32 = 240;

/// Default number of buffers in circulation
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Default number of buffers pre-enqueued to each device
pub const DEFAULT_KICKSTART: usize = 3;

/// Shortest echo the delay line supports
pub const MIN_DELAY_MS: u32 = 1;

/// Longest echo the delay line supports
pub const MAX_DELAY_MS: u32 = 5000;

/// PCM layout shared by both devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frames_per_buffer: u32,
}

impl SampleFormat {
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Size of one device buffer in bytes, rounded up from bits
    #[inline]
    pub fn buffer_bytes(&self) -> usize {
        let bits = self.frames_per_buffer as usize
            * self.channels as usize
            * self.bits_per_sample as usize;
        bits.div_ceil(8)
    }

    /// Duration of one device buffer in milliseconds
    pub fn buffer_duration_ms(&self) -> f32 {
        self.frames_per_buffer as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// Construction-time engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frames per device buffer
    pub frames_per_buffer: u32,
    /// Interleaved channels (1 or 2)
    pub channel_count: u16,
    /// Bits per sample; the echo effect works on 16-bit PCM only
    pub bits_per_sample: u16,
    /// Number of buffers in circulation
    pub buffer_pool_size: usize,
    /// Buffers pre-enqueued to each device; also the depth of each device shadow queue
    pub kickstart: usize,
    /// Echo delay at startup
    pub initial_delay_ms: u32,
    /// Echo feedback weight at startup, in [0, 1)
    pub initial_decay: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            channel_count: 1,
            bits_per_sample: 16,
            buffer_pool_size: DEFAULT_POOL_SIZE,
            kickstart: DEFAULT_KICKSTART,
            initial_delay_ms: 100,
            initial_decay: 0.1,
        }
    }
}

impl EngineConfig {
    /// Derived PCM layout
    pub fn format(&self) -> SampleFormat {
        SampleFormat {
            sample_rate: self.sample_rate,
            channels: self.channel_count,
            bits_per_sample: self.bits_per_sample,
            frames_per_buffer: self.frames_per_buffer,
        }
    }

    /// Set the pool size and kickstart depth
    pub fn with_pool(mut self, buffers: usize, kickstart: usize) -> Self {
        self.buffer_pool_size = buffers;
        self.kickstart = kickstart;
        self
    }

    /// Set the initial echo parameters
    pub fn with_echo(mut self, delay_ms: u32, decay: f32) -> Self {
        self.initial_delay_ms = delay_ms;
        self.initial_decay = decay;
        self
    }

    /// Set the device buffer length
    pub fn with_frames_per_buffer(mut self, frames: u32) -> Self {
        self.frames_per_buffer = frames;
        self
    }

    /// Check every field, returning the first problem found
    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate == 0 {
            return Err(EngineError::InvalidConfig(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.frames_per_buffer == 0 {
            return Err(EngineError::InvalidConfig(
                "frames_per_buffer must be positive".to_string(),
            ));
        }
        if !(1..=2).contains(&self.channel_count) {
            return Err(EngineError::InvalidConfig(format!(
                "channel_count {} unsupported (1 or 2)",
                self.channel_count
            )));
        }
        if self.bits_per_sample != 16 {
            return Err(EngineError::InvalidConfig(format!(
                "bits_per_sample {} unsupported (16-bit PCM only)",
                self.bits_per_sample
            )));
        }
        if self.buffer_pool_size < MIN_POOL_BUFFERS {
            return Err(EngineError::InvalidConfig(format!(
                "buffer_pool_size {} is below the minimum of {}",
                self.buffer_pool_size, MIN_POOL_BUFFERS
            )));
        }
        if self.kickstart == 0 || self.kickstart > self.buffer_pool_size {
            return Err(EngineError::InvalidConfig(format!(
                "kickstart {} must be between 1 and buffer_pool_size ({})",
                self.kickstart, self.buffer_pool_size
            )));
        }
        validate_delay(self.initial_delay_ms)?;
        validate_decay(self.initial_decay)?;
        Ok(())
    }
}

pub(crate) fn validate_delay(delay_ms: u32) -> EngineResult<()> {
    if (MIN_DELAY_MS..=MAX_DELAY_MS).contains(&delay_ms) {
        Ok(())
    } else {
        Err(EngineError::InvalidDelay {
            delay_ms,
            min_ms: MIN_DELAY_MS,
            max_ms: MAX_DELAY_MS,
        })
    }
}

pub(crate) fn validate_decay(decay: f32) -> EngineResult<()> {
    if (0.0..1.0).contains(&decay) {
        Ok(())
    } else {
        Err(EngineError::InvalidDecay(decay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.format().buffer_bytes(), 480);
        assert_eq!(config.format().bytes_per_frame(), 2);
        assert!((config.format().buffer_duration_ms() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_buffer_bytes() {
        let config = EngineConfig {
            channel_count: 2,
            frames_per_buffer: 192,
            ..Default::default()
        };
        assert_eq!(config.format().buffer_bytes(), 192 * 2 * 2);
        assert_eq!(config.format().bytes_per_frame(), 4);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            EngineConfig {
                sample_rate: 0,
                ..Default::default()
            },
            EngineConfig {
                channel_count: 3,
                ..Default::default()
            },
            EngineConfig {
                bits_per_sample: 24,
                ..Default::default()
            },
            EngineConfig::default().with_pool(1, 1),
            EngineConfig::default().with_pool(8, 0),
            EngineConfig::default().with_pool(8, 9),
            EngineConfig::default().with_echo(0, 0.5),
            EngineConfig::default().with_echo(MAX_DELAY_MS + 1, 0.5),
            EngineConfig::default().with_echo(100, 1.0),
            EngineConfig::default().with_echo(100, -0.1),
        ];
        for config in bad {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("sample_rate: 44100\ninitial_decay: 0.5\n").unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.initial_decay, 0.5);
        assert_eq!(config.buffer_pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.kickstart, DEFAULT_KICKSTART);
    }
}
