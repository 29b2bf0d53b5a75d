//! CPAL driver
//!
//! CPAL pulls and pushes audio in whatever block size the host picks, so the
//! devices here adapt blocks to engine buffers: the input callback copies
//! into the capture path's current buffer and reports it full when it fills
//! up; the output callback copies out of the playback path's current buffer
//! and reports it consumed when it runs out.
//!
//! The paths are moved into the stream callbacks and come back through a
//! channel when the streams are dropped, which is also how a starved capture
//! path is brought back for a Stop + Start.
//!
//! ```text
//!  input callback ──► CapturePath ──► Captured queue ──► PlaybackPath ──► output callback
//!                          ▲                                  │
//!                          └────────── Free queue ◄───────────┘
//! ```

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, Stream, StreamConfig};
use crossbeam::channel::{bounded, Receiver, Sender};

use echo_core::{CaptureDevice, CapturePath, Engine, EngineConfig, PlaybackDevice, PlaybackPath, SampleBuffer};

use super::RunSummary;
use crate::config::DriverConfig;

/// Input device state kept inside the capture path
#[derive(Debug, Default)]
pub struct CpalInput {
    running: bool,
    /// Samples already written into the current buffer
    filled: usize,
    dropped_samples: u64,
}

impl CaptureDevice for CpalInput {
    fn enqueue(&mut self, _buffer: &SampleBuffer) {}

    fn start(&mut self) {
        self.running = true;
        self.filled = 0;
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// Output device state kept inside the playback path
#[derive(Debug, Default)]
pub struct CpalOutput {
    running: bool,
    /// Samples already played from the current buffer
    played: usize,
    consumed: u64,
    peak: i16,
}

impl PlaybackDevice for CpalOutput {
    fn enqueue(&mut self, _buffer: &SampleBuffer) {}

    fn start(&mut self) {
        self.running = true;
        self.played = 0;
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// Sends a path back to the control thread when the callback owning it is dropped
struct Homing<T> {
    value: Option<T>,
    home: Sender<T>,
}

impl<T> Homing<T> {
    fn new(value: T, home: Sender<T>) -> Self {
        Self {
            value: Some(value),
            home,
        }
    }

    fn get(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }
}

impl<T> Drop for Homing<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let _ = self.home.send(value);
        }
    }
}

fn record_block(capture: &mut CapturePath<CpalInput>, mut data: &[i16]) {
    while !data.is_empty() {
        if !capture.device().running {
            capture.device_mut().dropped_samples += data.len() as u64;
            return;
        }
        let offset = capture.device().filled;
        let Some(buffer) = capture.device_buffer_mut() else {
            capture.device_mut().dropped_samples += data.len() as u64;
            return;
        };

        let samples = buffer.samples_mut();
        let n = (samples.len() - offset).min(data.len());
        samples[offset..offset + n].copy_from_slice(&data[..n]);
        let complete = offset + n == samples.len();
        data = &data[n..];

        if complete {
            capture.device_mut().filled = 0;
            capture.on_buffer_full();
        } else {
            capture.device_mut().filled = offset + n;
        }
    }
}

fn play_block(playback: &mut PlaybackPath<CpalOutput>, mut data: &mut [i16]) {
    while !data.is_empty() {
        if !playback.device().running {
            data.fill(0);
            return;
        }
        let offset = playback.device().played;
        let Some(buffer) = playback.device_buffer() else {
            data.fill(0);
            return;
        };

        let samples = &buffer.samples()[..buffer.len() / 2];
        let n = (samples.len().saturating_sub(offset)).min(data.len());
        let (head, rest) = std::mem::take(&mut data).split_at_mut(n);
        head.copy_from_slice(&samples[offset..offset + n]);
        let peak = head.iter().map(|s| s.saturating_abs()).max().unwrap_or(0);
        let exhausted = offset + n >= samples.len();
        data = rest;

        let output = playback.device_mut();
        output.peak = output.peak.max(peak);
        if exhausted {
            output.played = 0;
            output.consumed += 1;
            playback.on_buffer_consumed();
        } else {
            output.played = offset + n;
        }
    }
}

/// Input and output streams that own the engine paths while they play
struct Streams {
    input: Stream,
    output: Stream,
    capture_back: Receiver<CapturePath<CpalInput>>,
    playback_back: Receiver<PlaybackPath<CpalOutput>>,
}

impl Streams {
    /// Move the paths into new stream callbacks and start both streams
    fn open(
        input_device: &Device,
        output_device: &Device,
        stream_config: &StreamConfig,
        capture: CapturePath<CpalInput>,
        playback: PlaybackPath<CpalOutput>,
    ) -> Result<Self> {
        let (capture_home, capture_back) = bounded(1);
        let (playback_home, playback_back) = bounded(1);

        let mut capture = Homing::new(capture, capture_home);
        let input = input_device
            .build_input_stream(
                stream_config,
                move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                    if let Some(capture) = capture.get() {
                        record_block(capture, data);
                    }
                },
                move |err| {
                    log::error!("Input stream error: {}", err);
                },
                None,
            )
            .context("Failed to build input stream")?;

        let mut playback = Homing::new(playback, playback_home);
        let output = output_device
            .build_output_stream(
                stream_config,
                move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                    if let Some(playback) = playback.get() {
                        play_block(playback, data);
                    }
                },
                move |err| {
                    log::error!("Output stream error: {}", err);
                },
                None,
            )
            .context("Failed to build output stream")?;

        input.play().context("Failed to start input stream")?;
        output.play().context("Failed to start output stream")?;

        Ok(Self {
            input,
            output,
            capture_back,
            playback_back,
        })
    }

    /// Drop both streams and wait for the paths to come home
    fn close(self) -> Result<(CapturePath<CpalInput>, PlaybackPath<CpalOutput>)> {
        drop(self.input);
        drop(self.output);
        let capture = self
            .capture_back
            .recv_timeout(Duration::from_secs(1))
            .context("Capture path did not come back from the input stream")?;
        let playback = self
            .playback_back
            .recv_timeout(Duration::from_secs(1))
            .context("Playback path did not come back from the output stream")?;
        Ok((capture, playback))
    }
}

/// Run the engine against the default input and output devices
///
/// A starved capture path is recovered by closing the streams, cycling the
/// engine through Stop and Start, and opening fresh streams.
pub fn run(config: EngineConfig, driver: &DriverConfig) -> Result<RunSummary> {
    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No default input device"))?;
    let output_device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))?;
    log::info!(
        "Using input '{}' and output '{}'",
        input_device.name().unwrap_or_else(|_| "Unknown".to_string()),
        output_device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let stream_config = StreamConfig {
        channels: config.channel_count,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.frames_per_buffer),
    };

    let mut engine = Engine::new(config, CpalInput::default(), CpalOutput::default())
        .context("Failed to create echo engine")?;
    let control = engine.control();
    engine.start().context("Failed to start echo engine")?;

    let (capture, playback) = engine.detach()?;
    let mut streams = Streams::open(&input_device, &output_device, &stream_config, capture, playback)?;

    let run_for = Duration::from_secs_f32(driver.run_seconds.max(0.0));
    log::info!("Streaming for {:.1}s", run_for.as_secs_f32());
    let started = Instant::now();
    let mut swept = driver.sweep_delay_ms.is_none();
    let mut restarts = 0u32;
    while started.elapsed() < run_for {
        std::thread::sleep(Duration::from_millis(50));
        if !swept && started.elapsed() >= run_for / 2 {
            if let Some(delay_ms) = driver.sweep_delay_ms {
                if let Err(e) = control.reconfigure(delay_ms, control.echo().decay_weight()) {
                    log::warn!("Mid-run reconfigure failed: {}", e);
                }
            }
            swept = true;
        }
        control.poll_diagnostics();

        if control.capture_starved() {
            log::warn!("Capture starved, restarting streams: {}", control.census());
            let (capture, playback) = streams.close()?;
            engine.attach(capture, playback)?;
            engine.stop().context("Failed to stop starved engine")?;
            engine.start().context("Failed to restart echo engine")?;
            let (capture, playback) = engine.detach()?;
            streams = Streams::open(&input_device, &output_device, &stream_config, capture, playback)?;
            restarts += 1;
        }
    }

    let capture_starved = restarts > 0 || control.capture_starved();
    let (capture, playback) = streams.close()?;

    if capture.device().dropped_samples > 0 {
        log::warn!(
            "Input dropped {} samples while no buffer was available",
            capture.device().dropped_samples
        );
    }
    let buffers_out = playback.device().consumed;
    let peak_out = playback.device().peak;

    engine.attach(capture, playback)?;
    engine.stop().context("Failed to stop echo engine")?;

    Ok(RunSummary {
        census: engine.census(),
        stats: engine.stats(),
        buffers_out,
        peak_out,
        capture_starved,
        restarts,
    })
}
