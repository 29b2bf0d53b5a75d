//! Simulated loopback driver
//!
//! Two threads stand in for the audio callbacks: one records a test tone
//! into whatever buffer the capture path hands it, the other "plays" the
//! head of the playback queue. Both tick once per buffer period, so the
//! pipeline runs at the same pace it would on hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use echo_core::{CaptureDevice, Engine, EngineConfig, PlaybackDevice, SampleBuffer};

use super::RunSummary;
use crate::config::DriverConfig;

/// Microphone that completes buffers in the order it was given them
#[derive(Debug, Default)]
pub struct SimMic {
    pending: usize,
    running: bool,
}

impl SimMic {
    fn ready(&self) -> bool {
        self.running && self.pending > 0
    }
}

impl CaptureDevice for SimMic {
    fn enqueue(&mut self, _buffer: &SampleBuffer) {
        self.pending += 1;
    }

    fn start(&mut self) {
        self.running = true;
    }

    /// Stopping flushes the device queue, as the engine reclaims it
    fn stop(&mut self) {
        self.running = false;
        self.pending = 0;
    }
}

/// Speaker that measures what it plays
#[derive(Debug, Default)]
pub struct SimSpeaker {
    pending: usize,
    running: bool,
    consumed: u64,
    peak: i16,
}

impl SimSpeaker {
    fn ready(&self) -> bool {
        self.running && self.pending > 0
    }
}

impl PlaybackDevice for SimSpeaker {
    fn enqueue(&mut self, _buffer: &SampleBuffer) {
        self.pending += 1;
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        self.pending = 0;
    }
}

/// Sine generator writing interleaved 16-bit frames
struct Tone {
    phase: f32,
    step: f32,
    amplitude: f32,
    channels: usize,
}

impl Tone {
    fn new(hz: f32, level: f32, sample_rate: u32, channels: usize) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * hz / sample_rate as f32,
            amplitude: level.clamp(0.0, 1.0) * i16::MAX as f32,
            channels,
        }
    }

    fn fill(&mut self, samples: &mut [i16]) {
        for frame in samples.chunks_mut(self.channels) {
            let value = (self.phase.sin() * self.amplitude) as i16;
            frame.fill(value);
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
    }
}

/// Sleep until `deadline`, then move it one period on
fn tick(deadline: &mut Instant, period: Duration) {
    let now = Instant::now();
    if *deadline > now {
        std::thread::sleep(*deadline - now);
    }
    *deadline += period;
}

/// Run the engine against the simulated devices for `driver.run_seconds`
///
/// If the capture path starves, the driver threads are wound down and the
/// engine is cycled through Stop and Start before streaming resumes.
pub fn run(config: EngineConfig, driver: &DriverConfig) -> Result<RunSummary> {
    let format = config.format();
    let period = Duration::from_secs_f32(format.buffer_duration_ms() / 1000.0);
    let run_for = Duration::from_secs_f32(driver.run_seconds.max(0.0));

    let mut engine = Engine::new(config, SimMic::default(), SimSpeaker::default())
        .context("Failed to create echo engine")?;
    let control = engine.control();
    engine.start().context("Failed to start echo engine")?;

    log::info!(
        "Loopback running for {:.1}s ({:.2}ms per buffer)",
        run_for.as_secs_f32(),
        period.as_secs_f32() * 1000.0
    );

    let mut tone = Tone::new(
        driver.tone_hz,
        driver.tone_level,
        format.sample_rate,
        format.channels as usize,
    );
    let started = Instant::now();
    let halfway = started + run_for / 2;
    let mut swept = driver.sweep_delay_ms.is_none();
    let mut restarts = 0u32;

    loop {
        let done = AtomicBool::new(false);
        let (capture, playback) = engine.streams_mut()?;
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut deadline = Instant::now();
                while !done.load(Ordering::Acquire) {
                    tick(&mut deadline, period);
                    if !capture.device().ready() {
                        continue;
                    }
                    if let Some(buffer) = capture.device_buffer_mut() {
                        tone.fill(buffer.samples_mut());
                    }
                    capture.device_mut().pending -= 1;
                    capture.on_buffer_full();
                }
            });

            s.spawn(|| {
                let mut deadline = Instant::now();
                while !done.load(Ordering::Acquire) {
                    tick(&mut deadline, period);
                    if !playback.device().ready() {
                        continue;
                    }
                    let peak = playback
                        .device_buffer()
                        .and_then(|buffer| buffer.samples().iter().map(|s| s.saturating_abs()).max())
                        .unwrap_or(0);
                    let speaker = playback.device_mut();
                    speaker.pending -= 1;
                    speaker.consumed += 1;
                    speaker.peak = speaker.peak.max(peak);
                    playback.on_buffer_consumed();
                }
            });

            while started.elapsed() < run_for && !control.capture_starved() {
                std::thread::sleep(Duration::from_millis(20));
                if !swept && Instant::now() >= halfway {
                    if let Some(delay_ms) = driver.sweep_delay_ms {
                        let decay = control.echo().decay_weight();
                        if let Err(e) = control.reconfigure(delay_ms, decay) {
                            log::warn!("Mid-run reconfigure failed: {}", e);
                        }
                    }
                    swept = true;
                }
                control.poll_diagnostics();
            }
            done.store(true, Ordering::Release);
        });

        if !control.capture_starved() || started.elapsed() >= run_for {
            break;
        }
        log::warn!("Capture starved, restarting: {}", control.census());
        engine.stop().context("Failed to stop starved engine")?;
        engine.start().context("Failed to restart echo engine")?;
        restarts += 1;
    }

    let capture_starved = restarts > 0 || control.capture_starved();
    let (buffers_out, peak_out) = {
        let (_, playback) = engine.streams_mut()?;
        (playback.device().consumed, playback.device().peak)
    };
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_fills_every_channel() {
        let mut tone = Tone::new(1000.0, 0.5, 48000, 2);
        let mut samples = [0i16; 96];
        tone.fill(&mut samples);
        for frame in samples.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!(samples.iter().any(|&s| s != 0));
        assert!(samples.iter().all(|&s| s.saturating_abs() <= i16::MAX / 2 + 1));
    }

    #[test]
    fn test_short_loopback_run_conserves_buffers() {
        let config = EngineConfig::default().with_echo(20, 0.5);
        let driver = DriverConfig {
            run_seconds: 0.3,
            sweep_delay_ms: Some(40),
            ..Default::default()
        };

        let summary = run(config, &driver).unwrap();
        assert!(summary.census.is_balanced());
        assert_eq!(summary.census.free, summary.census.pool_size);
        assert_eq!(summary.stats.shadow_desyncs, 0);
        assert!(summary.buffers_out > 0);
        assert!(summary.stats.buffers_captured > 0);
    }

    #[test]
    fn test_starved_capture_is_restarted() {
        // Every buffer is seeded to the mic, so the second capture completion
        // finds Free empty while the first is still queued behind silence
        let config = EngineConfig::default().with_echo(20, 0.5).with_pool(2, 2);
        let driver = DriverConfig {
            run_seconds: 0.4,
            sweep_delay_ms: None,
            ..Default::default()
        };

        let summary = run(config, &driver).unwrap();
        assert!(summary.capture_starved);
        assert!(summary.restarts >= 1);
        assert!(summary.stats.capture_starvations >= u64::from(summary.restarts));
        assert!(summary.census.is_balanced());
        assert!(summary.stats.buffers_captured > 2);
    }
}
