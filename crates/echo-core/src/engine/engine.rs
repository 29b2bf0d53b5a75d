//! Echo engine - owns the pool, the queues, the echo, and both device paths

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{SampleBuffer, SampleBufferPool};
use crate::circulation::{
    BufferCensus, CaptureDevice, CapturePath, PlaybackDevice, PlaybackPath, QueueProbes,
};
use crate::config::EngineConfig;
use crate::effect::{echo_hook, EchoEffect};
use crate::error::{EngineError, EngineResult};
use crate::ring::RingBuffer;

use super::{PipelineAtomics, PipelineStats};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Control-thread handle to a running engine
///
/// Cheap to clone and `Sync`; everything it does is either lock-free or
/// takes the echo's control lock, never anything the callbacks wait on.
#[derive(Clone)]
pub struct EngineControl {
    shared: Arc<ControlShared>,
}

struct ControlShared {
    echo: Arc<EchoEffect>,
    atomics: Arc<PipelineAtomics>,
    probes: QueueProbes,
    pool_size: usize,
}

impl EngineControl {
    /// Change the echo delay and decay
    ///
    /// On failure the previous delay line keeps running.
    pub fn reconfigure(&self, delay_ms: u32, decay: f32) -> EngineResult<()> {
        match self.shared.echo.reconfigure(delay_ms, decay) {
            Ok(()) => {
                log::info!("Echo reconfigured: {}ms, decay {:.2}", delay_ms, decay);
                Ok(())
            }
            Err(e) => {
                log::warn!("Echo reconfigure rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Count the buffers in each queue
    pub fn census(&self) -> BufferCensus {
        self.shared
            .probes
            .count(&self.shared.atomics, self.shared.pool_size)
    }

    /// Snapshot of the pipeline counters
    pub fn stats(&self) -> PipelineStats {
        self.shared.atomics.snapshot(self.shared.echo.skipped())
    }

    /// Whether the capture path stopped its device for lack of free buffers
    pub fn capture_starved(&self) -> bool {
        self.shared.atomics.capture_starved()
    }

    /// Take the census a path asked for after a shadow desync
    ///
    /// Returns `None` when no desync happened since the last call. The
    /// callbacks cannot log, so the control thread polls this and logs for them.
    pub fn poll_diagnostics(&self) -> Option<BufferCensus> {
        if !self.shared.atomics.take_census_request() {
            return None;
        }
        let census = self.census();
        log::warn!(
            "Shadow desync reported ({} so far): {}",
            self.shared.atomics.snapshot(0).shadow_desyncs,
            census
        );
        Some(census)
    }

    pub fn echo(&self) -> &EchoEffect {
        &self.shared.echo
    }
}

impl std::fmt::Debug for EngineControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineControl")
            .field("census", &self.census())
            .field("stats", &self.stats())
            .finish()
    }
}

/// The echo engine
///
/// Built once per session. The capture and playback paths live inside the
/// engine while it is being started or stopped, and are lent to the device
/// driver while audio flows: borrowed via [`streams_mut`](Self::streams_mut)
/// for scoped driver threads, or moved out with [`detach`](Self::detach) for
/// `'static` callbacks and handed back with [`attach`](Self::attach).
pub struct Engine<C: CaptureDevice, P: PlaybackDevice> {
    id: u64,
    config: EngineConfig,
    streams: Option<(CapturePath<C>, PlaybackPath<P>)>,
    control: EngineControl,
    running: bool,
}

impl<C: CaptureDevice, P: PlaybackDevice> Engine<C, P> {
    /// Allocate the pool, queues, and delay line for `config`
    pub fn new(config: EngineConfig, capture: C, playback: P) -> EngineResult<Self> {
        config.validate()?;

        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let format = config.format();
        let pool_size = config.buffer_pool_size;
        let kickstart = config.kickstart;

        let mut pool = SampleBufferPool::allocate(pool_size, format.buffer_bytes())?;

        let (mut free_in, free_out) = RingBuffer::<Box<SampleBuffer>>::new(pool_size);
        let (captured_in, captured_out) = RingBuffer::<Box<SampleBuffer>>::new(pool_size);
        let (record_in, record_out) = RingBuffer::<Box<SampleBuffer>>::new(kickstart);
        let (play_in, play_out) = RingBuffer::new(kickstart);

        for buffer in pool.drain() {
            if free_in.push(buffer).is_err() {
                return Err(EngineError::PoolAllocation {
                    requested: pool_size,
                    reason: "free queue smaller than pool".to_string(),
                });
            }
        }

        let echo = Arc::new(EchoEffect::new(
            format,
            config.initial_delay_ms,
            config.initial_decay,
        )?);
        let atomics = Arc::new(PipelineAtomics::new());

        let probes = QueueProbes {
            free: free_in.probe(),
            captured: captured_in.probe(),
            record_shadow: record_in.probe(),
            play_shadow: play_in.probe(),
        };

        let capture = CapturePath::new(
            id,
            capture,
            free_out,
            captured_in,
            (record_in, record_out),
            echo_hook(Arc::clone(&echo)),
            Arc::clone(&atomics),
        );
        let playback = PlaybackPath::new(
            id,
            playback,
            captured_out,
            free_in,
            (play_in, play_out),
            format.buffer_bytes(),
            Arc::clone(&atomics),
        );

        log::info!(
            "Echo engine #{} created: {}Hz, {} ch, {} frames/buffer, {} buffers x {} bytes, kickstart {}",
            id,
            format.sample_rate,
            format.channels,
            format.frames_per_buffer,
            pool_size,
            format.buffer_bytes(),
            kickstart
        );
        log::debug!("Echo: {:?}", echo);

        Ok(Self {
            id,
            config,
            streams: Some((capture, playback)),
            control: EngineControl {
                shared: Arc::new(ControlShared {
                    echo,
                    atomics,
                    probes,
                    pool_size,
                }),
            },
            running: false,
        })
    }

    /// Seed both devices and start them
    ///
    /// The capture device gets up to `kickstart` empty buffers; the playback
    /// device gets `kickstart` entries, captured data if any is waiting and
    /// silence otherwise. Does nothing if already running.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.running {
            return Ok(());
        }

        let kickstart = self.config.kickstart;
        let (capture, playback) = self
            .streams
            .as_mut()
            .ok_or(EngineError::StreamsDetached("start"))?;

        let seeded = capture.prime(kickstart);
        if seeded < kickstart {
            log::warn!(
                "Out of free buffers at start: seeded {} of {} capture buffers",
                seeded,
                kickstart
            );
        }
        let armed = playback.prime(kickstart);

        capture.start_device();
        playback.start_device();
        self.running = true;

        log::info!(
            "Echo engine #{} started ({} capture, {} playback buffers queued)",
            self.id,
            seeded,
            armed
        );
        Ok(())
    }

    /// Stop both devices and return every buffer to Free
    ///
    /// Idempotent. The paths must be attached, which also means the driver
    /// can no longer be inside a callback.
    pub fn stop(&mut self) -> EngineResult<()> {
        let (capture, playback) = self
            .streams
            .as_mut()
            .ok_or(EngineError::StreamsDetached("stop"))?;

        let was_running = self.running;
        if was_running {
            capture.stop_device();
            playback.stop_device();
        }

        while let Some(buffer) = capture.reclaim() {
            playback.recycle(buffer);
        }
        playback.drain();
        self.running = false;
        self.control.poll_diagnostics();

        let census = self.control.census();
        if !census.is_balanced() {
            log::warn!("Buffer census mismatch after stop: {}", census);
        } else if was_running {
            log::info!("Echo engine #{} stopped: {}", self.id, census);
        }
        Ok(())
    }

    /// Replace the hook run on every captured buffer
    ///
    /// The default hook runs the engine's echo; use
    /// [`echo_hook`](crate::effect::echo_hook) with [`echo`](Self::echo) to
    /// chain it from a custom hook.
    pub fn register_effect_hook<F>(&mut self, hook: F) -> EngineResult<()>
    where
        F: FnMut(&mut SampleBuffer) + Send + 'static,
    {
        let (capture, _) = self
            .streams
            .as_mut()
            .ok_or(EngineError::StreamsDetached("registering an effect hook"))?;
        drop(capture.set_hook(Box::new(hook)));
        log::debug!("Effect hook replaced on engine #{}", self.id);
        Ok(())
    }

    /// Change the echo delay and decay; see [`EngineControl::reconfigure`]
    pub fn reconfigure(&self, delay_ms: u32, decay: f32) -> EngineResult<()> {
        self.control.reconfigure(delay_ms, decay)
    }

    /// Count the buffers in each queue
    pub fn census(&self) -> BufferCensus {
        self.control.census()
    }

    pub fn stats(&self) -> PipelineStats {
        self.control.stats()
    }

    /// Cloneable handle for a control thread
    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    /// Shared echo effect
    pub fn echo(&self) -> Arc<EchoEffect> {
        Arc::clone(&self.control.shared.echo)
    }

    /// Borrow both paths, e.g. for scoped driver threads
    pub fn streams_mut(&mut self) -> EngineResult<(&mut CapturePath<C>, &mut PlaybackPath<P>)> {
        self.streams
            .as_mut()
            .map(|(capture, playback)| (capture, playback))
            .ok_or(EngineError::StreamsDetached("borrowing the streams"))
    }

    /// Move both paths out, e.g. into `'static` device callbacks
    pub fn detach(&mut self) -> EngineResult<(CapturePath<C>, PlaybackPath<P>)> {
        let streams = self
            .streams
            .take()
            .ok_or(EngineError::StreamsDetached("detaching again"))?;
        log::debug!("Streams detached from engine #{}", self.id);
        Ok(streams)
    }

    /// Hand the paths back after the driver stopped calling them
    ///
    /// Paths from another engine are rejected and dropped.
    pub fn attach(&mut self, capture: CapturePath<C>, playback: PlaybackPath<P>) -> EngineResult<()> {
        for found in [capture.engine_id, playback.engine_id] {
            if found != self.id {
                return Err(EngineError::ForeignStreams {
                    expected: self.id,
                    found,
                });
            }
        }
        self.streams = Some((capture, playback));
        log::debug!("Streams attached to engine #{}", self.id);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_attached(&self) -> bool {
        self.streams.is_some()
    }
}

impl<C: CaptureDevice, P: PlaybackDevice> Drop for Engine<C, P> {
    fn drop(&mut self) {
        if self.running && self.streams.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Failed to stop engine #{} on drop: {}", self.id, e);
            }
        }
    }
}

impl<C: CaptureDevice, P: PlaybackDevice> std::fmt::Debug for Engine<C, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("running", &self.running)
            .field("attached", &self.streams.is_some())
            .field("census", &self.census())
            .finish()
    }
}
