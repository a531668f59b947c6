//! The acquisition thread and its handle.
//!
//! [`spawn`] starts one thread that owns the whole pipeline: device link, demultiplexer, ring
//! buffer bank, trigger engine, frame assembler and voltmeter. The thread only blocks in
//! `read_next_block`; completed frames go into a drop-oldest [`handoff_queue`] together with
//! their voltmeter readings, so a slow consumer never slows acquisition down.
//!
//! Trigger and channel updates are queued through the [`EngineHandle`] and applied between two
//! blocks. A fault flushes all buffered samples and pending trigger events before reconnecting,
//! so no frame ever mixes data from before and after a gap.

use crate::config::{ChannelConfig, ConfigError};
use crate::demux::Demultiplexer;
use crate::device::{ConnectionEvent, ConnectionState, DeviceHandle, DeviceSelector};
use crate::device_link::{ConnectError, Connector, DeviceLink, LinkError, StateWatch};
use crate::frame::{AssembleError, CapturedFrame, FrameAssembler};
use crate::handoff::{handoff_queue, QueueReceiver, QueueSender};
use crate::ring_buffer::RingBufferBank;
use crate::settings::Settings;
use crate::trigger::{IndexedSample, TriggerEngine, TriggerEvent};
use crate::trigger_config::TriggerConfig;
use crate::voltmeter::{Readings, RollingVoltmeter, Voltmeter};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Failed to start acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Acquisition thread panicked")]
    ThreadPanicked,
}

/// One handoff item: a frame and the readings computed from it.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub frame: CapturedFrame,
    pub readings: Readings,
    /// Readings averaged over the last frames of this connection session.
    pub rolling: Readings,
    /// Device session the frame was captured in.
    pub session: u64,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    blocks_received: AtomicU64,
    samples_received: AtomicU64,
    dropped_blocks: AtomicU64,
    discontinuities: AtomicU64,
    stale_frames: AtomicU64,
    frames_emitted: AtomicU64,
    free_run_frames: AtomicU64,
    dropped_frames: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub blocks_received: u64,
    pub samples_received: u64,
    /// Blocks that failed to decode.
    pub dropped_blocks: u64,
    pub discontinuities: u64,
    /// Trigger candidates whose window was overwritten before assembly.
    pub stale_frames: u64,
    pub frames_emitted: u64,
    pub free_run_frames: u64,
    /// Frames evicted from the handoff queue unread.
    pub dropped_frames: u64,
    pub reconnects: u64,
}

impl Diagnostics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            blocks_received: get(&self.blocks_received),
            samples_received: get(&self.samples_received),
            dropped_blocks: get(&self.dropped_blocks),
            discontinuities: get(&self.discontinuities),
            stale_frames: get(&self.stale_frames),
            frames_emitted: get(&self.frames_emitted),
            free_run_frames: get(&self.free_run_frames),
            dropped_frames: get(&self.dropped_frames),
            reconnects: get(&self.reconnects),
        }
    }
}

/// State written by the handle and read by the acquisition thread.
#[derive(Debug, Default)]
struct EngineShared {
    cancel: AtomicBool,
    rearm: AtomicBool,
    pending_trigger: Mutex<Option<TriggerConfig>>,
    pending_channels: Mutex<Option<Vec<ChannelConfig>>>,
    /// Channel count of the connected device, 0 before the first connect.
    channel_count: AtomicUsize,
    diagnostics: Diagnostics,
}

impl EngineShared {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Control surface of a running engine. Dropping it stops the engine and waits for it.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    frames: QueueReceiver<FrameOutput>,
    events: Receiver<ConnectionEvent>,
    state: StateWatch,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Completed frames, newest `queue_capacity` only.
    pub fn frames(&self) -> &QueueReceiver<FrameOutput> {
        &self.frames
    }

    pub fn events(&self) -> &Receiver<ConnectionEvent> {
        &self.events
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Replace the trigger configuration before the next block is scanned.
    pub fn update_trigger(&self, config: TriggerConfig) -> Result<(), ConfigError> {
        config.validate(self.known_channels())?;
        *self
            .shared
            .pending_trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config);
        Ok(())
    }

    /// Replace all channel settings. Buffered samples are flushed, since they were scaled with
    /// the old settings.
    pub fn update_channels(&self, channels: Vec<ChannelConfig>) -> Result<(), ConfigError> {
        for (channel, config) in channels.iter().enumerate() {
            config.validate(channel)?;
        }
        *self
            .shared
            .pending_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(channels);
        Ok(())
    }

    /// Arm a single-shot trigger for the next capture.
    pub fn rearm(&self) {
        self.shared.rearm.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the acquisition thread to stop. Safe to call repeatedly and from any thread.
    pub fn stop(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }

    /// Wait for the acquisition thread to exit.
    pub fn join(&mut self) -> Result<(), EngineError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| EngineError::ThreadPanicked),
            None => Ok(()),
        }
    }

    fn known_channels(&self) -> usize {
        match self.shared.channel_count.load(Ordering::Acquire) {
            0 => usize::MAX,
            n => n,
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

/// Start acquiring from the device matching `selector`.
pub fn spawn(
    connector: Box<dyn Connector>,
    selector: DeviceSelector,
    settings: Settings,
) -> Result<EngineHandle, EngineError> {
    settings.validate()?;

    let shared = Arc::new(EngineShared::default());
    let (event_tx, events) = channel();
    let (frame_tx, frames) = handoff_queue(settings.acquisition.queue_capacity);
    let link = DeviceLink::new(connector, settings.acquisition.reconnect.clone(), event_tx);
    let state = link.watch();

    let acquisition = Acquisition {
        link,
        selector,
        voltmeter: Voltmeter::default(),
        rolling: RollingVoltmeter::new(settings.voltmeter_depth),
        assembler: FrameAssembler::new(settings.acquisition.frame_length),
        trigger: TriggerEngine::new(settings.trigger.clone(), settings.acquisition.frame_length),
        settings,
        shared: Arc::clone(&shared),
        output: frame_tx,
        pipeline: None,
        pending_events: VecDeque::new(),
        oversize_warned: false,
    };

    let thread = thread::Builder::new()
        .name("whoascope-acquisition".to_string())
        .spawn(move || acquisition.run())?;

    Ok(EngineHandle {
        shared,
        frames,
        events,
        state,
        thread: Some(thread),
    })
}

/// Per-device pipeline state; rebuilt when a different device shape connects.
struct Pipeline {
    demux: Demultiplexer,
    bank: RingBufferBank,
    session: u64,
    channel_count: usize,
}

struct Acquisition {
    link: DeviceLink,
    selector: DeviceSelector,
    settings: Settings,
    shared: Arc<EngineShared>,
    output: QueueSender<FrameOutput>,
    pipeline: Option<Pipeline>,
    trigger: TriggerEngine,
    assembler: FrameAssembler,
    voltmeter: Voltmeter,
    rolling: RollingVoltmeter,
    /// Events whose post-trigger samples have not all arrived yet.
    pending_events: VecDeque<TriggerEvent>,
    oversize_warned: bool,
}

impl Acquisition {
    fn run(mut self) {
        #[cfg(feature = "cpu-profiling")]
        let _client = tracy_client::Client::start();

        let span = tracing::info_span!("acquisition", device = %self.selector);
        let _enter = span.enter();

        match self
            .link
            .connect_with_retry(&self.selector, &self.shared.cancel)
        {
            Ok(handle) => {
                if let Err(e) = self.begin_streaming(&handle) {
                    if !self.recover(&e) {
                        return self.shutdown();
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not connect");
                return self.shutdown();
            }
        }

        while !self.shared.cancelled() {
            if let Err(e) = self.apply_updates() {
                if !self.recover(&e) {
                    break;
                }
                continue;
            }
            match self.link.read_next_block(self.settings.acquisition.read_timeout) {
                Ok(block) => self.ingest(block),
                Err(e) if !e.is_fault() => {}
                Err(e) => {
                    if !self.recover(&e) {
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.link.stop_streaming() {
            tracing::debug!(error = %e, "Stopping stream failed");
        }
        self.link.disconnect();
        let diagnostics = self.shared.diagnostics.snapshot();
        tracing::info!(
            frames = diagnostics.frames_emitted,
            dropped = diagnostics.dropped_frames,
            stale = diagnostics.stale_frames,
            "Acquisition stopped"
        );
    }

    /// Size the channel list to the device, prepare the pipeline and start the stream.
    fn begin_streaming(&mut self, handle: &DeviceHandle) -> Result<(), LinkError> {
        let info = &handle.info;
        let channel_count = info.channel_count();
        self.shared
            .channel_count
            .store(channel_count, Ordering::Release);
        self.settings
            .channels
            .resize(channel_count, ChannelConfig::default());

        if let Err(e) = self.settings.trigger.validate(channel_count) {
            tracing::warn!(error = %e, "Trigger source not available, using channel 0");
            self.settings.trigger.source = 0;
            self.trigger.apply_config(self.settings.trigger.clone());
        }

        let reusable = self
            .pipeline
            .as_ref()
            .is_some_and(|p| p.channel_count == channel_count);
        if reusable {
            if let Some(pipeline) = self.pipeline.as_mut() {
                pipeline.session = handle.session;
                pipeline.demux.set_calibrations(info.calibrations.clone());
            }
            self.flush();
        } else {
            self.pipeline = Some(Pipeline {
                demux: Demultiplexer::new(info.calibrations.clone()),
                bank: RingBufferBank::new(channel_count, self.settings.acquisition.ring_capacity),
                session: handle.session,
                channel_count,
            });
            self.trigger = TriggerEngine::new(
                self.settings.trigger.clone(),
                self.settings.acquisition.frame_length,
            );
            self.pending_events.clear();
            self.rolling.clear();
        }
        self.oversize_warned = false;

        let history = self.settings.acquisition.history_span(info.sample_rate);
        tracing::info!(
            session = handle.session,
            channels = channel_count,
            sample_rate = info.sample_rate,
            history_ms = history.as_secs_f64() * 1000.0,
            "Streaming"
        );
        self.link.start_streaming(&self.settings.channels)
    }

    /// Drop every buffered sample and pending trigger candidate.
    fn flush(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.bank.clear();
            pipeline.demux.reset();
        }
        self.trigger.reset();
        self.pending_events.clear();
        self.rolling.clear();
    }

    /// Fault the link, flush and reconnect. Returns `false` when acquisition has to end.
    fn recover(&mut self, error: &LinkError) -> bool {
        tracing::warn!(error = %error, state = ?self.link.state(), "Device link fault");
        self.link.fault(error);
        self.flush();

        // Bounded: the link counts attempts until a stream starts.
        loop {
            match self.link.reconnect(&self.shared.cancel) {
                Ok(handle) => {
                    Diagnostics::bump(&self.shared.diagnostics.reconnects);
                    match self.begin_streaming(&handle) {
                        Ok(()) => return true,
                        Err(e) => {
                            tracing::warn!(error = %e, "Restarting stream failed");
                            self.link.fault(&e);
                        }
                    }
                }
                Err(ConnectError::Cancelled) => return false,
                Err(e) => {
                    tracing::error!(error = %e, "Reconnecting failed, acquisition halted");
                    return false;
                }
            }
        }
    }

    /// Apply configuration queued by the handle.
    fn apply_updates(&mut self) -> Result<(), LinkError> {
        if self.shared.rearm.swap(false, Ordering::AcqRel) {
            tracing::debug!("Single-shot trigger rearmed");
            self.trigger.rearm();
        }

        let trigger = self
            .shared
            .pending_trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(trigger) = trigger {
            tracing::info!(
                source = trigger.source,
                edge = trigger.edge.as_str(),
                level = trigger.level,
                mode = trigger.mode.as_str(),
                "Trigger updated"
            );
            self.trigger.apply_config(trigger.clone());
            self.settings.trigger = trigger;
            self.pending_events.clear();
        }

        let channels = self
            .shared
            .pending_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut channels) = channels {
            let count = self
                .pipeline
                .as_ref()
                .map_or(channels.len(), |p| p.channel_count);
            channels.resize(count, ChannelConfig::default());
            tracing::info!(channels = count, "Channel settings updated");
            self.settings.channels = channels;
            self.flush();
            if self.link.state() == ConnectionState::Streaming {
                self.link.stop_streaming()?;
                self.link.start_streaming(&self.settings.channels)?;
            }
        }
        Ok(())
    }

    fn ingest(&mut self, block: crate::device::RawSampleBlock) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        let diagnostics = &self.shared.diagnostics;
        Diagnostics::bump(&diagnostics.blocks_received);

        let output = match pipeline.demux.demux(block, &self.settings.channels) {
            Ok(output) => output,
            Err(e) => {
                Diagnostics::bump(&diagnostics.dropped_blocks);
                tracing::debug!(error = %e, "Dropped sample block");
                return;
            }
        };
        diagnostics
            .samples_received
            .fetch_add(output.samples.len() as u64, Ordering::Relaxed);

        if output.discontinuity {
            Diagnostics::bump(&diagnostics.discontinuities);
            tracing::debug!("Sample stream discontinuity, flushing");
            pipeline.bank.clear();
            self.trigger.reset();
            self.pending_events.clear();
        }

        let frames = output.samples.len() / pipeline.channel_count.max(1);
        let acquisition = &self.settings.acquisition;
        if !self.oversize_warned && acquisition.validate(frames).is_err() {
            tracing::warn!(
                block_samples = frames,
                ring_capacity = acquisition.ring_capacity,
                frame_length = acquisition.frame_length,
                "Blocks too large for the ring buffer, frames will be stale"
            );
            self.oversize_warned = true;
        }

        let source = self.trigger.config().source;
        let mut scanned = Vec::with_capacity(frames);
        for sample in output.samples {
            if let Some(index) = pipeline.bank.push(sample) {
                if sample.channel == source {
                    scanned.push(IndexedSample {
                        index,
                        channel: sample.channel,
                        timestamp: sample.timestamp,
                        voltage: sample.voltage,
                    });
                }
            }
        }

        while let Some(event) = self.trigger.scan(&scanned) {
            self.pending_events.push_back(event);
        }
        self.assemble_ready();
    }

    fn assemble_ready(&mut self) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };
        while let Some(event) = self.pending_events.front().copied() {
            if !self
                .assembler
                .is_ready(&pipeline.bank, &event, &self.settings.trigger)
            {
                break;
            }
            self.pending_events.pop_front();
            match self.assembler.assemble(
                &pipeline.bank,
                &event,
                &self.settings.trigger,
                &self.settings.channels,
            ) {
                Ok(frame) => {
                    self.trigger.frame_completed();
                    Self::emit(
                        &self.shared,
                        &self.output,
                        &self.voltmeter,
                        &mut self.rolling,
                        frame,
                        pipeline.session,
                    );
                }
                Err(AssembleError::Stale { channel }) => {
                    Diagnostics::bump(&self.shared.diagnostics.stale_frames);
                    tracing::debug!(channel, index = event.logical_index, "Stale trigger candidate");
                    self.trigger.frame_discarded();
                }
                Err(AssembleError::NotReady) => {
                    self.pending_events.push_front(event);
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Trigger candidate discarded");
                    self.trigger.frame_discarded();
                }
            }
        }
    }

    fn emit(
        shared: &EngineShared,
        output: &QueueSender<FrameOutput>,
        voltmeter: &Voltmeter,
        rolling: &mut RollingVoltmeter,
        frame: CapturedFrame,
        session: u64,
    ) {
        let readings = voltmeter.measure(&frame);
        let averaged = rolling.push(readings.clone());
        let diagnostics = &shared.diagnostics;
        Diagnostics::bump(&diagnostics.frames_emitted);
        if frame.free_run {
            Diagnostics::bump(&diagnostics.free_run_frames);
        }
        tracing::trace!(
            sequence = frame.sequence,
            trigger_time = frame.trigger_time,
            free_run = frame.free_run,
            "Frame captured"
        );
        let evicted = output.push(FrameOutput {
            frame,
            readings,
            rolling: averaged,
            session,
        });
        if evicted.is_some() {
            Diagnostics::bump(&diagnostics.dropped_frames);
        }
    }
}
