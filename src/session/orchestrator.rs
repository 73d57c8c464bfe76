//! Session orchestrator: owns the connection intent, provisions a fresh
//! pipeline (device + transport) per attempt and tears it down on every
//! exit path.
//!
//! All mutation goes through one `Mutex<Shared>`. Asynchronous work (device
//! acquisition, transport connect, warm-up, backoff, the event pump and the
//! meter) runs on spawned tasks that hold a generation number and re-check
//! it on every resumption. Device and transport teardown always happens
//! after the lock is released, since a device may be inside the capture
//! callback waiting for that same lock.

use crate::audio::{
    decode_frame, encode_chunk, AcquiredDevice, AudioDevice, AudioLevels, Completion,
    DeviceProvider, LevelMeter, LevelTaps, PlaybackScheduler, PlaybackToken,
};
use crate::config::SessionConfig;
use crate::session::commands::{dispatch, CommandHandler};
use crate::session::reconnect::{ReconnectController, RetryDecision};
use crate::session::state::{SessionEvent, SessionState, TerminalError, VoiceState};
use crate::transport::{
    CommandInvocation, Connector, InboundMessage, OutboundMessage, TransportEvent,
    TransportSession, WebSocketConnector,
};
use crate::{RealtalkError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Observable events buffered before new ones are dropped
const EVENT_CAPACITY: usize = 256;

/// Resources of one provisioning attempt
struct Pipeline {
    device: Arc<dyn AudioDevice>,
    transport: Option<TransportSession>,
    scheduler: PlaybackScheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    fn new(device: Arc<dyn AudioDevice>) -> Self {
        Self {
            device,
            transport: None,
            scheduler: PlaybackScheduler::new(),
            tasks: Vec::new(),
        }
    }

    /// Release everything. Must be called without the state lock held.
    fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for token in self.scheduler.stop_all() {
            self.device.stop(token);
        }
        self.device.set_capture_sink(None);
        self.device.close();
        if let Some(mut transport) = self.transport.take() {
            debug!("Closing transport session {}", transport.id());
            transport.close();
        }
    }
}

struct Shared {
    state: SessionState,
    pipeline: Option<Pipeline>,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    devices: Arc<dyn DeviceProvider>,
    handler: Option<Arc<dyn CommandHandler>>,
    runtime: Handle,
    shared: Mutex<Shared>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

/// Builder for [`VoiceSession`]
pub struct VoiceSessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    devices: Option<Arc<dyn DeviceProvider>>,
    handler: Option<Arc<dyn CommandHandler>>,
    runtime: Option<Handle>,
}

impl VoiceSessionBuilder {
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn devices(mut self, devices: impl DeviceProvider + 'static) -> Self {
        self.devices = Some(Arc::new(devices));
        self
    }

    pub fn command_handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Runtime for session tasks. Defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<VoiceSession> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                RealtalkError::ConfigError("VoiceSession needs a Tokio runtime".into())
            })?,
        };

        let devices = match self.devices {
            Some(devices) => devices,
            None => default_devices()?,
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));

        let timing = &self.config.timing;
        let retry = ReconnectController::new(timing.max_retries, timing.retry_backoff());
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);

        Ok(VoiceSession {
            inner: Arc::new(Inner {
                config: self.config,
                connector,
                devices,
                handler: self.handler,
                runtime,
                shared: Mutex::new(Shared {
                    state: SessionState::new(retry),
                    pipeline: None,
                }),
                events_tx,
                events_rx,
            }),
        })
    }
}

#[cfg(feature = "audio-io")]
fn default_devices() -> Result<Arc<dyn DeviceProvider>> {
    Ok(Arc::new(crate::audio::CpalDevices::new()))
}

#[cfg(not(feature = "audio-io"))]
fn default_devices() -> Result<Arc<dyn DeviceProvider>> {
    Err(RealtalkError::ConfigError(
        "No device provider; enable the audio-io feature or supply one".into(),
    ))
}

/// A duplex voice session.
///
/// `connect` and `disconnect` may be called in any order and any number of
/// times. Dropping the session disconnects it.
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl VoiceSession {
    pub fn builder(config: SessionConfig) -> VoiceSessionBuilder {
        VoiceSessionBuilder {
            config,
            connector: None,
            devices: None,
            handler: None,
            runtime: None,
        }
    }

    /// Start a connect cycle. No-op while one is already running.
    pub fn connect(&self) {
        let inner = &self.inner;
        let generation = {
            let mut shared = inner.shared.lock();
            let state = &mut shared.state;
            if state.intent {
                debug!("connect() ignored, already connecting or connected");
                return;
            }

            state.intent = true;
            state.last_error = None;
            state.retry.reset();
            if state.muted {
                state.muted = false;
                inner.emit(SessionEvent::MuteChanged(false));
            }
            state.advance_generation()
        };

        info!("Connecting voice session");
        let task = Arc::clone(inner);
        inner.runtime.spawn(async move { task.provision(generation).await });
    }

    /// End the session and release every resource. Safe from any state.
    pub fn disconnect(&self) {
        let pipeline = {
            let mut shared = self.inner.shared.lock();
            let was_active = shared.state.intent || shared.pipeline.is_some();
            shared.state.intent = false;
            shared.state.ready = false;
            shared.state.advance_generation();
            shared.state.retry.reset();
            self.inner.reset_observables(&mut shared.state);
            if was_active {
                info!("Voice session disconnected");
            }
            shared.pipeline.take()
        };

        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
    }

    /// Flip the mute flag and return the new value
    pub fn toggle_mute(&self) -> bool {
        let mut shared = self.inner.shared.lock();
        let state = &mut shared.state;
        state.muted = !state.muted;
        if state.muted {
            state.live_levels.input = 0.0;
            state.levels.input = 0.0;
        }
        debug!("Mute {}", if state.muted { "on" } else { "off" });
        self.inner.emit(SessionEvent::MuteChanged(state.muted));
        state.muted
    }

    /// Final disconnect. The session can still be reconnected afterwards.
    pub fn dispose(&self) {
        self.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().state.connected
    }

    pub fn voice_state(&self) -> VoiceState {
        self.inner.shared.lock().state.voice_state
    }

    /// Throttled levels, as last published
    pub fn levels(&self) -> AudioLevels {
        self.inner.shared.lock().state.levels
    }

    /// Levels from the most recent meter tick
    pub fn live_levels(&self) -> AudioLevels {
        self.inner.shared.lock().state.live_levels
    }

    pub fn last_error(&self) -> Option<TerminalError> {
        self.inner.shared.lock().state.last_error.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.shared.lock().state.muted
    }

    pub fn try_recv_event(&self) -> Option<SessionEvent> {
        self.inner.events_rx.try_recv().ok()
    }

    pub fn events(&self) -> Receiver<SessionEvent> {
        self.inner.events_rx.clone()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        if self.events_tx.try_send(event).is_err() {
            debug!("Session event dropped, channel full");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.lock().state.is_current(generation)
    }

    fn set_voice_state(&self, state: &mut SessionState, voice_state: VoiceState) {
        if state.voice_state != voice_state {
            debug!("Voice state {} -> {}", state.voice_state, voice_state);
            state.voice_state = voice_state;
            self.emit(SessionEvent::VoiceStateChanged(voice_state));
        }
    }

    /// Per-connection state back to its idle values
    fn reset_observables(&self, state: &mut SessionState) {
        state.ready = false;
        if state.connected {
            state.connected = false;
            self.emit(SessionEvent::Disconnected);
        }
        self.set_voice_state(state, VoiceState::Idle);
        state.live_levels = AudioLevels::SILENT;
        if state.levels != AudioLevels::SILENT {
            state.levels = AudioLevels::SILENT;
            self.emit(SessionEvent::Levels(AudioLevels::SILENT));
        }
    }

    async fn provision(self: Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        let AcquiredDevice {
            device,
            completions,
        } = match self.devices.acquire(&self.config.audio).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.fail_initialization(generation, e);
                return;
            }
        };

        // The user may have disconnected while a permission prompt was up
        {
            let mut shared = self.shared.lock();
            if shared.state.is_current(generation) {
                let mut pipeline = Pipeline::new(Arc::clone(&device));
                pipeline.tasks.push(self.runtime.spawn(meter_loop(
                    Arc::downgrade(&self),
                    generation,
                    device.taps(),
                )));
                shared.pipeline = Some(pipeline);
            } else {
                drop(shared);
                debug!("Releasing devices acquired for a cancelled attempt");
                device.close();
                return;
            }
        }
        info!("Audio devices acquired");

        device.set_capture_sink(Some(capture_sink(Arc::downgrade(&self), generation)));

        let mut session = match self.connector.connect(&self.config).await {
            Ok(session) => session,
            Err(e) => {
                self.handle_transport_failure(generation, &e.to_string());
                return;
            }
        };

        let Some(events) = session.take_events() else {
            self.handle_transport_failure(generation, "transport session has no event stream");
            return;
        };

        let mut shared = self.shared.lock();
        if !shared.state.is_current(generation) || shared.pipeline.is_none() {
            drop(shared);
            info!("Closing transport session {} that resolved after disconnect", session.id());
            session.close();
            return;
        }

        let pump_task = self.runtime.spawn(pump(
            Arc::downgrade(&self),
            generation,
            events,
            completions,
        ));
        if let Some(pipeline) = shared.pipeline.as_mut() {
            debug!("Transport session {} installed", session.id());
            pipeline.tasks.push(pump_task);
            pipeline.transport = Some(session);
        }
    }

    fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Open => self.on_open(generation),
            TransportEvent::Message(message) => {
                self.on_message(generation, message);
                self.is_current(generation)
            }
            TransportEvent::Close(reason) => {
                self.handle_transport_failure(generation, &format!("closed: {}", reason));
                false
            }
            TransportEvent::Error(cause) => {
                self.handle_transport_failure(generation, &cause);
                false
            }
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64) -> bool {
        let mut shared = self.shared.lock();
        if !shared.state.is_current(generation) {
            return false;
        }

        let state = &mut shared.state;
        state.retry.mark_stable();
        if !state.connected {
            state.connected = true;
            self.emit(SessionEvent::Connected);
        }
        if state.voice_state == VoiceState::Idle {
            self.set_voice_state(state, VoiceState::Listening);
        }
        info!("Voice session open");

        let weak = Arc::downgrade(self);
        let warmup = self.config.timing.warmup();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(warmup).await;
            let Some(inner) = weak.upgrade() else { return };
            let mut shared = inner.shared.lock();
            if shared.state.is_current(generation) {
                shared.state.ready = true;
                debug!("Warm-up complete, forwarding capture");
            }
        });
        if let Some(pipeline) = shared.pipeline.as_mut() {
            pipeline.tasks.push(task);
        }
        true
    }

    fn on_message(&self, generation: u64, message: InboundMessage) {
        if let Some(audio) = &message.audio {
            self.on_audio(generation, audio);
        }
        for invocation in &message.commands {
            self.on_command(generation, invocation);
        }
        if message.turn_complete {
            self.on_turn_complete(generation);
        }
    }

    fn on_audio(&self, generation: u64, data: &str) {
        let frame = match decode_frame(data, self.config.audio.output_sample_rate) {
            Ok(frame) if !frame.is_empty() => frame,
            Ok(_) => return,
            Err(e) => {
                debug!("Ignoring inbound audio: {}", e);
                return;
            }
        };

        let mut shared = self.shared.lock();
        let Shared { state, pipeline } = &mut *shared;
        if !state.is_current(generation) || !state.connected {
            return;
        }
        let Some(pipeline) = pipeline.as_mut() else { return };

        let now = pipeline.device.clock();
        let entry = pipeline.scheduler.schedule(&frame, now);
        let started = pipeline
            .device
            .schedule(entry.token, frame.shared_samples(), entry.start_time);
        pipeline.scheduler.reanchor(entry.token, started);
        debug!(
            "Scheduled buffer {} at {:.3}s for {:.3}s",
            entry.token, started, entry.duration
        );
        self.set_voice_state(state, VoiceState::Speaking);
    }

    fn on_command(&self, generation: u64, invocation: &CommandInvocation) {
        if !self.is_current(generation) {
            return;
        }

        // The handler runs without the lock; it may call back into the session
        let Some(ack) = dispatch(
            self.handler.as_deref(),
            self.config.command.as_ref(),
            invocation,
        ) else {
            return;
        };

        let shared = self.shared.lock();
        if !shared.state.is_current(generation) {
            return;
        }
        match shared.pipeline.as_ref().and_then(|p| p.transport.as_ref()) {
            Some(transport) => {
                if let Err(e) = transport.send(ack) {
                    warn!("Failed to acknowledge command: {}", e);
                }
            }
            None => warn!("No transport to acknowledge command"),
        }
    }

    fn on_turn_complete(&self, generation: u64) {
        let mut shared = self.shared.lock();
        let Shared { state, pipeline } = &mut *shared;
        if !state.is_current(generation) || !state.connected {
            return;
        }
        if pipeline.as_ref().map_or(true, |p| p.scheduler.is_empty()) {
            self.set_voice_state(state, VoiceState::Listening);
        }
    }

    fn on_playback_complete(&self, generation: u64, token: PlaybackToken) {
        let mut shared = self.shared.lock();
        let Shared { state, pipeline } = &mut *shared;
        if !state.is_current(generation) {
            return;
        }
        let Some(pipeline) = pipeline.as_mut() else { return };

        let now = pipeline.device.clock();
        match pipeline.scheduler.complete(token, now) {
            Completion::Drained => {
                debug!("Playback queue drained at {:.3}s", now);
                self.set_voice_state(state, VoiceState::Listening);
            }
            Completion::Pending => {}
            Completion::Unknown => debug!("Completion for unknown buffer {}", token),
        }
    }

    fn forward_capture(&self, generation: u64, block: &[f32]) {
        let shared = self.shared.lock();
        let state = &shared.state;
        if !state.is_current(generation) || !state.ready || state.muted {
            return;
        }
        let Some(transport) = shared.pipeline.as_ref().and_then(|p| p.transport.as_ref()) else {
            return;
        };

        let chunk = encode_chunk(block, self.config.audio.input_sample_rate);
        if let Err(e) = transport.send(OutboundMessage::Audio(chunk)) {
            debug!("Dropped capture block: {}", e);
        }
    }

    fn handle_transport_failure(self: &Arc<Self>, generation: u64, cause: &str) {
        let pipeline = {
            let mut shared = self.shared.lock();
            if !shared.state.is_current(generation) {
                return;
            }

            let state = &mut shared.state;
            match state.retry.on_failure() {
                RetryDecision::Retry { attempt, delay } => {
                    warn!(
                        "Transport failed ({}), reconnecting in {:?} (attempt {}/{})",
                        cause, delay, attempt, self.config.timing.max_retries
                    );
                    self.reset_observables(state);
                    let next = state.advance_generation();

                    let weak = Arc::downgrade(self);
                    self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let Some(inner) = weak.upgrade() else { return };
                        if inner.is_current(next) {
                            info!("Reconnection attempt {}", attempt);
                            inner.provision(next).await;
                        }
                    });
                }
                RetryDecision::GiveUp { retries } => {
                    error!(
                        "Transport failed ({}), giving up after {} reconnection attempts",
                        cause, retries
                    );
                    self.terminate(state, TerminalError::Unreachable { retries });
                }
            }
            shared.pipeline.take()
        };

        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
    }

    fn fail_initialization(&self, generation: u64, cause: RealtalkError) {
        let pipeline = {
            let mut shared = self.shared.lock();
            if !shared.state.is_current(generation) {
                return;
            }
            error!("Audio initialization failed: {}", cause);
            self.terminate(
                &mut shared.state,
                TerminalError::Initialization(cause.to_string()),
            );
            shared.pipeline.take()
        };

        if let Some(pipeline) = pipeline {
            pipeline.shutdown();
        }
    }

    /// Clear intent and surface a terminal error
    fn terminate(&self, state: &mut SessionState, error: TerminalError) {
        state.intent = false;
        state.advance_generation();
        self.reset_observables(state);
        state.last_error = Some(error.clone());
        self.emit(SessionEvent::Error(error));
    }
}

fn capture_sink(inner: Weak<Inner>, generation: u64) -> crate::audio::CaptureSink {
    Box::new(move |block: &[f32]| {
        if let Some(inner) = inner.upgrade() {
            inner.forward_capture(generation, block);
        }
    })
}

/// Feeds transport events and playback completions of one pipeline into
/// the session, in arrival order
async fn pump(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    mut completions: mpsc::UnboundedReceiver<PlaybackToken>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                let event = event.unwrap_or_else(|| TransportEvent::Close("event stream ended".into()));
                if !inner.on_transport_event(generation, event) {
                    break;
                }
            }
            Some(token) = completions.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_playback_complete(generation, token);
            }
        }
    }
}

async fn meter_loop(inner: Weak<Inner>, generation: u64, taps: LevelTaps) {
    let (interval, publish_every) = match inner.upgrade() {
        Some(inner) => (
            inner.config.timing.meter_interval(),
            inner.config.timing.meter_publish_every,
        ),
        None => return,
    };

    let mut meter = LevelMeter::new(publish_every);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };

        let input = taps.input.snapshot();
        let output = taps.output.snapshot();

        let mut shared = inner.shared.lock();
        let state = &mut shared.state;
        if state.generation != generation {
            break;
        }

        let reading = meter.tick(&input, &output, state.muted);
        state.live_levels = reading.live;
        if let Some(published) = reading.published {
            if published != state.levels {
                state.levels = published;
                inner.emit(SessionEvent::Levels(published));
            }
        }
    }
}
