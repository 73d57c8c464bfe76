//! In-memory device and transport doubles for driving a [`VoiceSession`]
//! without hardware or network.
//!
//! [`VoiceSession`]: crate::VoiceSession

use crate::audio::{
    AcquiredDevice, AudioConfig, AudioDevice, CaptureSink, DeviceProvider, LevelTaps,
    PlaybackToken,
};
use crate::config::SessionConfig;
use crate::transport::{Connector, InboundMessage, OutboundMessage, TransportEvent, TransportSession};
use crate::{RealtalkError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Notify};

/// A buffer handed to [`MockDevice::schedule`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub token: PlaybackToken,
    pub start_at: f64,
    pub samples: usize,
}

/// Device with a manually driven clock
pub struct MockDevice {
    clock: Mutex<f64>,
    sink: Mutex<Option<CaptureSink>>,
    scheduled: Mutex<Vec<ScheduledBuffer>>,
    stopped: Mutex<Vec<PlaybackToken>>,
    taps: LevelTaps,
    closed: AtomicBool,
    completions: mpsc::UnboundedSender<PlaybackToken>,
}

impl MockDevice {
    pub fn set_clock(&self, seconds: f64) {
        *self.clock.lock() = seconds;
    }

    pub fn advance_clock(&self, seconds: f64) {
        *self.clock.lock() += seconds;
    }

    /// Deliver one capture block. Returns whether a sink received it.
    pub fn push_capture(&self, block: &[f32]) -> bool {
        self.taps.input.write(block);
        match self.sink.lock().as_mut() {
            Some(sink) => {
                sink(block);
                true
            }
            None => false,
        }
    }

    /// Feed the output analysis window as if `samples` had been rendered
    pub fn render(&self, samples: &[f32]) {
        self.taps.output.write(samples);
    }

    /// Report a scheduled buffer as finished
    pub fn complete(&self, token: PlaybackToken) {
        let _ = self.completions.send(token);
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.scheduled.lock().clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackToken> {
        self.stopped.lock().clone()
    }

    pub fn has_capture_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AudioDevice for MockDevice {
    fn clock(&self) -> f64 {
        *self.clock.lock()
    }

    fn set_capture_sink(&self, sink: Option<CaptureSink>) {
        if self.is_closed() && sink.is_some() {
            return;
        }
        *self.sink.lock() = sink;
    }

    fn schedule(&self, token: PlaybackToken, samples: Arc<[f32]>, start_at: f64) -> f64 {
        let start_at = start_at.max(self.clock());
        if !self.is_closed() {
            self.scheduled.lock().push(ScheduledBuffer {
                token,
                start_at,
                samples: samples.len(),
            });
        }
        start_at
    }

    fn stop(&self, token: PlaybackToken) {
        self.stopped.lock().push(token);
    }

    fn taps(&self) -> LevelTaps {
        self.taps.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.sink.lock() = None;
    }
}

#[derive(Default)]
struct DevicesState {
    acquired: Vec<Arc<MockDevice>>,
    failure: Option<RealtalkError>,
    gate: Option<Arc<Notify>>,
}

/// Device provider handing out [`MockDevice`]s
#[derive(Clone, Default)]
pub struct MockDevices {
    state: Arc<Mutex<DevicesState>>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following acquisition fail with `error`
    pub fn fail_with(&self, error: RealtalkError) {
        self.state.lock().failure = Some(error);
    }

    /// Hold acquisitions until [`MockDevices::release`]
    pub fn hold(&self) {
        self.state.lock().gate = Some(Arc::new(Notify::new()));
    }

    /// Let one held acquisition proceed
    pub fn release(&self) {
        if let Some(gate) = self.state.lock().gate.as_ref() {
            gate.notify_one();
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.state.lock().acquired.len()
    }

    pub fn last(&self) -> Option<Arc<MockDevice>> {
        self.state.lock().acquired.last().cloned()
    }

    pub fn all(&self) -> Vec<Arc<MockDevice>> {
        self.state.lock().acquired.clone()
    }
}

#[async_trait]
impl DeviceProvider for MockDevices {
    async fn acquire(&self, config: &AudioConfig) -> Result<AcquiredDevice> {
        let gate = self.state.lock().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }

        let (completions_tx, completions) = mpsc::unbounded_channel();
        let device = Arc::new(MockDevice {
            clock: Mutex::new(0.0),
            sink: Mutex::new(None),
            scheduled: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            taps: LevelTaps::new(config.analyser_window),
            closed: AtomicBool::new(false),
            completions: completions_tx,
        });
        state.acquired.push(Arc::clone(&device));

        Ok(AcquiredDevice {
            device,
            completions,
        })
    }
}

struct RemoteInner {
    events: mpsc::Sender<TransportEvent>,
    outbound: Mutex<mpsc::Receiver<OutboundMessage>>,
    received: Mutex<Vec<OutboundMessage>>,
    shutdown: Mutex<oneshot::Receiver<()>>,
}

/// The far end of one mock transport session
#[derive(Clone)]
pub struct MockRemote {
    inner: Arc<RemoteInner>,
}

impl MockRemote {
    /// Inject an event. Returns false once the client stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.inner.events.try_send(event).is_ok()
    }

    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    pub fn send(&self, message: InboundMessage) -> bool {
        self.emit(TransportEvent::Message(message))
    }

    /// Send one base64 PCM16 audio payload
    pub fn send_audio(&self, data: impl Into<String>) -> bool {
        self.send(InboundMessage {
            audio: Some(data.into()),
            ..Default::default()
        })
    }

    pub fn turn_complete(&self) -> bool {
        self.send(InboundMessage {
            turn_complete: true,
            ..Default::default()
        })
    }

    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Close(reason.into()))
    }

    pub fn error(&self, cause: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(cause.into()))
    }

    /// Everything the client has sent so far
    pub fn outbound(&self) -> Vec<OutboundMessage> {
        let mut received = self.inner.received.lock();
        let mut outbound = self.inner.outbound.lock();
        while let Ok(message) = outbound.try_recv() {
            received.push(message);
        }
        received.clone()
    }

    /// Whether the client closed (or dropped) its session handle
    pub fn is_closed(&self) -> bool {
        !matches!(self.inner.shutdown.lock().try_recv(), Err(TryRecvError::Empty))
    }
}

/// Outcome of one [`MockConnector`] connect call
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Accept,
    Fail(String),
}

struct ConnectorState {
    script: VecDeque<ConnectOutcome>,
    remotes: Vec<MockRemote>,
    attempts: usize,
    auto_open: bool,
    gate: Option<Arc<Notify>>,
}

/// Connector that hands out in-memory sessions
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Accepts every connect and opens the session immediately
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                script: VecDeque::new(),
                remotes: Vec::new(),
                attempts: 0,
                auto_open: true,
                gate: None,
            })),
        }
    }

    /// Leave the open event to [`MockRemote::open`]
    pub fn manual_open(self) -> Self {
        self.state.lock().auto_open = false;
        self
    }

    /// Queue outcomes for the next connect calls; later calls accept
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Hold connects until [`MockConnector::release`]
    pub fn hold(&self) {
        self.state.lock().gate = Some(Arc::new(Notify::new()));
    }

    pub fn release(&self) {
        if let Some(gate) = self.state.lock().gate.as_ref() {
            gate.notify_one();
        }
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn remotes(&self) -> Vec<MockRemote> {
        self.state.lock().remotes.clone()
    }

    pub fn last_remote(&self) -> Option<MockRemote> {
        self.state.lock().remotes.last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportSession> {
        let gate = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if let Some(ConnectOutcome::Fail(reason)) = state.script.pop_front() {
            return Err(RealtalkError::TransportError(reason));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(config.transport.outbound_capacity);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        if state.auto_open {
            let _ = events_tx.try_send(TransportEvent::Open);
        }

        state.remotes.push(MockRemote {
            inner: Arc::new(RemoteInner {
                events: events_tx,
                outbound: Mutex::new(outbound_rx),
                received: Mutex::new(Vec::new()),
                shutdown: Mutex::new(shutdown_rx),
            }),
        });

        Ok(TransportSession::new(outbound_tx, events_rx, shutdown_tx))
    }
}
