//! Duplex message transport to the remote conversational endpoint

pub mod websocket;
pub mod wire;

pub use websocket::WebSocketConnector;
pub use wire::{CommandInvocation, InboundMessage};

use crate::audio::EncodedChunk;
use crate::config::SessionConfig;
use crate::{RealtalkError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Messages sent to the remote endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One block of encoded microphone audio
    Audio(EncodedChunk),

    /// Acknowledges a command invocation so the remote turn can proceed
    CommandAck {
        id: String,
        name: String,
        result: String,
    },
}

/// Lifecycle and data events from an open session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(InboundMessage),
    Close(String),
    Error(String),
}

/// Handle to one open duplex connection.
///
/// Sending never blocks: a full or closed outbound queue fails the send and
/// the caller decides whether the message matters. Dropping the handle
/// closes the connection.
pub struct TransportSession {
    id: Uuid,
    outbound: mpsc::Sender<OutboundMessage>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportSession {
    pub fn new(
        outbound: mpsc::Sender<OutboundMessage>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            events: Some(events),
            shutdown: Some(shutdown),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take the inbound event stream; only the first call returns it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.shutdown.is_none() {
            return Err(RealtalkError::TransportError("Session is closed".into()));
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => RealtalkError::TransportError("Outbound queue is full".into()),
            TrySendError::Closed(_) => RealtalkError::TransportError("Connection is closed".into()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none() || self.outbound.is_closed()
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens transport sessions.
///
/// A successful connect yields a session whose event stream begins with
/// [`TransportEvent::Open`]. A failed connect counts as a transport error.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(capacity: usize) -> (TransportSession, mpsc::Receiver<OutboundMessage>, oneshot::Receiver<()>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        (TransportSession::new(out_tx, events_rx, shutdown_tx), out_rx, shutdown_rx)
    }

    fn ack() -> OutboundMessage {
        OutboundMessage::CommandAck {
            id: "1".into(),
            name: "n".into(),
            result: "ok".into(),
        }
    }

    #[test]
    fn test_send_full_queue_fails() {
        let (session, mut out_rx, _shutdown) = session(1);
        assert!(session.send(ack()).is_ok());
        assert!(session.send(ack()).is_err());
        assert_eq!(out_rx.try_recv().unwrap(), ack());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut session, _out_rx, mut shutdown) = session(4);
        assert!(!session.is_closed());

        session.close();
        session.close();

        assert!(session.is_closed());
        assert!(shutdown.try_recv().is_ok());
        assert!(session.send(ack()).is_err());
    }

    #[test]
    fn test_events_taken_once() {
        let (mut session, _out_rx, _shutdown) = session(1);
        assert!(session.take_events().is_some());
        assert!(session.take_events().is_none());
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        let (a, _, _) = session(1);
        let (b, _, _) = session(1);
        assert_ne!(a.id(), b.id());
    }
}
