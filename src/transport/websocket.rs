//! WebSocket client for the streaming endpoint.
//!
//! A connection is split into a write task draining the outbound queue and a
//! read task decoding frames into [`TransportEvent`]s. Both tasks end when
//! the owning [`TransportSession`] closes or is dropped.

use super::wire::{encode_outbound, parse_inbound, setup_message};
use super::{Connector, OutboundMessage, TransportEvent, TransportSession};
use crate::config::SessionConfig;
use crate::{RealtalkError, Result};
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

/// Inbound events buffered before the read task waits on the consumer
const EVENT_CAPACITY: usize = 256;

/// Opens one WebSocket connection per call
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportSession> {
        let endpoint = &config.transport.endpoint;
        if endpoint.is_empty() {
            return Err(RealtalkError::TransportError("No endpoint configured".into()));
        }

        let setup = setup_message(config)?;

        let (ws_stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| RealtalkError::TransportError(format!("Connect failed: {}", e)))?;
        info!("WebSocket connected to {}", endpoint);

        let (mut ws_tx, ws_rx) = ws_stream.split();

        ws_tx
            .send(tungstenite::Message::Text(setup.into()))
            .await
            .map_err(|e| RealtalkError::TransportError(format!("Failed to send setup: {}", e)))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.transport.outbound_capacity);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // Capacity is non-zero and nothing else holds the sender yet
        let _ = events_tx.try_send(TransportEvent::Open);

        tokio::spawn(write_loop(ws_tx, outbound_rx, shutdown_rx));
        tokio::spawn(read_loop(ws_rx, events_tx));

        Ok(TransportSession::new(outbound_tx, events_rx, shutdown_tx))
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    S: futures::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            message = outbound_rx.recv() => {
                let Some(message) = message else { break };
                let text = match encode_outbound(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(tungstenite::Message::Text(text.into())).await {
                    debug!("WebSocket send failed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = sink.send(tungstenite::Message::Close(None)).await;
    let _ = sink.close().await;
    debug!("WebSocket writer stopped");
}

async fn read_loop<S>(mut stream: S, events_tx: mpsc::Sender<TransportEvent>)
where
    S: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = events_tx.closed() => break,
            frame = stream.next() => frame,
        };

        let event = match frame {
            Some(Ok(tungstenite::Message::Text(text))) => decode(text.as_str()),
            Some(Ok(tungstenite::Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => decode(text),
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                    None
                }
            },
            Some(Ok(tungstenite::Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by remote".to_string());
                let _ = events_tx.send(TransportEvent::Close(reason)).await;
                break;
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => {
                let _ = events_tx.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
            None => {
                let _ = events_tx.send(TransportEvent::Close("stream ended".into())).await;
                break;
            }
        };

        if let Some(event) = event {
            if events_tx.send(event).await.is_err() {
                break;
            }
        }
    }

    debug!("WebSocket reader stopped");
}

fn decode(text: &str) -> Option<TransportEvent> {
    match parse_inbound(text) {
        Ok(message) if message.is_empty() => None,
        Ok(message) => Some(TransportEvent::Message(message)),
        Err(e) => {
            debug!("Ignoring inbound frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn text(s: &str) -> std::result::Result<tungstenite::Message, tungstenite::Error> {
        Ok(tungstenite::Message::Text(s.to_string().into()))
    }

    #[tokio::test]
    async fn test_read_loop_decodes_and_ends_with_close() {
        let frames = stream::iter(vec![
            text(r#"{"setupComplete":{}}"#),
            text("not json"),
            text(r#"{"serverContent":{"turnComplete":true}}"#),
            Ok(tungstenite::Message::Binary(
                br#"{"toolCall":{"functionCalls":[{"id":"1","name":"x","args":{}}]}}"#.to_vec().into(),
            )),
        ]);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        read_loop(frames, events_tx).await;

        match events_rx.recv().await {
            Some(TransportEvent::Message(m)) => assert!(m.turn_complete),
            other => panic!("unexpected event: {:?}", other),
        }
        match events_rx.recv().await {
            Some(TransportEvent::Message(m)) => assert_eq!(m.commands.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Close("stream ended".into()))
        );
        assert_eq!(events_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_read_loop_reports_socket_error() {
        let frames = stream::iter(vec![Err(tungstenite::Error::ConnectionClosed)]);
        let (events_tx, mut events_rx) = mpsc::channel(8);

        read_loop(frames, events_tx).await;

        assert!(matches!(events_rx.recv().await, Some(TransportEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_read_loop_stops_when_consumer_drops() {
        let (events_tx, events_rx) = mpsc::channel(8);
        drop(events_rx);
        // A stream that never yields would hang without the closed() arm
        read_loop(stream::pending(), events_tx).await;
    }

    #[tokio::test]
    async fn test_connect_without_endpoint_fails() {
        let err = WebSocketConnector::new()
            .connect(&SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RealtalkError::TransportError(_)));
    }
}
