//! STOMP over WebSocket
//!
//! Speaks STOMP 1.2 text frames over a single WebSocket, the way a browser
//! STOMP client talks to a message broker's `/ws` endpoint. Topics are
//! mapped to destinations by prefixing `destination_prefix`.

use async_trait::async_trait;
use std::collections::VecDeque;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::frame::{Frame, FrameCommand};
use super::{Connection, Delivery, Transport, TransportEvent};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to reach the STOMP broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompConfig {
    /// WebSocket URL of the broker endpoint
    pub url: String,
    /// Virtual host sent in the CONNECT frame
    pub host: String,
    /// Prepended to every topic to form the STOMP destination
    pub destination_prefix: String,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/websocket".to_string(),
            host: "localhost".to_string(),
            destination_prefix: "/topic/".to_string(),
        }
    }
}

/// Opens STOMP sessions over WebSocket
#[derive(Debug, Clone)]
pub struct StompTransport {
    config: StompConfig,
}

impl StompTransport {
    pub fn new(config: StompConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StompConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", self.config.url)))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::text(Frame::connect(&self.config.host).encode()))
            .await?;

        // Wait for the broker to accept the session
        let pending = 'handshake: loop {
            let message = match stream.next().await {
                Some(message) => message?,
                None => return Err(TransportError::Closed),
            };
            let mut frames = read_frames(message)?.into_iter();
            while let Some(frame) = frames.next() {
                match frame.command {
                    FrameCommand::Connected => {
                        tracing::debug!(
                            url = %self.config.url,
                            version = frame.get("version").unwrap_or("1.2"),
                            "STOMP session established"
                        );
                        // Frames sent right behind CONNECTED
                        break 'handshake frames.collect::<VecDeque<_>>();
                    }
                    FrameCommand::Error => {
                        return Err(TransportError::Rejected(error_detail(&frame)))
                    }
                    other => {
                        return Err(TransportError::Protocol(format!(
                            "expected CONNECTED, got {other}"
                        )))
                    }
                }
            }
        };

        Ok(Box::new(StompConnection {
            sink,
            stream,
            pending,
            prefix: self.config.destination_prefix.clone(),
        }))
    }
}

struct StompConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    /// Decoded frames not yet handed out
    pending: VecDeque<Frame>,
    prefix: String,
}

impl StompConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.sink.send(Message::text(frame.encode())).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for StompConnection {
    async fn subscribe(&mut self, id: &str, topic: &str) -> Result<(), TransportError> {
        let destination = format!("{}{}", self.prefix, topic);
        self.send(Frame::subscribe(id, &destination)).await
    }

    async fn unsubscribe(&mut self, id: &str) -> Result<(), TransportError> {
        self.send(Frame::unsubscribe(id)).await
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                if let Some(event) = frame_event(frame, &self.prefix) {
                    return Some(event);
                }
                continue;
            }

            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket read failed");
                    return None;
                }
            };

            match read_frames(message) {
                Ok(frames) => self.pending.extend(frames),
                Err(TransportError::Closed) => return None,
                Err(e) => return Some(TransportEvent::Error(e)),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.send(Frame::disconnect()).await {
            tracing::debug!(error = %e, "DISCONNECT not delivered");
        }
        let _ = self.sink.close().await;
    }
}

/// Extract the STOMP frames carried by a WebSocket message, in order
fn read_frames(message: Message) -> Result<Vec<Frame>, TransportError> {
    let decoded = match message {
        Message::Text(text) => Frame::decode_all(text.as_str()),
        Message::Binary(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| TransportError::Protocol(format!("binary frame is not UTF-8: {e}")))?;
            Frame::decode_all(text)
        }
        Message::Close(_) => return Err(TransportError::Closed),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(Vec::new()),
    };
    decoded.map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Map an inbound frame to a transport event. Frames with no meaning for
/// a subscriber (RECEIPT, stray CONNECTED) yield `None`.
fn frame_event(frame: Frame, prefix: &str) -> Option<TransportEvent> {
    match frame.command {
        FrameCommand::Message => {
            let Some(subscription) = frame.get("subscription") else {
                return Some(TransportEvent::Error(TransportError::Protocol(
                    "MESSAGE frame without subscription header".to_string(),
                )));
            };
            let destination = frame.get("destination").unwrap_or_default();
            let topic = destination.strip_prefix(prefix).unwrap_or(destination);

            Some(TransportEvent::Message(Delivery {
                subscription: subscription.to_string(),
                topic: topic.to_string(),
                payload: frame.body.clone(),
            }))
        }
        FrameCommand::Error => Some(TransportEvent::Error(TransportError::Broker(error_detail(
            &frame,
        )))),
        FrameCommand::Receipt | FrameCommand::Connected => {
            tracing::trace!(command = %frame.command, "Ignoring frame");
            None
        }
        other => Some(TransportEvent::Error(TransportError::Protocol(format!(
            "unexpected {other} frame from broker"
        )))),
    }
}

fn error_detail(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) => message.to_string(),
        None if !frame.body.is_empty() => frame.body.clone(),
        None => "unspecified broker error".to_string(),
    }
}
