//! WebSocket transport: the single streaming connection shared by all
//! subscriptions.
//!
//! Provides:
//! - Connection lifecycle (connect, close) with an idempotent `connect`
//! - Fire-and-forget sends that are dropped with a diagnostic while closed
//! - Inbound text frames delivered as [`TransportEvent`]s, tagged with the
//!   connection generation so stale frames can be ignored after a reconnect

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::OutboundFrame;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered by the transport to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame { generation: u64, text: String },
    /// The connection with this generation is gone.
    Closed { generation: u64 },
}

/// Anything that can carry outbound control frames.
pub trait FrameSink: Send + Sync {
    /// Send one frame. Returns `false` when the frame was dropped.
    fn send(&self, frame: &OutboundFrame) -> bool;
}

type ConnectOutcome = Shared<BoxFuture<'static, Result<(), TransportError>>>;

struct Link {
    state: ConnectionState,
    /// Bumped on every successful open.
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    pending: Option<ConnectOutcome>,
}

impl Link {
    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.outgoing = None;
        self.pending = None;
    }
}

/// The streaming connection.
pub struct Connection {
    url: String,
    connect_timeout: Duration,
    link: Arc<Mutex<Link>>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    inbound_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl Connection {
    /// Create a disconnected connection to `url`.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            connect_timeout,
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Disconnected,
                generation: 0,
                outgoing: None,
                pending: None,
            })),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
        }
    }

    /// Create a connection that is already open over in-process channels.
    ///
    /// The returned [`AttachedPeer`] plays the server: it sees every frame
    /// the client sends and can push inbound frames or close the link.
    pub fn attached() -> (Self, AttachedPeer) {
        let connection = Self::new("attached://", Duration::from_secs(1));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut link = connection.link.lock();
            link.generation += 1;
            link.state = ConnectionState::Connected;
            link.outgoing = Some(outgoing_tx);
            link.generation
        };
        let peer = AttachedPeer {
            generation,
            link: connection.link.clone(),
            inbound_tx: connection.inbound_tx.clone(),
            outgoing_rx,
        };
        (connection, peer)
    }

    /// Take the inbound event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inbound_rx.take()
    }

    /// Open the connection.
    ///
    /// Returns immediately when already connected. While a connect is in
    /// flight, every caller awaits the same outcome.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let outcome = {
            let mut link = self.link.lock();
            if link.state == ConnectionState::Connected {
                log::debug!("[WS] already connected to {}", self.url);
                return Ok(());
            }
            if let Some(pending) = link.pending.clone() {
                pending
            } else {
                link.state = ConnectionState::Connecting;
                let outcome = Self::open(
                    self.url.clone(),
                    self.connect_timeout,
                    self.link.clone(),
                    self.inbound_tx.clone(),
                )
                .boxed()
                .shared();
                link.pending = Some(outcome.clone());
                outcome
            }
        };
        outcome.await
    }

    async fn open(
        url: String,
        connect_timeout: Duration,
        link: Arc<Mutex<Link>>,
        inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let ws_stream =
            match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
            {
                Ok(Ok((ws_stream, _))) => ws_stream,
                Ok(Err(e)) => {
                    link.lock().reset();
                    log::error!("[WS] connect to {url} failed: {e}");
                    return Err(TransportError::ConnectFailed(e.to_string()));
                }
                Err(_) => {
                    link.lock().reset();
                    log::error!("[WS] connect to {url} timed out");
                    return Err(TransportError::Timeout(connect_timeout));
                }
            };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let generation = {
            let mut link = link.lock();
            link.generation += 1;
            link.state = ConnectionState::Connected;
            link.outgoing = Some(out_tx);
            link.pending = None;
            link.generation
        };
        log::info!("[WS] connected to {url}");

        // Writer task: forward outgoing channel to the socket. Dropping the
        // sender closes the socket.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward text frames until the socket goes away.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = TransportEvent::Frame {
                            generation,
                            text: text.as_str().to_owned(),
                        };
                        if inbound_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {
                        log::debug!("[WS] ignoring binary frame");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("[WS] read error: {e}");
                        break;
                    }
                }
            }

            {
                let mut link = link.lock();
                if link.generation == generation {
                    link.reset();
                }
            }
            log::info!("[WS] disconnected");
            let _ = inbound_tx.send(TransportEvent::Closed { generation });
        });

        Ok(())
    }

    /// Close the connection. The reader reports `Closed` once the socket
    /// has shut down.
    pub fn close(&self) {
        let mut link = self.link.lock();
        if link.state != ConnectionState::Disconnected {
            log::info!("[WS] closing connection to {}", self.url);
        }
        link.reset();
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Generation of the current (or last) open connection.
    pub fn generation(&self) -> u64 {
        self.link.lock().generation
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl FrameSink for Connection {
    fn send(&self, frame: &OutboundFrame) -> bool {
        let link = self.link.lock();
        let Some(ref outgoing) = link.outgoing else {
            log::error!("[WS] not connected, dropping {frame:?}");
            return false;
        };
        match frame.encode() {
            Ok(text) => outgoing.send(text).is_ok(),
            Err(e) => {
                log::error!("[WS] failed to encode {frame:?}: {e}");
                false
            }
        }
    }
}

/// Server side of an [`attached`](Connection::attached) connection.
pub struct AttachedPeer {
    generation: u64,
    link: Arc<Mutex<Link>>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    outgoing_rx: mpsc::UnboundedReceiver<String>,
}

impl AttachedPeer {
    /// Deliver one inbound text frame to the client.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.inbound_tx
            .send(TransportEvent::Frame {
                generation: self.generation,
                text: text.into(),
            })
            .is_ok()
    }

    /// Next frame the client sent, if any is queued.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.outgoing_rx.try_recv().ok()
    }

    /// Every frame the client has sent so far.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut sent = Vec::new();
        while let Ok(text) = self.outgoing_rx.try_recv() {
            sent.push(text);
        }
        sent
    }

    /// Drop the link as a server would.
    pub fn close(&self) {
        {
            let mut link = self.link.lock();
            if link.generation == self.generation {
                link.reset();
            }
        }
        let _ = self.inbound_tx.send(TransportEvent::Closed {
            generation: self.generation,
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Sink that records encoded frames.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        frames: Mutex<Vec<OutboundFrame>>,
    }

    impl RecordingSink {
        pub(crate) fn frames(&self) -> Vec<OutboundFrame> {
            self.frames.lock().clone()
        }

        pub(crate) fn take(&self) -> Vec<OutboundFrame> {
            std::mem::take(&mut *self.frames.lock())
        }
    }

    impl FrameSink for RecordingSink {
        fn send(&self, frame: &OutboundFrame) -> bool {
            self.frames.lock().push(frame.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_initial_state() {
        let connection = Connection::new("ws://localhost:9090", Duration::from_secs(1));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.generation(), 0);
        assert_eq!(connection.url(), "ws://localhost:9090");
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let connection = Connection::new("ws://localhost:9090", Duration::from_secs(1));
        assert!(!connection.send(&OutboundFrame::pong()));
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut connection = Connection::new("ws://localhost:9090", Duration::from_secs(1));
        assert!(connection.take_event_rx().is_some());
        assert!(connection.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_attached_connection_carries_frames() {
        let (mut connection, mut peer) = Connection::attached();
        let mut events = connection.take_event_rx().unwrap();

        assert!(connection.is_connected());
        assert!(connection.send(&OutboundFrame::pong()));
        assert_eq!(peer.try_next_sent().as_deref(), Some(r#"{"type":"pong"}"#));

        assert!(peer.push(r#"{"type":"ping"}"#));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Frame {
                generation: 1,
                text: r#"{"type":"ping"}"#.to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_attached_close_resets_link() {
        let (mut connection, peer) = Connection::attached();
        let mut events = connection.take_event_rx().unwrap();

        peer.close();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.send(&OutboundFrame::pong()));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed { generation: 1 }));
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let (connection, _peer) = Connection::attached();
        assert!(connection.connect().await.is_ok());
        assert_eq!(connection.generation(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused_resets_state() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connection = Connection::new(format!("ws://127.0.0.1:{port}"), Duration::from_secs(2));
        let result = connection.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
