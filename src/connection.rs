//! Wire Connection
//!
//! Owns the lifecycle of the link to the lobby server: each connection
//! attempt runs as a background io task that pumps decoded inbound frames and
//! state changes into the engine inbox. Sends are fire-and-forget against the
//! writer channel; the engine never blocks on the socket.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ClientMessage;
use crate::transport::{Connector, Transport};

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live link.
    Disconnected,
    /// Attempting to establish a link.
    Connecting,
    /// Link established.
    Connected,
}

impl ConnectionState {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// An event produced by the wire.
#[derive(Debug)]
pub enum WireEvent {
    /// The transport changed state.
    StateChanged(ConnectionState),
    /// A decoded inbound message arrived.
    Message(Value),
}

/// A [`WireEvent`] tagged with the connection attempt that produced it, so
/// events from a superseded connection can be discarded.
#[derive(Debug)]
pub struct WireUpdate {
    /// Sequence number of the producing connection attempt.
    pub conn: u64,
    /// The event itself.
    pub event: WireEvent,
}

/// Client side of the wire connection.
///
/// Generic over the engine's inbox message type; `wrap` lifts a [`WireUpdate`]
/// into the inbox so wire events interleave with commands and timers on one
/// queue, preserving arrival order.
pub struct ServerConnection<M: Send + 'static> {
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<M>,
    wrap: fn(WireUpdate) -> M,
    out_tx: Option<mpsc::UnboundedSender<String>>,
    conn_seq: u64,
    state: ConnectionState,
}

impl<M: Send + 'static> ServerConnection<M> {
    /// Create a connection manager that reports into `events`.
    pub fn new(
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<M>,
        wrap: fn(WireUpdate) -> M,
    ) -> Self {
        Self {
            connector,
            events,
            wrap,
            out_tx: None,
            conn_seq: 0,
            state: ConnectionState::Disconnected,
        }
    }

    /// Last state observed by the engine.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Record the state observed from a wire event.
    pub fn note_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Sequence number of the current connection attempt.
    pub fn current_conn(&self) -> u64 {
        self.conn_seq
    }

    /// Start a connection attempt. Ignored while one is already connecting or
    /// connected.
    pub fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("connect ignored, wire already {:?}", self.state);
            return;
        }

        self.conn_seq += 1;
        let conn = self.conn_seq;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.out_tx = Some(out_tx);

        let _ = self.events.send((self.wrap)(WireUpdate {
            conn,
            event: WireEvent::StateChanged(ConnectionState::Connecting),
        }));

        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let wrap = self.wrap;

        tokio::spawn(async move {
            let mut transport = match connector.connect().await {
                Ok(t) => t,
                Err(e) => {
                    warn!("connection attempt failed: {e}");
                    let _ = events.send(wrap(WireUpdate {
                        conn,
                        event: WireEvent::StateChanged(ConnectionState::Disconnected),
                    }));
                    return;
                }
            };

            let _ = events.send(wrap(WireUpdate {
                conn,
                event: WireEvent::StateChanged(ConnectionState::Connected),
            }));

            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if let Err(e) = transport.send(text).await {
                                warn!("send failed: {e}");
                                break;
                            }
                        }
                        // Writer handle dropped: the engine requested a close.
                        None => {
                            let _ = transport.close().await;
                            break;
                        }
                    },
                    inbound = transport.recv() => match inbound {
                        Some(Ok(text)) => match serde_json::from_str::<Value>(&text) {
                            Ok(message) => {
                                let update = wrap(WireUpdate {
                                    conn,
                                    event: WireEvent::Message(message),
                                });
                                if events.send(update).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("dropping undecodable frame: {e}"),
                        },
                        Some(Err(e)) => {
                            warn!("receive failed: {e}");
                            break;
                        }
                        None => {
                            debug!("server closed the connection");
                            break;
                        }
                    },
                }
            }

            let _ = events.send(wrap(WireUpdate {
                conn,
                event: WireEvent::StateChanged(ConnectionState::Disconnected),
            }));
        });
    }

    /// Close the current link, if any. The io task emits the disconnect event
    /// once the transport is down.
    pub fn disconnect(&mut self) {
        self.out_tx = None;
    }

    /// Queue an outbound message. Dropped with a log line when no link is up.
    pub fn send(&self, message: &ClientMessage) {
        let Some(out_tx) = &self.out_tx else {
            warn!("dropping outbound message, not connected");
            return;
        };
        match message.to_json() {
            Ok(json) => {
                debug!("sending {json}");
                if out_tx.send(json).is_err() {
                    warn!("dropping outbound message, writer is gone");
                }
            }
            Err(e) => warn!("failed to serialize outbound message: {e}"),
        }
    }
}
