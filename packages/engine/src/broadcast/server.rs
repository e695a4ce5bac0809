// packages/engine/src/broadcast/server.rs
//! TCP server for real-time clients
//!
//! One subscription per connection. Frames are newline-delimited JSON
//! ([`LinesCodec`] with a maximum line length); the write half is handed to the
//! hub as a [`Connection`], the read half accepts `filter` messages.

use super::hub::{BroadcastHub, Connection, SubscriptionId};
use super::protocol::{ClientMessage, DisconnectReason, ServerMessage};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Produces the messages a new client receives before live updates
pub type SnapshotFn = Arc<dyn Fn() -> Vec<ServerMessage> + Send + Sync>;

const DISCONNECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Write half of a client connection
struct LineConnection {
    sink: SplitSink<Framed<TcpStream, LinesCodec>, String>,
    peer: SocketAddr,
}

fn codec_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[async_trait]
impl Connection for LineConnection {
    async fn deliver(&mut self, message: &ServerMessage) -> Result<()> {
        let line = serde_json::to_string(message)?;
        self.sink.send(line).await.map_err(codec_error)
    }

    async fn close(&mut self, reason: DisconnectReason) {
        if reason != DisconnectReason::ClientClosed {
            // Best effort; the client may already be gone
            if let Ok(line) = serde_json::to_string(&ServerMessage::Disconnect { reason }) {
                let _ = tokio::time::timeout(DISCONNECT_WRITE_TIMEOUT, self.sink.send(line)).await;
            }
        }
        let _ = self.sink.close().await;
        debug!(peer = %self.peer, "Connection closed ({})", reason);
    }
}

/// Real-time TCP server
pub struct RealtimeServer {
    listener: TcpListener,
    hub: BroadcastHub,
    snapshot: SnapshotFn,
    max_line_length: usize,
}

impl RealtimeServer {
    pub async fn bind(
        addr: &str,
        hub: BroadcastHub,
        snapshot: SnapshotFn,
        max_line_length: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Real-time server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            hub,
            snapshot,
            max_line_length,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let id = self.attach(stream, peer, cancel.child_token());
                    debug!(peer = %peer, subscription = id, "Client connected");
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        info!("Real-time server stopped");
    }

    fn attach(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> SubscriptionId {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(self.max_line_length));
        let (sink, lines) = framed.split();

        let snapshot = Arc::clone(&self.snapshot);
        let id = self
            .hub
            .subscribe_with(Box::new(LineConnection { sink, peer }), move || snapshot());

        let hub = self.hub.clone();
        tokio::spawn(async move {
            read_client(id, peer, lines, &hub, cancel).await;
            hub.close(id, DisconnectReason::ClientClosed);
        });
        id
    }
}

async fn read_client(
    id: SubscriptionId,
    peer: SocketAddr,
    mut lines: futures::stream::SplitStream<Framed<TcpStream, LinesCodec>>,
    hub: &BroadcastHub,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next() => line,
        };

        match line {
            Some(Ok(line)) => match serde_json::from_str::<ClientMessage>(&line) {
                Ok(ClientMessage::Filter(filter)) => {
                    if !hub.set_filter(id, filter) {
                        return;
                    }
                }
                Err(e) => debug!(peer = %peer, "Ignoring malformed client message: {}", e),
            },
            Some(Err(e)) => {
                warn!(peer = %peer, "Closing connection: {}", e);
                return;
            }
            None => return,
        }
    }
}
