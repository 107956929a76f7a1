//! WebSocket publish/subscribe relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐   join{topic}
//!             ├── connection task ── MemoryHub topic ── broadcast + presence
//! Client B ──┘                              │
//!                               ┌───────────┼───────────┐
//!                               ▼           ▼           ▼
//!                            Client A    Client B    Client C
//! ```
//!
//! The relay is content-agnostic: it forwards envelopes to every member of
//! a topic, the sender included, and maintains presence. It never decodes
//! document deltas and holds no document state. One connection is one
//! topic membership.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::RelayConfig;
use crate::transport::frame::{ClientFrame, ServerFrame};
use crate::transport::{ChannelEvent, MemoryHub, Transport};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

pub struct RelayServer {
    config: RelayConfig,
    hub: MemoryHub,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let hub = MemoryHub::new(config.topic_capacity);
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: MemoryHub,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("WebSocket connection established from {addr}");

        let result = Self::relay_connection(ws_stream, addr, hub, stats.clone()).await;
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        result
    }

    async fn relay_connection(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        hub: MemoryHub,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // The first frame must name the topic.
        let topic = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => match ClientFrame::decode(text.as_str()) {
                    Ok(ClientFrame::Join { topic }) if !topic.is_empty() => break topic,
                    Ok(_) | Err(_) => {
                        stats.write().await.rejected_frames += 1;
                        let reply = ServerFrame::Error {
                            message: "expected join".into(),
                        };
                        ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                    }
                },
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }
        };

        let mut sub = hub.subscribe(&topic)?;
        let handle = sub.handle.clone();
        log::info!("{addr} joined {topic}");

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        match ClientFrame::decode(text.as_str()) {
                            Ok(ClientFrame::Broadcast { envelope }) => handle.publish(envelope)?,
                            Ok(ClientFrame::Track { meta }) => handle.track(meta)?,
                            Ok(ClientFrame::Leave) => break,
                            Ok(ClientFrame::Join { .. }) => {
                                log::warn!("{addr} sent a second join, ignoring");
                            }
                            Err(e) => {
                                stats.write().await.rejected_frames += 1;
                                log::warn!("Failed to decode frame from {addr}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                event = sub.events.recv() => {
                    let frame = match event {
                        Some(ChannelEvent::Subscribed) => ServerFrame::Joined { topic: topic.clone() },
                        Some(ChannelEvent::Broadcast(envelope)) => ServerFrame::Broadcast { envelope },
                        Some(ChannelEvent::PresenceSync(presences)) => ServerFrame::PresenceSync { presences },
                        Some(ChannelEvent::PresenceJoin(presences)) => ServerFrame::PresenceJoin { presences },
                        Some(ChannelEvent::PresenceLeave(presences)) => ServerFrame::PresenceLeave { presences },
                        Some(ChannelEvent::SubscribeFailed(message)) => ServerFrame::Error { message },
                        Some(ChannelEvent::Closed) | None => break,
                    };
                    ws_sender.send(Message::Text(frame.encode()?.into())).await?;
                }
            }
        }

        handle.unsubscribe();
        let _ = ws_sender.close().await;
        log::info!("{addr} left {topic}");
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The hub behind the relay, for in-process subscribers.
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}
