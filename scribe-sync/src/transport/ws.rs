//! WebSocket client transport for the relay server.
//!
//! Each subscription opens its own connection:
//!
//! ```text
//! connect ──► join{topic} ──► joined ──► Subscribed
//!                                          │
//!     Outbound::Broadcast ──► broadcast    │   broadcast      ──► ChannelEvent::Broadcast
//!     Outbound::Track     ──► track        │   presence_*     ──► ChannelEvent::Presence*
//!     Outbound::Unsubscribe ► leave, close │   close / error  ──► ChannelEvent::Closed
//! ```
//!
//! A failed connect or a rejected join surfaces as
//! [`ChannelEvent::SubscribeFailed`]; the session then stays in its
//! connecting state instead of editing unsynced.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::frame::{ClientFrame, ServerFrame};
use crate::transport::{ChannelEvent, ChannelHandle, Outbound, Subscription, Transport, TransportError};

/// Connects channels to a relay at `url` (e.g. `ws://127.0.0.1:9090`).
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (handle, commands) = ChannelHandle::pair(channel);
        let (events_tx, events) = mpsc::unbounded_channel();

        let url = self.url.clone();
        let topic = channel.to_string();
        tokio::spawn(async move {
            if let Err(e) = run_connection(&url, &topic, commands, &events_tx).await {
                log::error!("Channel {topic} via {url} failed: {e}");
                let _ = events_tx.send(ChannelEvent::SubscribeFailed(e.to_string()));
            }
            let _ = events_tx.send(ChannelEvent::Closed);
        });

        Ok(Subscription { handle, events })
    }
}

async fn run_connection(
    url: &str,
    topic: &str,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> Result<(), TransportError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    send_frame(&mut ws_writer, &ClientFrame::Join { topic: topic.to_string() }).await?;

    // Wait for the join acknowledgement before reporting Subscribed.
    loop {
        match ws_reader.next().await {
            Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str()) {
                Ok(ServerFrame::Joined { .. }) => break,
                Ok(ServerFrame::Error { message }) => {
                    return Err(TransportError::Connection(message));
                }
                Ok(other) => log::debug!("Ignoring pre-join frame {other:?}"),
                Err(e) => log::warn!("Undecodable frame from relay: {e}"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Connection("closed before join".into()));
            }
            Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
    let _ = events.send(ChannelEvent::Subscribed);
    log::info!("Subscribed to {topic} via {url}");

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(Outbound::Broadcast(envelope)) => ClientFrame::Broadcast { envelope },
                    Some(Outbound::Track(meta)) => ClientFrame::Track { meta },
                    Some(Outbound::Unsubscribe) | None => {
                        let _ = send_frame(&mut ws_writer, &ClientFrame::Leave).await;
                        let _ = ws_writer.close().await;
                        break;
                    }
                };
                send_frame(&mut ws_writer, &frame).await?;
            }
            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str()) {
                    Ok(frame) => {
                        if let Some(event) = into_event(frame) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_writer.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Relay closed channel {topic}");
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error on {topic}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    Ok(())
}

fn into_event(frame: ServerFrame) -> Option<ChannelEvent> {
    match frame {
        ServerFrame::Broadcast { envelope } => Some(ChannelEvent::Broadcast(envelope)),
        ServerFrame::PresenceSync { presences } => Some(ChannelEvent::PresenceSync(presences)),
        ServerFrame::PresenceJoin { presences } => Some(ChannelEvent::PresenceJoin(presences)),
        ServerFrame::PresenceLeave { presences } => Some(ChannelEvent::PresenceLeave(presences)),
        ServerFrame::Error { message } => {
            log::warn!("Relay reported: {message}");
            None
        }
        ServerFrame::Joined { .. } => None,
    }
}

async fn send_frame<S>(writer: &mut S, frame: &ClientFrame) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = frame
        .encode()
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    writer
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_unreachable_relay_reports_failure() {
        // Port 1 is never a relay.
        let transport = WsTransport::new("ws://127.0.0.1:1");
        let mut sub = transport.subscribe("scribe-doc-x").unwrap();

        let first = timeout(Duration::from_secs(5), sub.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, ChannelEvent::SubscribeFailed(_)));
        assert_eq!(
            timeout(Duration::from_secs(1), sub.events.recv()).await.unwrap(),
            Some(ChannelEvent::Closed)
        );
    }

    #[test]
    fn test_into_event() {
        assert_eq!(
            into_event(ServerFrame::PresenceSync { presences: vec![] }),
            Some(ChannelEvent::PresenceSync(vec![]))
        );
        assert_eq!(into_event(ServerFrame::Joined { topic: "t".into() }), None);
        assert_eq!(into_event(ServerFrame::Error { message: "full".into() }), None);
    }
}
