//! In-process channel hub.
//!
//! Each channel name maps to a [`Topic`]: one tokio broadcast channel that
//! fans every frame out to all subscribers (the sender included), plus the
//! presence table. Subscribers that fall more than `capacity` frames behind
//! lose the overflow, which is the at-most-once contract the session is
//! built for.
//!
//! The relay server reuses the hub, so WebSocket peers and in-process peers
//! see identical channel semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};

use crate::protocol::{Envelope, PresenceMeta};
use crate::transport::{ChannelEvent, ChannelHandle, Outbound, Subscription, Transport, TransportError};

/// Frame fanned out to every subscriber of a topic.
#[derive(Debug, Clone)]
enum TopicFrame {
    Broadcast(Envelope),
    Presence {
        joins: Vec<PresenceMeta>,
        leaves: Vec<PresenceMeta>,
        snapshot: Vec<PresenceMeta>,
    },
}

/// Statistics for monitoring topic health.
#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// One named channel.
pub struct Topic {
    sender: broadcast::Sender<Arc<TopicFrame>>,
    /// Tracked presence per subscription.
    presence: RwLock<HashMap<u64, PresenceMeta>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            presence: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    fn publish(&self, frame: TopicFrame) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Arc::new(frame)).unwrap_or(0)
    }

    async fn track(&self, conn: u64, meta: PresenceMeta) {
        let snapshot = {
            let mut presence = self.presence.write().await;
            presence.insert(conn, meta.clone());
            Self::sorted(&presence)
        };
        self.publish(TopicFrame::Presence {
            joins: vec![meta],
            leaves: Vec::new(),
            snapshot,
        });
    }

    async fn untrack(&self, conn: u64) {
        let (left, snapshot) = {
            let mut presence = self.presence.write().await;
            let left = presence.remove(&conn);
            (left, Self::sorted(&presence))
        };
        if let Some(meta) = left {
            self.publish(TopicFrame::Presence {
                joins: Vec::new(),
                leaves: vec![meta],
                snapshot,
            });
        }
    }

    fn sorted(presence: &HashMap<u64, PresenceMeta>) -> Vec<PresenceMeta> {
        let mut metas: Vec<PresenceMeta> = presence.values().cloned().collect();
        metas.sort_by_key(|m| m.online_at);
        metas
    }

    /// Current presence snapshot.
    pub async fn presence(&self) -> Vec<PresenceMeta> {
        Self::sorted(&*self.presence.read().await)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps channel names to topics.
#[derive(Clone)]
pub struct MemoryHub {
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
    capacity: usize,
    next_conn: Arc<AtomicU64>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryHub {
    /// `capacity` is the per-subscriber backlog before frames are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Get or create the topic for a channel name.
    pub async fn topic(&self, name: &str) -> Arc<Topic> {
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(name) {
                return topic.clone();
            }
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.capacity)))
            .clone()
    }

    /// Get or create the topic and subscribe to it under one write lock, so
    /// a concurrent [`MemoryHub::remove_if_empty`] cannot orphan it between
    /// the lookup and the subscription.
    async fn join(&self, name: &str) -> (Arc<Topic>, broadcast::Receiver<Arc<TopicFrame>>) {
        let mut topics = self.topics.write().await;
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.capacity)))
            .clone();
        let frames = topic.sender.subscribe();
        (topic, frames)
    }

    /// Drop a topic once nobody is subscribed.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut topics = self.topics.write().await;
        match topics.get(name) {
            Some(topic) if topic.subscriber_count() == 0 => {
                topics.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Per-subscription pump: commands in, frames out.
    async fn pump(
        self,
        name: String,
        conn: u64,
        mut commands: mpsc::UnboundedReceiver<Outbound>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let (topic, mut frames) = self.join(&name).await;
        if events.send(ChannelEvent::Subscribed).is_err() {
            return;
        }
        log::debug!("conn {conn} subscribed to {name}");

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Outbound::Broadcast(envelope)) => {
                        topic.publish(TopicFrame::Broadcast(envelope));
                    }
                    Some(Outbound::Track(meta)) => topic.track(conn, meta).await,
                    Some(Outbound::Unsubscribe) | None => break,
                },
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if !forward(&frame, &events) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        topic.messages_dropped.fetch_add(n, Ordering::Relaxed);
                        log::warn!("conn {conn} on {name} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        drop(frames);
        topic.untrack(conn).await;
        let _ = events.send(ChannelEvent::Closed);
        self.remove_if_empty(&name).await;
        log::debug!("conn {conn} left {name}");
    }
}

/// Translate a topic frame into subscriber events. Returns `false` once the
/// subscriber is gone.
fn forward(frame: &TopicFrame, events: &mpsc::UnboundedSender<ChannelEvent>) -> bool {
    let mut out = Vec::with_capacity(3);
    match frame {
        TopicFrame::Broadcast(envelope) => out.push(ChannelEvent::Broadcast(envelope.clone())),
        TopicFrame::Presence {
            joins,
            leaves,
            snapshot,
        } => {
            if !joins.is_empty() {
                out.push(ChannelEvent::PresenceJoin(joins.clone()));
            }
            if !leaves.is_empty() {
                out.push(ChannelEvent::PresenceLeave(leaves.clone()));
            }
            out.push(ChannelEvent::PresenceSync(snapshot.clone()));
        }
    }
    out.into_iter().all(|event| events.send(event).is_ok())
}

impl Transport for MemoryHub {
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (handle, commands) = ChannelHandle::pair(channel);
        let (events_tx, events) = mpsc::unbounded_channel();
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(self.clone().pump(channel.to_string(), conn, commands, events_tx));

        Ok(Subscription { handle, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientId, WireMessage};
    use tokio::time::{timeout, Duration};

    async fn next(sub: &mut Subscription) -> ChannelEvent {
        timeout(Duration::from_secs(1), sub.events.recv())
            .await
            .expect("timed out")
            .expect("channel ended")
    }

    #[tokio::test]
    async fn test_subscribe_acknowledged() {
        let hub = MemoryHub::new(16);
        let mut sub = hub.subscribe("scribe-doc-a").unwrap();
        assert_eq!(next(&mut sub).await, ChannelEvent::Subscribed);
        assert_eq!(hub.topic_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_including_sender() {
        let hub = MemoryHub::new(16);
        let mut a = hub.subscribe("room").unwrap();
        let mut b = hub.subscribe("room").unwrap();
        assert_eq!(next(&mut a).await, ChannelEvent::Subscribed);
        assert_eq!(next(&mut b).await, ChannelEvent::Subscribed);

        let msg = WireMessage::delta(ClientId::random(), vec![1, 2, 3]);
        a.handle.send(&msg).unwrap();

        for sub in [&mut a, &mut b] {
            match next(sub).await {
                ChannelEvent::Broadcast(env) => {
                    assert_eq!(WireMessage::from_envelope(&env).unwrap(), msg)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = MemoryHub::new(16);
        let mut a = hub.subscribe("doc-1").unwrap();
        let mut b = hub.subscribe("doc-2").unwrap();
        next(&mut a).await;
        next(&mut b).await;

        a.handle
            .send(&WireMessage::state_request(ClientId::random()))
            .unwrap();
        assert!(matches!(next(&mut a).await, ChannelEvent::Broadcast(_)));
        assert!(timeout(Duration::from_millis(50), b.events.recv()).await.is_err());
        assert_eq!(hub.topic_count().await, 2);
    }

    #[tokio::test]
    async fn test_presence_join_sync_and_leave() {
        let hub = MemoryHub::new(16);
        let mut a = hub.subscribe("room").unwrap();
        let mut b = hub.subscribe("room").unwrap();
        next(&mut a).await;
        next(&mut b).await;

        let alice = PresenceMeta::now(ClientId::random(), "Alice");
        a.handle.track(alice.clone()).unwrap();

        assert_eq!(next(&mut b).await, ChannelEvent::PresenceJoin(vec![alice.clone()]));
        assert_eq!(next(&mut b).await, ChannelEvent::PresenceSync(vec![alice.clone()]));

        a.handle.unsubscribe();
        assert_eq!(next(&mut b).await, ChannelEvent::PresenceLeave(vec![alice.clone()]));
        assert_eq!(next(&mut b).await, ChannelEvent::PresenceSync(vec![]));

        let topic = hub.topic("room").await;
        assert!(topic.presence().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_handle_leaves_channel() {
        let hub = MemoryHub::new(16);
        let Subscription { handle, mut events } = hub.subscribe("room").unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Subscribed));

        drop(handle);
        assert_eq!(
            timeout(Duration::from_secs(1), events.recv()).await.unwrap(),
            Some(ChannelEvent::Closed)
        );
    }

    #[tokio::test]
    async fn test_empty_topic_removed() {
        let hub = MemoryHub::new(16);
        let mut a = hub.subscribe("room").unwrap();
        next(&mut a).await;
        a.handle.unsubscribe();
        while let Ok(Some(ev)) = timeout(Duration::from_secs(1), a.events.recv()).await {
            if ev == ChannelEvent::Closed {
                break;
            }
        }
        // Cleanup runs right after Closed is sent.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_joined_topic_is_not_removed() {
        let hub = MemoryHub::new(16);
        let (_, frames) = hub.join("room").await;
        assert!(!hub.remove_if_empty("room").await);
        assert_eq!(hub.topic_count().await, 1);

        drop(frames);
        assert!(hub.remove_if_empty("room").await);
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_shares_topic() {
        for round in 0..50 {
            let hub = MemoryHub::new(16);
            let mut leaving = hub.subscribe("room").unwrap();
            next(&mut leaving).await;

            // The last member leaves while a new one joins.
            leaving.handle.unsubscribe();
            let mut y = hub.subscribe("room").unwrap();
            next(&mut y).await;
            while let Ok(Some(ev)) = timeout(Duration::from_secs(1), leaving.events.recv()).await {
                if ev == ChannelEvent::Closed {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;

            let mut z = hub.subscribe("room").unwrap();
            next(&mut z).await;
            let msg = WireMessage::state_request(ClientId::random());
            z.handle.send(&msg).unwrap();

            loop {
                match next(&mut y).await {
                    ChannelEvent::Broadcast(env) => {
                        assert_eq!(WireMessage::from_envelope(&env).unwrap(), msg, "round {round}");
                        break;
                    }
                    ChannelEvent::Closed => panic!("round {round}: joiner lost the channel"),
                    _ => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn test_topic_stats() {
        let hub = MemoryHub::new(16);
        let mut a = hub.subscribe("room").unwrap();
        next(&mut a).await;
        a.handle
            .send(&WireMessage::state_request(ClientId::random()))
            .unwrap();
        next(&mut a).await;

        let stats = hub.topic("room").await.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.messages_dropped, 0);
    }
}
