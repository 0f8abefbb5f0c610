//! Event bus connecting the stages
//!
//! The bus is a capability: stages only see [`EventBus`] and
//! [`Subscription`]. [`BroadcastBus`] is fire-and-forget. A message published
//! while nobody is subscribed to its channel is dropped, and a subscriber
//! never sees anything published before it subscribed. A durable queue with
//! acknowledgement could implement the same traits without touching stage
//! logic.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use userflow_common::types::{Channel, Phase1Announcement, Phase2Announcement};
use userflow_common::{Result, UserflowError};

/// Per-channel buffer; a subscriber that falls this far behind loses messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Publish side of the bus
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a JSON payload, returning how many live subscribers received it
    async fn publish(&self, channel: Channel, payload: String) -> Result<usize>;

    /// Start receiving messages published on `channel` from now on
    async fn subscribe(&self, channel: Channel) -> Result<Box<dyn Subscription>>;
}

/// Receive side of one subscription
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next payload; `None` once the bus is gone
    async fn next_message(&mut self) -> Option<String>;
}

/// In-process fire-and-forget bus over tokio broadcast channels
pub struct BroadcastBus {
    senders: HashMap<Channel, broadcast::Sender<String>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let senders = Channel::all()
            .into_iter()
            .map(|channel| (channel, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { senders }
    }

    fn sender(&self, channel: Channel) -> Result<&broadcast::Sender<String>> {
        self.senders
            .get(&channel)
            .ok_or_else(|| UserflowError::bus(format!("channel {} is not configured", channel)))
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, channel: Channel, payload: String) -> Result<usize> {
        match self.sender(channel)?.send(payload) {
            Ok(receivers) => {
                debug!(%channel, receivers, "Message published");
                Ok(receivers)
            },
            Err(_) => {
                warn!(%channel, "No active subscriber, message dropped");
                Ok(0)
            },
        }
    }

    async fn subscribe(&self, channel: Channel) -> Result<Box<dyn Subscription>> {
        let receiver = self.sender(channel)?.subscribe();
        debug!(%channel, "Subscribed");
        Ok(Box::new(BroadcastSubscription { channel, receiver }))
    }
}

struct BroadcastSubscription {
    channel: Channel,
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn next_message(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(channel = %self.channel, missed, "Subscriber lagged, messages lost");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Publish a phase1 announcement
pub async fn announce_phase1(bus: &dyn EventBus, announcement: &Phase1Announcement) -> Result<usize> {
    bus.publish(Channel::Phase1Complete, announcement.to_payload()?)
        .await
}

/// Publish a phase2 announcement
pub async fn announce_phase2(bus: &dyn EventBus, announcement: &Phase2Announcement) -> Result<usize> {
    bus.publish(Channel::Phase2Complete, announcement.to_payload()?)
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscriber_is_lost() {
        let bus = BroadcastBus::new();

        let delivered = announce_phase1(&bus, &Phase1Announcement::new("early.jsonl"))
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        // A late subscriber does not see the earlier message.
        let mut sub = bus.subscribe(Channel::Phase1Complete).await.unwrap();
        announce_phase1(&bus, &Phase1Announcement::new("late.jsonl"))
            .await
            .unwrap();

        let payload = sub.next_message().await.unwrap();
        let received = Phase1Announcement::from_payload(&payload).unwrap();
        assert_eq!(received.raw_file.to_str(), Some("late.jsonl"));
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let bus = BroadcastBus::new();
        let mut phase2 = bus.subscribe(Channel::Phase2Complete).await.unwrap();

        assert_eq!(
            bus.publish(Channel::Phase1Complete, "{}".into()).await.unwrap(),
            0
        );
        let announcement = Phase2Announcement::new("r", "p", "d", 1, 2);
        assert_eq!(announce_phase2(&bus, &announcement).await.unwrap(), 1);

        let received = Phase2Announcement::from_payload(&phase2.next_message().await.unwrap()).unwrap();
        assert_eq!(received, announcement);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = BroadcastBus::new();
        let mut a = bus.subscribe(Channel::Phase1Complete).await.unwrap();
        let mut b = bus.subscribe(Channel::Phase1Complete).await.unwrap();

        assert_eq!(bus.publish(Channel::Phase1Complete, "x".into()).await.unwrap(), 2);
        assert_eq!(a.next_message().await.as_deref(), Some("x"));
        assert_eq!(b.next_message().await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = BroadcastBus::new();
        let mut sub = bus.subscribe(Channel::Phase2Complete).await.unwrap();
        drop(bus);
        assert!(sub.next_message().await.is_none());
    }
}
