//! Broadcast notification channel with filtered queue subscriptions.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{DurableQueue, NotificationFilterPolicy, NotificationMessage};

/// Identifies a subscription on a channel.
pub type SubscriptionId = Uuid;

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    queue: Arc<DurableQueue>,
    policy: NotificationFilterPolicy,
}

/// A pub/sub channel fanning each published message out to every subscribed
/// queue whose filter policy matches.
#[derive(Debug)]
pub struct NotificationChannel {
    name: String,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl NotificationChannel {
    /// Creates a channel with no subscribers.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Returns the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribes `queue` with raw message delivery and `policy`.
    pub fn subscribe(
        &self,
        queue: Arc<DurableQueue>,
        policy: NotificationFilterPolicy,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        debug!(channel = %self.name, queue = %queue.name(), subscription = %id, "Queue subscribed");
        self.subscriptions.write().push(Subscription { id, queue, policy });
        id
    }

    /// Removes a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Returns the number of subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Publishes `message`. Returns how many queues received it.
    pub fn publish(&self, message: &NotificationMessage) -> usize {
        let subs = self.subscriptions.read();
        let mut delivered = 0;

        for sub in subs.iter() {
            if sub.policy.matches(&message.attributes) {
                sub.queue.send(message.clone());
                delivered += 1;
            } else {
                trace!(
                    channel = %self.name,
                    queue = %sub.queue.name(),
                    message_id = %message.message_id,
                    "Message filtered out"
                );
            }
        }

        debug!(
            channel = %self.name,
            message_id = %message.message_id,
            delivered,
            "Message published"
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RedrivePolicy, ALL};
    use std::time::Duration;

    fn queue(name: &str) -> Arc<DurableQueue> {
        Arc::new(DurableQueue::new(name, Duration::from_secs(300), RedrivePolicy::default()))
    }

    #[test]
    fn test_fan_out_respects_each_policy() {
        let channel = NotificationChannel::new("distribution");
        let eu = queue("eu");
        let us = queue("us");
        channel.subscribe(
            eu.clone(),
            NotificationFilterPolicy::for_consumer("111111111111", "eu-west-1"),
        );
        channel.subscribe(
            us.clone(),
            NotificationFilterPolicy::for_consumer("222222222222", "us-east-1"),
        );

        assert_eq!(channel.publish(&NotificationMessage::new(ALL, ALL, "{}")), 2);
        assert_eq!(channel.publish(&NotificationMessage::new(ALL, "eu-west-1", "{}")), 1);
        assert_eq!(channel.publish(&NotificationMessage::new("222222222222", ALL, "{}")), 1);
        assert_eq!(channel.publish(&NotificationMessage::new("333333333333", ALL, "{}")), 0);

        assert_eq!(eu.len(), 2);
        assert_eq!(us.len(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let channel = NotificationChannel::new("distribution");
        let q = queue("q");
        let id = channel.subscribe(q.clone(), NotificationFilterPolicy::for_consumer("1", "r"));

        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));
        assert_eq!(channel.publish(&NotificationMessage::new(ALL, ALL, "{}")), 0);
        assert!(q.is_empty());
    }
}
