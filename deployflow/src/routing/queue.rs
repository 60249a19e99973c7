//! Durable queue with visibility timeouts and a dead-letter path.
//!
//! Delivery is at-least-once: a received message stays on the queue, hidden,
//! until it is acknowledged with [`DurableQueue::delete`]. If the consumer
//! does not acknowledge it within the visibility timeout the message becomes
//! receivable again. Once a message has been received more than
//! `max_receive_count` times it moves to the dead-letter list instead.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::NotificationMessage;
use crate::config::QueueSettings;

/// Longest a received message can stay hidden.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Bounded redelivery before dead-lettering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedrivePolicy {
    /// Receives allowed before a message is dead-lettered.
    pub max_receive_count: u32,
}

impl Default for RedrivePolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 5,
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Handle used to acknowledge this receive.
    pub receipt_handle: Uuid,
    /// How many times the message has been received, including this one.
    pub receive_count: u32,
    /// The message itself.
    pub message: NotificationMessage,
}

/// A message that exhausted its redelivery budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message.
    pub message: NotificationMessage,
    /// Receives before it was moved.
    pub receive_count: u32,
}

#[derive(Debug)]
struct Entry {
    message: NotificationMessage,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<Uuid>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<Entry>,
    dead_letters: Vec<DeadLetter>,
}

fn hidden_until(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(MAX_VISIBILITY_TIMEOUT)).unwrap_or(now)
}

/// An in-memory durable queue.
#[derive(Debug)]
pub struct DurableQueue {
    name: String,
    visibility_timeout: Duration,
    redrive: RedrivePolicy,
    state: Mutex<QueueState>,
}

impl DurableQueue {
    /// Creates a queue with the given visibility timeout and redrive policy.
    ///
    /// The timeout is capped at [`MAX_VISIBILITY_TIMEOUT`] and every message
    /// is delivered at least once before it can be dead-lettered.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        visibility_timeout: Duration,
        redrive: RedrivePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: visibility_timeout.min(MAX_VISIBILITY_TIMEOUT),
            redrive: RedrivePolicy {
                max_receive_count: redrive.max_receive_count.max(1),
            },
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Creates a queue from settings.
    #[must_use]
    pub fn from_settings(name: impl Into<String>, settings: &QueueSettings) -> Self {
        Self::new(
            name,
            settings.visibility_timeout(),
            RedrivePolicy {
                max_receive_count: settings.max_receive_count,
            },
        )
    }

    /// Returns the queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the visibility timeout.
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Enqueues a message, immediately visible.
    pub fn send(&self, message: NotificationMessage) {
        debug!(queue = %self.name, message_id = %message.message_id, "Message enqueued");
        self.state.lock().entries.push(Entry {
            message,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt_handle: None,
        });
    }

    /// Receives up to `max` visible messages and hides them for the
    /// visibility timeout.
    ///
    /// No ordering is guaranteed across producers.
    pub fn receive(&self, max: usize) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut received = Vec::new();
        let mut exhausted = Vec::new();

        for (index, entry) in state.entries.iter_mut().enumerate() {
            if received.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            if entry.receive_count >= self.redrive.max_receive_count {
                exhausted.push(index);
                continue;
            }

            entry.receive_count += 1;
            entry.visible_at = hidden_until(now, self.visibility_timeout);
            let handle = Uuid::new_v4();
            entry.receipt_handle = Some(handle);

            received.push(ReceivedMessage {
                receipt_handle: handle,
                receive_count: entry.receive_count,
                message: entry.message.clone(),
            });
        }

        for index in exhausted.into_iter().rev() {
            let entry = state.entries.remove(index);
            warn!(
                queue = %self.name,
                message_id = %entry.message.message_id,
                receive_count = entry.receive_count,
                "Message moved to dead-letter list"
            );
            state.dead_letters.push(DeadLetter {
                message: entry.message,
                receive_count: entry.receive_count,
            });
        }

        received
    }

    /// Acknowledges a receive, removing the message.
    ///
    /// Returns false if the handle is stale (the message was received again
    /// after this handle was issued, or already deleted).
    pub fn delete(&self, receipt_handle: Uuid) -> bool {
        let mut state = self.state.lock();
        let position = state
            .entries
            .iter()
            .position(|e| e.receipt_handle == Some(receipt_handle));

        match position {
            Some(index) => {
                state.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Changes how long a received message stays hidden.
    ///
    /// A zero timeout makes it receivable immediately.
    pub fn change_visibility(&self, receipt_handle: Uuid, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        match state
            .entries
            .iter_mut()
            .find(|e| e.receipt_handle == Some(receipt_handle))
        {
            Some(entry) => {
                entry.visible_at = hidden_until(Instant::now(), timeout);
                true
            }
            None => false,
        }
    }

    /// Messages still on the queue, visible or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if no messages remain on the queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by a visibility timeout.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.visible_at > now)
            .count()
    }

    /// Returns the dead-lettered messages.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    /// Moves every dead-lettered message back onto the queue with a fresh
    /// receive budget. Returns how many were moved.
    pub fn redrive_dead_letters(&self) -> usize {
        let mut state = self.state.lock();
        let letters: Vec<DeadLetter> = state.dead_letters.drain(..).collect();
        let count = letters.len();
        let now = Instant::now();
        state.entries.extend(letters.into_iter().map(|letter| Entry {
            message: letter.message,
            receive_count: 0,
            visible_at: now,
            receipt_handle: None,
        }));
        count
    }

    /// Moves every message, dead letters included, onto `other`.
    ///
    /// Moved messages keep their receive counts but become visible at once;
    /// receipt handles issued by this queue go stale. Returns how many
    /// messages were moved.
    pub fn transfer_to(&self, other: &DurableQueue) -> usize {
        let (entries, dead_letters) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.dead_letters),
            )
        };
        let count = entries.len() + dead_letters.len();
        let now = Instant::now();

        let mut target = other.state.lock();
        target.entries.extend(entries.into_iter().map(|entry| Entry {
            visible_at: now,
            receipt_handle: None,
            ..entry
        }));
        target.dead_letters.extend(dead_letters);
        debug!(from = %self.name, to = %other.name, count, "Queue contents transferred");
        count
    }

    /// Receive counts keyed by message ID, for diagnostics.
    #[must_use]
    pub fn receive_counts(&self) -> HashMap<Uuid, u32> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| (e.message.message_id, e.receive_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(visibility: Duration, max_receive_count: u32) -> DurableQueue {
        DurableQueue::new("test", visibility, RedrivePolicy { max_receive_count })
    }

    #[test]
    fn test_transfer_moves_pending_and_dead_letters() {
        let dead = queue(Duration::ZERO, 1);
        dead.send(NotificationMessage::new("ALL", "ALL", "poison"));
        dead.receive(10);
        dead.receive(10);
        assert_eq!(dead.dead_letters().len(), 1);

        let old = queue(Duration::from_secs(300), 5);
        old.send(NotificationMessage::new("ALL", "ALL", "in-flight"));
        let handle = old.receive(1)[0].receipt_handle;
        old.send(NotificationMessage::new("ALL", "ALL", "pending"));

        let replacement = queue(Duration::from_secs(300), 5);
        assert_eq!(old.transfer_to(&replacement), 2);
        assert_eq!(dead.transfer_to(&replacement), 1);
        assert!(old.is_empty());
        assert!(!old.delete(handle));

        let received = replacement.receive(10);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].receive_count, 2);
        assert_eq!(replacement.dead_letters().len(), 1);
    }

    #[test]
    fn test_receive_hides_until_visibility_timeout() {
        let q = queue(Duration::from_secs(300), 5);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        assert_eq!(q.receive(10).len(), 1);
        assert!(q.receive(10).is_empty());
        assert_eq!(q.in_flight(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_unacknowledged_message_is_redelivered() {
        let q = queue(Duration::ZERO, 5);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        let first = q.receive(1);
        let second = q.receive(1);
        assert_eq!(first[0].message.message_id, second[0].message.message_id);
        assert_eq!(second[0].receive_count, 2);
    }

    #[test]
    fn test_delete_acknowledges() {
        let q = queue(Duration::ZERO, 5);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        let received = q.receive(1);
        assert!(q.delete(received[0].receipt_handle));
        assert!(q.is_empty());
        assert!(!q.delete(received[0].receipt_handle));
    }

    #[test]
    fn test_stale_receipt_handle_is_rejected() {
        let q = queue(Duration::ZERO, 5);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        let first = q.receive(1);
        let _second = q.receive(1);
        assert!(!q.delete(first[0].receipt_handle));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_dead_letter_after_max_receives() {
        let q = queue(Duration::ZERO, 3);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        for attempt in 1..=3 {
            let received = q.receive(1);
            assert_eq!(received.len(), 1, "attempt {attempt}");
        }

        assert!(q.receive(1).is_empty());
        assert!(q.is_empty());
        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receive_count, 3);
    }

    #[test]
    fn test_redrive_restores_budget() {
        let q = queue(Duration::ZERO, 1);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));
        q.receive(1);
        q.receive(1);
        assert_eq!(q.dead_letters().len(), 1);

        assert_eq!(q.redrive_dead_letters(), 1);
        assert!(q.dead_letters().is_empty());
        assert_eq!(q.receive(1)[0].receive_count, 1);
    }

    #[test]
    fn test_change_visibility_releases_message() {
        let q = queue(Duration::from_secs(300), 5);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        let received = q.receive(1);
        assert!(q.change_visibility(received[0].receipt_handle, Duration::ZERO));
        assert_eq!(q.receive(1).len(), 1);
    }

    #[test]
    fn test_oversized_visibility_timeout_is_capped() {
        let settings = QueueSettings::default().with_visibility_timeout_seconds(u64::MAX);
        let q = DurableQueue::from_settings("huge", &settings);
        assert_eq!(q.visibility_timeout(), MAX_VISIBILITY_TIMEOUT);

        q.send(NotificationMessage::new("ALL", "ALL", "{}"));
        let received = q.receive(1);
        assert_eq!(received.len(), 1);
        assert!(q.change_visibility(received[0].receipt_handle, Duration::MAX));
        assert_eq!(q.in_flight(), 1);
    }

    #[test]
    fn test_zero_receive_budget_still_delivers_once() {
        let settings = QueueSettings::default().with_max_receive_count(0);
        let q = DurableQueue::from_settings("strict", &settings);
        q.send(NotificationMessage::new("ALL", "ALL", "{}"));

        assert_eq!(q.receive(10).len(), 1);
        assert!(q.dead_letters().is_empty());
    }
}
