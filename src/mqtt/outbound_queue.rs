//! Offline buffer for publishes made while the broker link is down.
//!
//! Messages are replayed in FIFO order once the session is connected again.
//! The buffer is bounded; what happens on overflow is decided by
//! [`OverflowPolicy`] and every discarded message is logged and counted.

use super::message_manager::QueuedMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered message to make room
    #[default]
    DropOldest,
    /// Keep the buffer as is and discard the incoming message
    DropNewest,
}

#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        OutboundQueue::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::default())
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        OutboundQueue {
            messages: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
            dropped: 0,
        }
    }

    /// Appends a message, applying the overflow policy when full.
    ///
    /// Returns the message that was discarded to honour the bound, if any.
    pub fn enqueue(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        if self.messages.len() < self.capacity {
            debug!("Queued message for later delivery: {}", message);
            self.messages.push_back(message);
            return None;
        }

        let discarded = match self.policy {
            OverflowPolicy::DropOldest => {
                let oldest = self.messages.pop_front();
                self.messages.push_back(message);
                oldest
            }
            OverflowPolicy::DropNewest => Some(message),
        };

        if let Some(msg) = &discarded {
            self.dropped += 1;
            warn!(
                "Outbound queue full ({} messages), dropped {} (total dropped: {})",
                self.capacity, msg, self.dropped
            );
        }
        discarded
    }

    /// Removes and returns every buffered message, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.messages.drain(..).collect()
    }

    /// Puts messages that could not be delivered back in front of the queue.
    ///
    /// Order is preserved; anything beyond the capacity is discarded
    /// according to the overflow policy.
    pub fn restore(&mut self, undelivered: Vec<QueuedMessage>) {
        for message in undelivered.into_iter().rev() {
            self.messages.push_front(message);
        }
        self.trim();
    }

    /// Applies a new bound and overflow policy, keeping buffered messages
    /// up to the new capacity.
    pub fn resize(&mut self, capacity: usize, policy: OverflowPolicy) {
        self.capacity = capacity.max(1);
        self.policy = policy;
        self.trim();
    }

    fn trim(&mut self) {
        while self.messages.len() > self.capacity {
            let discarded = match self.policy {
                OverflowPolicy::DropOldest => self.messages.pop_front(),
                OverflowPolicy::DropNewest => self.messages.pop_back(),
            };
            if let Some(msg) = discarded {
                self.dropped += 1;
                warn!("Outbound queue over capacity, dropped {}", msg);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of messages discarded by the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::QoS;

    fn msg(topic: &str) -> QueuedMessage {
        QueuedMessage::new(topic, "x", QoS::AtLeastOnce, false)
    }

    fn topics(messages: &[QueuedMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.topic.as_str()).collect()
    }

    #[test]
    fn drains_in_insertion_order() {
        let mut queue = OutboundQueue::default();
        queue.enqueue(msg("a"));
        queue.enqueue(msg("b"));
        queue.enqueue(msg("c"));

        let drained = queue.drain();
        assert_eq!(topics(&drained), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn drop_oldest_keeps_latest_messages() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        assert!(queue.enqueue(msg("a")).is_none());
        assert!(queue.enqueue(msg("b")).is_none());
        let discarded = queue.enqueue(msg("c"));

        assert_eq!(discarded.map(|m| m.topic), Some("a".to_string()));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(topics(&queue.drain()), vec!["b", "c"]);
    }

    #[test]
    fn drop_newest_rejects_incoming_message() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropNewest);
        queue.enqueue(msg("a"));
        queue.enqueue(msg("b"));
        let discarded = queue.enqueue(msg("c"));

        assert_eq!(discarded.map(|m| m.topic), Some("c".to_string()));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(topics(&queue.drain()), vec!["a", "b"]);
    }

    #[test]
    fn restore_puts_messages_back_in_front() {
        let mut queue = OutboundQueue::default();
        queue.enqueue(msg("later"));
        queue.restore(vec![msg("first"), msg("second")]);

        assert_eq!(topics(&queue.drain()), vec!["first", "second", "later"]);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn restore_respects_capacity() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.enqueue(msg("c"));
        queue.restore(vec![msg("a"), msg("b")]);

        assert_eq!(queue.dropped(), 1);
        assert_eq!(topics(&queue.drain()), vec!["b", "c"]);
    }

    #[test]
    fn shrinking_keeps_the_newest_messages() {
        let mut queue = OutboundQueue::new(4, OverflowPolicy::DropNewest);
        for topic in ["a", "b", "c", "d"] {
            queue.enqueue(msg(topic));
        }
        queue.resize(2, OverflowPolicy::DropOldest);

        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(topics(&queue.drain()), vec!["c", "d"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = OutboundQueue::new(0, OverflowPolicy::DropOldest);
        assert_eq!(queue.capacity(), 1);
    }
}
