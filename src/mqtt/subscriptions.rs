use super::message_manager::QoS;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    /// Filter was known with a different QoS; the stored QoS was replaced
    Updated,
    AlreadySubscribed,
}

impl SubscribeOutcome {
    /// Whether the broker has to be told about this change.
    pub fn needs_wire(self) -> bool {
        !matches!(self, SubscribeOutcome::AlreadySubscribed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Removed,
    NotSubscribed,
}

/// Set of active topic filters, one entry per filter.
///
/// The session consults the registry before every wire subscribe so that
/// repeated calls from the host cost nothing, and replays [`all`](Self::all)
/// after each reconnect.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    filters: BTreeMap<String, QoS>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic_filter: &str, qos: QoS) -> SubscribeOutcome {
        match self.filters.get_mut(topic_filter) {
            Some(existing) if *existing == qos => {
                debug!("Already subscribed to {}", topic_filter);
                SubscribeOutcome::AlreadySubscribed
            }
            Some(existing) => {
                debug!("Updating QoS of {} from {:?} to {:?}", topic_filter, existing, qos);
                *existing = qos;
                SubscribeOutcome::Updated
            }
            None => {
                self.filters.insert(topic_filter.to_string(), qos);
                SubscribeOutcome::Added
            }
        }
    }

    pub fn unsubscribe(&mut self, topic_filter: &str) -> UnsubscribeOutcome {
        match self.filters.remove(topic_filter) {
            Some(_) => UnsubscribeOutcome::Removed,
            None => {
                debug!("Not subscribed to {}, nothing to remove", topic_filter);
                UnsubscribeOutcome::NotSubscribed
            }
        }
    }

    /// Active subscriptions sorted by filter.
    pub fn all(&self) -> Vec<Subscription> {
        self.filters
            .iter()
            .map(|(topic_filter, qos)| Subscription {
                topic_filter: topic_filter.clone(),
                qos: *qos,
            })
            .collect()
    }

    pub fn contains(&self, topic_filter: &str) -> bool {
        self.filters.contains_key(topic_filter)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }
}
