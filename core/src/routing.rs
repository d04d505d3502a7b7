//! Static event-type to topic mapping.
//!
//! Topics are named `{prefix}.{slug}`, one per [`EventType`]. The mapping is
//! configuration, not state: the same prefix always yields the same topics.

use crate::event::EventType;

/// Deterministic topic routing for auction events.
///
/// # Examples
///
/// ```
/// use gavel_core::routing::TopicRouter;
/// use gavel_core::event::EventType;
///
/// let router = TopicRouter::new("auctions");
/// assert_eq!(router.topic_for(EventType::Created), "auctions.record-created");
/// assert_eq!(router.resolve("auctions.record-deleted"), Some(EventType::Deleted));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicRouter {
    prefix: String,
    topics: [String; 4],
}

impl TopicRouter {
    /// Build the routing table for a service prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let topics = EventType::ALL.map(|t| format!("{prefix}.{}", t.topic_slug()));
        Self { prefix, topics }
    }

    /// The service prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Destination topic for an event type.
    #[must_use]
    pub fn topic_for(&self, event_type: EventType) -> &str {
        &self.topics[Self::index(event_type)]
    }

    /// Event type routed to a topic, if the topic belongs to this table.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Option<EventType> {
        EventType::ALL
            .into_iter()
            .find(|t| self.topic_for(*t) == topic)
    }

    /// Every topic in the table, for subscribing.
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        self.topics.iter().map(String::as_str).collect()
    }

    const fn index(event_type: EventType) -> usize {
        match event_type {
            EventType::Created => 0,
            EventType::Updated => 1,
            EventType::Deleted => 2,
            EventType::Finished => 3,
        }
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new("auctions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup() {
        let router = TopicRouter::new("gavel");
        assert_eq!(router.topic_for(EventType::Updated), "gavel.record-updated");
        assert_eq!(router.topic_for(EventType::Finished), "gavel.record-finished");
        assert_eq!(router.topics().len(), 4);
        assert_eq!(router.resolve("other.record-updated"), None);
    }
}
