//! In-memory event bus with publish fault injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use gavel_core::event::SerializedEvent;
use gavel_core::event_bus::{EventBus, EventBusError, EventStream};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct BusState {
    published: Vec<(String, SerializedEvent)>,
    subscribers: Vec<(Vec<String>, mpsc::UnboundedSender<SerializedEvent>)>,
    unavailable: bool,
    failing_publishes: usize,
    failing_keys: HashSet<String>,
}

/// Event bus that records every acknowledged publish and fans out to
/// in-process subscribers.
///
/// Subscribers see events published after they subscribed, in publish order.
///
/// # Example
///
/// ```
/// use gavel_testing::InMemoryEventBus;
/// use gavel_core::event::SerializedEvent;
/// use gavel_core::event_bus::EventBus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// bus.fail_next_publishes(1);
///
/// let event = SerializedEvent::new("AuctionCreated".to_string(), 1, "a".to_string(), vec![]);
/// assert!(bus.publish("auctions.record-created", &event).await.is_err());
/// assert!(bus.publish("auctions.record-created", &event).await.is_ok());
/// assert_eq!(bus.published().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    held: Arc<watch::Sender<bool>>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            held: Arc::new(watch::Sender::new(false)),
        }
    }
}

impl InMemoryEventBus {
    /// Create a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave publishes unacknowledged until [`release_publishes`](Self::release_publishes)
    pub fn hold_publishes(&self) {
        self.held.send_replace(true);
    }

    /// Let held and future publishes complete
    pub fn release_publishes(&self) {
        self.held.send_replace(false);
    }

    /// Reject every publish until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Reject the next `count` publishes
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().unwrap().failing_publishes = count;
    }

    /// Reject every publish carrying this partition key
    pub fn fail_key(&self, key: impl Into<String>) {
        self.state.lock().unwrap().failing_keys.insert(key.into());
    }

    /// Stop rejecting publishes for any key
    pub fn clear_failing_keys(&self) {
        self.state.lock().unwrap().failing_keys.clear();
    }

    /// Every acknowledged publish, in order
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Acknowledged publishes on one topic, in order
    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<SerializedEvent> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event)
            .collect()
    }

    fn try_publish(&self, topic: &str, event: &SerializedEvent) -> Result<(), EventBusError> {
        let mut state = self.state.lock().unwrap();
        let rejected = if state.unavailable {
            Some("broker unavailable")
        } else if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            Some("injected publish failure")
        } else if state.failing_keys.contains(&event.key) {
            Some("injected failure for key")
        } else {
            None
        };
        if let Some(reason) = rejected {
            return Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: reason.to_string(),
            });
        }

        state.published.push((topic.to_string(), event.clone()));
        state.subscribers.retain(|(topics, sender)| {
            !topics.iter().any(|t| t == topic) || sender.send(event.clone()).is_ok()
        });
        Ok(())
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        let mut held = self.held.subscribe();
        Box::pin(async move {
            loop {
                let waiting = *held.borrow_and_update();
                if !waiting || held.changed().await.is_err() {
                    break;
                }
            }
            self.try_publish(&topic, &event)
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            self.state.lock().unwrap().subscribers.push((topics, sender));

            let stream = async_stream::stream! {
                while let Some(event) = receiver.recv().await {
                    yield Ok(event);
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(key: &str) -> SerializedEvent {
        SerializedEvent::new("AuctionUpdated".to_string(), 1, key.to_string(), vec![1])
    }

    #[tokio::test]
    async fn subscribers_receive_matching_topics_in_order() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();

        bus.publish("a", &event("1")).await.unwrap();
        bus.publish("b", &event("2")).await.unwrap();
        bus.publish("a", &event("3")).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().key, "1");
        assert_eq!(stream.next().await.unwrap().unwrap().key, "3");
        assert_eq!(bus.published_on("b").len(), 1);
    }

    #[tokio::test]
    async fn held_publish_completes_on_release() {
        let bus = InMemoryEventBus::new();
        bus.hold_publishes();

        let pending = tokio::spawn({
            let bus = bus.clone();
            async move { bus.publish("a", &event("1")).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert!(bus.published().is_empty());

        bus.release_publishes();
        pending.await.unwrap().unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn failing_key_only_rejects_that_key() {
        let bus = InMemoryEventBus::new();
        bus.fail_key("bad");
        assert!(bus.publish("a", &event("bad")).await.is_err());
        assert!(bus.publish("a", &event("good")).await.is_ok());
        bus.clear_failing_keys();
        assert!(bus.publish("a", &event("bad")).await.is_ok());
    }
}
