//! Event contracts between the outbox and the message broker

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Domain event emitted when a registered parent results in a new baby record.
///
/// Stored verbatim in the outbox payload and forwarded to the broker. All
/// fields may be empty; consumers validate semantics on their side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BabyCreatedEvent {
    pub user_id: String,
    pub last_name: String,
    pub room_number: String,
}

/// Error type for publish operations
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The broker is unreachable or its circuit breaker is open
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The event could not be serialized
    #[error("event serialization failed: {0}")]
    Serialization(String),

    /// The publish was cancelled before reaching the broker
    #[error("publish cancelled")]
    Cancelled,
}

/// Port for publishing baby-created events to the message broker.
///
/// Publishing is at-least-once: the relay may deliver the same event more
/// than once after a partial failure, so consumers must deduplicate on
/// `user_id` (or an equivalent business key).
#[async_trait]
pub trait BabyEventPublisher: Send + Sync {
    /// Publish one event.
    ///
    /// When `deadline` is given and has already passed on entry, the call
    /// fails with [`PublishError::Cancelled`] without contacting the
    /// broker. In-flight cancellation is by dropping the future.
    async fn publish_baby_created(
        &self,
        event: &BabyCreatedEvent,
        deadline: Option<Instant>,
    ) -> Result<(), PublishError>;
}

/// In-memory publisher capturing published events.
///
/// This is primarily for testing. It records every successful publish and
/// can be told to fail the next calls to exercise error paths.
#[derive(Default)]
pub struct InMemoryBabyEventPublisher {
    published: Mutex<Vec<BabyCreatedEvent>>,
    fail_with: Mutex<Option<String>>,
}

impl InMemoryBabyEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail with a broker-unavailable error
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.fail_with.lock() = Some(reason.into());
    }

    /// Clear a previously injected failure
    pub fn clear_failure(&self) {
        *self.fail_with.lock() = None;
    }

    /// Events captured so far, in publish order
    pub fn published(&self) -> Vec<BabyCreatedEvent> {
        self.published.lock().clone()
    }

    /// Number of successful publishes
    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    /// Forget captured events and injected failures
    pub fn reset(&self) {
        self.published.lock().clear();
        *self.fail_with.lock() = None;
    }
}

#[async_trait]
impl BabyEventPublisher for InMemoryBabyEventPublisher {
    async fn publish_baby_created(
        &self,
        event: &BabyCreatedEvent,
        deadline: Option<Instant>,
    ) -> Result<(), PublishError> {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PublishError::Cancelled);
        }
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(PublishError::BrokerUnavailable(reason));
        }
        self.published.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_field_names() {
        let event = BabyCreatedEvent {
            user_id: "user-123".into(),
            last_name: "TestFamily".into(),
            room_number: "101".into(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["user_id"], "user-123");
        assert_eq!(value["last_name"], "TestFamily");
        assert_eq!(value["room_number"], "101");
    }

    #[test]
    fn test_empty_object_parses_with_defaults() {
        let event: BabyCreatedEvent = serde_json::from_str("{}").unwrap();
        assert_eq!(event, BabyCreatedEvent::default());
    }

    #[test]
    fn test_non_object_payloads_rejected() {
        assert!(serde_json::from_str::<BabyCreatedEvent>("[1, 2]").is_err());
        assert!(serde_json::from_str::<BabyCreatedEvent>("\"not an object\"").is_err());
        assert!(serde_json::from_str::<BabyCreatedEvent>("not json").is_err());
    }

    #[tokio::test]
    async fn test_in_memory_publisher_captures_events() {
        let publisher = InMemoryBabyEventPublisher::new();
        let event = BabyCreatedEvent {
            user_id: "user-123".into(),
            last_name: "TestFamily".into(),
            room_number: "101".into(),
        };

        publisher.publish_baby_created(&event, None).await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0], event);
    }

    #[tokio::test]
    async fn test_in_memory_publisher_error_injection() {
        let publisher = InMemoryBabyEventPublisher::new();
        publisher.fail_with("broker down");

        let result = publisher
            .publish_baby_created(&BabyCreatedEvent::default(), None)
            .await;

        assert!(matches!(result, Err(PublishError::BrokerUnavailable(_))));
        assert_eq!(publisher.publish_count(), 0);

        publisher.clear_failure();
        publisher
            .publish_baby_created(&BabyCreatedEvent::default(), None)
            .await
            .unwrap();
        assert_eq!(publisher.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_cancels_without_publishing() {
        let publisher = InMemoryBabyEventPublisher::new();

        let result = publisher
            .publish_baby_created(&BabyCreatedEvent::default(), Some(Instant::now()))
            .await;

        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert_eq!(publisher.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_future_deadline_does_not_cancel() {
        let publisher = InMemoryBabyEventPublisher::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(60);

        publisher
            .publish_baby_created(&BabyCreatedEvent::default(), Some(deadline))
            .await
            .unwrap();
        assert_eq!(publisher.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_publisher_reset() {
        let publisher = InMemoryBabyEventPublisher::new();
        publisher
            .publish_baby_created(&BabyCreatedEvent::default(), None)
            .await
            .unwrap();

        publisher.reset();
        assert_eq!(publisher.publish_count(), 0);
        assert!(publisher.published().is_empty());
    }
}
