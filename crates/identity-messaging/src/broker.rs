//! RabbitMQ implementation of the baby event publisher
//!
//! Publishes to the default exchange with the routing key equal to the
//! queue name, persistent delivery mode and `application/json` content
//! type. Every publish goes through the broker's own circuit breaker so
//! repeated failures shed load instead of piling up timeouts.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use identity_core::events::{BabyCreatedEvent, BabyEventPublisher, PublishError};
use identity_core::reliability::{BreakerError, CircuitBreaker, CircuitBreakerConfig};

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// RabbitMQ-backed publisher for baby-created events
pub struct RabbitMqBroker {
    conn: Connection,
    channel: Channel,
    queue_name: String,
    breaker: CircuitBreaker,
}

impl RabbitMqBroker {
    /// Connect to the broker and declare the target queue.
    ///
    /// The queue is declared durable, non-exclusive and non-auto-delete
    /// with no extra arguments; declaration is idempotent.
    pub async fn connect(amqp_url: &str, queue_name: impl Into<String>) -> Result<Self, PublishError> {
        let queue_name = queue_name.into();

        let conn = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| PublishError::BrokerUnavailable(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| PublishError::BrokerUnavailable(e.to_string()))?;

        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PublishError::BrokerUnavailable(e.to_string()))?;

        info!(queue = %queue_name, "declared durable queue");

        Ok(Self {
            conn,
            channel,
            queue_name,
            breaker: CircuitBreaker::new("rabbitmq-publisher", CircuitBreakerConfig::for_publisher()),
        })
    }

    /// The queue this broker publishes to
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Close the channel and the connection
    pub async fn close(&self) -> Result<(), PublishError> {
        self.channel
            .close(200, "shutting down")
            .await
            .map_err(|e| PublishError::BrokerUnavailable(e.to_string()))?;
        self.conn
            .close(200, "shutting down")
            .await
            .map_err(|e| PublishError::BrokerUnavailable(e.to_string()))
    }
}

#[async_trait]
impl BabyEventPublisher for RabbitMqBroker {
    #[instrument(skip(self, event, deadline), fields(user_id = %event.user_id, queue = %self.queue_name))]
    async fn publish_baby_created(
        &self,
        event: &BabyCreatedEvent,
        deadline: Option<Instant>,
    ) -> Result<(), PublishError> {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PublishError::Cancelled);
        }

        let body =
            serde_json::to_vec(event).map_err(|e| PublishError::Serialization(e.to_string()))?;

        self.breaker
            .call(async {
                let confirm = self
                    .channel
                    .basic_publish(
                        "",
                        &self.queue_name,
                        BasicPublishOptions::default(),
                        &body,
                        BasicProperties::default()
                            .with_content_type("application/json".into())
                            .with_delivery_mode(PERSISTENT_DELIVERY_MODE),
                    )
                    .await?;
                confirm.await?;
                Ok::<_, lapin::Error>(())
            })
            .await
            .map_err(|err| match err {
                BreakerError::Open | BreakerError::TooManyRequests => {
                    PublishError::BrokerUnavailable(err.to_string())
                }
                BreakerError::Timeout(after) => {
                    PublishError::BrokerUnavailable(format!("publish timed out after {after:?}"))
                }
                BreakerError::Inner(e) => PublishError::BrokerUnavailable(e.to_string()),
            })?;

        debug!("published baby-created event");
        Ok(())
    }
}
