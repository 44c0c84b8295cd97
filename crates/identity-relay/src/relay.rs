//! Outbox relay worker
//!
//! Listens for PostgreSQL NOTIFY signals on `outbox_channel` and publishes
//! committed outbox rows to the broker. Notifications are treated as
//! latency hints only; the periodic sweep over unprocessed rows is what
//! guarantees delivery. Rows are claimed with `FOR UPDATE SKIP LOCKED`,
//! so multiple relay replicas never process the same row twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use identity_core::events::{BabyCreatedEvent, BabyEventPublisher, PublishError};
use identity_core::reliability::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};

// PostgreSQL NOTIFY/LISTEN configuration
const LISTENER_MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
const LISTENER_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
const OUTBOX_CHANNEL: &str = "outbox_channel";

// Event processing timeouts
const EVENT_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const BATCH_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);
const PERIODIC_PROCESS_INTERVAL: Duration = Duration::from_secs(90);

// Health check configuration
const HEALTH_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

// Batch processing limits
const MAX_EVENTS_PER_BATCH: i64 = 100;

/// Error type for the relay worker
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Shutdown was signalled; this is the clean exit from `start`
    #[error("relay shut down")]
    Cancelled,

    /// The database circuit breaker short-circuited the call
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    /// The database rejected a statement; transient, the row stays
    /// unprocessed for the next sweep
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// The broker rejected the publish; the transaction rolled back
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    /// A processing operation exceeded its deadline
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

fn map_breaker(op: &'static str, err: BreakerError<sqlx::Error>) -> RelayError {
    match err {
        BreakerError::Open | BreakerError::TooManyRequests => {
            RelayError::Unavailable(err.to_string())
        }
        BreakerError::Timeout(after) => RelayError::Timeout(op, after),
        BreakerError::Inner(e) => RelayError::Storage(e),
    }
}

/// Outcome of one breaker-guarded processing transaction.
///
/// Publish failures and shutdown interrupts are carried out of the guarded
/// closure as values, never as its error: only storage failures may count
/// against the database breaker, which guards PostgreSQL alone. The broker
/// has its own breaker inside the publisher.
enum TxOutcome {
    /// Every locked row was handled and the transaction committed
    Completed,

    /// The broker rejected the publish; the transaction rolled back and
    /// the row stays unprocessed for the next sweep
    PublishFailed(PublishError),

    /// Shutdown was observed mid-transaction; the transaction rolled back
    Interrupted,
}

/// Shared health state read by the health endpoint and written by the
/// relay worker. Kept to an atomic flag plus a narrow lock so readers
/// never contend with the worker.
#[derive(Clone)]
pub struct RelayHealth {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    alive: AtomicBool,
    last_processed: Mutex<Instant>,
    db_breaker: CircuitBreaker,
}

impl RelayHealth {
    pub(crate) fn new(db_breaker: CircuitBreaker) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                alive: AtomicBool::new(true),
                last_processed: Mutex::new(Instant::now()),
                db_breaker,
            }),
        }
    }

    /// Liveness: the process is responsive and has not noticed a listener
    /// disconnect. An open circuit breaker is deliberately NOT checked
    /// here; degraded-but-recoverable must not kill the process.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Relaxed)
    }

    /// Readiness: the database breaker is not open and something was
    /// processed recently enough that the worker is not stuck.
    pub fn is_ready(&self) -> bool {
        if self.inner.db_breaker.state() == CircuitState::Open {
            return false;
        }
        if self.inner.last_processed.lock().elapsed() > HEALTH_STALE_THRESHOLD {
            return false;
        }
        self.is_alive()
    }

    fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::Relaxed);
    }

    fn touch(&self) {
        *self.inner.last_processed.lock() = Instant::now();
    }
}

/// How a locked outbox row should be handled
#[derive(Debug, PartialEq)]
enum Dispatch {
    /// The event type matches the target queue and the payload is valid
    Publish(BabyCreatedEvent),

    /// The event type does not match the target queue; mark processed
    /// without publishing so unrecognised events do not pile up
    Drain,

    /// The payload does not decode as a baby-created event; mark processed
    /// so a poison pill cannot retry forever
    Poison(String),
}

fn classify_event(event_type: &str, target_queue: &str, payload: &serde_json::Value) -> Dispatch {
    if event_type != target_queue {
        return Dispatch::Drain;
    }
    match serde_json::from_value::<BabyCreatedEvent>(payload.clone()) {
        Ok(event) => Dispatch::Publish(event),
        Err(err) => Dispatch::Poison(err.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: String,
    event_type: String,
    payload: serde_json::Value,
}

/// The outbox relay worker
///
/// # Example
///
/// ```ignore
/// let relay = OutboxRelay::new(pool, db_url, publisher, "babies");
/// let health = relay.health();
///
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn(async move { relay.start(shutdown_rx).await });
/// ```
pub struct OutboxRelay {
    pool: PgPool,
    db_url: String,
    publisher: Arc<dyn BabyEventPublisher>,
    queue_name: String,
    db_breaker: CircuitBreaker,
    health: RelayHealth,
}

impl OutboxRelay {
    /// Create a new relay.
    ///
    /// `db_url` is used for the dedicated LISTEN connection; regular
    /// processing shares `pool` with the rest of the service.
    pub fn new(
        pool: PgPool,
        db_url: impl Into<String>,
        publisher: Arc<dyn BabyEventPublisher>,
        queue_name: impl Into<String>,
    ) -> Self {
        let db_breaker = CircuitBreaker::new(
            "relay-postgres",
            CircuitBreakerConfig::for_postgres(),
        );
        let health = RelayHealth::new(db_breaker.clone());

        Self {
            pool,
            db_url: db_url.into(),
            publisher,
            queue_name: queue_name.into(),
            db_breaker,
            health,
        }
    }

    /// Handle for liveness/readiness checks; safe to read from other tasks
    pub fn health(&self) -> RelayHealth {
        self.health.clone()
    }

    /// Run the relay until shutdown is signalled.
    ///
    /// Returns [`RelayError::Cancelled`] on clean shutdown; any other error
    /// is fatal. Processing errors are logged and absorbed here, they never
    /// stop the loop.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut listener = PgListener::connect(&self.db_url).await?;
        listener.listen(OUTBOX_CHANNEL).await?;
        info!(channel = OUTBOX_CHANNEL, "listening for outbox notifications");

        // Catch up on anything committed while the relay was offline
        match self.sweep(&mut shutdown).await {
            Ok(()) => {}
            Err(RelayError::Cancelled) => {
                info!("shutting down");
                return Err(RelayError::Cancelled);
            }
            Err(err) => error!(error = %err, "error processing startup backlog"),
        }

        let mut reconnect_backoff = LISTENER_MIN_RECONNECT_INTERVAL;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutting down");
                    return Err(RelayError::Cancelled);
                }

                notification = listener.try_recv() => {
                    match notification {
                        Ok(Some(notification)) => {
                            reconnect_backoff = LISTENER_MIN_RECONNECT_INTERVAL;
                            let event_id = notification.payload();
                            debug!(event_id, "received outbox notification");

                            match self.process_event(event_id, &mut shutdown).await {
                                Ok(()) => {
                                    self.health.touch();
                                    self.health.set_alive(true);
                                }
                                Err(RelayError::Cancelled) => {
                                    info!("shutting down");
                                    return Err(RelayError::Cancelled);
                                }
                                Err(err) => {
                                    error!(event_id, error = %err, "error processing notified event");
                                }
                            }
                        }
                        Ok(None) => {
                            warn!("listener connection lost, reconnecting");
                            self.health.set_alive(false);
                            if self.backoff(&mut shutdown, &mut reconnect_backoff).await {
                                return Err(RelayError::Cancelled);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "listener error, reconnecting");
                            self.health.set_alive(false);
                            if self.backoff(&mut shutdown, &mut reconnect_backoff).await {
                                return Err(RelayError::Cancelled);
                            }
                        }
                    }
                }

                _ = tokio::time::sleep(PERIODIC_PROCESS_INTERVAL) => {
                    // Safety net for missed notifications and failed publishes
                    match self.sweep(&mut shutdown).await {
                        Ok(()) => self.health.touch(),
                        Err(RelayError::Cancelled) => {
                            info!("shutting down");
                            return Err(RelayError::Cancelled);
                        }
                        Err(err) => error!(error = %err, "error in periodic sweep"),
                    }
                }
            }
        }
    }

    /// Wait out the listener reconnect backoff; returns true when shutdown
    /// was signalled while waiting.
    async fn backoff(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> bool {
        let interrupted = tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(*backoff) => false,
        };
        *backoff = (*backoff * 2).min(LISTENER_MAX_RECONNECT_INTERVAL);
        interrupted
    }

    /// Process a single notified event by id.
    ///
    /// The row is locked with `SKIP LOCKED`; a missing row means it was
    /// already processed, deleted, or is being handled by another replica,
    /// all of which are no-ops. A failed publish rolls the transaction
    /// back, leaving the row for the next sweep.
    #[instrument(skip(self, shutdown))]
    async fn process_event(
        &self,
        event_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let outcome = self
            .db_breaker
            .call_with_timeout(EVENT_PROCESS_TIMEOUT, async {
                let deadline = Instant::now() + EVENT_PROCESS_TIMEOUT;
                let mut tx = self.pool.begin().await?;

                let row: Option<OutboxRow> = sqlx::query_as(
                    r#"
                    SELECT id, event_type, payload
                    FROM outbox_events
                    WHERE id = $1 AND processed_at IS NULL
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(event_id)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(row) = row else {
                    tx.commit().await?;
                    return Ok(TxOutcome::Completed);
                };

                match classify_event(&row.event_type, &self.queue_name, &row.payload) {
                    Dispatch::Publish(event) => {
                        let published = tokio::select! {
                            result = self.publisher.publish_baby_created(&event, Some(deadline)) => result,
                            _ = shutdown.changed() => {
                                tx.rollback().await?;
                                return Ok(TxOutcome::Interrupted);
                            }
                        };
                        if let Err(err) = published {
                            tx.rollback().await?;
                            return Ok(TxOutcome::PublishFailed(err));
                        }
                    }
                    Dispatch::Drain => {
                        warn!(
                            event_id = %row.id,
                            event_type = %row.event_type,
                            "event type does not match target queue, draining"
                        );
                    }
                    Dispatch::Poison(reason) => {
                        error!(event_id = %row.id, %reason, "invalid payload, marking processed");
                    }
                }

                sqlx::query("UPDATE outbox_events SET processed_at = NOW() WHERE id = $1")
                    .bind(&row.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                debug!(event_id = %row.id, "processed outbox event");
                Ok::<_, sqlx::Error>(TxOutcome::Completed)
            })
            .await
            .map_err(|err| map_breaker("event processing", err))?;

        match outcome {
            TxOutcome::Completed => Ok(()),
            TxOutcome::PublishFailed(err) => Err(RelayError::Publish(err)),
            TxOutcome::Interrupted => Err(RelayError::Cancelled),
        }
    }

    /// Drain up to [`MAX_EVENTS_PER_BATCH`] unprocessed rows in
    /// `created_at` order (no order is promised across batches).
    ///
    /// A publish failure for one row logs and moves on; the row's
    /// `processed_at` update is simply skipped so the commit still advances
    /// every row that did go out. Shutdown is observed between rows and
    /// races any in-flight publish; an interrupted sweep rolls back.
    #[instrument(skip(self, shutdown))]
    async fn sweep(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RelayError> {
        let outcome = self
            .db_breaker
            .call_with_timeout(BATCH_PROCESS_TIMEOUT, async {
                let deadline = Instant::now() + BATCH_PROCESS_TIMEOUT;
                let mut tx = self.pool.begin().await?;

                let rows: Vec<OutboxRow> = sqlx::query_as(
                    r#"
                    SELECT id, event_type, payload
                    FROM outbox_events
                    WHERE processed_at IS NULL
                    ORDER BY created_at
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(MAX_EVENTS_PER_BATCH)
                .fetch_all(&mut *tx)
                .await?;

                for row in &rows {
                    if *shutdown.borrow() {
                        tx.rollback().await?;
                        return Ok(TxOutcome::Interrupted);
                    }

                    match classify_event(&row.event_type, &self.queue_name, &row.payload) {
                        Dispatch::Publish(event) => {
                            let published = tokio::select! {
                                result = self.publisher.publish_baby_created(&event, Some(deadline)) => result,
                                _ = shutdown.changed() => {
                                    tx.rollback().await?;
                                    return Ok(TxOutcome::Interrupted);
                                }
                            };
                            if let Err(err) = published {
                                error!(
                                    event_id = %row.id,
                                    error = %err,
                                    "failed to publish event, leaving for next sweep"
                                );
                                continue;
                            }
                        }
                        Dispatch::Drain => {
                            warn!(
                                event_id = %row.id,
                                event_type = %row.event_type,
                                "event type does not match target queue, draining"
                            );
                        }
                        Dispatch::Poison(reason) => {
                            error!(event_id = %row.id, %reason, "invalid payload, marking processed");
                        }
                    }

                    sqlx::query("UPDATE outbox_events SET processed_at = NOW() WHERE id = $1")
                        .bind(&row.id)
                        .execute(&mut *tx)
                        .await?;
                    debug!(event_id = %row.id, "processed outbox event");
                }

                tx.commit().await?;
                Ok::<_, sqlx::Error>(TxOutcome::Completed)
            })
            .await
            .map_err(|err| map_breaker("sweep", err))?;

        match outcome {
            TxOutcome::Completed => Ok(()),
            TxOutcome::PublishFailed(err) => Err(RelayError::Publish(err)),
            TxOutcome::Interrupted => Err(RelayError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_matching_valid_payload() {
        let payload = json!({
            "user_id": "u1",
            "last_name": "Doe",
            "room_number": "101",
        });

        let dispatch = classify_event("babies", "babies", &payload);
        assert_eq!(
            dispatch,
            Dispatch::Publish(BabyCreatedEvent {
                user_id: "u1".into(),
                last_name: "Doe".into(),
                room_number: "101".into(),
            })
        );
    }

    #[test]
    fn test_classify_empty_object_publishes_defaults() {
        let dispatch = classify_event("babies", "babies", &json!({}));
        assert_eq!(dispatch, Dispatch::Publish(BabyCreatedEvent::default()));
    }

    #[test]
    fn test_classify_mismatched_event_type_drains() {
        let payload = json!({"user_id": "u1"});
        assert_eq!(classify_event("audits", "babies", &payload), Dispatch::Drain);
    }

    #[test]
    fn test_classify_non_object_payload_is_poison() {
        assert!(matches!(
            classify_event("babies", "babies", &json!([1, 2, 3])),
            Dispatch::Poison(_)
        ));
        assert!(matches!(
            classify_event("babies", "babies", &json!("not an object")),
            Dispatch::Poison(_)
        ));
    }

    #[tokio::test]
    async fn test_health_starts_alive() {
        let health = RelayHealth::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::for_postgres(),
        ));
        assert!(health.is_alive());
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn test_health_listener_loss_clears_liveness() {
        let health = RelayHealth::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::for_postgres(),
        ));

        health.set_alive(false);
        assert!(!health.is_alive());
        assert!(!health.is_ready());

        health.set_alive(true);
        assert!(health.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_goes_stale_without_processing() {
        let health = RelayHealth::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::for_postgres(),
        ));

        tokio::time::advance(HEALTH_STALE_THRESHOLD + Duration::from_secs(1)).await;
        assert!(!health.is_ready());
        // Staleness only affects readiness, not liveness
        assert!(health.is_alive());

        health.touch();
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn test_health_open_breaker_blocks_readiness() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::for_postgres().with_failure_threshold(1),
        );
        let health = RelayHealth::new(breaker.clone());

        #[derive(Debug, thiserror::Error)]
        #[error("down")]
        struct Down;
        let _ = breaker.call(async { Err::<(), _>(Down) }).await;

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!health.is_ready());
        // An open breaker is degraded but recoverable, never a liveness failure
        assert!(health.is_alive());
    }
}
