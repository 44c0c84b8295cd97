// Database models (internal, may differ from public domain types)

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub role: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

/// A row of the transactional outbox.
///
/// `processed_at` is NULL until the relay has delivered (or deliberately
/// skipped) the event; it transitions to non-NULL exactly once.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxEventRow {
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
