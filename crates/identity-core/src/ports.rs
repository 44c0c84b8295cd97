//! Storage ports
//!
//! The writer side of the outbox depends on these traits rather than a
//! concrete database so tests can substitute in-memory doubles.

use async_trait::async_trait;

use crate::domain::{Parent, ParentStatus, User};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row matched the lookup
    #[error("not found: {0}")]
    NotFound(String),

    /// The storage circuit breaker is open or the database is unreachable
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The database rejected a statement; transient, safe to retry
    #[error("database error: {0}")]
    Database(String),

    /// The outbox payload is not a JSON object
    #[error("invalid outbox payload: {0}")]
    InvalidPayload(String),
}

/// Repository for user and parent accounts.
///
/// `create_parent` is the transactional outbox writer: the business rows and
/// the outbox row land in a single transaction, or none of them do.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Look up a user by email
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Create a parent account and, when a payload is given, an outbox event
    /// row in the same transaction
    async fn create_parent(
        &self,
        parent: &Parent,
        outbox_payload: Option<&serde_json::Value>,
    ) -> Result<Parent, StoreError>;

    /// Create an admin account
    async fn create_admin(&self, user: &User) -> Result<User, StoreError>;

    /// Update a parent's admission status
    async fn update_parent_status(
        &self,
        parent_id: &str,
        status: ParentStatus,
    ) -> Result<(), StoreError>;

    /// Fetch a parent's admission status
    async fn get_parent_status(&self, parent_id: &str) -> Result<ParentStatus, StoreError>;
}
