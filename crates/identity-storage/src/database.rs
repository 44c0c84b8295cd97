//! PostgreSQL implementation of the user repository
//!
//! All statements run under the database circuit breaker. The parent
//! creation path is the transactional outbox writer: business rows and the
//! outbox row commit as one atomic unit, and a database trigger emits
//! `NOTIFY outbox_channel, <row id>` once the insert commits.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use identity_core::domain::{Parent, ParentStatus, Role, User};
use identity_core::ports::{StoreError, UserRepository};
use identity_core::reliability::{BreakerError, CircuitBreaker, CircuitBreakerConfig};

use crate::models::UserRow;

/// PostgreSQL-backed repository for user and parent accounts
///
/// Uses a connection pool for efficient database access; cloning shares
/// the pool and the circuit breaker.
///
/// # Example
///
/// ```ignore
/// use identity_storage::Database;
///
/// let db = Database::from_url("postgres://localhost/identity", "babies").await?;
/// let parent = db.create_parent(&parent, Some(&payload)).await?;
/// ```
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    breaker: CircuitBreaker,
    event_queue: String,
}

impl Database {
    /// Create a new repository over an existing connection pool.
    ///
    /// `event_queue` is the target queue name stored as `event_type` on
    /// outbox rows; the relay only dispatches rows whose `event_type`
    /// matches its configured queue.
    pub fn new(pool: PgPool, event_queue: impl Into<String>) -> Self {
        Self {
            pool,
            breaker: CircuitBreaker::new("postgres", CircuitBreakerConfig::for_postgres()),
            event_queue: event_queue.into(),
        }
    }

    /// Create a repository from a database URL
    pub async fn from_url(
        database_url: &str,
        event_queue: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool, event_queue))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_breaker(err: BreakerError<sqlx::Error>) -> StoreError {
    match err {
        BreakerError::Open | BreakerError::TooManyRequests => {
            StoreError::Unavailable(err.to_string())
        }
        BreakerError::Timeout(after) => {
            StoreError::Unavailable(format!("database call timed out after {after:?}"))
        }
        BreakerError::Inner(e) => StoreError::Database(e.to_string()),
    }
}

fn user_from_row(row: UserRow) -> Result<User, StoreError> {
    let role = Role::parse(&row.role)
        .ok_or_else(|| StoreError::Database(format!("unknown role: {}", row.role)))?;
    Ok(User {
        id: row.id,
        email: row.email,
        role,
        first_name: row.first_name,
        last_name: row.last_name,
        created_at: row.created_at,
    })
}

#[async_trait]
impl UserRepository for Database {
    #[instrument(skip(self))]
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = self
            .breaker
            .call(async {
                sqlx::query_as::<_, UserRow>(
                    r#"
                    SELECT id, email, role, first_name, last_name, created_at
                    FROM users
                    WHERE email = $1
                    "#,
                )
                .bind(email)
                .fetch_optional(&self.pool)
                .await
            })
            .await
            .map_err(map_breaker)?;

        row.map(user_from_row).transpose()
    }

    #[instrument(skip(self, parent, outbox_payload), fields(parent_id = %parent.user.id))]
    async fn create_parent(
        &self,
        parent: &Parent,
        outbox_payload: Option<&serde_json::Value>,
    ) -> Result<Parent, StoreError> {
        if let Some(payload) = outbox_payload {
            if !payload.is_object() {
                return Err(StoreError::InvalidPayload(
                    "outbox payload must be a JSON object".into(),
                ));
            }
        }

        self.breaker
            .call(async {
                let mut tx = self.pool.begin().await?;

                sqlx::query(
                    r#"
                    INSERT INTO users (id, email, role, first_name, last_name, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&parent.user.id)
                .bind(&parent.user.email)
                .bind(parent.user.role.as_str())
                .bind(&parent.user.first_name)
                .bind(&parent.user.last_name)
                .bind(parent.user.created_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO parents (user_id, room_number, status)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(&parent.user.id)
                .bind(&parent.room_number)
                .bind(parent.status.as_str())
                .execute(&mut *tx)
                .await?;

                if let Some(payload) = outbox_payload {
                    sqlx::query(
                        r#"
                        INSERT INTO outbox_events
                            (id, aggregate_type, aggregate_id, event_type, payload, created_at)
                        VALUES ($1, $2, $3, $4, $5, NOW())
                        "#,
                    )
                    .bind(Uuid::new_v4().to_string())
                    .bind("parent")
                    .bind(&parent.user.id)
                    .bind(&self.event_queue)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await
            })
            .await
            .map_err(map_breaker)?;

        debug!(parent_id = %parent.user.id, "created parent");
        Ok(parent.clone())
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn create_admin(&self, user: &User) -> Result<User, StoreError> {
        self.breaker
            .call(async {
                sqlx::query(
                    r#"
                    INSERT INTO users (id, email, role, first_name, last_name, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&user.id)
                .bind(&user.email)
                .bind(user.role.as_str())
                .bind(&user.first_name)
                .bind(&user.last_name)
                .bind(user.created_at)
                .execute(&self.pool)
                .await
            })
            .await
            .map_err(map_breaker)?;

        debug!(user_id = %user.id, "created admin");
        Ok(user.clone())
    }

    #[instrument(skip(self))]
    async fn update_parent_status(
        &self,
        parent_id: &str,
        status: ParentStatus,
    ) -> Result<(), StoreError> {
        let result = self
            .breaker
            .call(async {
                sqlx::query("UPDATE parents SET status = $2 WHERE user_id = $1")
                    .bind(parent_id)
                    .bind(status.as_str())
                    .execute(&self.pool)
                    .await
            })
            .await
            .map_err(map_breaker)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("parent {parent_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_parent_status(&self, parent_id: &str) -> Result<ParentStatus, StoreError> {
        let status: Option<String> = self
            .breaker
            .call(async {
                sqlx::query_scalar::<_, String>("SELECT status FROM parents WHERE user_id = $1")
                    .bind(parent_id)
                    .fetch_optional(&self.pool)
                    .await
            })
            .await
            .map_err(map_breaker)?;

        let status = status.ok_or_else(|| StoreError::NotFound(format!("parent {parent_id}")))?;
        ParentStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown parent status: {status}")))
    }
}
