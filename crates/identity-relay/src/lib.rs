//! # Outbox Relay
//!
//! Long-running worker that bridges the transactional outbox in PostgreSQL
//! to the RabbitMQ broker with at-least-once delivery:
//!
//! - `LISTEN outbox_channel` gives low-latency hints for freshly committed
//!   rows; each hint is processed as a single locked row.
//! - A periodic sweep drains any unprocessed rows and is the correctness
//!   backbone: notifications only buy latency, never correctness.
//! - Rows are claimed with `FOR UPDATE SKIP LOCKED`, so any number of relay
//!   replicas can run against the same database without coordination.

pub mod config;
pub mod health;
pub mod relay;

pub use config::{ConfigError, RelayConfig};
pub use health::health_router;
pub use relay::{OutboxRelay, RelayError, RelayHealth};
