//! # Identity Access Core
//!
//! Domain types, ports and shared reliability primitives for the
//! identity-access service and its outbox relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Writer (identity-storage)                │
//! │  (business row + outbox row in one transaction, NOTIFY)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Outbox Relay (identity-relay)               │
//! │  (LISTEN outbox_channel, per-event processing, sweeps)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             BabyEventPublisher (identity-messaging)          │
//! │  (durable AMQP queue, persistent delivery, breaker-guarded) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every call that crosses a process boundary goes through a
//! [`reliability::CircuitBreaker`] so a misbehaving dependency degrades
//! the service instead of cascading through it.

pub mod domain;
pub mod events;
pub mod ports;
pub mod reliability;

pub use domain::{Parent, ParentStatus, Role, User};
pub use events::{BabyCreatedEvent, BabyEventPublisher, InMemoryBabyEventPublisher, PublishError};
pub use ports::{StoreError, UserRepository};
pub use reliability::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
