//! Reliability primitives shared across the service
//!
//! This module provides:
//! - [`CircuitBreaker`] - Failure isolation for calls to remote dependencies
//! - [`CircuitBreakerConfig`] - Per-dependency breaker configuration

mod circuit_breaker;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
