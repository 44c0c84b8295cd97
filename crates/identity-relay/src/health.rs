//! Health check HTTP endpoint for the relay
//!
//! `/health` is the liveness probe: it only reports whether the worker is
//! responsive. `/ready` is the readiness probe and additionally checks the
//! database circuit breaker and processing staleness.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::relay::RelayHealth;

const COMPONENT: &str = "outbox-relay";

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    component: &'static str,
}

impl HealthResponse {
    fn up() -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                status: "UP",
                component: COMPONENT,
            }),
        )
    }

    fn down() -> (StatusCode, Json<Self>) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Self {
                status: "DOWN",
                component: COMPONENT,
            }),
        )
    }
}

async fn health_check(State(health): State<RelayHealth>) -> (StatusCode, Json<HealthResponse>) {
    if health.is_alive() {
        HealthResponse::up()
    } else {
        HealthResponse::down()
    }
}

async fn ready_check(State(health): State<RelayHealth>) -> (StatusCode, Json<HealthResponse>) {
    if health.is_ready() {
        HealthResponse::up()
    } else {
        HealthResponse::down()
    }
}

/// Build the health router
pub fn health_router(health: RelayHealth) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .layer(TraceLayer::new_for_http())
        .with_state(health)
}

/// Serve the health router until shutdown is signalled
pub async fn serve_health(
    addr: &str,
    health: RelayHealth,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting health check server");

    axum::serve(listener, health_router(health))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_core::reliability::{CircuitBreaker, CircuitBreakerConfig};

    fn test_health() -> RelayHealth {
        RelayHealth::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::for_postgres(),
        ))
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_up() {
        let health = test_health();
        let (status, Json(body)) = health_check(State(health)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "UP");
        assert_eq!(body.component, "outbox-relay");
    }

    #[tokio::test]
    async fn test_ready_endpoint_reports_up_when_fresh() {
        let health = test_health();
        let (status, Json(body)) = ready_check(State(health)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "UP");
    }

    #[tokio::test]
    async fn test_response_shape() {
        let (_, Json(body)) = health_check(State(test_health())).await;
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["status"], "UP");
        assert_eq!(value["component"], "outbox-relay");
    }
}
