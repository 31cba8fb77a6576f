//! HTTP surface (C6): `/metrics`, `/health`, `/ready` on a loopback-only
//! bind. Mirrors the reference codebase's gateway crate's `Router` +
//! `AppState` + `IntoResponse` error pattern, with `governor` rate-limiting
//! layered onto the two probe routes (spec §4.6).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use governor::{Quota, RateLimiter};
use governor::state::{InMemoryState, NotKeyed};
use governor::clock::DefaultClock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::storage::Storage;

/// Requests per second allowed on the rate-limited probe routes.
const PROBE_RATE_PER_SEC: u32 = 10;
const PROBE_BURST: u32 = 20;
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

type ProbeLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    storage: Arc<Storage>,
    limiter: Arc<ProbeLimiter>,
}

/// Build the router. Binds only to loopback regardless of the caller's
/// requested port, since this surface carries no authentication.
pub fn build_router(metrics: Arc<Metrics>, storage: Arc<Storage>) -> Router {
    let quota = Quota::per_second(NonZeroU32::new(PROBE_RATE_PER_SEC).unwrap())
        .allow_burst(NonZeroU32::new(PROBE_BURST).unwrap());
    let state = AppState {
        metrics,
        storage,
        limiter: Arc::new(RateLimiter::direct(quota)),
    };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn loopback_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

enum ApiError {
    RateLimited,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
            }
        }
    }
}

/// No authentication and no rate limit: scrapers poll this frequently and
/// its cost is proportional to metric count, not request volume.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Liveness: the process is up. Rate-limited to deter probe storms.
async fn health_handler(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    if state.limiter.check().is_err() {
        return Err(ApiError::RateLimited);
    }
    Ok("OK")
}

/// Readiness: InfluxDB must answer within the bounded probe deadline.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.limiter.check().is_err() {
        return ApiError::RateLimited.into_response();
    }

    match tokio::time::timeout(READY_PROBE_TIMEOUT, state.storage.health()).await {
        Ok(Ok(())) => (StatusCode::OK, "READY").into_response(),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("NOT READY: InfluxDB unhealthy: {e}"),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT READY: InfluxDB unhealthy: health probe timed out",
        )
            .into_response(),
    }
}
