//! HTTP API server for dockvm.
//!
//! Exposes the supervisor's operations so other tools can drive the VM
//! without going through the CLI.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! dockvm serve --listen 127.0.0.1:8090
//!
//! # Boot the VM
//! curl -X POST http://localhost:8090/api/v1/vm/initialize
//! curl -X POST http://localhost:8090/api/v1/vm/start \
//!   -H "Content-Type: application/json" \
//!   -d '{"ram_mb": 4096, "cpus": 4}'
//!
//! # Watch it
//! curl -N http://localhost:8090/api/v1/vm/events
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use state::ApiState;

/// Upper bound on one lifecycle request (restart includes a full stop).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    // Health check route
    let health_route = Router::new().route("/health", get(handlers::health));

    // SSE route (no timeout - streams indefinitely)
    let events_route = Router::new().route("/events", get(handlers::events::stream_events));

    let vm_routes_with_timeout = Router::new()
        .route("/", get(handlers::vm::status))
        .route("/initialize", post(handlers::vm::initialize))
        .route("/start", post(handlers::vm::start))
        .route("/stop", post(handlers::vm::stop))
        .route("/restart", post(handlers::vm::restart))
        .route("/logs", get(handlers::vm::logs))
        .route("/exec", post(handlers::exec::exec_command))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let vm_routes = Router::new()
        .merge(events_route)
        .merge(vm_routes_with_timeout);

    let api_v1 = Router::new().nest("/vm", vm_routes);

    // Localhost origins only.
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:8090"),
            HeaderValue::from_static("http://127.0.0.1:8090"),
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
