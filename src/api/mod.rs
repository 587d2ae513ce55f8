//! HTTP API server for snapvisor.
//!
//! This module exposes snapshot and clone operations over HTTP. Clients
//! name their session with the `x-session-id` header; the session ends
//! when its event stream closes.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! snapvisor serve --listen 127.0.0.1:8090
//!
//! # Take a snapshot
//! curl -X POST http://localhost:8090/api/v1/vms/web/snapshots \
//!   -H "Content-Type: application/json" \
//!   -H "x-session-id: alice" \
//!   -d '{"name": "before-upgrade"}'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use state::{ApiState, SESSION_HEADER, SESSION_UID_HEADER};

/// Upper bound on one request, streams excluded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    // Health check route
    let health_route = Router::new().route("/health", get(handlers::health::health));

    // SSE events route (no timeout - streams for the life of the session)
    let events_route = Router::new().route("/events", get(handlers::events::stream_events));

    // VM routes with timeout
    let vm_routes = Router::new()
        .route("/", get(handlers::vms::list_vms))
        .route("/:id/locks", get(handlers::vms::vm_locks))
        .route(
            "/:id/snapshots",
            get(handlers::snapshots::list_snapshots).post(handlers::snapshots::create_snapshot),
        )
        .route(
            "/:id/snapshots/:guid",
            delete(handlers::snapshots::delete_snapshot),
        )
        .route(
            "/:id/snapshots/:guid/revert",
            post(handlers::snapshots::revert_snapshot),
        )
        .route("/:id/clone", post(handlers::clone::clone_vm))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    // API v1 routes
    let api_v1 = Router::new()
        .merge(events_route)
        .nest("/vms", vm_routes);

    // CORS: local origins only.
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:8090"),
            HeaderValue::from_static("http://127.0.0.1:8090"),
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static(SESSION_UID_HEADER),
        ]);

    // Combine all routes
    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
