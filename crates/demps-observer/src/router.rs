//! Axum router construction.
//!
//! Assembles every route into a single [`Router`] with open CORS for the
//! browser map UI and request tracing.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{control, directory, sse};

/// Build the complete router.
///
/// - `GET /` -- plain-text banner
/// - `GET /api/simulation` -- start a run, SSE stream
/// - `DELETE /api/simulation` -- stop the running simulator
/// - `GET /api/simulation/status` -- pool keys and process state
/// - `POST /api/directory/get` -- list a directory
/// - `DELETE /api/directory/delete` -- delete a file or directory
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(control::index))
        .route(
            "/api/simulation",
            get(sse::simulation_stream).delete(control::stop),
        )
        .route("/api/simulation/status", get(control::status))
        .route("/api/directory/get", post(directory::list))
        .route("/api/directory/delete", delete(directory::delete))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
