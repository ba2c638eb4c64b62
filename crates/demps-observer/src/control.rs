//! Control endpoints for the running simulator.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Plain-text service banner |
//! | `DELETE` | `/api/simulation` | Terminate the registered simulator |
//! | `GET` | `/api/simulation/status` | Pool keys and simulator state |

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use demps_core::pool::PROCESS_KEY;
use demps_core::supervisor::ProcessSupervisor;
use demps_types::{SimulationStatus, StopResponse};
use tracing::info;

use crate::state::AppState;

/// Service banner.
///
/// # Route
///
/// `GET /`
pub async fn index() -> &'static str {
    concat!("DEMPS live server ", env!("CARGO_PKG_VERSION"))
}

/// Terminate the registered simulator, if it is running.
///
/// The supervisor is removed from the pool first, so a concurrent run
/// start cannot pick it up again. Resolves once the process is gone.
///
/// # Route
///
/// `DELETE /api/simulation`
pub async fn stop(State(state): State<Arc<AppState>>) -> Json<StopResponse> {
    let Some(supervisor) = state.pool.pop::<ProcessSupervisor>(PROCESS_KEY) else {
        return Json(StopResponse { stopped: false });
    };
    if !supervisor.is_running() {
        return Json(StopResponse { stopped: false });
    }

    info!(pid = ?supervisor.pid(), "Stop requested, terminating simulator");
    supervisor.kill().await;
    Json(StopResponse { stopped: true })
}

/// Pool contents and simulator state.
///
/// # Route
///
/// `GET /api/simulation/status`
pub async fn status(State(state): State<Arc<AppState>>) -> Json<SimulationStatus> {
    let supervisor = state.pool.get::<ProcessSupervisor>(PROCESS_KEY);
    Json(SimulationStatus {
        resources: state.pool.keys(),
        process: supervisor.as_ref().map(|s| s.state()),
        started_at: supervisor.as_ref().and_then(|s| s.started_at()),
    })
}
