//! Server-Sent Events transport for runs.
//!
//! `GET /api/simulation` starts a run and streams its events: `status`
//! with data `init | ready | finished | error`, and one dataset event
//! (`agents`, `flood`) per processed output file. Closing the connection
//! drops the receiver, which disconnects and tears down the run.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use demps_types::StreamEvent;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::run::start_run;
use crate::state::AppState;

/// Start a run and stream its events.
///
/// # Route
///
/// `GET /api/simulation`
pub async fn simulation_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (run_id, rx) = start_run(Arc::clone(&state.pool), Arc::clone(&state.config));
    info!(%run_id, "Simulation stream opened");

    let stream = ReceiverStream::new(rx).map(|event| Ok(to_sse(&event)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.stream.keep_alive())
            .text("keep-alive"),
    )
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default().event(event.name()).data(event.data())
}
