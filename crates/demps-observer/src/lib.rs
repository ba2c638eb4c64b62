//! HTTP surface for live DEMPS runs.
//!
//! This crate provides an Axum server that exposes:
//!
//! - **SSE endpoint** (`GET /api/simulation`) that starts a run and
//!   streams its lifecycle and dataset events
//! - **Control endpoints** to stop the simulator and inspect the
//!   resource pool
//! - **Directory endpoints** used by the setup UI, confined to the
//!   configured files root
//!
//! # Architecture
//!
//! Each SSE connection owns one run task (see [`run`]). The only state
//! shared across connections is the [`ResourcePool`] in [`AppState`],
//! which guarantees at most one simulator and one watcher per role.
//!
//! [`ResourcePool`]: demps_core::pool::ResourcePool

pub mod control;
pub mod directory;
pub mod error;
pub mod router;
pub mod run;
pub mod server;
pub mod sse;
pub mod state;

// Re-export primary types for convenience.
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use state::AppState;
