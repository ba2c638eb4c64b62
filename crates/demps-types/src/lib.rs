//! Shared wire types for the DEMPS live simulation stream.
//!
//! This crate is the single source of truth for the types that cross the
//! HTTP boundary. Types defined here flow downstream to `TypeScript` via
//! `ts-rs` for the browser map UI.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrapper for run identifiers
//! - [`enums`] -- Run status and process lifecycle state
//! - [`events`] -- Named events delivered to a run subscriber
//! - [`responses`] -- JSON bodies of the control and directory endpoints

pub mod enums;
pub mod events;
pub mod ids;
pub mod responses;

// Re-export all public types at crate root for convenience.
pub use enums::{ProcessState, RunStatus};
pub use events::{STATUS_EVENT, StreamEvent};
pub use ids::RunId;
pub use responses::{Deleted, DirectoryContents, DirectoryListing, SimulationStatus, StopResponse};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // ts-rs generates TypeScript bindings when types with
        // #[ts(export)] are used. The files are written to the
        // `bindings/` directory relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::RunId::export_all();
        let _ = crate::enums::RunStatus::export_all();
        let _ = crate::enums::ProcessState::export_all();
        let _ = crate::events::StreamEvent::export_all();
        let _ = crate::responses::SimulationStatus::export_all();
        let _ = crate::responses::StopResponse::export_all();
        let _ = crate::responses::DirectoryListing::export_all();
        let _ = crate::responses::Deleted::export_all();
    }
}
