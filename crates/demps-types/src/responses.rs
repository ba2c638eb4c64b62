//! JSON bodies returned by the control and directory endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::ProcessState;

/// Body of `GET /api/simulation/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SimulationStatus {
    /// Role keys currently registered in the resource pool.
    pub resources: Vec<String>,
    /// State of the registered simulator, if any.
    pub process: Option<ProcessState>,
    /// When the registered simulator was spawned.
    pub started_at: Option<DateTime<Utc>>,
}

/// Body of `DELETE /api/simulation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StopResponse {
    /// Whether a running simulator was found and terminated.
    pub stopped: bool,
}

/// Entries of one directory, names only, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DirectoryContents {
    /// Regular files passing the extension filter.
    pub files: Vec<String>,
    /// Subdirectories.
    pub folders: Vec<String>,
}

/// Body of `POST /api/directory/get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DirectoryListing {
    /// The listed directory.
    pub contents: DirectoryContents,
}

/// Body of `DELETE /api/directory/delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Deleted {
    /// The path as given in the request.
    pub deleted: String,
}
