//! Enumeration types shared between the server and the browser UI.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle status of a streaming run, carried by the `status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum RunStatus {
    /// Directives loaded, pipeline being wired.
    Init,
    /// The simulator process has been spawned.
    Ready,
    /// The simulator exited with a zero status.
    Finished,
    /// Directives could not be loaded, spawning failed, or the
    /// simulator exited abnormally.
    Error,
}

impl RunStatus {
    /// Wire representation used as the SSE `data` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Process state
// ---------------------------------------------------------------------------

/// Lifecycle of the supervised simulator process.
///
/// `Idle -> Spawning -> Running -> Exited`, with `Failed` reachable from
/// any state on a spawn error or a forced kill. `Exited` and `Failed` are
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "state", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ProcessState {
    /// Constructed, no launch requested yet.
    Idle,
    /// Launch requested, spawn not yet confirmed.
    Spawning,
    /// The OS confirmed the spawn.
    Running {
        /// OS process id (also the process group id).
        pid: u32,
    },
    /// The process terminated on its own or after a graceful signal.
    Exited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if the process was killed by one.
        signal: Option<i32>,
    },
    /// Spawning failed or the process had to be force-killed.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

impl ProcessState {
    /// Whether the state is `Exited` or `Failed`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Failed { .. })
    }

    /// Whether the process is spawning or running.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Spawning | Self::Running { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_serializes_lowercase() {
        let json = serde_json::to_string(&RunStatus::Finished).ok();
        assert_eq!(json.as_deref(), Some("\"finished\""));
        assert_eq!(RunStatus::Ready.to_string(), "ready");
    }

    #[test]
    fn process_state_tagging() {
        let state = ProcessState::Running { pid: 42 };
        let json = serde_json::to_value(&state).ok();
        assert_eq!(
            json,
            Some(serde_json::json!({ "state": "running", "pid": 42 }))
        );
    }

    #[test]
    fn process_state_predicates() {
        assert!(ProcessState::Spawning.is_active());
        assert!(!ProcessState::Idle.is_terminal());
        let exited = ProcessState::Exited {
            code: Some(0),
            signal: None,
        };
        assert!(exited.is_terminal());
        assert!(!exited.is_active());
        let failed = ProcessState::Failed {
            reason: String::from("killed"),
        };
        assert!(failed.is_terminal());
    }
}
