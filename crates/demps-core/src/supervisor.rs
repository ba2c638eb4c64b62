//! Supervision of the external simulator process.
//!
//! A [`ProcessSupervisor`] owns one launch of the simulator: it checks the
//! working directory, spawns the executable as the leader of a new
//! process group, tracks the [`ProcessState`] lifecycle, and shuts the
//! whole process tree down gracefully, escalating to `SIGKILL` when the
//! tree ignores `SIGTERM` for longer than the kill timeout.
//!
//! While running, the supervisor is registered in the [`ResourcePool`]
//! under its role key, so a new run (or the stop endpoint) can always
//! find and terminate the previous simulator before starting another one
//! that would write into the same output directories.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Spawning -> Running -> Exited
//!    \________\__________\----> Failed   (spawn error, forced kill)
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use demps_types::ProcessState;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pool::{Closeable, ResourcePool};
use crate::signal::{Delivery, TreeSignal, signal_tree};

/// Default wait between `SIGTERM` and `SIGKILL`.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the exit to be observed after `SIGKILL`.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Reason recorded in [`ProcessState::Failed`] after a forced kill.
const KILLED_REASON: &str = "killed";

/// Errors from launching or awaiting the simulator.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The configured working directory is missing; nothing was spawned.
    #[error("working directory {} does not exist", .path.display())]
    WorkingDirMissing {
        /// The missing directory.
        path: PathBuf,
    },

    /// The executable could not be spawned (not found, not executable).
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        /// The resolved executable path.
        program: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// `start` was called on a supervisor that already left `Idle`.
    #[error("process already started (state: {state:?})")]
    AlreadyStarted {
        /// The state at the time of the call.
        state: ProcessState,
    },

    /// `wait` was called before a successful `start`.
    #[error("process was never started")]
    NotStarted,

    /// The process terminated with a non-zero status or a signal.
    #[error("process exited with code {code:?} and signal {signal:?}")]
    Exited {
        /// Exit code, if any.
        code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<i32>,
    },

    /// The process ignored `SIGTERM` and was force-killed.
    #[error("process was force-killed after ignoring termination")]
    Killed,

    /// Waiting on the child failed.
    #[error("failed to wait for process: {source}")]
    Wait {
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// What to launch and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    /// Executable. A relative path with more than one component is
    /// resolved against `working_dir`; a bare name is looked up on `PATH`.
    pub program: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Working directory; must exist at launch.
    pub working_dir: PathBuf,
}

impl ProgramSpec {
    /// The executable path the supervisor will actually spawn.
    pub fn resolved_program(&self) -> PathBuf {
        let relative_with_dir =
            self.program.is_relative() && self.program.components().count() > 1;
        if relative_with_dir {
            self.working_dir.join(&self.program)
        } else {
            self.program.clone()
        }
    }
}

/// Supervises one launch of the simulator.
pub struct ProcessSupervisor {
    role: String,
    spec: ProgramSpec,
    kill_timeout: Duration,
    state: watch::Sender<ProcessState>,
    child: tokio::sync::Mutex<Option<Child>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    kill_requested: AtomicBool,
    forced: AtomicBool,
    me: Weak<Self>,
}

impl ProcessSupervisor {
    /// Create an idle supervisor for `spec` under pool key `role`.
    pub fn new(role: impl Into<String>, spec: ProgramSpec, kill_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ProcessState::Idle);
        Arc::new_cyclic(|me| Self {
            role: role.into(),
            spec,
            kill_timeout,
            state,
            child: tokio::sync::Mutex::new(None),
            started_at: Mutex::new(None),
            kill_requested: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            me: Weak::clone(me),
        })
    }

    /// Terminate the supervisor previously registered under `role`, if
    /// any, and wait for it to exit.
    ///
    /// Call this before starting a new run so two simulators never write
    /// into the same output directories.
    pub async fn supersede(pool: &ResourcePool, role: &str) {
        let Some(previous) = pool.pop::<Self>(role) else {
            return;
        };
        if previous.is_running() {
            info!(role, pid = ?previous.pid(), "Terminating previous simulator before new run");
            previous.kill().await;
        } else {
            debug!(role, state = ?previous.state(), "Previous simulator already terminated");
        }
    }

    /// Pool key this supervisor registers under.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// What this supervisor launches.
    pub const fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Whether the process is spawning or running.
    pub fn is_running(&self) -> bool {
        self.state.borrow().is_active()
    }

    /// OS pid (and process group id) while running.
    pub fn pid(&self) -> Option<u32> {
        match *self.state.borrow() {
            ProcessState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    /// When the spawn was confirmed.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ProcessState) {
        debug!(role = %self.role, ?state, "Process state transition");
        self.state.send_replace(state);
    }

    fn fail(&self, reason: impl Into<String>) {
        self.set_state(ProcessState::Failed {
            reason: reason.into(),
        });
    }

    /// Launch the process: run [`start`](Self::start) then
    /// [`wait`](Self::wait).
    ///
    /// Resolves `Ok(())` when the process exits with status zero.
    pub async fn run(self: &Arc<Self>, pool: &ResourcePool) -> Result<(), SupervisorError> {
        self.start(pool).await?;
        self.wait(pool).await
    }

    /// Spawn the process and register it in `pool`, returning its pid.
    ///
    /// The working directory is checked before anything is spawned; on
    /// any failure the state becomes `Failed` and nothing is registered.
    pub async fn start(self: &Arc<Self>, pool: &ResourcePool) -> Result<u32, SupervisorError> {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if matches!(state, ProcessState::Idle) {
                *state = ProcessState::Spawning;
                claimed = true;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(SupervisorError::AlreadyStarted {
                state: self.state(),
            });
        }

        let working_dir = self.spec.working_dir.clone();
        if !is_dir(&working_dir).await {
            warn!(role = %self.role, path = %working_dir.display(), "Working directory missing, not spawning");
            self.fail(format!("working directory {} does not exist", working_dir.display()));
            return Err(SupervisorError::WorkingDirMissing { path: working_dir });
        }

        let program = self.spec.resolved_program();
        let mut command = Command::new(&program);
        command
            .args(&self.spec.args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(role = %self.role, program = %program.display(), error = %source, "Failed to spawn simulator");
                self.fail(format!("spawn failed: {source}"));
                return Err(SupervisorError::Spawn { program, source });
            }
        };

        let Some(pid) = child.id() else {
            self.fail("process exited before its pid was observed");
            return Err(SupervisorError::NotStarted);
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.role.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.role.clone(), "stderr", stderr);
        }

        *self.child.lock().await = Some(child);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.set_state(ProcessState::Running { pid });
        pool.add(&self.role, Arc::clone(self));

        info!(
            role = %self.role,
            pid,
            program = %program.display(),
            args = ?self.spec.args,
            cwd = %working_dir.display(),
            "Simulator spawned"
        );
        Ok(pid)
    }

    /// Wait for the process to exit and deregister it from `pool`.
    pub async fn wait(self: &Arc<Self>, pool: &ResourcePool) -> Result<(), SupervisorError> {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Err(SupervisorError::NotStarted);
        };

        let result = match child.wait().await {
            Ok(status) => {
                let code = status.code();
                let signal = exit_signal(&status);
                if self.forced.load(Ordering::SeqCst) {
                    warn!(role = %self.role, ?code, ?signal, "Simulator force-killed");
                    self.fail(KILLED_REASON);
                    Err(SupervisorError::Killed)
                } else {
                    info!(role = %self.role, ?code, ?signal, "Simulator exited");
                    self.set_state(ProcessState::Exited { code, signal });
                    if status.success() {
                        Ok(())
                    } else {
                        Err(SupervisorError::Exited { code, signal })
                    }
                }
            }
            Err(source) => {
                error!(role = %self.role, error = %source, "Failed to wait for simulator");
                self.fail(format!("wait failed: {source}"));
                Err(SupervisorError::Wait { source })
            }
        };

        pool.remove_if_same(&self.role, self);
        result
    }

    /// Terminate the process tree.
    ///
    /// Sends `SIGTERM` to the process group, waits up to the kill timeout
    /// for the exit, then sends `SIGKILL`. Calling this on a supervisor
    /// that is not running is a logged no-op; concurrent callers all wait
    /// for the same termination. Exit is observed by whoever is awaiting
    /// [`wait`](Self::wait).
    pub async fn kill(&self) {
        let mut rx = self.state.subscribe();

        let spawning = matches!(*rx.borrow(), ProcessState::Spawning);
        if spawning {
            let _ = rx.wait_for(|state| !matches!(state, ProcessState::Spawning)).await;
        }

        let pid = match &*rx.borrow() {
            ProcessState::Running { pid } => *pid,
            other => {
                debug!(role = %self.role, state = ?other, "Process already terminated, nothing to kill");
                return;
            }
        };

        if self.kill_requested.swap(true, Ordering::SeqCst) {
            debug!(role = %self.role, pid, "Kill already in progress, waiting");
            let budget = self.kill_timeout.saturating_add(KILL_GRACE);
            let _ = await_terminal(&mut rx, budget).await;
            return;
        }

        info!(role = %self.role, pid, timeout_ms = self.kill_timeout.as_millis(), "Sending SIGTERM to simulator process group");
        deliver(&self.role, pid, TreeSignal::Terminate);

        if await_terminal(&mut rx, self.kill_timeout).await {
            return;
        }

        warn!(role = %self.role, pid, "Simulator ignored SIGTERM, sending SIGKILL");
        self.forced.store(true, Ordering::SeqCst);
        deliver(&self.role, pid, TreeSignal::Kill);

        if !await_terminal(&mut rx, KILL_GRACE).await {
            error!(role = %self.role, pid, "Simulator exit not observed after SIGKILL");
        }
    }
}

impl Closeable for ProcessSupervisor {
    /// Start [`kill`](ProcessSupervisor::kill) in the background.
    ///
    /// Outside a tokio runtime the process group is sent `SIGKILL`
    /// directly.
    fn close(&self) {
        if !self.is_running() {
            return;
        }
        match (tokio::runtime::Handle::try_current(), self.me.upgrade()) {
            (Ok(handle), Some(this)) => {
                handle.spawn(async move { this.kill().await });
            }
            _ => {
                if let Some(pid) = self.pid() {
                    self.forced.store(true, Ordering::SeqCst);
                    deliver(&self.role, pid, TreeSignal::Kill);
                }
            }
        }
    }
}

impl core::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("role", &self.role)
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Wait until `rx` reports a terminal state or `budget` elapses.
async fn await_terminal(rx: &mut watch::Receiver<ProcessState>, budget: Duration) -> bool {
    matches!(
        tokio::time::timeout(budget, rx.wait_for(ProcessState::is_terminal)).await,
        Ok(_)
    )
}

fn deliver(role: &str, pid: u32, signal: TreeSignal) {
    match signal_tree(pid, signal) {
        Ok(Delivery::Delivered) => {}
        Ok(Delivery::Gone) => debug!(role, pid, ?signal, "Process group already gone"),
        Err(e) => warn!(role, pid, ?signal, error = %e, "Failed to signal process group"),
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Log every line the simulator writes to `stream`.
fn forward_output<R>(role: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "demps::simulator", role = %role, stream, "{line}");
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(target: "demps::simulator", role = %role, stream, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    });
}
