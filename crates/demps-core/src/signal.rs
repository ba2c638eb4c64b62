//! Process-group signal delivery.
//!
//! The simulator is spawned as the leader of its own process group, so
//! signalling the group reaches every worker it forks without walking
//! the process tree.

/// Signals the supervisor sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// Ask the tree to shut down (`SIGTERM`).
    Terminate,
    /// Kill the tree immediately (`SIGKILL`).
    Kill,
}

/// Outcome of signalling a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was delivered to at least one process.
    Delivered,
    /// No process in the group exists any more.
    Gone,
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    use super::{Delivery, TreeSignal};

    pub fn signal_tree(pgid: u32, signal: TreeSignal) -> std::io::Result<Delivery> {
        let raw = i32::try_from(pgid).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid pgid {pgid}: {e}"))
        })?;
        if raw <= 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to signal process group {raw}"),
            ));
        }
        let signal = match signal {
            TreeSignal::Terminate => Signal::SIGTERM,
            TreeSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(Errno::ESRCH) => Ok(Delivery::Gone),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{Delivery, TreeSignal};

    pub fn signal_tree(_pgid: u32, _signal: TreeSignal) -> std::io::Result<Delivery> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process group signals require a unix platform",
        ))
    }
}

/// Send `signal` to every process in the group led by `pgid`.
///
/// A group that no longer exists is reported as [`Delivery::Gone`], not
/// as an error. Groups 0 and 1 are rejected.
pub fn signal_tree(pgid: u32, signal: TreeSignal) -> std::io::Result<Delivery> {
    imp::signal_tree(pgid, signal)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn refuses_init_and_own_group() {
        assert!(signal_tree(0, TreeSignal::Terminate).is_err());
        assert!(signal_tree(1, TreeSignal::Kill).is_err());
    }

    #[test]
    fn missing_group_is_gone() {
        // Pid values near i32::MAX are never allocated on Linux/macOS.
        let result = signal_tree(0x7fff_fff0, TreeSignal::Terminate).unwrap();
        assert_eq!(result, Delivery::Gone);
    }

    #[tokio::test]
    async fn terminates_a_spawned_group() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert_eq!(signal_tree(pid, TreeSignal::Kill).unwrap(), Delivery::Delivered);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
