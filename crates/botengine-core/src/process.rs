//! OS process helpers: liveness and ownership checks, process-tree termination.
//!
//! Workers are launched as process-group leaders, so killing the group also
//! takes down any helper processes a worker spawned (browser, bridge, ...).

use crate::{errors::Error, Result};

/// Whether a process with `pid` currently exists.
///
/// Only meaningful for processes we do not own a `Child` handle for; for our
/// own children prefer `Child::try_wait`, which also sees zombies as exited.
/// Existence says nothing about whose process it is: pair with
/// [`launched_with`] before acting on a pid read from disk.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Whether `pid` was started with every `NAME=value` pair in `expected`.
///
/// Reads the launch environment from procfs. A process whose environment
/// cannot be read (another user's) never matches.
#[cfg(target_os = "linux")]
pub fn launched_with(pid: u32, expected: &[(&str, &str)]) -> bool {
    let Ok(raw) = std::fs::read(format!("/proc/{pid}/environ")) else {
        return false;
    };
    let vars: Vec<&[u8]> = raw.split(|b| *b == 0).collect();
    expected.iter().all(|(name, value)| {
        let pair = format!("{name}={value}");
        vars.contains(&pair.as_bytes())
    })
}

/// Without procfs there is no way to inspect another process's launch
/// environment, so nothing matches.
#[cfg(not(target_os = "linux"))]
pub fn launched_with(_pid: u32, _expected: &[(&str, &str)]) -> bool {
    false
}

/// Kill `pid` and its process group with SIGKILL.
///
/// Returns `Ok(false)` when nothing was running (already gone is not an error).
#[cfg(unix)]
pub fn kill_tree(pid: u32) -> Result<bool> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, killpg, Signal},
        unistd::Pid,
    };

    let raw = i32::try_from(pid).map_err(|_| Error::Process {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    if raw <= 0 {
        return Err(Error::Process {
            pid,
            reason: "refusing to signal a non-positive pid".to_string(),
        });
    }
    let target = Pid::from_raw(raw);

    let group = killpg(target, Signal::SIGKILL);
    // The leader may not own a group (e.g. spawned by an older panel build);
    // fall back to the single process.
    let single = kill(target, Signal::SIGKILL);

    match (group, single) {
        (Ok(()), _) | (_, Ok(())) => Ok(true),
        (Err(Errno::ESRCH), Err(Errno::ESRCH)) => Ok(false),
        (_, Err(e)) => Err(Error::Process {
            pid,
            reason: format!("kill failed: {e}"),
        }),
    }
}

#[cfg(not(unix))]
pub fn kill_tree(pid: u32) -> Result<bool> {
    if !is_alive(pid) {
        return Ok(false);
    }
    let status = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .status()?;
    if status.success() {
        Ok(true)
    } else {
        Err(Error::Process {
            pid,
            reason: format!("taskkill exited with {status}"),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn kill_tree_kills_leader_and_tolerates_gone() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_alive(pid));

        assert!(kill_tree(pid).unwrap());
        child.wait().unwrap();
        assert!(!is_alive(pid));

        assert!(!kill_tree(pid).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn launched_with_matches_the_exact_environment() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .env("SESSION_ID", "alice")
            .env("BOTENGINE_PLATFORM", "telegram")
            .spawn()
            .unwrap();
        let pid = child.id();

        assert!(launched_with(pid, &[("SESSION_ID", "alice")]));
        assert!(launched_with(
            pid,
            &[("SESSION_ID", "alice"), ("BOTENGINE_PLATFORM", "telegram")]
        ));
        assert!(!launched_with(pid, &[("SESSION_ID", "alic")]));
        assert!(!launched_with(pid, &[("SESSION_ID", "alice"), ("BOTENGINE_PLATFORM", "whatsapp")]));
        assert!(!launched_with(i32::MAX as u32, &[("SESSION_ID", "alice")]));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn rejects_non_positive_pid() {
        assert!(kill_tree(0).is_err());
        assert!(!is_alive(0));
    }
}
