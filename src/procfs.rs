//! Small `/proc` readers used by long-running daemons: the state
//! character in `/proc/<pid>/stat`, and a boot-id cache for detecting a
//! reboot across restarts.

use std::sync::OnceLock;

use crate::error::RuntimeError;
use crate::pid::Pid;

/// The state character reported in field 3 of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    Waiting,
    Zombie,
    Stopped,
    Traced,
    Dead,
}

impl ProcessState {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'R' => Some(ProcessState::Running),
            'S' => Some(ProcessState::Sleeping),
            'D' => Some(ProcessState::Waiting),
            'Z' => Some(ProcessState::Zombie),
            'T' => Some(ProcessState::Stopped),
            't' => Some(ProcessState::Traced),
            'X' | 'x' => Some(ProcessState::Dead),
            _ => None,
        }
    }
}

/// Reads and parses the state character out of `/proc/<pid>/stat`.
/// Uses the same "split on the last `)`" trick as
/// [`crate::pid::PidSignature::of_process`] to skip over a `comm` field
/// that may itself contain parentheses.
pub fn fetch_process_state(pid: Pid) -> Result<ProcessState, RuntimeError> {
    let path = format!("/proc/{}/stat", pid.as_raw());
    let contents = std::fs::read_to_string(&path).map_err(|source| RuntimeError::Proc {
        pid: pid.as_raw(),
        source,
    })?;

    let after_comm = contents
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or(RuntimeError::MalformedProcStat { pid: pid.as_raw() })?;

    let state_char = after_comm
        .split_whitespace()
        .next()
        .and_then(|s| s.chars().next())
        .ok_or(RuntimeError::MalformedProcStat { pid: pid.as_raw() })?;

    ProcessState::from_char(state_char).ok_or(RuntimeError::MalformedProcStat { pid: pid.as_raw() })
}

static BOOT_ID: OnceLock<String> = OnceLock::new();

/// The kernel's boot id (`/proc/sys/kernel/random/boot_id`), read once
/// and cached: it cannot change without a reboot, and a daemon that
/// persists state across restarts uses it to detect one.
pub fn boot_incarnation() -> &'static str {
    BOOT_ID.get_or_init(|| {
        std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .map(|s| s.trim().to_owned())
            .unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_state_parses() {
        let state = fetch_process_state(crate::pid::RawId(std::process::id() as i32)).unwrap();
        assert!(matches!(
            state,
            ProcessState::Running | ProcessState::Sleeping | ProcessState::Waiting
        ));
    }

    #[test]
    fn boot_incarnation_is_stable_across_calls() {
        let a = boot_incarnation();
        let b = boot_incarnation();
        assert_eq!(a, b);
    }
}
