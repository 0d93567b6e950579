//! Process, thread, and process-group identifiers, collapsed to one
//! newtype: `Pid`, `Pgid`, and `Tid` are structurally identical
//! wrappers around a raw id.

use std::fmt;
use std::fs;

use nix::unistd::Pid as NixPid;

use crate::error::RuntimeError;

/// A generic process/thread/group identifier. `Pid`, `Pgid`, and `Tid`
/// below are all this type under a different name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawId(pub i32);

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Pid = RawId;
pub type Pgid = RawId;
pub type Tid = RawId;

impl RawId {
    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn to_nix_pid(self) -> NixPid {
        NixPid::from_raw(self.0)
    }
}

impl From<NixPid> for RawId {
    fn from(pid: NixPid) -> Self {
        RawId(pid.as_raw())
    }
}

/// Returns the calling thread's kernel id (`gettid()` on Linux), used to
/// tag error frame sequences.
pub fn current_tid() -> Tid {
    RawId(unsafe { libc::syscall(libc::SYS_gettid) as i32 })
}

/// A `(pid, start-time)` pair that uniquely identifies one incarnation of
/// a process, used to guard against pid reuse across `fork()`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PidSignature {
    pid: Pid,
    signature: String,
}

impl PidSignature {
    pub fn new(pid: Pid, signature: impl Into<String>) -> Self {
        Self {
            pid,
            signature: signature.into(),
        }
    }

    /// Reads the process start-time field out of `/proc/<pid>/stat` and
    /// uses it as the signature. Differs across incarnations of a reused
    /// pid, which is precisely the property the fork layer's post-fork
    /// rate-limiting sleep relies on.
    pub fn of_process(pid: Pid) -> Result<Self, RuntimeError> {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid.0))
            .map_err(|source| RuntimeError::Proc { pid: pid.0, source })?;

        // Field 22 (starttime) follows the `(comm)` parenthesized field,
        // which may itself contain spaces or parens, so we split on the
        // last ')' rather than by whitespace index.
        let after_comm = stat
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .ok_or(RuntimeError::MalformedProcStat { pid: pid.0 })?;

        let starttime = after_comm
            .split_whitespace()
            .nth(19)
            .ok_or(RuntimeError::MalformedProcStat { pid: pid.0 })?;

        Ok(Self::new(pid, starttime.to_string()))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// True if `self` still refers to the same incarnation of the
    /// process it names (the pid hasn't been recycled underneath it).
    pub fn matches_current(&self) -> bool {
        matches!(Self::of_process(self.pid), Ok(current) if current == *self)
    }
}

impl fmt::Display for PidSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pid, self.signature)
    }
}
