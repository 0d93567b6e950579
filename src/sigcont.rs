//! Process-wide SIGCONT tracker: lets a long-running wait distinguish
//! "the deadline genuinely expired" from "the process was stopped
//! (`SIGSTOP`/job control) and later resumed, so the clock jumped past
//! the deadline while nothing was actually running".
//!
//! A signal handler bumps a shared counter by two on every `SIGCONT`; a
//! [`ProcessSigContTracker`] snapshots the counter and later asks
//! whether it has moved. The low bit is pinned to `1` at every read so a
//! zero-initialized, never-constructed tracker can never be mistaken for
//! a valid snapshot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGCONT_COUNT: AtomicU32 = AtomicU32::new(0);
static HOOK_ONCE: Once = Once::new();

extern "C" fn on_sigcont(_signum: libc::c_int) {
    SIGCONT_COUNT.fetch_add(2, Ordering::SeqCst);
}

fn fetch() -> u32 {
    1 | SIGCONT_COUNT.load(Ordering::SeqCst)
}

/// Installs the `SIGCONT` handler exactly once per process. Creating the
/// first [`ProcessSigContTracker`] triggers this implicitly, so callers
/// never need to sequence it relative to the rest of signal setup.
fn ensure_hooked() {
    HOOK_ONCE.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_sigcont),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signal::SIGCONT, &action).expect("failed to install SIGCONT handler");
        }
    });
}

/// A snapshot of the process's `SIGCONT` counter, taken at construction
/// and advanced every time [`check`](Self::check) observes it has moved.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSigContTracker {
    count: u32,
}

impl ProcessSigContTracker {
    pub fn new() -> Self {
        ensure_hooked();
        Self { count: fetch() }
    }

    /// Returns `true` if a `SIGCONT` has been observed since this
    /// tracker was created or last checked, and advances the snapshot.
    pub fn check(&mut self) -> bool {
        let current = fetch();
        let moved = current != self.count;
        self.count = current;
        moved
    }
}

impl Default for ProcessSigContTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_reports_no_sigcont() {
        let mut tracker = ProcessSigContTracker::new();
        assert!(!tracker.check());
    }

    #[test]
    fn observes_a_raised_sigcont() {
        let mut tracker = ProcessSigContTracker::new();
        on_sigcont(libc::SIGCONT);
        assert!(tracker.check());
        assert!(!tracker.check());
    }
}
