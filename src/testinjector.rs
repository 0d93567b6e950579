//! Fault injection for exercising error paths under test: a counter
//! advances on every checked call site, and when it reaches a configured
//! trigger value, a chosen `errno` is injected instead of letting the
//! call proceed. Configuration is read from the environment so a test
//! can turn it on for the duration of a single process without needing
//! a parallel config type.

use std::sync::atomic::{AtomicU64, Ordering};

pub const TRIGGER_VAR: &str = "DAEMONRT_TEST_ERROR_TRIGGER";

static ERROR_LEVEL: AtomicU64 = AtomicU64::new(0);

/// The errno values the fault injector chooses between.
const INJECTABLE_ERRNOS: [i32; 2] = [libc::EINTR, libc::EIO];

/// Advances the global call counter and, if it just reached the
/// configured trigger (`DAEMONRT_TEST_ERROR_TRIGGER`, 1-based), returns
/// an `errno` to inject. Intended to be consulted from inside
/// [`crate::error_if!`]'s predicate when a harness wants to force a
/// specific call site to fail without actually breaking its
/// precondition.
pub fn should_inject() -> Option<i32> {
    let trigger: u64 = std::env::var(TRIGGER_VAR).ok()?.parse().ok()?;
    if trigger == 0 {
        return None;
    }

    let level = ERROR_LEVEL.fetch_add(1, Ordering::SeqCst) + 1;
    if level != trigger {
        return None;
    }

    let choice = (level as usize) % INJECTABLE_ERRNOS.len();
    Some(INJECTABLE_ERRNOS[choice])
}

pub fn reset() {
    ERROR_LEVEL.store(0, Ordering::SeqCst);
}

pub fn error_level() -> u64 {
    ERROR_LEVEL.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn no_trigger_configured_never_injects() {
        let _guard = ENV_GUARD.lock().unwrap();
        std::env::remove_var(TRIGGER_VAR);
        reset();
        assert_eq!(should_inject(), None);
        assert_eq!(should_inject(), None);
    }

    #[test]
    fn injects_exactly_once_at_the_configured_level() {
        let _guard = ENV_GUARD.lock().unwrap();
        std::env::set_var(TRIGGER_VAR, "2");
        reset();

        assert_eq!(should_inject(), None);
        assert!(should_inject().is_some());
        assert_eq!(should_inject(), None);

        std::env::remove_var(TRIGGER_VAR);
    }
}
