//! Signal dispatch layer: a single trampoline per signal number looks up
//! a per-signal handler slot in a process-wide vector, guarded by a
//! `RwLock` plus a per-signal `Mutex` so installing a new handler can
//! never race with one already running. The handler itself is a
//! type-erased closure rather than a raw function pointer, so it can
//! capture state.
//!
//! Registered handlers may not request `SA_RESTART`: system calls must
//! observe `EINTR` so event loops get a chance to recompute their
//! deadlines (see [`crate::deadline`]).

use std::cell::Cell;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{self, RuntimeError};

const NSIG: usize = 65;

type Handler = Arc<dyn Fn() + Send + Sync>;

struct Slot {
    handler: Mutex<Option<Handler>>,
}

struct Vector {
    slots: Vec<Slot>,
}

static VECTOR: OnceLock<RwLock<Vector>> = OnceLock::new();
static ABORT_TRIGGER: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
static QUIT_TRIGGER: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

thread_local! {
    static SIGNAL_CONTEXT_DEPTH: Cell<u32> = Cell::new(0);
}

fn vector() -> &'static RwLock<Vector> {
    VECTOR.get_or_init(|| {
        RwLock::new(Vector {
            slots: (0..NSIG).map(|_| Slot { handler: Mutex::new(None) }).collect(),
        })
    })
}

/// Depth of nested signal handlers currently running on this thread.
/// Zero outside of a signal handler.
pub fn own_process_signal_context() -> u32 {
    SIGNAL_CONTEXT_DEPTH.with(|d| d.get())
}

fn dispatch_sig_exit(signum: libc::c_int) {
    if signum == libc::SIGABRT && ABORT_TRIGGER.load(std::sync::atomic::Ordering::SeqCst) {
        abort_process();
    }
    if signum == libc::SIGQUIT && QUIT_TRIGGER.load(std::sync::atomic::Ordering::SeqCst) {
        quit_process();
    }
}

extern "C" fn trampoline(signum: libc::c_int) {
    let vec = vector().read().unwrap_or_else(|p| p.into_inner());

    let prev_stack = error::switch_error_frame_stack(error::StackKind::Signal);

    dispatch_sig_exit(signum);

    if let Some(slot) = vec.slots.get(signum as usize) {
        let handler = slot
            .handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        if let Some(handler) = handler {
            SIGNAL_CONTEXT_DEPTH.with(|d| d.set(d.get() + 1));
            let seq = error::push_error_frame_sequence();

            handler();

            error::pop_error_frame_sequence(seq);
            SIGNAL_CONTEXT_DEPTH.with(|d| d.set(d.get() - 1));
        }
    }

    error::switch_error_frame_stack(prev_stack);
}

/// Installs `handler` for `signum`, replacing whatever was registered
/// before. Passing `None` restores `SIG_DFL`. Rejects `restart = true`.
pub fn watch(signum: Signal, handler: Option<Handler>, restart: bool) -> Result<(), RuntimeError> {
    if restart {
        return Err(RuntimeError::Other(
            "SA_RESTART is not permitted for registered handlers".into(),
        ));
    }

    let vec = vector().read().unwrap_or_else(|p| p.into_inner());
    let slot = &vec.slots[signum as usize];

    {
        let mut guard = slot.handler.lock().unwrap_or_else(|p| p.into_inner());
        *guard = handler.clone();
    }

    let mut mask = SigSet::all();
    mask.remove(Signal::SIGABRT);

    let action = if handler.is_some() {
        SigAction::new(SigHandler::Handler(trampoline), SaFlags::empty(), mask)
    } else {
        SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
    };

    unsafe {
        signal::sigaction(signum, &action)?;
    }

    Ok(())
}

pub fn unwatch(signum: Signal) -> Result<(), RuntimeError> {
    watch(signum, None, false)
}

fn terminate_process(signum: Signal, trigger: &std::sync::atomic::AtomicBool) -> ! {
    trigger.store(true, std::sync::atomic::Ordering::SeqCst);

    let mut unblock = SigSet::empty();
    unblock.add(signum);
    let _ = signal::sigprocmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&unblock), None);

    for _ in 0..10 {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        if unsafe { signal::sigaction(signum, &default) }.is_err() {
            break;
        }

        if unsafe { libc::raise(signum as libc::c_int) } != 0 {
            break;
        }

        let mut pending = SigSet::empty();
        if signal::sigpending(&mut pending).is_err() {
            break;
        }

        if pending.contains(signum) {
            crate::clock::monotonic_sleep(crate::clock::Duration::from_millis(100));
        }
    }

    unsafe {
        libc::raise(signum as libc::c_int);
    }

    loop {
        crate::clock::monotonic_sleep(crate::clock::Duration::from_secs(1));
        unsafe {
            libc::raise(libc::SIGKILL);
        }
    }
}

/// Forces process termination via `SIGABRT`, falling back to `SIGKILL`
/// if something downstream has made `SIGABRT` survivable.
pub fn abort_process() -> ! {
    terminate_process(Signal::SIGABRT, &ABORT_TRIGGER)
}

pub fn quit_process() -> ! {
    terminate_process(Signal::SIGQUIT, &QUIT_TRIGGER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rejects_sa_restart() {
        let result = watch(Signal::SIGUSR1, Some(Arc::new(|| {})), true);
        assert!(result.is_err());
    }

    #[test]
    fn installed_handler_runs_on_signal() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        watch(
            Signal::SIGUSR2,
            Some(Arc::new(|| {
                HITS.fetch_add(1, Ordering::SeqCst);
            })),
            false,
        )
        .unwrap();

        unsafe {
            libc::raise(libc::SIGUSR2);
        }

        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        unwatch(Signal::SIGUSR2).unwrap();
    }

    #[test]
    fn signal_context_depth_reflects_nesting() {
        assert_eq!(own_process_signal_context(), 0);
    }
}
