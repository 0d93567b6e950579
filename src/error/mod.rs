//! The Error-Frame Engine: structured, exception-free unwinding built
//! from three pieces:
//!
//! - [`chunk`] — the mmap-backed arena frames are written into.
//! - [`stack`] — the per-thread, per-stack-kind log with nestable
//!   sequence checkpoints.
//! - [`freeze`] — serializing a sequence to a file descriptor and back.
//!
//! Rather than `setjmp`/`goto`-style unwinding, this threads an explicit
//! `Result` through every fallible call: [`error_if!`] captures a frame
//! and returns early; [`finally!`] runs cleanup on every exit path via
//! `scopeguard`; [`abort_if!`] dumps the accumulated sequence and aborts
//! the process.

mod chunk;
mod frame;
mod freeze;
mod stack;

pub use chunk::{race_test_mode, set_race_test_mode};
pub use frame::{ErrorFrame, FrameSeqId, StackKind};
pub use stack::ErrorFrameSequence;

use stack::TLS;
use thiserror::Error;

/// The ambient error shell returned by fallible operations across the
/// crate. [`error_if!`]-style macros populate [`RuntimeError::Failed`]
/// automatically; other modules add their own variants for conditions
/// that carry more context than a bare errno.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("operation failed: {}", strerror(*.errno))]
    Failed { errno: i32 },

    #[error("deadline expired")]
    TimedOut,

    #[error("wrapped io error")]
    Io(#[from] std::io::Error),

    #[error("wrapped syscall error")]
    Nix(#[from] nix::Error),

    #[error("failed to read /proc/{pid}/stat")]
    Proc { pid: i32, source: std::io::Error },

    #[error("malformed /proc/{pid}/stat")]
    MalformedProcStat { pid: i32 },

    #[error("malformed or out-of-range /proc/uptime value")]
    InvalidUptime,

    #[error("thawed a failure with errno {}", strerror(*.errno))]
    Thawed { errno: i32 },

    #[error("fd range {0:?} already present")]
    RangeExists(crate::fdset::FdRange),

    #[error("fd range {0:?} not present")]
    RangeMissing(crate::fdset::FdRange),

    #[error("process signature changed before an outstanding operation completed")]
    PidRecycled,

    #[error("child reported failure: {0}")]
    ChildFailed(i32),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn errno(&self) -> i32 {
        match self {
            RuntimeError::Failed { errno } => *errno,
            RuntimeError::Thawed { errno } => *errno,
            RuntimeError::TimedOut => libc::ETIMEDOUT,
            RuntimeError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            RuntimeError::Nix(e) => *e as i32,
            RuntimeError::ChildFailed(errno) => *errno,
            RuntimeError::InvalidUptime => libc::ERANGE,
            _ => libc::EINVAL,
        }
    }
}

/// Renders `errno` as `strerror(3)`-style text alongside the numeric
/// value.
pub fn strerror(errno: i32) -> String {
    // errno values synthesized by test code are not validated against
    // the platform's known range — `Errno::from_raw` tolerates that by
    // falling back to `UnknownErrno`.
    nix::errno::Errno::from_raw(errno).to_string()
}

pub fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(0)
}

fn with_current<R>(f: impl FnOnce(&mut stack::StackState) -> R) -> R {
    TLS.with(|tls| f(tls.borrow_mut().current_mut()))
}

/// Used only by the signal dispatcher.
pub fn switch_error_frame_stack(kind: StackKind) -> StackKind {
    TLS.with(|tls| tls.borrow_mut().switch(kind))
}

pub fn own_error_frame_offset() -> usize {
    TLS.with(|tls| tls.borrow().current().offset())
}

pub fn own_error_frame_sequence_id() -> FrameSeqId {
    TLS.with(|tls| tls.borrow().current().sequence_id())
}

#[doc(hidden)]
pub fn restart_error_frame_sequence() {
    with_current(|s| s.restart());
}

#[doc(hidden)]
pub fn add_error_frame(file: &'static str, line: u32, func: &'static str, description: &'static str, errno: i32) {
    with_current(|s| s.add_frame(file, line, func, description, errno));
}

/// Nestable checkpoint for user code that wants to probe a fallible
/// operation without permanently polluting the caller's sequence.
pub fn push_error_frame_sequence() -> ErrorFrameSequence {
    with_current(|s| s.push_sequence())
}

pub fn pop_error_frame_sequence(saved: ErrorFrameSequence) {
    with_current(|s| s.pop_sequence(saved));
}

pub fn current_sequence_frames() -> Vec<ErrorFrame> {
    TLS.with(|tls| tls.borrow().current().current_frames())
}

/// Writes the current sequence to `fd`. Returns the number of frames
/// written.
pub fn freeze_error_frame_sequence<W: std::io::Write>(writer: W) -> std::io::Result<usize> {
    let frames = current_sequence_frames();
    freeze::freeze(writer, &frames)
}

/// Reads a sequence previously written by [`freeze_error_frame_sequence`]
/// and pushes it onto the current thread's sequence (after a
/// [`restart_error_frame_sequence`]), returning a [`RuntimeError`] that
/// carries the last frame's `errno` so the thaw itself propagates as a
/// fresh failure.
///
/// # Safety
///
/// `reader` must yield bytes written by [`freeze_error_frame_sequence`]
/// in this same binary image.
pub unsafe fn thaw_error_frame_sequence<R: std::io::Read>(reader: R) -> std::io::Result<RuntimeError> {
    let frames = freeze::thaw(reader)?;
    let errno = frames.last().map(|f| f.errno).unwrap_or(0);

    restart_error_frame_sequence();
    with_current(|s| s.extend_current(&frames));

    Ok(RuntimeError::Thawed { errno })
}

/// Prints a chronological dump of the current sequence to stderr and to
/// the `tracing` subscriber.
pub fn dump_current_sequence(context: &str) {
    let frames = current_sequence_frames();
    eprintln!("{}: unrecovered error sequence ({} frame(s))", context, frames.len());
    for frame in &frames {
        eprintln!("  {}", frame);
        tracing::error!(
            func = frame.func,
            file = frame.file,
            line = frame.line,
            errno = frame.errno,
            seq = %frame.sequence,
            "{}",
            frame.description
        );
    }
}

/// Evaluates `$pred`; on a
/// truthy result, captures a frame tagged with the call site and the
/// `errno` observed at that point, runs an optional cleanup expression,
/// and returns the enclosing function's error early. Every evaluation
/// first calls [`restart_error_frame_sequence`], so a previous,
/// unrelated failure that this function recovered from never leaks into
/// the new sequence.
#[macro_export]
macro_rules! error_if {
    ($pred:expr) => {
        $crate::error_if!($pred, {})
    };
    ($pred:expr, $cleanup:block) => {{
        $crate::error::restart_error_frame_sequence();
        let __injected_errno = $crate::testinjector::should_inject();
        if __injected_errno.is_some() || $pred {
            let errno = __injected_errno.unwrap_or_else($crate::error::last_errno);
            $cleanup
            $crate::error::add_error_frame(file!(), line!(), module_path!(), stringify!($pred), errno);
            return Err($crate::error::RuntimeError::Failed { errno }.into());
        }
    }};
}

/// Runs `$cleanup` on every exit path out of the enclosing scope, with
/// `errno` restored to its value at the time the guard fires. Built on
/// `scopeguard` so cleanup runs regardless of how the scope returns.
#[macro_export]
macro_rules! finally {
    ($cleanup:expr) => {
        let __errno_on_entry = $crate::error::last_errno();
        let _finally_guard = ::scopeguard::guard((), |()| {
            let __errno_at_exit = $crate::error::last_errno();
            $cleanup;
            unsafe {
                *::libc::__errno_location() = __errno_at_exit;
            }
        });
        let _ = __errno_on_entry;
    };
}

/// Pushes an anchoring sequence; if `$pred` holds, dumps every
/// accumulated frame and terminates the process. Used at the top of the
/// call stack to convert an unrecovered propagation into a diagnostic
/// dump.
#[macro_export]
macro_rules! abort_if {
    ($pred:expr) => {
        $crate::abort_if!($pred, stringify!($pred))
    };
    ($pred:expr, $context:expr) => {{
        let __seq = $crate::error::push_error_frame_sequence();
        if $pred {
            $crate::error::dump_current_sequence($context);
            std::process::abort();
        }
        $crate::error::pop_error_frame_sequence(__seq);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestErr(RuntimeError);
    impl From<RuntimeError> for TestErr {
        fn from(e: RuntimeError) -> Self {
            TestErr(e)
        }
    }

    fn test_fail1() -> Result<(), TestErr> {
        error_if!(true, {
            unsafe { *libc::__errno_location() = -1i32 as i32 };
        });
        Ok(())
    }

    fn test_fail2() -> Result<(), TestErr> {
        error_if!(test_fail1().is_err(), {
            unsafe { *libc::__errno_location() = -2i32 as i32 };
        });
        Ok(())
    }

    #[test]
    fn scenario_two_level_error_stack() {
        restart_error_frame_sequence();
        let result = test_fail2();
        assert!(result.is_err());

        let frames = current_sequence_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].errno, -1);
        assert_eq!(frames[1].errno, -2);
    }

    #[test]
    fn freeze_thaw_round_trip_scenario() {
        restart_error_frame_sequence();
        let _ = test_fail2();

        let seq = push_error_frame_sequence();
        // Re-enact the frames inside the pushed sequence so freeze sees
        // exactly the two-frame sequence from the scenario.
        let _ = test_fail2();
        let mut buf = Vec::new();
        let written = freeze_error_frame_sequence(&mut buf).unwrap();
        assert_eq!(written, 2);
        pop_error_frame_sequence(seq);

        let result = unsafe { thaw_error_frame_sequence(&buf[..]) }.unwrap();
        assert_eq!(result.errno(), -2);

        let frames = current_sequence_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].errno, -1);
        assert_eq!(frames[1].errno, -2);
    }

    #[test]
    fn injected_failure_short_circuits_the_predicate() {
        use std::sync::Mutex;
        static ENV_GUARD: Mutex<()> = Mutex::new(());
        let _guard = ENV_GUARD.lock().unwrap();

        fn never_runs() -> bool {
            panic!("predicate must not be evaluated once injection fires");
        }

        fn injected_call() -> Result<(), TestErr> {
            error_if!(never_runs());
            Ok(())
        }

        std::env::set_var(crate::testinjector::TRIGGER_VAR, "1");
        crate::testinjector::reset();

        let result = injected_call();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().0.errno(), libc::EIO);

        std::env::remove_var(crate::testinjector::TRIGGER_VAR);
        crate::testinjector::reset();
    }

    #[test]
    fn signal_stack_switch_is_isolated() {
        restart_error_frame_sequence();
        let _ = test_fail2();
        assert_eq!(own_error_frame_offset(), 2);

        let prev = switch_error_frame_stack(StackKind::Signal);
        assert_eq!(prev, StackKind::Thread);

        restart_error_frame_sequence();
        let _ = test_fail1();
        assert_eq!(own_error_frame_offset(), 1);

        let prev = switch_error_frame_stack(StackKind::Thread);
        assert_eq!(prev, StackKind::Signal);

        assert_eq!(own_error_frame_offset(), 2);
        let frames = current_sequence_frames();
        assert_eq!(frames[0].errno, -1);
        assert_eq!(frames[1].errno, -2);
    }
}
