//! Structured error unwinding, signal dispatch, and fork coordination
//! for long-lived POSIX daemons.
//!
//! Five subsystems, usable independently or through the [`Runtime`]
//! handle that wires them together for a typical daemon's lifecycle:
//!
//! - [`error`] — the Error-Frame Engine: `error_if!`/`finally!`/
//!   `abort_if!`.
//! - [`signal`] — the per-signal dispatch table.
//! - [`fork`] — `fork_process_child`/`fork_process_daemon`.
//! - [`deadline`] — SIGCONT-aware deadlines built on [`clock`].
//! - [`fdset`] — the fd-range set the fork layer uses for whitelists.

pub mod applock;
pub mod bell;
pub mod clock;
pub mod config;
pub mod deadline;
pub mod env;
pub mod error;
pub mod fdset;
pub mod fork;
pub mod pid;
pub mod pipe;
pub mod procfs;
pub mod runtime;
pub mod sigcont;
pub mod signal;
pub mod socket;
pub mod tempfile;
pub mod testinjector;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use runtime::Runtime;
