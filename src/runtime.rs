//! The `Runtime` handle: a single `Arc`-shared value a host process
//! constructs once and threads through, owning the process-wide
//! application lock and the config that was in force when it was
//! built. The signal vector, error-frame chunks and boot incarnation
//! cache stay process-wide `OnceLock` statics in their own modules —
//! promoting *those* into `Runtime` fields would mean every signal
//! handler and every error macro needs a `Runtime` reference in scope.

use std::fs::File;
use std::sync::Arc;

use nix::sys::signal::Signal;

use crate::applock::{ProcessAppLock, ProcessAppLockGuard};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::procfs;
use crate::signal;

/// Owns the pieces of process-wide state a host binary constructs once
/// at startup.
pub struct Runtime {
    config: RuntimeConfig,
    app_lock: ProcessAppLock,
}

impl Runtime {
    /// Builds a `Runtime` from `config`, applying its
    /// [`RuntimeConfig::race_test_mode`] to the error-frame allocator and
    /// optionally taking an OFD write-lock on `lock_file` as the
    /// process's single-instance guard.
    pub fn new(config: RuntimeConfig, lock_file: Option<File>) -> Arc<Self> {
        config.apply();
        Arc::new(Self {
            config,
            app_lock: ProcessAppLock::new(lock_file),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Acquires the process application lock.
    pub fn lock_app(&self) -> Result<ProcessAppLockGuard<'_>, RuntimeError> {
        self.app_lock.acquire()
    }

    /// Installs a handler for `signum`, delegating to the process-wide
    /// signal vector.
    pub fn watch_signal(
        &self,
        signum: Signal,
        handler: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<(), RuntimeError> {
        signal::watch(signum, Some(handler), false)
    }

    pub fn unwatch_signal(&self, signum: Signal) -> Result<(), RuntimeError> {
        signal::unwatch(signum)
    }

    /// The boot-id-derived incarnation string used to distinguish this
    /// boot of the machine from any other.
    pub fn boot_incarnation(&self) -> &'static str {
        procfs::boot_incarnation()
    }
}
