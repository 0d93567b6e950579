//! The application lock: a process-wide recursive lock that also blocks
//! signal delivery while held, optionally backed by an `fcntl` OFD
//! region lock on a file for exclusion across processes.
//!
//! The file-region half uses OFD locks via `fcntl(F_OFD_SETLKW)` rather
//! than `flock(2)`, since OFD locks compose correctly with `fork()` the
//! way the application lock needs to.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::{Condvar, Mutex};

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{self, SigSet, Signal, SigmaskHow};

use crate::error::RuntimeError;
use crate::pid::current_tid;

struct State {
    owner_tid: Option<i32>,
    depth: u32,
    saved_mask: Option<SigSet>,
}

/// A recursive mutex that blocks all signals but `SIGABRT` for as long
/// as any thread holds it at any depth.
pub struct ThreadSigMutex {
    state: Mutex<State>,
    released: Condvar,
}

impl ThreadSigMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                owner_tid: None,
                depth: 0,
                saved_mask: None,
            }),
            released: Condvar::new(),
        }
    }

    pub fn lock(&self) -> ThreadSigMutexGuard<'_> {
        let tid = current_tid().as_raw();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        loop {
            match state.owner_tid {
                None => break,
                Some(owner) if owner == tid => break,
                _ => {
                    state = self.released.wait(state).unwrap_or_else(|p| p.into_inner());
                }
            }
        }

        if state.owner_tid.is_none() {
            let mut block = SigSet::all();
            block.remove(Signal::SIGABRT);
            let mut old = SigSet::empty();
            signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&block), Some(&mut old))
                .expect("failed to block signals while acquiring application lock");
            state.saved_mask = Some(old);
            state.owner_tid = Some(tid);
        }

        state.depth += 1;

        ThreadSigMutexGuard { mutex: self }
    }

    /// Recursion depth currently held by *any* thread — tracked
    /// per-mutex, not per-thread, since only the owning thread can ever
    /// observe a non-zero value.
    pub fn own_locked(&self) -> u32 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).depth
    }

    fn unlock(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.depth -= 1;

        if state.depth == 0 {
            let mask = state.saved_mask.take();
            state.owner_tid = None;
            drop(state);

            if let Some(mask) = mask {
                signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
                    .expect("failed to restore signal mask while releasing application lock");
            }

            self.released.notify_one();
        }
    }
}

impl Default for ThreadSigMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ThreadSigMutexGuard<'a> {
    mutex: &'a ThreadSigMutex,
}

impl Drop for ThreadSigMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// An `fcntl` OFD write-lock spanning the whole of `file`. Held for the
/// lifetime of the value.
pub struct FileRegionLock {
    _file: File,
}

impl FileRegionLock {
    pub fn acquire_write(file: File) -> Result<Self, RuntimeError> {
        let params = libc::flock {
            l_type: libc::F_WRLCK as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLKW(&params))?;
        Ok(Self { _file: file })
    }
}

/// The process-wide application lock: recursive within a
/// process, optionally backed by a [`FileRegionLock`] so a second
/// process trying to acquire the same lock blocks (or fails, depending
/// on how the caller opened the file) until the first releases it.
pub struct ProcessAppLock {
    mutex: ThreadSigMutex,
    file_lock: Option<File>,
}

impl ProcessAppLock {
    pub fn new(file_lock: Option<File>) -> Self {
        Self {
            mutex: ThreadSigMutex::new(),
            file_lock,
        }
    }

    /// Acquires the lock, taking the file-region lock only on the
    /// outermost acquisition.
    pub fn acquire(&self) -> Result<ProcessAppLockGuard<'_>, RuntimeError> {
        let guard = self.mutex.lock();

        let region_guard = if self.mutex.own_locked() == 1 {
            match &self.file_lock {
                Some(file) => {
                    let params = libc::flock {
                        l_type: libc::F_WRLCK as i16,
                        l_whence: libc::SEEK_SET as i16,
                        l_start: 0,
                        l_len: 0,
                        l_pid: 0,
                    };
                    fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLKW(&params))?;
                    true
                }
                None => false,
            }
        } else {
            false
        };

        Ok(ProcessAppLockGuard {
            lock: self,
            _mutex_guard: guard,
            holds_region: region_guard,
        })
    }

    pub fn own_lock_count(&self) -> u32 {
        self.mutex.own_locked()
    }
}

pub struct ProcessAppLockGuard<'a> {
    lock: &'a ProcessAppLock,
    _mutex_guard: ThreadSigMutexGuard<'a>,
    holds_region: bool,
}

impl Drop for ProcessAppLockGuard<'_> {
    fn drop(&mut self) {
        if self.holds_region {
            if let Some(file) = &self.lock.file_lock {
                let params = libc::flock {
                    l_type: libc::F_UNLCK as i16,
                    l_whence: libc::SEEK_SET as i16,
                    l_start: 0,
                    l_len: 0,
                    l_pid: 0,
                };
                let _ = fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&params));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn recursive_acquire_increments_depth() {
        let lock = ProcessAppLock::new(None);
        let g1 = lock.acquire().unwrap();
        assert_eq!(lock.own_lock_count(), 1);
        let g2 = lock.acquire().unwrap();
        assert_eq!(lock.own_lock_count(), 2);
        drop(g2);
        assert_eq!(lock.own_lock_count(), 1);
        drop(g1);
        assert_eq!(lock.own_lock_count(), 0);
    }

    #[test]
    fn blocks_other_threads_until_released() {
        let lock = Arc::new(ProcessAppLock::new(None));
        let guard = lock.acquire().unwrap();

        let lock2 = Arc::clone(&lock);
        let acquired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let acquired2 = Arc::clone(&acquired);

        let handle = thread::spawn(move || {
            let _g = lock2.acquire().unwrap();
            acquired2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!acquired.load(std::sync::atomic::Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
