//! A close-on-exec pipe. Every descriptor-creating call in this crate
//! prefers the `*_CLOEXEC` variant so fds never leak across `exec()` by
//! accident — the fork layer's whitelist is the only place that should
//! decide what survives.

use std::fs::File;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::error::RuntimeError;

pub struct Pipe {
    pub read: File,
    pub write: File,
}

impl Pipe {
    pub fn new() -> Result<Self, RuntimeError> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            read: File::from(read),
            write: File::from(write),
        })
    }
}
