//! A "bell": a one-byte ready signal over a socket pair. Writes and
//! reads exactly one byte, remapping a broken-pipe condition to a
//! single error variant so callers only have to handle the
//! connection-closed case once. Built on [`crate::socket::SocketPair`].

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::socket::SocketPair;

pub struct BellPair {
    parent: UnixStream,
    child: UnixStream,
}

fn ring(socket: &mut UnixStream) -> Result<(), RuntimeError> {
    match socket.write(&[0u8]) {
        Ok(1) => Ok(()),
        Ok(_) => Err(RuntimeError::Other("bell write wrote zero bytes".into())),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            Err(RuntimeError::Other("bell socket pipe broken".into()))
        }
        Err(e) => Err(e.into()),
    }
}

fn wait(socket: &mut UnixStream, timeout: Option<Duration>) -> Result<(), RuntimeError> {
    socket.set_read_timeout(timeout)?;

    let mut buf = [0u8; 1];
    match socket.read(&mut buf) {
        Ok(1) => Ok(()),
        Ok(_) => Err(RuntimeError::Other("bell closed before ringing".into())),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            Err(RuntimeError::Other("bell socket pipe broken".into()))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RuntimeError::TimedOut),
        Err(e) => Err(e.into()),
    }
}

impl BellPair {
    pub fn new() -> Result<Self, RuntimeError> {
        let pair = SocketPair::new()?;
        Ok(Self {
            parent: pair.parent,
            child: pair.child,
        })
    }

    pub fn ring_parent(&mut self) -> Result<(), RuntimeError> {
        ring(&mut self.parent)
    }

    pub fn ring_child(&mut self) -> Result<(), RuntimeError> {
        ring(&mut self.child)
    }

    pub fn wait_parent(&mut self, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        wait(&mut self.parent, timeout)
    }

    pub fn wait_child(&mut self, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        wait(&mut self.child, timeout)
    }

    pub(crate) fn parent_fd(&self) -> RawFd {
        self.parent.as_raw_fd()
    }

    pub(crate) fn child_fd(&self) -> RawFd {
        self.child.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ringing_the_child_wakes_the_parent() {
        let mut bell = BellPair::new().unwrap();
        bell.ring_child().unwrap();
        bell.wait_parent(Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn waiting_without_a_ring_times_out() {
        let mut bell = BellPair::new().unwrap();
        let result = bell.wait_parent(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(RuntimeError::TimedOut)));
    }
}
