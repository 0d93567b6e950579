//! A close-on-exec `AF_UNIX` socketpair, used for control channels
//! between a parent and a freshly forked child.

use std::os::unix::net::UnixStream;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::error::RuntimeError;

pub struct SocketPair {
    pub parent: UnixStream,
    pub child: UnixStream,
}

impl SocketPair {
    pub fn new() -> Result<Self, RuntimeError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok(Self {
            parent: UnixStream::from(a),
            child: UnixStream::from(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn parent_and_child_can_exchange_bytes() {
        let pair = SocketPair::new().unwrap();
        let mut parent = pair.parent;
        let mut child = pair.child;

        parent.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        child.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
