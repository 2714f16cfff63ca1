//! Listening-socket descriptors exchanged during a handoff.

use std::os::fd::RawFd;

use crate::error::{Result, RspError};

/// A listening socket received from (or offered to) another process:
/// an OS file descriptor plus the `proto:addr` pair identifying it.
#[derive(Debug)]
pub struct ConnSock {
    pub fd: RawFd,
    /// `tcp` or `unix`.
    pub proto: String,
    /// `host:port` for tcp, a filesystem path for unix.
    pub addr: String,
}

impl ConnSock {
    /// Parse a `"<proto>:<addr>"` descriptor, e.g. `tcp:127.0.0.1:8001`
    /// or `unix:/var/run/foo.sock`. The fd is filled in separately.
    pub fn parse(s: &str) -> Result<ConnSock> {
        let (proto, addr) = s
            .split_once(':')
            .ok_or_else(|| RspError::ZdrProtocol(format!("invalid conn sock {s:?}")))?;
        if proto.is_empty() || addr.is_empty() {
            return Err(RspError::ZdrProtocol(format!("invalid conn sock {s:?}")));
        }
        Ok(ConnSock {
            fd: -1,
            proto: proto.to_string(),
            addr: addr.to_string(),
        })
    }

    pub fn descriptor(&self) -> String {
        format!("{}:{}", self.proto, self.addr)
    }

    /// Adopt the fd as a TCP listener. Consumes the descriptor's
    /// ownership of the fd.
    pub fn into_tcp_listener(mut self) -> Result<std::net::TcpListener> {
        use std::os::fd::FromRawFd;
        if self.fd < 0 {
            return Err(RspError::ZdrFdTransfer(format!(
                "no fd for listener {}",
                self.descriptor()
            )));
        }
        let fd = self.fd;
        self.fd = -1;
        Ok(unsafe { std::net::TcpListener::from_raw_fd(fd) })
    }

    /// Close an unused inherited fd.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            use std::os::fd::{FromRawFd, OwnedFd};
            drop(unsafe { OwnedFd::from_raw_fd(self.fd) });
            self.fd = -1;
        }
    }
}

impl Drop for ConnSock {
    fn drop(&mut self) {
        self.close();
    }
}
