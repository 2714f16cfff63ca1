//! File descriptor transfer over a unix stream socket (`SCM_RIGHTS`).

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::error::{Result, RspError};

/// Max number of fds to send in one message; chunking avoids unknown
/// system limits on ancillary payload size.
pub const MAX_FDS_PER_MSG: usize = 4;

fn transfer_err(e: impl std::fmt::Display) -> RspError {
    RspError::ZdrFdTransfer(e.to_string())
}

/// Send `fds` over `conn`, chunked. Each chunk carries one data byte so
/// the ancillary payload is never attached to an empty message.
pub fn send_fds(conn: &mut UnixStream, fds: &[RawFd]) -> Result<()> {
    let sockfd = conn.as_raw_fd();

    for chunk in fds.chunks(MAX_FDS_PER_MSG) {
        let data = [0u8; 1];
        let iov = [IoSlice::new(&data)];
        let cmsg = [ControlMessage::ScmRights(chunk)];
        sendmsg::<UnixAddr>(sockfd, &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(transfer_err)?;
    }
    Ok(())
}

/// Receive `count` fds from `conn`, in the order they were sent. The
/// result may be shorter than `count` if the peer sent fewer.
pub fn recv_fds(conn: &mut UnixStream, count: usize) -> Result<Vec<RawFd>> {
    let sockfd = conn.as_raw_fd();
    let mut fds: Vec<RawFd> = Vec::with_capacity(count);

    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(MAX_FDS_PER_MSG);

        let mut data = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MSG]);

        let msg = recvmsg::<UnixAddr>(
            sockfd,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(transfer_err)?;

        let mut got_any = false;
        for cmsg in msg.cmsgs().map_err(transfer_err)? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                got_any = got_any || !received.is_empty();
                fds.extend(received);
            }
        }
        if !got_any {
            // peer stopped sending early
            break;
        }

        remaining = remaining.saturating_sub(chunk);
    }

    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Seek, SeekFrom, Write as _};
    use std::os::fd::FromRawFd;

    #[test]
    fn test_fd_exchange_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        // send a real file's fd and write through the received copy
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"before ").unwrap();

        send_fds(&mut a, &[file.as_raw_fd()]).unwrap();
        let fds = recv_fds(&mut b, 1).unwrap();
        assert_eq!(fds.len(), 1);
        assert_ne!(fds[0], file.as_raw_fd(), "receiver gets its own fd");

        let mut received = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        received.write_all(b"after").unwrap();

        // both descriptors reference the same open file description
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "before after");
    }

    #[test]
    fn test_fd_exchange_chunks_more_than_four() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let files: Vec<std::fs::File> =
            (0..6).map(|_| tempfile::tempfile().unwrap()).collect();
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();

        send_fds(&mut a, &raw).unwrap();
        let fds = recv_fds(&mut b, raw.len()).unwrap();
        assert_eq!(fds.len(), 6);

        for fd in fds {
            use std::os::fd::{FromRawFd, OwnedFd};
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }

    #[test]
    fn test_recv_zero_is_empty() {
        let (_a, mut b) = UnixStream::pair().unwrap();
        let fds = recv_fds(&mut b, 0).unwrap();
        assert!(fds.is_empty());
    }
}
