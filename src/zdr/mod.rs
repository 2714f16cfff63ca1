//! Zero-downtime restart coordination.
//!
//! Exactly one process per control socket is the *master*: it owns the
//! unix-domain control listener and every serving listener. A newly
//! started process asks the incumbent to hand over by connecting and
//! sending `take-over`; the incumbent replies with `fd-info` (the ordered
//! `proto:addr` list) followed by the file descriptors themselves, then
//! shuts down gracefully. Successors never bind serving sockets the
//! incumbent still owns - they adopt the received descriptors, so no
//! connection is ever refused during the switch.

pub mod fd;
pub mod ipc;
pub mod sock;

use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, RspError};
use crate::{debug, log};

pub use sock::ConnSock;

pub const CMD_TAKE_OVER: &str = "take-over";
pub const CMD_FD_INFO: &str = "fd-info";

/// What the coordinator needs from the rest of the instance during a
/// handoff.
pub trait Handoff: Send + Sync {
    /// Raw fds of every serving listener with their `proto:addr`
    /// descriptors, in a deterministic order. Implementations detach the
    /// listeners from their servers: after this call the servers no
    /// longer own them.
    fn detach_listeners(&self) -> Result<Vec<(i32, String)>>;

    /// Gracefully shut the instance down. Blocks until complete.
    fn shutdown(&self) -> Result<()>;
}

/// Zero-downtime restart coordinator. One per instance.
pub struct Zdr {
    sockpath: PathBuf,
    handoff: Arc<dyn Handoff>,
    master_ln: Mutex<Option<Arc<UnixListener>>>,
    shutdown_tx: Mutex<Option<Sender<Result<()>>>>,
    shutdown_rx: Receiver<Result<()>>,
    me: std::sync::Weak<Zdr>,
}

impl Zdr {
    pub fn new(sockpath: PathBuf, handoff: Arc<dyn Handoff>) -> Arc<Self> {
        let (tx, rx) = bounded(1);
        Arc::new_cyclic(|me| Self {
            sockpath,
            handoff,
            master_ln: Mutex::new(None),
            shutdown_tx: Mutex::new(Some(tx)),
            shutdown_rx: rx,
            me: me.clone(),
        })
    }

    pub fn sockpath(&self) -> &Path {
        &self.sockpath
    }

    /// Block until a handoff-initiated shutdown has completed, returning
    /// its result. Returns immediately once the coordinator is closed.
    pub fn await_shutdown(&self) -> Result<()> {
        match self.shutdown_rx.recv() {
            Ok(result) => result,
            // sender dropped without a handoff: nothing to wait for
            Err(_) => Ok(()),
        }
    }

    /// Acquire the master role, taking it over from any process currently
    /// serving on this control socket.
    ///
    /// Returns the listening sockets inherited from the previous master
    /// (empty when this process is the first). After this returns, the
    /// calling process is the master.
    pub fn acquire_master_role(&self, timeout: Duration) -> Result<Vec<ConnSock>> {
        let deadline = Instant::now() + timeout;
        let mut removed_stale = false;
        let mut made_dir = false;

        loop {
            match UnixListener::bind(&self.sockpath) {
                Ok(ln) => {
                    // acquired master role as the initial process
                    self.install_master(ln);
                    return Ok(Vec::new());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    // another process is master; ask it to hand over
                    match self.take_over_master(deadline) {
                        Err(RspError::ZdrProtocol(msg))
                            if msg == "connection refused" && !removed_stale =>
                        {
                            // the prior master crashed and left its socket
                            // file behind; clean up once and retry the bind
                            log!("zdr"; "removing stale socket {:?}", self.sockpath.display());
                            let _ = std::fs::remove_file(&self.sockpath);
                            removed_stale = true;
                            continue;
                        }
                        other => return other,
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && !made_dir => {
                    if let Some(parent) = self.sockpath.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    made_dir = true;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Connect to the incumbent master and receive its sockets.
    fn take_over_master(&self, deadline: Instant) -> Result<Vec<ConnSock>> {
        let mut conn = match UnixStream::connect(&self.sockpath) {
            Ok(c) => c,
            // normalized so the caller can tell a crashed master apart
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(RspError::ZdrProtocol("connection refused".into()))
            }
            Err(e) => return Err(RspError::ZdrProtocol(e.to_string())),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RspError::ZdrTimeout);
        }
        conn.set_read_timeout(Some(remaining))
            .map_err(|e| RspError::ZdrProtocol(e.to_string()))?;

        // request the role
        ipc::write_msg(&mut conn, &ipc::IpcMsg::new(CMD_TAKE_OVER, Vec::new()))?;

        // the reply lists the fds about to arrive, control socket first
        let fdinfo = match ipc::read_expect(&mut conn, CMD_FD_INFO) {
            Err(_) if Instant::now() >= deadline => return Err(RspError::ZdrTimeout),
            other => other?,
        };
        let nfds = fdinfo.args.len();
        if nfds == 0 {
            return Err(RspError::ZdrProtocol("empty fd-info from master".into()));
        }

        let fds = fd::recv_fds(&mut conn, nfds)?;
        if fds.len() < nfds {
            return Err(RspError::ZdrFdTransfer(
                "too few fds received from master".into(),
            ));
        }

        // take ownership of every received fd up front so an error below
        // closes them instead of leaking mid-handoff
        let mut fds = fds.into_iter();
        let master_ln = unsafe {
            use std::os::fd::FromRawFd;
            UnixListener::from_raw_fd(fds.next().expect("nfds checked above"))
        };
        let mut conns: Vec<ConnSock> = fds
            .map(|fd| ConnSock {
                fd,
                proto: String::new(),
                addr: String::new(),
            })
            .collect();

        // the remaining descriptors are serving listeners, in fd-info order
        for (cs, arg) in conns.iter_mut().zip(fdinfo.args.iter().skip(1)) {
            let parsed = ConnSock::parse(arg)?;
            cs.proto = parsed.proto.clone();
            cs.addr = parsed.addr.clone();
        }

        // acquired master role via handoff
        self.install_master(master_ln);
        Ok(conns)
    }

    fn install_master(&self, ln: UnixListener) {
        let ln = Arc::new(ln);
        *self.master_ln.lock() = Some(ln.clone());

        let me = self.me.upgrade().expect("zdr arc alive");
        std::thread::Builder::new()
            .name("zdr-master".into())
            .spawn(move || me.master_loop(ln))
            .expect("spawn zdr master loop");
    }

    /// Serve handoff requests. Connections are handled serially: at most
    /// one handoff can be in progress.
    fn master_loop(self: Arc<Self>, ln: Arc<UnixListener>) {
        loop {
            let (mut conn, _) = match ln.accept() {
                Ok(c) => c,
                Err(e) => {
                    // accept fails when close() shut the listener down
                    if self.master_ln.lock().is_some() {
                        log!("zdr"; "error in accept: {}", e);
                    }
                    return;
                }
            };

            // read a message, expecting the take-over request; anything
            // else closes the connection and keeps serving
            if let Err(e) = ipc::read_expect(&mut conn, CMD_TAKE_OVER) {
                debug!("zdr"; "rejecting connection: {}", e);
                continue;
            }

            // the requestor wants the master role; give it up
            match self.release_master_role(&mut conn) {
                Err(e) => {
                    // still master; serve the next request
                    log!("zdr"; "failed to release master role: {}", e);
                    continue;
                }
                Ok(()) => {
                    // no longer master: the control listener now belongs
                    // to the successor
                    return;
                }
            }
        }
    }

    /// Ship every owned fd to the successor and shut this instance down.
    fn release_master_role(&self, conn: &mut UnixStream) -> Result<()> {
        // collect fds: the control socket first, then each server
        // listener (detached from its server by the collection)
        let control_fd = self
            .master_ln
            .lock()
            .as_ref()
            .map(|ln| ln.as_raw_fd())
            .ok_or_else(|| RspError::ZdrProtocol("not master".into()))?;

        let mut fds = vec![control_fd];
        let mut uris = vec![format!("unix:{}", self.sockpath.display())];

        for (fd, uri) in self.handoff.detach_listeners()? {
            fds.push(fd);
            uris.push(uri);
        }

        ipc::write_msg(conn, &ipc::IpcMsg::new(CMD_FD_INFO, uris))?;
        fd::send_fds(conn, &fds)?;

        // fds are delivered; this process is no longer master. The
        // listener object itself stays alive (held by the master loop)
        // until after this function returns, so the socket stays in-use
        // for the successor's retry logic.
        *self.master_ln.lock() = None;

        // graceful shutdown; publish the result for the main loop
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handoff.shutdown()
        }))
        .unwrap_or_else(|_| Err(RspError::Other("panic in zdr shutdown".into())));

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(result);
        }

        Ok(())
    }

    /// Stop being master (if we are) and release waiters.
    pub fn close(&self) {
        if let Some(ln) = self.master_ln.lock().take() {
            // break the accept loop; dropping our handle alone would not,
            // since the loop holds its own reference
            let _ = nix::sys::socket::shutdown(ln.as_raw_fd(), nix::sys::socket::Shutdown::Both);
            let _ = std::fs::remove_file(&self.sockpath);
        }
        // waiters on await_shutdown observe the disconnect
        self.shutdown_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestHandoff {
        listeners: Mutex<Vec<std::net::TcpListener>>,
        shutdown_called: AtomicBool,
    }

    impl TestHandoff {
        fn new(listeners: Vec<std::net::TcpListener>) -> Arc<Self> {
            Arc::new(Self {
                listeners: Mutex::new(listeners),
                shutdown_called: AtomicBool::new(false),
            })
        }
    }

    impl Handoff for TestHandoff {
        fn detach_listeners(&self) -> Result<Vec<(i32, String)>> {
            // keep the listener objects alive; only report their fds
            Ok(self
                .listeners
                .lock()
                .iter()
                .map(|l| {
                    let addr = l.local_addr().unwrap();
                    (l.as_raw_fd(), format!("tcp:{addr}"))
                })
                .collect())
        }

        fn shutdown(&self) -> Result<()> {
            self.shutdown_called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sockpath(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("zdr.sock")
    }

    #[test]
    fn test_first_process_becomes_master_with_no_inherited_fds() {
        let tmp = tempfile::tempdir().unwrap();
        let z = Zdr::new(sockpath(&tmp), TestHandoff::new(Vec::new()));
        let conns = z.acquire_master_role(Duration::from_secs(5)).unwrap();
        assert!(conns.is_empty());
        z.close();
    }

    #[test]
    fn test_handoff_transfers_listeners_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = sockpath(&tmp);

        let l1 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let l2 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let a1 = l1.local_addr().unwrap();
        let a2 = l2.local_addr().unwrap();

        let master_handoff = TestHandoff::new(vec![l1, l2]);
        let master = Zdr::new(path.clone(), master_handoff.clone());
        assert!(master
            .acquire_master_role(Duration::from_secs(5))
            .unwrap()
            .is_empty());

        // successor takes over and receives both listeners, in order
        let successor = Zdr::new(path, TestHandoff::new(Vec::new()));
        let conns = successor.acquire_master_role(Duration::from_secs(5)).unwrap();

        assert_eq!(conns.len(), 2);
        assert_eq!(conns[0].descriptor(), format!("tcp:{a1}"));
        assert_eq!(conns[1].descriptor(), format!("tcp:{a2}"));
        assert!(conns.iter().all(|c| c.fd >= 0));

        // outgoing master ran its graceful shutdown
        master.await_shutdown().unwrap();
        assert!(master_handoff.shutdown_called.load(Ordering::SeqCst));

        // a received fd really is the listening socket: connecting to the
        // original address must succeed through the successor's fd
        let adopted = conns.into_iter().next().unwrap().into_tcp_listener().unwrap();
        let client = std::net::TcpStream::connect(a1).unwrap();
        let (_srv, peer) = adopted.accept().unwrap();
        assert_eq!(client.local_addr().unwrap(), peer);

        successor.close();
    }

    #[test]
    fn test_stale_socket_file_is_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let path = sockpath(&tmp);

        // a crashed master leaves a bound-then-abandoned socket file
        {
            let ln = UnixListener::bind(&path).unwrap();
            drop(ln); // fd closed, file left behind
        }
        assert!(path.exists());

        let z = Zdr::new(path, TestHandoff::new(Vec::new()));
        let conns = z.acquire_master_role(Duration::from_secs(5)).unwrap();
        assert!(conns.is_empty());
        z.close();
    }

    #[test]
    fn test_socket_dir_created_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/zdr.sock");
        let z = Zdr::new(path, TestHandoff::new(Vec::new()));
        z.acquire_master_role(Duration::from_secs(5)).unwrap();
        z.close();
    }

    #[test]
    fn test_unknown_command_keeps_master_alive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = sockpath(&tmp);
        let z = Zdr::new(path.clone(), TestHandoff::new(Vec::new()));
        z.acquire_master_role(Duration::from_secs(5)).unwrap();

        // a bogus client is rejected without giving up the role
        {
            let mut conn = UnixStream::connect(&path).unwrap();
            ipc::write_msg(&mut conn, &ipc::IpcMsg::new("bogus", vec![])).unwrap();
        }

        // a real successor still succeeds afterwards
        let successor = Zdr::new(path, TestHandoff::new(Vec::new()));
        successor.acquire_master_role(Duration::from_secs(5)).unwrap();
        successor.close();
        z.close();
    }
}
