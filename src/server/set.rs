//! The set of configured servers, managed as a unit.

use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;

use super::HttpServer;
use crate::error::{Result, RspError};
use crate::log;
use crate::zdr::ConnSock;

#[derive(Default)]
pub struct ServerSet {
    servers: Vec<Arc<HttpServer>>,
    /// Listeners detached during a ZDR handoff. Parked here so their fds
    /// stay open until the descriptors have reached the successor.
    detached: Mutex<Vec<TcpListener>>,
}

impl ServerSet {
    pub fn new(servers: Vec<Arc<HttpServer>>) -> Self {
        Self {
            servers,
            detached: Mutex::new(Vec::new()),
        }
    }

    pub fn servers(&self) -> &[Arc<HttpServer>] {
        &self.servers
    }

    /// Create or adopt listeners for every server. Takes ownership of
    /// `inherited`; sockets matched by `(proto, addr)` are adopted, the
    /// rest are closed. On error every listener is closed.
    pub fn listen(&self, mut inherited: Vec<ConnSock>) -> Result<()> {
        for server in &self.servers {
            let adopted = match inherited
                .iter()
                .position(|ls| ls.proto == "tcp" && ls.addr == server.addr())
            {
                Some(i) => {
                    let sock = inherited.remove(i);
                    match sock.into_tcp_listener() {
                        Ok(l) => Some(l),
                        Err(e) => {
                            self.close_listeners();
                            return Err(e);
                        }
                    }
                }
                None => None,
            };

            if let Err(e) = server.listen(adopted) {
                self.close_listeners();
                return Err(e);
            }
        }

        // close unused inherited sockets (ConnSock closes on drop)
        inherited.clear();
        Ok(())
    }

    /// Run every server concurrently; returns once all are done. A
    /// non-graceful error from one server closes the rest immediately.
    pub fn serve(&self) -> Result<()> {
        let (errs_tx, errs_rx) = crossbeam::channel::bounded(self.servers.len());

        std::thread::scope(|scope| {
            for server in &self.servers {
                let errs_tx = errs_tx.clone();
                scope.spawn(move || {
                    let result = server.serve();
                    if result.is_err() {
                        // close all servers immediately so the error
                        // propagates to the joining caller
                        self.close();
                    }
                    let _ = errs_tx.send(result);
                });
            }
            drop(errs_tx);
        });

        let mut first_err = None;
        while let Ok(result) = errs_rx.recv() {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Graceful: stop accepting everywhere; in-flight requests finish.
    pub fn shutdown(&self) {
        for server in &self.servers {
            server.shutdown();
        }
    }

    /// Immediate close of every server.
    pub fn close(&self) {
        for server in &self.servers {
            server.close();
        }
    }

    fn close_listeners(&self) {
        for server in &self.servers {
            server.detach_listener();
        }
    }

    /// Detach every server's listener for a handoff, returning
    /// `(fd, "tcp:<addr>")` pairs in server order. The listener objects
    /// are parked so the fds stay valid while they travel.
    pub fn detach_all(&self) -> Result<Vec<(i32, String)>> {
        let mut out = Vec::with_capacity(self.servers.len());
        let mut pen = self.detached.lock();

        for server in &self.servers {
            let Some(listener) = server.detach_listener() else {
                return Err(RspError::ZdrProtocol(format!(
                    "server {} has no listener to hand off",
                    server.addr()
                )));
            };
            use std::os::fd::AsRawFd;
            out.push((listener.as_raw_fd(), format!("tcp:{}", server.addr())));
            pen.push(listener);
        }

        if out.is_empty() {
            log!("zdr"; "handoff with no serving listeners");
        }
        Ok(out)
    }
}
