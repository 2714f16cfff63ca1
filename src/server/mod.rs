//! The HTTP server and its request router.
//!
//! The router is a thin collaborator over the core: it resolves the
//! request path inside the pub dir and hands off to the page cache, the
//! servlet cache, the static file responder or the directory lister.

pub mod dirlist;
pub mod response;
pub mod set;

use std::fs;
use std::io::Read;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tiny_http::{Request, Response, StatusCode};

use crate::cache::{BuildContext, PageCache, ServletCache};
use crate::config::ServerConfig;
use crate::error::{Result, RspError};
use crate::servlet::abi::{AbiBytes, AbiRequest, AbiStr, ResponseSink};
use crate::util;
use crate::{debug, log};

use dirlist::DirLister;
use response::{header, reply_error, reply_file, reply_html, reply_not_found, reply_redirect};

/// Everything a server needs to route requests into the core.
pub struct ServeContext {
    pub pubdir: PathBuf,
    pub pages: Option<Arc<PageCache>>,
    pub servlets: Option<Arc<ServletCache>>,
}

pub struct HttpServer {
    config: ServerConfig,
    ctx: Arc<ServeContext>,
    addr: String,
    /// `index.<page-ext>`, when pages are enabled.
    page_index_name: Option<String>,
    dirlist: Option<DirLister>,

    /// The bound (or adopted) listening socket. Retained here even while
    /// serving so ZDR can hand off the descriptor; `None` after detach.
    listener: Mutex<Option<TcpListener>>,
    server: OnceLock<Arc<tiny_http::Server>>,
}

impl HttpServer {
    pub fn new(ctx: Arc<ServeContext>, config: ServerConfig) -> Self {
        let page_index_name = ctx
            .pages
            .as_ref()
            .map(|pc| format!("index{}", pc.fileext()));

        let dirlist = config
            .dir_list
            .enabled
            .then(|| DirLister::new(&ctx.pubdir, &config.dir_list));

        let addr = config.addr();

        Self {
            config,
            ctx,
            addr,
            page_index_name,
            dirlist,
            listener: Mutex::new(None),
            server: OnceLock::new(),
        }
    }

    /// The configured `host:port`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Install a listening socket: an inherited one when given, otherwise
    /// a fresh bind.
    pub fn listen(&self, inherited: Option<TcpListener>) -> Result<()> {
        let listener = match inherited {
            Some(l) => {
                debug!("http"; "adopted existing listener for {}", self.addr);
                l
            }
            None => TcpListener::bind(&self.addr)
                .map_err(|e| RspError::Io(format!("listen {}: {e}", self.addr)))?,
        };
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    /// Raw fd of the listening socket, for descriptor handoff.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.lock().as_ref().map(|l| l.as_raw_fd())
    }

    /// Give up ownership of the listening socket (ZDR handoff). The
    /// returned object keeps the fd open until the caller is done with it.
    pub fn detach_listener(&self) -> Option<TcpListener> {
        self.listener.lock().take()
    }

    /// Run the request loop. Blocks until the server is shut down.
    pub fn serve(&self) -> Result<()> {
        if self.config.kind == "https" {
            // TLS termination is an external collaborator; the config
            // surface is validated but this build does not serve it
            return Err(RspError::ConfigInvalid(format!(
                "server {} is https; terminate TLS in front of rsp",
                self.addr
            )));
        }

        let listener = self
            .listener
            .lock()
            .as_ref()
            .ok_or_else(|| RspError::Other(format!("nil listener on server {}", self.addr)))?
            .try_clone()
            .map_err(|e| RspError::Io(e.to_string()))?;

        let server = tiny_http::Server::from_listener(listener, None)
            .map_err(|e| RspError::Io(format!("server {}: {e}", self.addr)))?;
        let server = self.server.get_or_init(|| Arc::new(server)).clone();

        log!("serve"; "listening on http://{}", self.addr);

        // requests fan out onto a small pool so an on-demand build cannot
        // stall unrelated requests
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .map_err(|e| RspError::Other(e.to_string()))?;

        pool.scope(|scope| {
            for request in server.incoming_requests() {
                scope.spawn(move |_| {
                    if let Err(e) = self.route(request) {
                        log!("http"; "request error: {}", e);
                    }
                });
            }
        });

        Ok(())
    }

    /// Stop accepting; in-flight requests run to completion.
    pub fn shutdown(&self) {
        if let Some(server) = self.server.get() {
            server.unblock();
        }
    }

    /// Immediate close: stop accepting and drop the listener.
    pub fn close(&self) {
        self.shutdown();
        self.listener.lock().take();
    }

    // -- routing -----------------------------------------------------------

    fn route(&self, request: Request) -> std::io::Result<()> {
        let url = request.url().to_string();
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, q),
            None => (url.as_str(), ""),
        };

        debug!("http"; "{} {}", request.method(), url);

        // never step outside the pub dir
        if path.split('/').any(|seg| seg == "..") {
            return reply_not_found(request);
        }

        let fspath = self.ctx.pubdir.join(path.trim_start_matches('/'));
        let Ok(meta) = fs::metadata(&fspath) else {
            return reply_not_found(request);
        };

        if meta.is_dir() {
            self.route_dir(request, &fspath, path, query)
        } else if self.is_page_path(&fspath) {
            self.serve_page(request, &fspath, path)
        } else {
            reply_file(request, &fspath)
        }
    }

    fn route_dir(
        &self,
        request: Request,
        fspath: &Path,
        url_path: &str,
        query: &str,
    ) -> std::io::Result<()> {
        let Ok(entries) = fs::read_dir(fspath) else {
            return reply_not_found(request);
        };
        let names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();

        // index resolution: page index, then index.html, then a servlet
        // marker. The page check runs first as the page extension might
        // be ".html". Index files are served directly; only the servlet
        // and listing branches insist on a canonical directory URL.
        if let Some(index) = &self.page_index_name {
            if names.iter().any(|n| n == index) {
                return self.serve_page(request, &fspath.join(index), url_path);
            }
        }
        if names.iter().any(|n| n == "index.html") {
            return reply_file(request, &fspath.join("index.html"));
        }
        if self.ctx.servlets.is_some() && names.iter().any(|n| n == "servlet.rs") {
            if let Some(canonical) = canonical_dir_path(url_path) {
                debug!("http"; "redirect {:?} to canonical {:?}", url_path, canonical);
                return reply_redirect(request, &canonical);
            }
            return self.serve_servlet(request, fspath, url_path, query);
        }

        match &self.dirlist {
            Some(lister) => {
                if let Some(canonical) = canonical_dir_path(url_path) {
                    debug!("http"; "redirect {:?} to canonical {:?}", url_path, canonical);
                    return reply_redirect(request, &canonical);
                }
                match lister.render(fspath, url_path) {
                    Ok(html) => reply_html(request, 200, html),
                    Err(e) => reply_error(request, &e),
                }
            }
            None => reply_not_found(request),
        }
    }

    fn is_page_path(&self, fspath: &Path) -> bool {
        match &self.ctx.pages {
            None => false,
            Some(pc) => fspath
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(pc.fileext()))
                .unwrap_or(false),
        }
    }

    fn serve_page(
        &self,
        request: Request,
        fspath: &Path,
        url_path: &str,
    ) -> std::io::Result<()> {
        let cache = self.ctx.pages.as_ref().expect("pages enabled");

        let page = match cache.get(&mut BuildContext::new(), fspath) {
            Err(e) => return reply_error(request, &e),
            Ok(p) => p,
        };
        if let Some(e) = &page.build_err {
            return reply_error(request, e);
        }

        let html = match page.render(url_path) {
            Err(e) => return reply_error(request, &e),
            Ok(html) => html,
        };

        let mut response = Response::from_data(html.into_bytes());
        let mut has_content_type = false;
        for (name, value) in page.headers() {
            has_content_type = has_content_type || name.eq_ignore_ascii_case("content-type");
            response = response.with_header(header(name, value));
        }
        if !has_content_type {
            response = response.with_header(header("Content-Type", util::mime::types::HTML));
        }

        request.respond(response)
    }

    /// A servlet is always a directory with a `servlet.rs` file.
    fn serve_servlet(
        &self,
        mut request: Request,
        fspath: &Path,
        url_path: &str,
        query: &str,
    ) -> std::io::Result<()> {
        let cache = self.ctx.servlets.as_ref().expect("servlets enabled");

        let name = util::rel_file(&self.ctx.pubdir, fspath)
            .to_string_lossy()
            .into_owned();

        let servlet = match cache.get(&name) {
            Err(e) => return reply_error(request, &e),
            Ok(s) => s,
        };
        if let Some(e) = &servlet.build_err {
            return reply_error(request, e);
        }

        let mut body = Vec::new();
        let _ = request.as_reader().read_to_end(&mut body);
        let method = request.method().to_string();

        let abi_req = AbiRequest {
            method: AbiStr::new(&method),
            path: AbiStr::new(url_path),
            query: AbiStr::new(query),
            body: AbiBytes::new(&body),
        };

        let mut sink = ResponseSink::new();
        let mut abi_resp = sink.abi_response();
        if let Err(e) = servlet.serve(&abi_req, &mut abi_resp) {
            return reply_error(request, &e);
        }

        let status = sink.status();
        let mut response = Response::from_data(sink.body).with_status_code(StatusCode(status));
        for (name, value) in &sink.headers {
            response = response.with_header(header(name, value));
        }
        request.respond(response)
    }
}

/// The canonical form of a directory URL ends in a slash and contains no
/// redundant segments. Returns the redirect target when `path` deviates.
fn canonical_dir_path(path: &str) -> Option<String> {
    let mut cleaned = util::clean_path(Path::new(path))
        .to_string_lossy()
        .into_owned();
    if cleaned.is_empty() {
        cleaned = "/".to_string();
    }
    if cleaned != "/" {
        cleaned.push('/');
    }
    if path == cleaned {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_dir_path() {
        assert_eq!(canonical_dir_path("/a/"), None);
        assert_eq!(canonical_dir_path("/"), None);
        assert_eq!(canonical_dir_path("/a"), Some("/a/".to_string()));
        assert_eq!(canonical_dir_path("/a//b"), Some("/a/b/".to_string()));
        assert_eq!(canonical_dir_path("/a/./b/"), Some("/a/b/".to_string()));
    }
}
