//! Servlet artifacts: dynamically-loaded shared libraries serving HTTP.

pub mod abi;
pub mod build;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use crate::error::{Result, RspError};
use crate::log;
use crate::srcgraph::SrcGraph;

use abi::{AbiContext, AbiRequest, AbiResponse, AbiStr, LifecycleFn, ServeHttpFn};

/// Resolved symbols plus the library that owns them. The function
/// pointers are only valid while `lib` is alive, so they live and die
/// together.
#[derive(Default)]
struct Symbols {
    lib: Option<Library>,
    serve_http: Option<ServeHttpFn>,
    start_fn: Option<LifecycleFn>,
    stop_fn: Option<LifecycleFn>,
}

/// One built-and-loaded generation of a servlet.
///
/// Like pages, a servlet with a build error is still installed in the
/// cache so repeated requests return a stable error instead of a build
/// storm.
pub struct Servlet {
    /// Identifying name: the unit's directory relative to the pub dir.
    pub name: String,
    /// Absolute source directory.
    pub dir: PathBuf,
    /// Unix nanotime of the library file; the artifact version.
    pub version: i64,
    version_hex: String,
    /// Library file this generation was loaded from.
    pub lib_file: PathBuf,
    pub build_err: Option<RspError>,
    symbols: Mutex<Symbols>,
    src_graph: Mutex<Option<Arc<SrcGraph>>>,
}

impl Servlet {
    pub fn new(name: &str, dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            dir,
            version: 0,
            version_hex: String::new(),
            lib_file: PathBuf::new(),
            build_err: None,
            symbols: Mutex::new(Symbols::default()),
            src_graph: Mutex::new(None),
        }
    }

    pub fn set_version(&mut self, version: i64) {
        self.version = version;
        self.version_hex = format!("{version:x}");
    }

    /// The observed source graph, when hot-reload is on.
    pub fn src_graph(&self) -> Option<Arc<SrcGraph>> {
        self.src_graph.lock().clone()
    }

    pub fn set_src_graph(&self, g: Option<Arc<SrcGraph>>) {
        *self.src_graph.lock() = g;
    }

    /// Move the observation state from `prev` onto `self` (and vice
    /// versa), so a successor inherits the graph its predecessor built.
    pub fn transfer_src_graph(&self, prev: &Servlet) {
        let mut a = self.src_graph.lock();
        let mut b = prev.src_graph.lock();
        std::mem::swap(&mut *a, &mut *b);
    }

    fn context(&self) -> AbiContext {
        AbiContext {
            name: AbiStr::new(&self.name),
            version: AbiStr::new(&self.version_hex),
        }
    }

    /// Open the library and resolve its symbols, invoking `StartServlet`
    /// when present. Symbol errors leave the servlet unloaded.
    pub fn load(&mut self) -> Result<()> {
        log!("servlet"; "loading {:?} from {:?}", self.name, self.lib_file.display());

        let lib = unsafe { Library::new(&self.lib_file) }
            .map_err(|e| RspError::Other(format!("library open failed: {e}")))?;

        // The version tag doubles as the signature check: the loader
        // cannot inspect function types, so a library is only trusted
        // when it declares the ABI revision these types were built from.
        let abi_version = unsafe {
            match lib.get::<*const u32>(abi::SYM_ABI_VERSION) {
                Err(_) => return Err(RspError::MissingSymbol("ServletAbiVersion".into())),
                Ok(sym) => **sym,
            }
        };
        if abi_version != abi::ABI_VERSION {
            return Err(RspError::SymbolSignatureMismatch("ServeHTTP".into()));
        }

        let serve_http = unsafe {
            match lib.get::<ServeHttpFn>(abi::SYM_SERVE_HTTP) {
                Err(_) => return Err(RspError::MissingSymbol("ServeHTTP".into())),
                Ok(sym) => *sym,
            }
        };

        let start_fn = unsafe { lib.get::<LifecycleFn>(abi::SYM_START_SERVLET).ok().map(|s| *s) };
        let stop_fn = unsafe { lib.get::<LifecycleFn>(abi::SYM_STOP_SERVLET).ok().map(|s| *s) };

        {
            let mut symbols = self.symbols.lock();
            symbols.serve_http = Some(serve_http);
            symbols.start_fn = start_fn;
            symbols.stop_fn = stop_fn;
            symbols.lib = Some(lib);
        }

        if let Some(start) = start_fn {
            log!("servlet"; "{:?} call StartServlet", self.name);
            let ctx = self.context();
            unsafe { start(&ctx) };
        }

        Ok(())
    }

    /// Dispatch one request into the loaded library.
    pub fn serve(&self, req: &AbiRequest, resp: &mut AbiResponse) -> Result<()> {
        let serve = self
            .symbols
            .lock()
            .serve_http
            .ok_or_else(|| RspError::MissingSymbol("ServeHTTP".into()))?;
        unsafe { serve(req, resp) };
        Ok(())
    }

    /// Stop the instance: close observation, then `StopServlet` if any.
    pub fn stop(&self) {
        if let Some(g) = self.src_graph.lock().take() {
            g.close();
        }
        let stop_fn = self.symbols.lock().stop_fn.take();
        if let Some(stop) = stop_fn {
            log!("servlet"; "{:?} call StopServlet", self.name);
            let ctx = self.context();
            unsafe { stop(&ctx) };
        }
    }

    /// Release symbols and unload the library. The instance is never used
    /// again after this.
    pub fn dealloc(&self) {
        log!("servlet"; "{:?}/{} dealloc", self.name, self.version);
        let mut symbols = self.symbols.lock();
        symbols.serve_http = None;
        symbols.start_fn = None;
        symbols.stop_fn = None;
        symbols.lib = None; // drops and unloads
        drop(symbols);

        if let Some(g) = self.src_graph.lock().take() {
            g.close();
        }
    }

    /// Start observing the unit's sources for changes.
    pub fn init_hot_reload(&self) -> Result<()> {
        if let Some(prev) = self.src_graph.lock().take() {
            prev.close();
        }
        let g = SrcGraph::new(&self.dir);
        g.scan()?;
        *self.src_graph.lock() = Some(g);
        Ok(())
    }
}

impl std::fmt::Display for Servlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Parse the version out of a `<version>.so` filename.
/// Non-numeric names yield `None` (the file is not one of ours).
pub fn parse_lib_file_version(libfile: &Path) -> Option<i64> {
    libfile
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lib_file_version() {
        assert_eq!(
            parse_lib_file_version(Path::new("/x/demo/1722170000000000000.so")),
            Some(1722170000000000000)
        );
        assert_eq!(parse_lib_file_version(Path::new("/x/demo/stray.so")), None);
    }

    #[test]
    fn test_version_hex_tracks_version() {
        let mut s = Servlet::new("demo", PathBuf::from("/tmp/demo"));
        s.set_version(255);
        assert_eq!(s.version_hex, "ff");
    }

    #[test]
    fn test_src_graph_transfer_swaps() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("servlet.rs"), "fn x() {}\n").unwrap();

        let prev = Servlet::new("demo", tmp.path().to_path_buf());
        let g = SrcGraph::new(tmp.path());
        prev.set_src_graph(Some(g));

        let next = Servlet::new("demo", tmp.path().to_path_buf());
        next.transfer_src_graph(&prev);

        assert!(next.src_graph().is_some());
        assert!(prev.src_graph().is_none());
    }

    #[test]
    fn test_serve_without_load_is_missing_symbol() {
        let s = Servlet::new("demo", PathBuf::from("/tmp/demo"));
        let req = AbiRequest {
            method: AbiStr::new("GET"),
            path: AbiStr::new("/demo/"),
            query: AbiStr::new(""),
            body: abi::AbiBytes::new(b""),
        };
        let mut sink = abi::ResponseSink::new();
        let mut resp = sink.abi_response();
        assert!(matches!(
            s.serve(&req, &mut resp),
            Err(RspError::MissingSymbol(_))
        ));
    }
}
