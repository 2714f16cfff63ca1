//! The servlet build/load cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::queue::{BuildQueue, Claim};
use crate::error::{Result, RspError};
use crate::servlet::{build::build_servlet, parse_lib_file_version, Servlet};
use crate::srcgraph::SrcGraph;
use crate::toolchain::RustTool;
use crate::util;
use crate::{debug, log};

pub struct ServletCache {
    /// Where servlet sources live (the pub dir).
    srcdir: PathBuf,
    /// Where built `.so` files are stored.
    builddir: PathBuf,
    tool: Arc<RustTool>,
    hot_reload: bool,

    items: RwLock<FxHashMap<String, Arc<Servlet>>>,
    queue: BuildQueue<Servlet>,
}

impl ServletCache {
    pub fn new(srcdir: PathBuf, builddir: PathBuf, tool: Arc<RustTool>, hot_reload: bool) -> Self {
        Self {
            srcdir,
            builddir,
            tool,
            hot_reload,
            items: RwLock::new(FxHashMap::default()),
            queue: BuildQueue::new(),
        }
    }

    /// Get the servlet for `name` (a directory path relative to the pub
    /// dir), building and loading it on demand.
    ///
    /// Always installs an artifact, even on build failure: repeat requests
    /// for a faulty servlet return the same artifact and the same error
    /// until the source changes or the servlet is removed. Callers check
    /// `servlet.build_err`.
    pub fn get(&self, name: &str) -> Result<Arc<Servlet>> {
        if name.is_empty() {
            return Err(RspError::Other("empty servlet name".into()));
        }
        if Path::new(name).is_absolute() {
            return Err(RspError::Other(format!(
                "absolute name {name:?} provided to ServletCache::get"
            )));
        }

        loop {
            // fetch already-built servlet
            let prev = self.items.read().get(name).cloned();

            if let Some(s) = &prev {
                match s.src_graph() {
                    // not observing source: cached forever
                    None => return Ok(s.clone()),
                    // library must be newer than the observed sources
                    Some(g) if s.version > g.mtime() => return Ok(s.clone()),
                    // outdated: fall through into the build queue
                    Some(_) => debug!("servlet"; "outdated {:?}/{}", name, s.version),
                }
            }

            match self.queue.claim(name) {
                Claim::Built(s) => return Ok(s),
                // the build finished before we could enrol; re-check items
                Claim::Retry => continue,
                Claim::Builder => return Ok(self.build_entry(name, prev)),
            }
        }
    }

    /// The builder path: construct, build, load and install a new
    /// generation, then release waiters and retire the predecessor.
    fn build_entry(&self, name: &str, prev: Option<Arc<Servlet>>) -> Arc<Servlet> {
        let mut s2 = Servlet::new(name, self.servlet_dir(name));

        if prev.is_none() && self.hot_reload {
            // first access: start observing the unit's sources
            let g = SrcGraph::new(&s2.dir);
            match g.scan() {
                Ok(()) => s2.set_src_graph(Some(g)),
                Err(e) => {
                    log!("servlet"; "error while scanning {:?}: {}", s2.dir.display(), e);
                    s2.build_err = Some(e);
                }
            }
        }

        s2.set_version(util::now_ns());

        if s2.build_err.is_none() {
            if prev.is_none() {
                self.build_and_load_init(&mut s2);
            } else {
                self.build_and_load(&mut s2);
            }
        }

        let s2 = Arc::new(s2);

        // install the new entry, transferring observation state from the
        // entry being replaced
        {
            let mut items = self.items.write();
            if let Some(prev) = &prev {
                s2.transfer_src_graph(prev);
            }
            items.insert(name.to_string(), s2.clone());
        }

        // wake waiters before any cleanup work
        self.queue.publish(name, &s2);

        // retire the replaced generation in the background so it cannot
        // delay waiters: remove its library file, stop it, drop symbols
        if let Some(prev) = prev {
            std::thread::spawn(move || {
                if !prev.lib_file.as_os_str().is_empty() {
                    let _ = fs::remove_file(&prev.lib_file);
                }
                prev.stop();
                prev.dealloc();
            });
        }

        s2
    }

    /// First-ever build for a name: prefer a library recycled from a
    /// previous run when it is still fresh. A recycled library that fails
    /// to load (stale toolchain, usually) is rebuilt exactly once.
    fn build_and_load_init(&self, s: &mut Servlet) {
        let existing = self.find_servlet_lib_file(&s.name);
        let mut lib_ok = false;

        if let Some(libfile) = &existing {
            if let Ok(st) = fs::metadata(libfile) {
                lib_ok = true;
                match s.src_graph() {
                    Some(g) if util::mtime_ns(&st) < g.mtime() => {
                        // source code is newer than the library file
                        s.set_version(g.mtime());
                        lib_ok = false;
                    }
                    _ => {
                        if let Some(v) = parse_lib_file_version(libfile) {
                            s.set_version(v);
                        }
                    }
                }
            }
        }

        loop {
            if lib_ok {
                s.lib_file = existing.clone().expect("lib_ok implies a libfile");
            } else {
                s.lib_file = self.servlet_lib_file(&s.name, s.version);
                if let Err(e) = build_servlet(s, &self.tool, &self.srcdir) {
                    s.build_err = Some(e);
                    return;
                }
            }

            match s.load() {
                Ok(()) => return,
                Err(e) => {
                    if lib_ok {
                        // A preexisting library that does not load anymore,
                        // commonly after a toolchain upgrade. Rebuild once.
                        log!("servlet"; "failed to load preexisting {}: {}", s, e);
                        s.set_version(util::now_ns());
                        lib_ok = false;
                        continue;
                    }
                    s.build_err = Some(e);
                    return;
                }
            }
        }
    }

    /// Rebuild of an already-known unit.
    fn build_and_load(&self, s: &mut Servlet) {
        s.lib_file = self.servlet_lib_file(&s.name, s.version);

        if let Err(e) = build_servlet(s, &self.tool, &self.srcdir) {
            s.build_err = Some(e);
            return;
        }
        if let Err(e) = s.load() {
            s.build_err = Some(e);
        }
    }

    /// Build and load every servlet in the pub tree (directories holding a
    /// `servlet.rs` marker), in parallel. Returns the first error.
    pub fn load_all(&self) -> Result<()> {
        let names = find_servlet_units(&self.srcdir);
        if names.is_empty() {
            return Ok(());
        }

        log!("servlet"; "preloading {} servlet(s)", names.len());

        let errors: Vec<RspError> = names
            .par_iter()
            .filter_map(|name| match self.get(name) {
                Err(e) => Some(e),
                Ok(s) => s.build_err.clone(),
            })
            .collect();

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every loaded servlet (graceful shutdown).
    pub fn shutdown(&self) {
        let items: Vec<Arc<Servlet>> = self.items.read().values().cloned().collect();
        for s in items {
            s.stop();
        }
    }

    // -- paths -------------------------------------------------------------

    fn servlet_dir(&self, name: &str) -> PathBuf {
        self.srcdir.join(name)
    }

    fn servlet_lib_file(&self, name: &str, version: i64) -> PathBuf {
        self.builddir.join(name).join(format!("{version}.so"))
    }

    /// The lexicographically-last `.so` under the unit's build dir, if any.
    fn find_servlet_lib_file(&self, name: &str) -> Option<PathBuf> {
        let libdir = self.builddir.join(name);
        let entries = fs::read_dir(&libdir).ok()?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".so"))
            .collect();
        names.sort();

        names.pop().map(|n| libdir.join(n))
    }
}

/// Directories under `root` containing a `servlet.rs` marker. A servlet
/// directory's subtree is not searched further, so nested markers belong
/// to the outermost unit.
fn find_servlet_units(root: &Path) -> Vec<String> {
    let mut dirs: Vec<PathBuf> = jwalk::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().is_some_and(|n| n == "servlet.rs") && p.is_file())
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();

    // drop units nested under another unit
    let mut units: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        if !units.iter().any(|u| dir.starts_with(u) && dir != *u) {
            units.push(dir);
        }
    }

    units
        .iter()
        .map(|d| util::rel_file(root, d).to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_servlet_units_skips_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in ["a", "a/inner", "b/c"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("a/servlet.rs"), "").unwrap();
        fs::write(root.join("a/inner/servlet.rs"), "").unwrap();
        fs::write(root.join("b/c/servlet.rs"), "").unwrap();
        fs::write(root.join("b/readme.md"), "").unwrap();

        let mut units = find_servlet_units(root);
        units.sort();
        assert_eq!(units, vec!["a".to_string(), "b/c".to_string()]);
    }

    #[test]
    fn test_get_rejects_bad_names() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = test_tool();
        let cache = ServletCache::new(
            tmp.path().to_path_buf(),
            tmp.path().join("build"),
            tool,
            false,
        );
        assert!(cache.get("").is_err());
        assert!(cache.get("/abs/path").is_err());
    }

    #[test]
    fn test_find_lib_file_picks_lexicographically_last() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = test_tool();
        let cache = ServletCache::new(
            tmp.path().to_path_buf(),
            tmp.path().join("build"),
            tool,
            false,
        );

        let libdir = tmp.path().join("build/demo");
        fs::create_dir_all(&libdir).unwrap();
        fs::write(libdir.join("100.so"), "").unwrap();
        fs::write(libdir.join("200.so"), "").unwrap();
        fs::write(libdir.join("150.so"), "").unwrap();
        fs::write(libdir.join("notes.txt"), "").unwrap();

        assert_eq!(
            cache.find_servlet_lib_file("demo"),
            Some(libdir.join("200.so"))
        );
        assert_eq!(cache.find_servlet_lib_file("missing"), None);
    }

    fn test_tool() -> Arc<RustTool> {
        Arc::new(RustTool::init(Vec::new()).expect("rustc available in test env"))
    }
}
