//! Source dependency graph with filesystem observation.
//!
//! A graph tracks the `.rs` sources of one servlet unit: the root package
//! (the unit's directory) plus every package it reaches through relative
//! imports (`#[path = "…"]`, `include!("…")`, `mod name;` resolving to
//! `name/mod.rs`). Each package records the max mtime of its own sources
//! (`srcmtime`) and of its transitive dependencies (`depmtime`); the graph
//! mtime is the max over all packages. Caches compare artifact versions
//! against the graph mtime to decide staleness.
//!
//! Filesystem events keep the graph current: edits bump file, package and
//! graph mtimes; removals drop files (an emptied package object is kept so
//! a rename-in-place can resuscitate it); new files register against their
//! containing package. All mtime cells are updated with a store-if-greater
//! primitive, so propagation is idempotent and package-import cycles are
//! benign.

mod scan;
mod watch;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{Result, RspError};
use crate::util::store_max;
use crate::{debug, log};

// ---------------------------------------------------------------------------

/// One tracked source file.
pub struct SrcFile {
    /// Path relative to the graph root.
    pub name: String,
    mtime: AtomicI64,
    pkg: Arc<SrcPackage>,
}

impl SrcFile {
    pub fn mtime(&self) -> i64 {
        self.mtime.load(Ordering::Acquire)
    }

    fn update_mtime(&self, mtime: i64) -> bool {
        store_max(&self.mtime, mtime)
    }
}

// ---------------------------------------------------------------------------

/// One package: a directory of source files.
pub struct SrcPackage {
    /// Directory relative to the graph root; `.` for the root package.
    pub dir: String,
    srcmtime: AtomicI64,
    depmtime: AtomicI64,
    nfiles: AtomicI32,
    /// Packages that import this one. Append-only.
    dependants: RwLock<Vec<Arc<SrcPackage>>>,
}

impl SrcPackage {
    fn new(dir: &str) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_string(),
            srcmtime: AtomicI64::new(0),
            depmtime: AtomicI64::new(0),
            nfiles: AtomicI32::new(0),
            dependants: RwLock::new(Vec::new()),
        })
    }

    /// Number of source files that comprise the package.
    pub fn num_files(&self) -> i32 {
        self.nfiles.load(Ordering::Acquire)
    }

    /// Unix-nanosecond timestamp of the most recent modification,
    /// including dependencies.
    pub fn mod_timestamp(&self) -> i64 {
        let srcmtime = self.srcmtime.load(Ordering::Acquire);
        let depmtime = self.depmtime.load(Ordering::Acquire);
        srcmtime.max(depmtime)
    }

    fn update_srcmtime(&self, mtime: i64) -> bool {
        store_max(&self.srcmtime, mtime)
    }

    fn update_depmtime(&self, mtime: i64) -> bool {
        store_max(&self.depmtime, mtime)
    }

    /// Register `dependant` as importing `self`, updating its depmtime to
    /// at least this package's modification timestamp.
    fn add_dependant(self: &Arc<Self>, dependant: &Arc<SrcPackage>) {
        self.dependants.write().push(dependant.clone());
        dependant.update_depmtime(self.mod_timestamp());
    }

    /// `add_dependant` unless the edge already exists.
    fn maybe_add_dependant(self: &Arc<Self>, dependant: &Arc<SrcPackage>) -> bool {
        {
            let deps = self.dependants.read();
            if deps.iter().any(|p| Arc::ptr_eq(p, dependant)) {
                return false;
            }
        }
        self.add_dependant(dependant);
        true
    }
}

// ---------------------------------------------------------------------------

struct GraphState {
    pkgmap: FxHashMap<String, Arc<SrcPackage>>,
    filemap: FxHashMap<String, Arc<SrcFile>>,
}

/// The graph of one servlet unit's sources.
pub struct SrcGraph {
    rootdir: PathBuf,
    mtime: AtomicI64,
    state: RwLock<GraphState>,
    watch: Mutex<Option<watch::WatchHandle>>,
    me: Weak<SrcGraph>,
}

impl SrcGraph {
    pub fn new(rootdir: &Path) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            rootdir: rootdir.to_path_buf(),
            mtime: AtomicI64::new(0),
            state: RwLock::new(GraphState {
                pkgmap: FxHashMap::default(),
                filemap: FxHashMap::default(),
            }),
            watch: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    /// Current maximum modification timestamp observed across the graph.
    pub fn mtime(&self) -> i64 {
        self.mtime.load(Ordering::Acquire)
    }

    /// Walk the root, register packages and files, link dependency edges
    /// and start the filesystem watcher.
    pub fn scan(&self) -> Result<()> {
        scan::scan(self)?;

        if let Err(e) = watch::start(self) {
            return Err(RspError::FsWatcher(e.to_string()));
        }

        debug!("sg"; "{}: mtime {}", self.rootdir.display(), self.mtime());
        Ok(())
    }

    /// Look up a package by directory relative to the root.
    pub fn package(&self, dir: &str) -> Option<Arc<SrcPackage>> {
        self.state.read().pkgmap.get(dir).cloned()
    }

    /// Look up a file by name relative to the root.
    pub fn file(&self, name: &str) -> Option<Arc<SrcFile>> {
        self.state.read().filemap.get(name).cloned()
    }

    /// Stop the watcher and release resources.
    pub fn close(&self) {
        if let Some(handle) = self.watch.lock().take() {
            handle.stop();
        }
    }

    // -- modification plumbing ---------------------------------------------

    fn update_mtime(&self, mtime: i64) -> bool {
        store_max(&self.mtime, mtime)
    }

    fn on_graph_modified(&self, mtime: i64) {
        if self.update_mtime(mtime) {
            debug!("sg"; "graph modified; mtime {}", mtime);
        }
    }

    /// Bump a package's source mtime and fan the change out to every
    /// package that transitively depends on it. The store-if-greater
    /// update terminates recursion on cycles.
    fn on_package_src_modified(&self, pkg: &Arc<SrcPackage>, mtime: i64) {
        if pkg.update_srcmtime(mtime) {
            debug!("sg"; "package {:?} modified; mtime {}", pkg.dir, mtime);
            propagate_depmtime(pkg, mtime);
            self.on_graph_modified(mtime);
        }
    }

    /// An emptied package is kept in the registry: a rename-in-place often
    /// arrives as REMOVE followed by CREATE, and dropping the package here
    /// would lose its dependency edges.
    fn on_package_emptied(&self, pkg: &Arc<SrcPackage>, mtime: i64) {
        debug!("sg"; "package {:?} was emptied", pkg.dir);
        self.on_package_src_modified(pkg, mtime);
    }

    fn on_package_resuscitated(&self, pkg: &Arc<SrcPackage>, mtime: i64) {
        debug!("sg"; "package {:?} was resuscitated", pkg.dir);
        self.on_package_src_modified(pkg, mtime);
    }

    fn on_file_modified(&self, f: &Arc<SrcFile>, mtime: i64) {
        if f.update_mtime(mtime) {
            debug!("sg"; "file {:?} modified; mtime {}", f.name, mtime);
            if let Err(e) = scan::rescan_file_imports(self, f) {
                log!("sg"; "import rescan failed for {:?}: {}", f.name, e);
            }
            self.on_package_src_modified(&f.pkg, mtime);
        }
    }

    fn on_file_disappeared(&self, f: &Arc<SrcFile>, relname: &str) {
        debug!("sg"; "file {:?} disappeared", f.name);
        self.state.write().filemap.remove(relname);

        let mtime = crate::util::now_ns();
        let pkg = &f.pkg;
        if pkg.nfiles.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
            self.on_package_emptied(pkg, mtime);
        } else {
            self.on_package_src_modified(pkg, mtime);
        }
    }
}

impl Drop for SrcGraph {
    fn drop(&mut self) {
        if let Some(handle) = self.watch.get_mut().take() {
            handle.stop();
        }
    }
}

/// Walk dependant edges outward, raising each ancestor's depmtime.
/// Recursion stops wherever the store-if-greater does not update, which
/// makes re-entry through an import cycle a no-op.
fn propagate_depmtime(pkg: &Arc<SrcPackage>, mtime: i64) {
    let dependants: Vec<Arc<SrcPackage>> = pkg.dependants.read().clone();
    for dep in dependants {
        if dep.update_depmtime(mtime) {
            propagate_depmtime(&dep, mtime);
        }
    }
}
