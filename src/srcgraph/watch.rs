//! Filesystem observation for a source graph.
//!
//! Events are processed serially by a dedicated thread. Platform event
//! semantics are untrustworthy in the details: one edit may arrive as
//! several WRITE events, RENAME and REMOVE are frequently interchangeable,
//! and CREATE can land before the file has content. The policy here:
//! treat RENAME as disappearance, re-stat on WRITE and downgrade to
//! disappearance when the stat fails.

use std::path::Path;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use super::{scan, SrcGraph};
use crate::error::Result;
use crate::util;
use crate::{debug, log};

/// What an OS event means to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    Written,
    Removed,
}

pub(super) struct WatchHandle {
    stop_tx: Sender<()>,
    join: std::thread::JoinHandle<()>,
}

impl WatchHandle {
    pub(super) fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.join.join();
    }
}

/// Start watching every package directory of the graph and spawn the
/// event loop thread.
pub(super) fn start(g: &SrcGraph) -> Result<()> {
    // stop an earlier watcher before replacing it (rescan path)
    if let Some(prev) = g.watch.lock().take() {
        prev.stop();
    }

    let (event_tx, event_rx) = channel::unbounded::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = event_tx.send(res);
    })
    .map_err(|e| crate::error::RspError::FsWatcher(e.to_string()))?;

    {
        let state = g.state.read();
        for dir in state.pkgmap.keys() {
            let absdir = g.rootdir.join(dir);
            if let Err(e) = watcher.watch(&absdir, RecursiveMode::NonRecursive) {
                log!("sg"; "failed to watch {:?}: {}", absdir.display(), e);
            } else {
                debug!("sg"; "watching {:?}", absdir.display());
            }
        }
    }

    let (stop_tx, stop_rx) = channel::bounded::<()>(1);
    let graph = g.me.upgrade().expect("graph arc gone during scan");

    let join = std::thread::Builder::new()
        .name("srcgraph-watch".into())
        .spawn(move || event_loop(graph, watcher, event_rx, stop_rx))
        .map_err(|e| crate::error::RspError::FsWatcher(e.to_string()))?;

    *g.watch.lock() = Some(WatchHandle { stop_tx, join });
    Ok(())
}

fn event_loop(
    graph: Arc<SrcGraph>,
    watcher: RecommendedWatcher,
    event_rx: Receiver<notify::Result<notify::Event>>,
    stop_rx: Receiver<()>,
) {
    loop {
        crossbeam::channel::select! {
            recv(event_rx) -> msg => match msg {
                Ok(Ok(event)) => graph.handle_event(&event),
                Ok(Err(e)) => {
                    // watcher failure: log, stop processing, await close
                    log!("sg"; "fs watch error: {}", e);
                    break;
                }
                Err(_) => break, // watcher dropped
            },
            recv(stop_rx) -> _ => {
                debug!("sg"; "event loop stopped");
                drop(watcher);
                return;
            }
        }
    }

    // an error occurred; hold the watcher and wait for an explicit close
    let _ = stop_rx.recv();
    drop(watcher);
    debug!("sg"; "event loop stopped");
}

impl SrcGraph {
    /// Apply one filesystem event to the graph. Serial per graph.
    pub(super) fn handle_event(&self, event: &notify::Event) {
        use notify::event::{EventKind, ModifyKind};

        let change = match event.kind {
            // CHMOD and other metadata-only noise
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            // renames are semantically "file disappeared"
            EventKind::Modify(ModifyKind::Name(_)) => Change::Removed,
            EventKind::Modify(_) => Change::Written,
            EventKind::Create(_) => Change::Created,
            EventKind::Remove(_) => Change::Removed,
            _ => return,
        };

        for path in &event.paths {
            self.handle_path_change(path, change);
        }
    }

    fn handle_path_change(&self, abspath: &Path, change: Change) {
        let Ok(rel) = abspath.strip_prefix(&self.rootdir) else {
            debug!("sg"; "unexpected file outside rootdir {:?}", abspath.display());
            return;
        };
        let relname = rel.to_string_lossy().into_owned();
        debug!("sg"; "{:?} {}", change, relname);

        if let Some(f) = self.file(&relname) {
            match change {
                Change::Written => {
                    // re-stat; a failed stat means the file is gone
                    match std::fs::metadata(abspath) {
                        Ok(meta) => self.on_file_modified(&f, util::mtime_ns(&meta)),
                        Err(e) => {
                            log!("sg"; "stat failed after event on {:?}: {}", relname, e);
                            self.on_file_disappeared(&f, &relname);
                        }
                    }
                }
                Change::Removed => self.on_file_disappeared(&f, &relname),
                Change::Created => {}
            }
            return;
        }

        // unknown path: a CREATE (or a WRITE beating the CREATE event)
        // may introduce a new source file in a known package
        if !matches!(change, Change::Created | Change::Written) {
            return;
        }
        if !scan::is_source_file(abspath) {
            return;
        }

        let pkgdir = Path::new(&relname)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pkgdir = if pkgdir.is_empty() { ".".to_string() } else { pkgdir };

        let Some(pkg) = self.package(&pkgdir) else {
            // a package we never scanned; if something we track imports
            // it, that importer will be edited and dirty the graph anyway
            return;
        };

        // stat before taking the graph lock
        let meta = match std::fs::metadata(abspath) {
            Ok(m) => m,
            Err(e) => {
                log!("sg"; "file reg error {:?}: {}", relname, e);
                return;
            }
        };

        let (f, firstfile) = {
            let mut state = self.state.write();
            scan::insert_src_file(&mut state, &pkg, &relname, util::mtime_ns(&meta))
        };
        if firstfile {
            self.on_package_resuscitated(&pkg, f.mtime());
        } else {
            self.on_package_src_modified(&pkg, f.mtime());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind};
    use std::fs;

    fn event(kind: EventKind, path: &Path) -> notify::Event {
        let mut e = notify::Event::new(kind);
        e = e.add_path(path.to_path_buf());
        e
    }

    fn graph_with_one_file() -> (tempfile::TempDir, Arc<SrcGraph>) {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("servlet.rs"), "fn a() {}\n").unwrap();
        let g = SrcGraph::new(tmp.path());
        g.scan().unwrap();
        (tmp, g)
    }

    #[test]
    fn test_metadata_events_are_dropped() {
        let (_tmp, g) = graph_with_one_file();
        let before = g.mtime();
        g.handle_event(&event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Any)),
            &g.rootdir().join("servlet.rs"),
        ));
        assert_eq!(g.mtime(), before);
        g.close();
    }

    #[test]
    fn test_write_bumps_mtimes() {
        let (tmp, g) = graph_with_one_file();
        let before = g.mtime();

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(tmp.path().join("servlet.rs"), "fn a() { /* edited */ }\n").unwrap();
        g.handle_event(&event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
            &tmp.path().join("servlet.rs"),
        ));

        assert!(g.mtime() > before, "graph mtime must advance on write");
        g.close();
    }

    #[test]
    fn test_write_with_failed_stat_is_disappearance() {
        let (tmp, g) = graph_with_one_file();
        fs::remove_file(tmp.path().join("servlet.rs")).unwrap();

        g.handle_event(&event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
            &tmp.path().join("servlet.rs"),
        ));

        assert!(g.file("servlet.rs").is_none());
        assert_eq!(g.package(".").unwrap().num_files(), 0);
        g.close();
    }

    #[test]
    fn test_remove_then_create_resuscitates_package() {
        let (tmp, g) = graph_with_one_file();

        g.handle_event(&event(
            EventKind::Remove(RemoveKind::File),
            &tmp.path().join("servlet.rs"),
        ));
        assert_eq!(g.package(".").unwrap().num_files(), 0);
        let emptied_mtime = g.mtime();

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(tmp.path().join("servlet.rs"), "fn b() {}\n").unwrap();
        g.handle_event(&event(
            EventKind::Create(CreateKind::File),
            &tmp.path().join("servlet.rs"),
        ));

        let pkg = g.package(".").unwrap();
        assert_eq!(pkg.num_files(), 1);
        assert!(g.file("servlet.rs").is_some());
        assert!(g.mtime() >= emptied_mtime);
        g.close();
    }

    #[test]
    fn test_rename_treated_as_disappearance() {
        let (tmp, g) = graph_with_one_file();
        g.handle_event(&event(
            EventKind::Modify(ModifyKind::Name(notify::event::RenameMode::Any)),
            &tmp.path().join("servlet.rs"),
        ));
        assert!(g.file("servlet.rs").is_none());
        g.close();
    }

    #[test]
    fn test_unrelated_file_ignored() {
        let (tmp, g) = graph_with_one_file();
        let before = g.mtime();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        g.handle_event(&event(
            EventKind::Create(CreateKind::File),
            &tmp.path().join("notes.txt"),
        ));
        assert_eq!(g.mtime(), before);
        g.close();
    }
}
