//! Initial graph scan and import extraction.

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use regex::Regex;

use super::{GraphState, SrcFile, SrcGraph, SrcPackage};
use crate::debug;
use crate::error::{Result, RspError};
use crate::util;

/// Relative references a source file can make to other source files.
/// Anything resolving outside the graph root is ignored (not tracked).
fn import_patterns() -> &'static [Regex] {
    use std::sync::OnceLock;
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // #[path = "../shared/util.rs"] mod util;
            Regex::new(r#"#\[path\s*=\s*"([^"]+)"\s*\]"#).unwrap(),
            // include!("./lib/util.rs");
            Regex::new(r#"include!\(\s*"([^"]+)"\s*\)"#).unwrap(),
        ]
    })
}

fn mod_decl_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // mod name; / pub mod name;  (resolves to name.rs or name/mod.rs)
        Regex::new(r"(?m)^\s*(?:pub\s+)?mod\s+([A-Za-z_][A-Za-z0-9_]*)\s*;").unwrap()
    })
}

/// A `#[path]` attribute and the mod declaration it governs; the attr's
/// target wins, so the declaration itself must not produce a candidate.
fn pathed_mod_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"#\[path\s*=\s*"[^"]+"\s*\]\s*(?:pub\s+)?mod\s+[A-Za-z_][A-Za-z0-9_]*\s*;"#)
            .unwrap()
    })
}

/// True for files that participate in a build: `.rs`, not hidden, not an
/// editor temp file.
pub(super) fn is_source_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.starts_with('.') || name.ends_with('~') {
        return false;
    }
    path.extension().and_then(|e| e.to_str()) == Some("rs")
}

/// Directories (relative to the file's package dir) referenced by a
/// source file. Only relative references are returned; `.` means a file
/// in the same package.
pub(super) fn parse_import_dirs(pkg_dir: &str, source: &str) -> Vec<String> {
    let mut dirs = Vec::new();

    let mut add_target = |target: &Path| {
        let resolved = util::clean_path(&Path::new(pkg_dir).join(target));
        let dir = resolved
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = if dir.is_empty() { ".".to_string() } else { dir };
        if dir != pkg_dir && !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    for re in import_patterns() {
        for cap in re.captures_iter(source) {
            let raw = &cap[1];
            if Path::new(raw).is_absolute() {
                continue;
            }
            add_target(Path::new(raw));
        }
    }

    // `mod x;` resolving to `x/mod.rs` pulls in a subdirectory package;
    // `x.rs` stays inside this package and needs no edge. Declarations
    // governed by a `#[path]` attribute were handled above.
    let without_pathed = pathed_mod_pattern().replace_all(source, "");
    for cap in mod_decl_pattern().captures_iter(&without_pathed) {
        let name = &cap[1];
        add_target(Path::new(&format!("{name}/mod.rs")));
    }

    dirs
}

/// Walk the root, identify each package, enumerate sources, link packages
/// via dependant edges. Runs under the graph write lock.
pub(super) fn scan(g: &SrcGraph) -> Result<()> {
    let mut state = g.state.write();
    state.pkgmap.clear();
    state.filemap.clear();

    scan_add_pkg(g, &mut state, ".")?;
    Ok(())
}

/// Register the package at `dir` (relative to the root), its files, and
/// recursively every relative import target.
fn scan_add_pkg(
    g: &SrcGraph,
    state: &mut GraphState,
    dir: &str,
) -> Result<Arc<SrcPackage>> {
    let pkg = SrcPackage::new(dir);
    state.pkgmap.insert(dir.to_string(), pkg.clone());

    let absdir = g.rootdir.join(dir);
    let mut entries: Vec<_> = fs::read_dir(&absdir)
        .map_err(|e| RspError::Io(format!("{}: {e}", absdir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_source_file(p))
        .collect();
    entries.sort();

    if entries.is_empty() {
        return Err(RspError::Other(format!(
            "no source files found in {:?}",
            absdir.display()
        )));
    }

    let mut import_dirs: Vec<String> = Vec::new();

    for path in entries {
        let relname = util::rel_file(&g.rootdir, &path)
            .to_string_lossy()
            .into_owned();

        let source = fs::read_to_string(&path)?;
        for imp in parse_import_dirs(dir, &source) {
            if !import_dirs.contains(&imp) {
                import_dirs.push(imp);
            }
        }

        let f = add_src_file(g, state, &pkg, &relname)?.0;
        util::store_max(&pkg.srcmtime, f.mtime());
    }

    // resolve imports, scanning unseen packages on the way
    for imp in import_dirs {
        // references escaping the root are outside packages (not tracked),
        // and `mod x;` declarations only count when x/mod.rs style targets
        // actually exist as a source directory
        let abs = util::clean_path(&g.rootdir.join(&imp));
        if !abs.starts_with(&g.rootdir) {
            debug!("sg"; "ignore outside pkg {:?}", imp);
            continue;
        }
        if !dir_has_sources(&abs) {
            continue;
        }

        let dep = match state.pkgmap.get(&imp) {
            Some(p) => p.clone(),
            None => scan_add_pkg(g, state, &imp)?,
        };
        dep.add_dependant(&pkg);
    }

    util::store_max(&g.mtime, pkg.srcmtime.load(Ordering::Acquire));

    Ok(pkg)
}

/// True when `dir` exists and holds at least one buildable source file.
fn dir_has_sources(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .any(|e| e.path().is_file() && is_source_file(&e.path()))
}

/// Stat and register one source file. The second return value indicates
/// whether this was the first file added to the package.
pub(super) fn add_src_file(
    g: &SrcGraph,
    state: &mut GraphState,
    pkg: &Arc<SrcPackage>,
    relname: &str,
) -> Result<(Arc<SrcFile>, bool)> {
    let meta = fs::metadata(g.rootdir.join(relname))?;
    Ok(insert_src_file(state, pkg, relname, util::mtime_ns(&meta)))
}

/// Registration half of `add_src_file`, for callers that stat outside
/// the graph lock.
pub(super) fn insert_src_file(
    state: &mut GraphState,
    pkg: &Arc<SrcPackage>,
    relname: &str,
    mtime: i64,
) -> (Arc<SrcFile>, bool) {
    let f = Arc::new(SrcFile {
        name: relname.to_string(),
        mtime: std::sync::atomic::AtomicI64::new(mtime),
        pkg: pkg.clone(),
    });

    state.filemap.insert(relname.to_string(), f.clone());
    let firstfile = pkg.nfiles.fetch_add(1, Ordering::AcqRel) == 0;

    (f, firstfile)
}

/// Re-parse a single file's imports after an edit and register any new
/// dependency edges against already-known packages.
pub(super) fn rescan_file_imports(g: &SrcGraph, f: &Arc<SrcFile>) -> Result<()> {
    let source = fs::read_to_string(g.rootdir.join(&f.name))?;

    for imp in parse_import_dirs(&f.pkg.dir, &source) {
        if let Some(dep) = g.package(&imp) {
            dep.maybe_add_dependant(&f.pkg);
        } else {
            debug!("sg"; "unregistered package {:?} imported by {:?}", imp, f.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_attr() {
        let dirs = parse_import_dirs(".", "#[path = \"./lib/util.rs\"]\nmod util;\n");
        assert_eq!(dirs, vec!["lib".to_string()]);
    }

    #[test]
    fn test_parse_include_keeps_escaping_reference() {
        // the target's directory escapes the package; the scan later drops
        // it as outside the graph root, never as a spurious in-root package
        let dirs = parse_import_dirs(".", "include!(\"../shared/defs.rs\");\n");
        assert_eq!(dirs, vec!["../shared".to_string()]);
    }

    #[test]
    fn test_parse_mod_decl_points_at_subdir() {
        let dirs = parse_import_dirs(".", "pub mod store;\nmod other;\n");
        assert_eq!(dirs, vec!["store".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_same_package_reference_is_no_edge() {
        // a path attr naming a sibling file stays inside the package
        let dirs = parse_import_dirs(".", "#[path = \"helper.rs\"]\nmod helper;\n");
        assert!(dirs.is_empty());
    }

    #[test]
    fn test_absolute_paths_ignored() {
        let dirs = parse_import_dirs(".", "include!(\"/etc/shadow\");\n");
        assert!(dirs.is_empty());
    }

    #[test]
    fn test_is_source_file() {
        assert!(is_source_file(Path::new("a/servlet.rs")));
        assert!(!is_source_file(Path::new("a/.hidden.rs")));
        assert!(!is_source_file(Path::new("a/servlet.rs~")));
        assert!(!is_source_file(Path::new("a/readme.md")));
    }
}
