//! Small shared utilities: monotonic mtime cells, path helpers, mime lookup.

pub mod mime;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Store `v` into `cell` if it is greater than the current value.
/// Returns true if the cell was updated.
///
/// This is the "store-if-greater" primitive every mtime update goes
/// through; `fetch_max` gives us the CAS-max loop in one call.
#[inline]
pub fn store_max(cell: &AtomicI64, v: i64) -> bool {
    cell.fetch_max(v, Ordering::AcqRel) < v
}

/// Current wall-clock time as unix nanoseconds.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Modification time of `meta` as unix nanoseconds (0 when unavailable).
pub fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Source file identity fingerprint: inode number where available,
/// falling back to file size.
#[cfg(unix)]
pub fn file_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
pub fn file_id(meta: &std::fs::Metadata) -> u64 {
    meta.len()
}

/// Path relative to `base`, or the path itself when it is not under `base`.
/// Used to turn absolute source paths into user-visible names.
pub fn rel_file<'a>(base: &Path, path: &'a Path) -> PathBuf {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem. `..` at the root of an absolute path is
/// dropped; a relative path keeps its leading `..` components, so
/// escaping references stay escaping.
pub fn clean_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // rooted paths stay rooted: /.. is /
                Some(Component::RootDir) => {}
                // nothing left to pop, or only ".." components so far
                _ => out.push(".."),
            },
            c => out.push(c),
        }
    }
    out
}

/// Slug used to namespace per-pubdir cache directories: the last two path
/// fragments (non-alphanumerics collapsed to `-`) plus a short hash.
pub fn pubdir_slug(pubdir: &Path) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(pubdir.as_os_str().as_encoded_bytes());
    let mut hash = String::with_capacity(16);
    for b in &digest[..8] {
        hash.push_str(&format!("{b:02x}"));
    }

    let comps: Vec<&str> = pubdir
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    let start = comps.len().saturating_sub(2);
    let frag: String = comps[start..].join("-");
    let frag: String = frag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect();

    format!("{frag}-{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_max() {
        let cell = AtomicI64::new(10);
        assert!(store_max(&cell, 20));
        assert_eq!(cell.load(Ordering::Acquire), 20);
        assert!(!store_max(&cell, 15));
        assert_eq!(cell.load(Ordering::Acquire), 20);
        assert!(!store_max(&cell, 20));
    }

    #[test]
    fn test_store_max_concurrent() {
        let cell = std::sync::Arc::new(AtomicI64::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let cell = cell.clone();
            handles.push(std::thread::spawn(move || {
                for v in (i * 100)..(i * 100 + 100) {
                    store_max(&cell, v);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.load(Ordering::Acquire), 799);
    }

    #[test]
    fn test_rel_file() {
        let base = Path::new("/srv/pub");
        assert_eq!(
            rel_file(base, Path::new("/srv/pub/a/b.rsp")),
            PathBuf::from("a/b.rsp")
        );
        assert_eq!(
            rel_file(base, Path::new("/etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(
            clean_path(Path::new("/srv/pub/a/../b/./c.rsp")),
            PathBuf::from("/srv/pub/b/c.rsp")
        );
        assert_eq!(clean_path(Path::new("a/b/../../..")), PathBuf::from(".."));
        assert_eq!(clean_path(Path::new("/a/../..")), PathBuf::from("/"));
    }

    #[test]
    fn test_clean_path_keeps_escaping_relatives() {
        assert_eq!(
            clean_path(&Path::new(".").join("../shared/defs.rs")),
            PathBuf::from("../shared/defs.rs")
        );
        assert_eq!(
            clean_path(Path::new("../../x.rs")),
            PathBuf::from("../../x.rs")
        );
    }

    #[test]
    fn test_pubdir_slug_stable_and_clean() {
        let a = pubdir_slug(Path::new("/home/me/site one/pub"));
        let b = pubdir_slug(Path::new("/home/me/site one/pub"));
        assert_eq!(a, b);
        assert!(a.starts_with("site-one-pub-"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, pubdir_slug(Path::new("/home/me/other/pub")));
    }
}
