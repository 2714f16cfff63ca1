//! Compiling a servlet source unit into a loadable library.

use std::path::Path;

use super::Servlet;
use crate::error::{Result, RspError};
use crate::toolchain::RustTool;
use crate::util;
use crate::log;

/// Compile the unit's `servlet.rs` into `libfile`. On success the
/// servlet's version becomes the library file's mtime.
pub fn build_servlet(s: &mut Servlet, tool: &RustTool, pubdir: &Path) -> Result<()> {
    log!("servlet"; "building {} -> {:?}", s, s.lib_file.display());

    if let Some(parent) = s.lib_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let out = tool
        .build_cdylib(&s.dir, &s.lib_file, s.version)
        .map_err(|e| RspError::Other(format!("failed to spawn compiler: {e}")))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        log!("servlet"; "build failed: {}\n{}", out.status, stderr);
        let srcdir = util::rel_file(pubdir, &s.dir);
        return Err(make_build_error(
            &format!("failed to build servlet {:?}", s.name),
            &srcdir.to_string_lossy(),
            &stderr,
        ));
    }

    let meta = std::fs::metadata(&s.lib_file)?;
    s.set_version(util::mtime_ns(&meta));

    Ok(())
}

/// Turn raw compiler stderr into a `Compile` error whose diagnostics point
/// at real files.
///
/// Header lines starting with `#` are dropped. Diagnostic locations that
/// name sources relative to the build's working directory - `./x.rs:1:2`,
/// `../lib/y.rs:3:4`, or rustc's ` --> servlet.rs:5:6` arrows - are
/// rewritten to be relative to the user-visible source path.
pub fn make_build_error(msg: &str, srcdir: &str, stderr: &str) -> RspError {
    let mut lines: Vec<String> = Vec::new();

    for line in stderr.trim().lines() {
        let line = line.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        lines.push(rewrite_diag_line(line, srcdir));
    }

    RspError::Compile {
        message: msg.to_string(),
        details: lines.join("\n"),
    }
}

fn rewrite_diag_line(line: &str, srcdir: &str) -> String {
    // `./file.rs:1:2: ...` style prefixes
    let trimmed = line.trim_start();
    if trimmed.starts_with("./") || trimmed.starts_with("../") {
        if let Some(colon) = trimmed.find(':') {
            let joined = util::clean_path(&Path::new(srcdir).join(&trimmed[..colon]));
            return format!("{}{}", joined.display(), &trimmed[colon..]);
        }
    }

    // rustc arrow lines: `  --> servlet.rs:3:5`
    if let Some(arrow) = line.find("--> ") {
        let (head, loc) = line.split_at(arrow + 4);
        if !loc.starts_with('/') {
            let joined = util::clean_path(&Path::new(srcdir).join(loc.trim()));
            return format!("{head}{}", joined.display());
        }
    }

    line.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lines_dropped() {
        let err = make_build_error(
            "failed to build servlet \"demo\"",
            "demo",
            "# demo servlet build\n./servlet.rs:24:51: syntax error\n",
        );
        let RspError::Compile { details, .. } = err else {
            panic!("expected compile error")
        };
        assert!(!details.contains('#'));
        assert_eq!(details, "demo/servlet.rs:24:51: syntax error");
    }

    #[test]
    fn test_rustc_arrow_rewritten_relative_to_pubdir() {
        let stderr = "error[E0425]: cannot find value `x`\n --> servlet.rs:3:5\n  |\n3 |     x\n";
        let err = make_build_error("failed", "apps/demo", stderr);
        let RspError::Compile { details, .. } = err else {
            panic!("expected compile error")
        };
        assert!(details.contains("--> apps/demo/servlet.rs:3:5"), "{details}");
    }

    #[test]
    fn test_absolute_paths_left_alone() {
        let stderr = " --> /usr/lib/rustlib/src/core.rs:1:1\n";
        let err = make_build_error("failed", "demo", stderr);
        let RspError::Compile { details, .. } = err else {
            panic!("expected compile error")
        };
        assert_eq!(details, " --> /usr/lib/rustlib/src/core.rs:1:1");
    }

    #[test]
    fn test_parent_relative_path_normalized() {
        let err = make_build_error("failed", "apps/demo", "../shared/util.rs:9:1: bad\n");
        let RspError::Compile { details, .. } = err else {
            panic!("expected compile error")
        };
        assert_eq!(details, "apps/shared/util.rs:9:1: bad");
    }

    #[test]
    fn test_message_is_short_summary() {
        let err = make_build_error("failed to build servlet \"demo\"", "demo", "");
        assert_eq!(err.to_string(), "failed to build servlet \"demo\"");
    }
}
