//! The servlet compiler wrapper.
//!
//! Resolved once at startup: the `rustc` binary (override with the
//! `RSP_RUSTC` environment variable), its version/host tag, and the extra
//! library search paths from the configuration. The tag namespaces the
//! on-disk build cache so artifacts from one toolchain are never loaded by
//! a host built with another.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::debug;
use crate::error::{Result, RspError};

pub struct RustTool {
    program: PathBuf,
    version_tag: String,
    lib_paths: Vec<PathBuf>,
}

impl RustTool {
    /// Resolve the compiler and probe its version. Fails when no usable
    /// `rustc` is on PATH.
    pub fn init(lib_paths: Vec<PathBuf>) -> Result<Self> {
        let program = resolve_program()?;
        let version_tag = probe_version_tag(&program)?;

        debug!("toolchain"; "using {:?} ({})", program.display(), version_tag);

        Ok(Self { program, version_tag, lib_paths })
    }

    /// E.g. `rustc-1.79.0-x86_64-unknown-linux-gnu`. Used in build
    /// directory names.
    pub fn version_tag(&self) -> &str {
        &self.version_tag
    }

    /// Compile `servlet.rs` in `srcdir` to a shared library at `libfile`.
    /// `version` feeds `-C metadata` so symbols stay unique across
    /// generations of the same unit.
    pub fn build_cdylib(
        &self,
        srcdir: &Path,
        libfile: &Path,
        version: i64,
    ) -> std::io::Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(srcdir)
            .arg("--edition")
            .arg("2021")
            .arg("--crate-type")
            .arg("cdylib")
            .arg("-C")
            .arg(format!("metadata={version}"))
            .arg("-o")
            .arg(libfile)
            .arg("servlet.rs");

        for p in &self.lib_paths {
            cmd.arg("-L").arg(p);
        }

        cmd.output()
    }
}

fn resolve_program() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("RSP_RUSTC") {
        let p = PathBuf::from(p);
        if p.is_file() {
            return Ok(p);
        }
        return Err(RspError::ConfigInvalid(format!(
            "RSP_RUSTC points at {:?}, which is not a file",
            p.display()
        )));
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join("rustc");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(RspError::ConfigInvalid(
        "rustc not found on PATH; servlets need the Rust toolchain".into(),
    ))
}

/// Run `rustc -vV` and condense the `release` and `host` lines into a tag.
fn probe_version_tag(program: &Path) -> Result<String> {
    let out = Command::new(program)
        .arg("-vV")
        .output()
        .map_err(|e| RspError::ConfigInvalid(format!("failed to run {program:?}: {e}")))?;

    if !out.status.success() {
        return Err(RspError::ConfigInvalid(format!(
            "{program:?} -vV exited with {}",
            out.status
        )));
    }

    let stdout = String::from_utf8_lossy(&out.stdout);
    parse_version_tag(&stdout).ok_or_else(|| {
        RspError::ConfigInvalid(format!("unparsable `rustc -vV` output {stdout:?}"))
    })
}

fn parse_version_tag(verbose_version: &str) -> Option<String> {
    let mut release = None;
    let mut host = None;
    for line in verbose_version.lines() {
        if let Some(v) = line.strip_prefix("release: ") {
            release = Some(v.trim());
        } else if let Some(v) = line.strip_prefix("host: ") {
            host = Some(v.trim());
        }
    }
    Some(format!("rustc-{}-{}", release?, host?))
}
