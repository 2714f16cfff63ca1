//! Error kinds shared across the caches, builders and the ZDR coordinator.
//!
//! Build and load errors are *cached on artifacts* rather than raised out of
//! the cache, so the variants here are cheap to clone and carry owned
//! strings instead of source errors.

use std::fmt;

/// Errors produced by the core (caches, builders, source graph, ZDR).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RspError {
    /// The external compiler rejected a servlet source unit.
    /// `details` carries the rewritten multi-line diagnostics.
    #[error("{message}")]
    Compile { message: String, details: String },

    /// A page source failed to parse as a template.
    #[error("template parse error: {0}")]
    TemplateParse(String),

    /// A page names itself as its own (transitive) parent.
    #[error("cyclic relationship {a} -- {b}")]
    CyclicRelationship { a: String, b: String },

    /// A required symbol was absent from a loaded servlet library.
    #[error("missing {0} function")]
    MissingSymbol(String),

    /// A symbol resolved but its signature tag did not match.
    #[error("incorrect signature of {0} function")]
    SymbolSignatureMismatch(String),

    /// Filesystem watcher failure; logged, does not kill the graph.
    #[error("fs watcher error: {0}")]
    FsWatcher(String),

    #[error("zdr: timed out acquiring master role")]
    ZdrTimeout,

    #[error("zdr protocol error: {0}")]
    ZdrProtocol(String),

    #[error("zdr fd transfer failed: {0}")]
    ZdrFdTransfer(String),

    /// Startup-only, fatal.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl RspError {
    /// Multi-line diagnostics for dev-mode error bodies, when present.
    pub fn details(&self) -> Option<&str> {
        match self {
            RspError::Compile { details, .. } if !details.is_empty() => Some(details),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RspError {
    fn from(e: std::io::Error) -> Self {
        RspError::Io(e.to_string())
    }
}

impl From<fmt::Error> for RspError {
    fn from(e: fmt::Error) -> Self {
        RspError::Other(e.to_string())
    }
}

pub type Result<T, E = RspError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_details() {
        let e = RspError::Compile {
            message: "failed to build servlet \"demo\"".into(),
            details: "demo/servlet.rs:3:1: expected `;`".into(),
        };
        assert_eq!(e.to_string(), "failed to build servlet \"demo\"");
        assert!(e.details().unwrap().contains("demo/servlet.rs"));
    }

    #[test]
    fn test_non_compile_has_no_details() {
        assert!(RspError::ZdrTimeout.details().is_none());
        assert!(RspError::TemplateParse("x".into()).details().is_none());
    }
}
