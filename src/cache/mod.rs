//! Build/load caches: build-once, reuse-many tables for servlets and pages.
//!
//! Both caches follow the same pattern: a `name -> artifact` table behind a
//! readers-writer lock, an in-flight build queue guaranteeing at most one
//! concurrent build per name (waiters multiplex onto the builder's result),
//! staleness checks against a source graph or source stat, and in-place
//! artifact hot-swap.
//!
//! Lock order: the in-flight queue mutex before the items lock; the items
//! lock before any package lock. No lock is held across file I/O or an
//! external build.

mod queue;

pub mod page;
pub mod servlet;

pub use page::PageCache;
pub use queue::{BuildQueue, Claim};
pub use servlet::ServletCache;

use rustc_hash::FxHashSet;

use crate::error::RspError;

/// Per-call-stack accumulator used during page builds to detect cyclic
/// parent references. One `BuildContext` per call stack; never crosses
/// threads.
#[derive(Default)]
pub struct BuildContext {
    building: FxHashSet<String>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_building(&self, name: &str) -> bool {
        self.building.contains(name)
    }

    /// Mark `name` as being built up this call stack.
    pub fn set_building(&mut self, name: &str) -> Result<(), RspError> {
        if !self.building.insert(name.to_string()) {
            return Err(RspError::Other(format!("already building {name}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_context_marks() {
        let mut bc = BuildContext::new();
        assert!(!bc.is_building("a"));
        bc.set_building("a").unwrap();
        assert!(bc.is_building("a"));
        assert!(bc.set_building("a").is_err());
    }
}
