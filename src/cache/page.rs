//! The page build cache.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::queue::{BuildQueue, Claim};
use super::BuildContext;
use crate::error::{Result, RspError};
use crate::page::{metadata::parse_metadata, related_filename, Page};
use crate::template::{self, EngineKind, HelpersMap, TemplateSet};
use crate::util;
use crate::{debug, log};

/// Default page source extension.
const DEFAULT_FILE_EXT: &str = ".rsp";

pub struct PageCache {
    /// Content root; page names are relative to this.
    srcdir: PathBuf,
    fileext: String,
    helpers: Arc<HelpersMap>,

    /// Keyed by absolute source path.
    items: RwLock<FxHashMap<String, Arc<Page>>>,
    queue: BuildQueue<Page>,
}

impl PageCache {
    pub fn new(srcdir: PathBuf, file_ext: Option<&str>, helpers: Arc<HelpersMap>) -> Self {
        let fileext = match file_ext {
            None | Some("") => DEFAULT_FILE_EXT.to_string(),
            // make sure it begins with a single "."
            Some(ext) => format!(".{}", ext.trim_start_matches('.')),
        };

        Self {
            srcdir,
            fileext,
            helpers,
            items: RwLock::new(FxHashMap::default()),
            queue: BuildQueue::new(),
        }
    }

    pub fn fileext(&self) -> &str {
        &self.fileext
    }

    /// Get the page for a source file, building it when missing or stale
    /// against the source's identity and modification time.
    ///
    /// Like servlets, a page that failed to build is still returned;
    /// callers check `page.build_err`.
    pub fn get(&self, bc: &mut BuildContext, path: &Path) -> Result<Arc<Page>> {
        let meta = fs::metadata(path)?;

        if let Some(p) = self.get_cached(path) {
            if !p.older_than_source(&meta) {
                // up-to date page found in cache
                return Ok(p);
            }
        }

        self.build(bc, path, &meta)
    }

    /// Unconditionally return a cached page, fresh or not.
    pub fn get_cached(&self, path: &Path) -> Option<Arc<Page>> {
        self.items.read().get(&key_of(path)).cloned()
    }

    /// Build the page from source. Concurrency-safe: calls while a page is
    /// being built multiplex onto the same build.
    fn build(&self, bc: &mut BuildContext, path: &Path, meta: &fs::Metadata) -> Result<Arc<Page>> {
        let key = key_of(path);

        loop {
            match self.queue.claim(&key) {
                Claim::Built(p) => return Ok(p),
                Claim::Retry => {
                    // the build completed between enrolment and receive
                    if let Some(p) = self.get_cached(path) {
                        return Ok(p);
                    }
                    continue;
                }
                Claim::Builder => break,
            }
        }

        let page = Arc::new(self.build_safe(bc, path, meta));

        self.items.write().insert(key.clone(), page.clone());
        self.queue.publish(&key, &page);

        Ok(page)
    }

    /// Build wrapper that never panics; on panic or error the returned
    /// page carries `build_err` and a fresh mtime so the error stays
    /// stable until the source advances.
    fn build_safe(&self, bc: &mut BuildContext, path: &Path, meta: &fs::Metadata) -> Page {
        let mut page = Page {
            srcpath: path.to_path_buf(),
            name: String::new(),
            mtime: 0,
            fileid: 0,
            build_err: None,
            related_page_missing: String::new(),
            meta: None,
            templates: None,
            parent: None,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.build_page(bc, &mut page, path, meta)
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                page.mtime = util::now_ns();
                page.build_err = Some(e);
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                log!("page"; "panic in page build: {}", msg);
                page.mtime = util::now_ns();
                page.build_err = Some(RspError::Other(msg));
            }
        }

        page
    }

    fn build_page(
        &self,
        bc: &mut BuildContext,
        page: &mut Page,
        path: &Path,
        d: &fs::Metadata,
    ) -> Result<()> {
        // mark source file as being in the process of building
        bc.set_building(&key_of(path))?;

        // friendly name is the path relative to the pub dir
        let name = util::rel_file(&self.srcdir, path).to_string_lossy().into_owned();
        let mtime = util::now_ns();

        debug!("page"; "build {:?}", name);

        let source = fs::read_to_string(path)?;
        let (trees, meta, kind) = self.parse_page(&name, &source)?;

        page.name = name;
        page.mtime = mtime;
        page.fileid = util::file_id(d);
        page.related_page_missing.clear();

        // load the parent chain before assembling templates
        if let Some(parent_name) = meta.as_ref().and_then(|m| m.parent.clone()) {
            if !parent_name.is_empty() {
                match self.load_related_page(bc, path, &parent_name) {
                    Ok(pp) => page.parent = Some(pp),
                    Err(e) => {
                        page.related_page_missing = parent_name;
                        return Err(e);
                    }
                }
            }
        }
        page.meta = meta;

        let mut set = TemplateSet::new(&page.name, kind, self.helpers.clone());

        // primary template
        let mut trees = trees;
        let root = trees.remove(&page.name).unwrap_or_default();
        set.add_tree(&page.name, Arc::new(root));

        // graft the parent's templates
        if let Some(parent) = &page.parent {
            if let Some(pt) = &parent.templates {
                for (tname, tree) in pt.trees() {
                    debug!("page"; "add branch template: {}", tname);
                    set.add_tree(tname, tree.clone());
                }
            }
        }

        // any additional templates defined by the source file
        for (tname, tree) in trees {
            debug!("page"; "add leaf template: {}", tname);
            set.add_tree(&tname, Arc::new(tree));
        }

        page.templates = Some(set);
        page.build_err = None;
        Ok(())
    }

    /// Split metadata, pick the engine and delimiters, parse the template
    /// source. On a parse failure the source is reparsed with the
    /// newlines consumed by the metadata block prepended, so diagnostic
    /// line numbers match the user's view of the file.
    #[allow(clippy::type_complexity)]
    fn parse_page(
        &self,
        name: &str,
        source: &str,
    ) -> Result<(
        FxHashMap<String, Vec<template::Node>>,
        Option<crate::page::PageMetadata>,
        EngineKind,
    )> {
        let (meta, meta_end) = parse_metadata(name, source)?;
        let body = &source[meta_end..];

        let (delim_l, delim_r) = match meta.as_ref().map(|m| m.template_delims.as_slice()) {
            None | Some([]) => ("{".to_string(), "}".to_string()),
            Some([l, r]) => (l.clone(), r.clone()),
            Some(_) => {
                return Err(RspError::TemplateParse(format!(
                    "{name}: incorrect template metadata: \
                     template-delims should be a list of exactly two strings"
                )))
            }
        };

        let kind = match &meta {
            Some(m) if !m.wants_html_engine() => EngineKind::Text,
            _ => EngineKind::Html,
        };

        let trees = match template::parse(name, body, &delim_l, &delim_r) {
            Ok(trees) => trees,
            Err(first_err) => {
                // re-parse with blank lines standing in for the metadata
                // block so the error's line number matches the file
                let nlines = source[..meta_end].matches('\n').count();
                let padded = format!("{}{}", "\n".repeat(nlines), body);
                return match template::parse(name, &padded, &delim_l, &delim_r) {
                    Err(e) => Err(e),
                    Ok(_) => Err(first_err),
                };
            }
        };

        Ok((trees, meta, kind))
    }

    /// Load another page referenced by `name` from `base`'s metadata,
    /// sharing the build context for cycle detection.
    fn load_related_page(
        &self,
        bc: &mut BuildContext,
        base: &Path,
        name: &str,
    ) -> Result<Arc<Page>> {
        let path = related_filename(&self.srcdir, base, name)?;

        if bc.is_building(&key_of(&path)) {
            // relationship cycle
            return Err(RspError::CyclicRelationship {
                a: util::rel_file(&self.srcdir, base).to_string_lossy().into_owned(),
                b: util::rel_file(&self.srcdir, &path).to_string_lossy().into_owned(),
            });
        }

        if !path.exists() {
            return Err(RspError::Other(format!("parent not found {name:?}")));
        }

        let page = self.get(bc, &path)?;
        if let Some(e) = &page.build_err {
            return Err(e.clone());
        }
        Ok(page)
    }
}

fn key_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during build".to_string()
    }
}
