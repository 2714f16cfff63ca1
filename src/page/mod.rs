//! Page artifacts: parsed template trees with optional front matter and an
//! optional parent (layout) chain.

pub mod metadata;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::RspError;
use crate::template::{TemplateSet, Value};
use crate::util;

pub use metadata::PageMetadata;

/// One built generation of a page.
///
/// A page with a build error is still a valid artifact: it is installed in
/// the cache and keeps returning the same error until its source changes.
pub struct Page {
    /// Absolute source path.
    pub srcpath: PathBuf,
    /// User-visible name, relative to the pub dir.
    pub name: String,
    /// Build timestamp (unix nanoseconds); the artifact version.
    pub mtime: i64,
    /// Source file identity fingerprint at build time.
    pub fileid: u64,
    pub build_err: Option<RspError>,
    /// Name of a related page that was missing at build time; forces a
    /// rebuild on the next access so it can be picked up once created.
    pub related_page_missing: String,
    pub meta: Option<PageMetadata>,
    pub templates: Option<TemplateSet>,
    pub parent: Option<Arc<Page>>,
}

impl Page {
    /// True if the page's source, or any parent source, changed since the
    /// page was built.
    pub fn older_than_source(&self, d: &fs::Metadata) -> bool {
        if util::file_id(d) != self.fileid
            || util::mtime_ns(d) > self.mtime
            || !self.related_page_missing.is_empty()
        {
            return true;
        }

        if let Some(parent) = &self.parent {
            return match fs::metadata(&parent.srcpath) {
                Ok(pd) => parent.older_than_source(&pd),
                Err(_) => true,
            };
        }

        false
    }

    /// Response headers from the metadata block.
    pub fn headers(&self) -> impl Iterator<Item = (&String, &String)> {
        self.meta.iter().flat_map(|m| m.headers.iter())
    }

    /// Render the page for a request path.
    ///
    /// With a parent chain this is a fold: the page renders first, then
    /// each ancestor renders with the accumulated output as `.Content`,
    /// the outermost template producing the final body.
    pub fn render(&self, url_path: &str) -> Result<String, RspError> {
        if let Some(err) = &self.build_err {
            return Err(err.clone());
        }
        let templates = self
            .templates
            .as_ref()
            .ok_or_else(|| RspError::Other(format!("page {} has no templates", self.name)))?;

        let mut page = self;
        let mut content = String::new();

        while page.parent.is_some() {
            let data = self.page_data(url_path, content);
            content = templates.exec_named(&page.name, &data)?;
            page = page.parent.as_deref().unwrap();
        }

        let data = self.page_data(url_path, content);
        templates.exec_named(&page.name, &data)
    }

    /// The root render context: request URL, metadata and accumulated
    /// inner content.
    fn page_data(&self, url_path: &str, content: String) -> Value {
        let mut m = Value::map();
        m.insert("URL".into(), Value::Str(url_path.to_string()));
        m.insert("Meta".into(), self.meta_value());
        m.insert("Content".into(), Value::Html(content));
        Value::Map(m)
    }

    fn meta_value(&self) -> Value {
        let Some(meta) = &self.meta else {
            return Value::Null;
        };
        let mut m = Value::map();
        for (k, v) in &meta.custom {
            m.insert(k.clone(), Value::from(v.clone()));
        }
        if let Some(kind) = &meta.kind {
            m.insert("type".into(), Value::Str(kind.clone()));
        }
        if let Some(parent) = &meta.parent {
            m.insert("parent".into(), Value::Str(parent.clone()));
        }
        Value::Map(m)
    }
}

/// Resolve a related page name against a base source file.
///
/// A leading `/` roots the name at the pub dir; otherwise it resolves
/// relative to the base file's directory. The result must stay inside the
/// pub dir.
pub fn related_filename(
    pubdir: &Path,
    basename: &Path,
    othername: &str,
) -> Result<PathBuf, RspError> {
    if othername.is_empty() {
        return Err(RspError::Other("empty filename".into()));
    }

    let fnm = if let Some(rooted) = othername.strip_prefix('/') {
        pubdir.join(rooted.trim_start_matches('/'))
    } else {
        basename
            .parent()
            .unwrap_or(Path::new(""))
            .join(othername)
    };
    let fnm = util::clean_path(&fnm);

    if !fnm.starts_with(pubdir) {
        return Err(RspError::Other(format!("file not found {othername}")));
    }
    Ok(fnm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_filename_rooted() {
        let pubdir = Path::new("/srv/pub");
        let base = Path::new("/srv/pub/blog/post.rsp");
        assert_eq!(
            related_filename(pubdir, base, "/layout/base.rsp").unwrap(),
            PathBuf::from("/srv/pub/layout/base.rsp")
        );
    }

    #[test]
    fn test_related_filename_relative() {
        let pubdir = Path::new("/srv/pub");
        let base = Path::new("/srv/pub/blog/post.rsp");
        assert_eq!(
            related_filename(pubdir, base, "base.rsp").unwrap(),
            PathBuf::from("/srv/pub/blog/base.rsp")
        );
        assert_eq!(
            related_filename(pubdir, base, "../base.rsp").unwrap(),
            PathBuf::from("/srv/pub/base.rsp")
        );
    }

    #[test]
    fn test_related_filename_escape_rejected() {
        let pubdir = Path::new("/srv/pub");
        let base = Path::new("/srv/pub/blog/post.rsp");
        assert!(related_filename(pubdir, base, "../../etc/passwd").is_err());
        assert!(related_filename(pubdir, base, "").is_err());
    }
}
