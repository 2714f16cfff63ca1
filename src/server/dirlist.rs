//! HTML directory listings for directories without an index.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::DirListConfig;
use crate::error::{Result, RspError};
use crate::template::{self, base_helpers, escape_html, EngineKind, TemplateSet, Value};

/// Renders directory listings, either through a user template or a
/// built-in one.
pub struct DirLister {
    template_src: Option<std::path::PathBuf>,
}

impl DirLister {
    pub fn new(pubdir: &Path, config: &DirListConfig) -> Self {
        let template_src = if config.template.is_empty() {
            None
        } else {
            Some(pubdir.join(config.template.trim_start_matches('/')))
        };
        Self { template_src }
    }

    /// Render the listing of `dir` as it appears under `url_path`.
    pub fn render(&self, dir: &Path, url_path: &str) -> Result<String> {
        let mut entries: Vec<(String, u64, bool)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                if name.starts_with('.') {
                    return None;
                }
                let meta = e.metadata().ok()?;
                Some((name, meta.len(), meta.is_dir()))
            })
            .collect();
        entries.sort();

        match &self.template_src {
            Some(src) => self.render_template(src, url_path, &entries),
            None => Ok(render_builtin(url_path, &entries)),
        }
    }

    /// Render through a user-supplied page source. The template sees
    /// `.URL` and `.Entries` (each entry with `Name`, `Size`, `IsDir`,
    /// `URL`).
    fn render_template(
        &self,
        src: &Path,
        url_path: &str,
        entries: &[(String, u64, bool)],
    ) -> Result<String> {
        let source = fs::read_to_string(src)
            .map_err(|e| RspError::Other(format!("dir-list template: {e}")))?;
        let name = src.to_string_lossy();

        let trees = template::parse(&name, &source, "{", "}")?;
        let mut set = TemplateSet::new(&name, EngineKind::Html, Arc::new(base_helpers()));
        for (tname, nodes) in trees {
            set.add_tree(&tname, Arc::new(nodes));
        }

        let list = entries
            .iter()
            .map(|(name, size, is_dir)| {
                let mut m = Value::map();
                m.insert("Name".into(), Value::Str(name.clone()));
                m.insert("Size".into(), Value::Int(*size as i64));
                m.insert("IsDir".into(), Value::Bool(*is_dir));
                m.insert("URL".into(), Value::Str(entry_url(url_path, name, *is_dir)));
                Value::Map(m)
            })
            .collect();

        let mut data = Value::map();
        data.insert("URL".into(), Value::Str(url_path.to_string()));
        data.insert("Entries".into(), Value::List(list));

        set.exec(&Value::Map(data))
    }
}

fn entry_url(url_path: &str, name: &str, is_dir: bool) -> String {
    let slash = if is_dir { "/" } else { "" };
    format!("{}{}{}", url_path, name, slash)
}

fn render_builtin(url_path: &str, entries: &[(String, u64, bool)]) -> String {
    let mut out = String::with_capacity(512);
    let title = escape_html(url_path);
    out.push_str(&format!(
        "<html><head><title>Index of {title}</title></head><body><h1>Index of {title}</h1><ul>\n"
    ));
    if url_path != "/" {
        out.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for (name, _, is_dir) in entries {
        let href = escape_html(&entry_url("", name, *is_dir));
        let label = escape_html(name);
        let slash = if *is_dir { "/" } else { "" };
        out.push_str(&format!("<li><a href=\"{href}\">{label}{slash}</a></li>\n"));
    }
    out.push_str("</ul></body></html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_listing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "x").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join(".hidden"), "x").unwrap();

        let lister = DirLister::new(tmp.path(), &DirListConfig::default());
        let html = lister.render(tmp.path(), "/files/").unwrap();

        assert!(html.contains("a.txt"));
        assert!(html.contains("sub/"));
        assert!(!html.contains(".hidden"));
        assert!(html.contains("Index of /files/"));
    }

    #[test]
    fn test_template_listing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("one.txt"), "x").unwrap();
        fs::write(
            tmp.path().join("list.rsp"),
            "{.URL}:{if .Entries}has-entries{end}",
        )
        .unwrap();

        let config = DirListConfig {
            enabled: true,
            template: "list.rsp".to_string(),
        };
        let lister = DirLister::new(tmp.path(), &config);
        let html = lister.render(tmp.path(), "/d/").unwrap();
        assert_eq!(html, "/d/:has-entries");
    }
}
