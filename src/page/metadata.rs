//! Page front matter: an optional YAML block delimited by `---` lines.
//!
//! A metadata block starts with a line of three or more dashes (possibly
//! preceded by blank lines) and ends at the next such line. Template source
//! begins after the closing delimiter. A closing delimiter at EOF with no
//! trailing newline is accepted.

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::RspError;

/// Parsed page metadata. All fields are optional; unknown keys collect
/// into `custom` and are exposed to templates under `.Meta`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PageMetadata {
    /// Selects the template engine: containing "html" or "xml" (or empty)
    /// means the HTML-escaping engine, anything else the text engine.
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Another page used as a layout for this one.
    pub parent: Option<String>,

    /// Template delimiter pair. Anything but exactly two entries is a
    /// parse error.
    pub template_delims: Vec<String>,

    /// Response headers emitted when serving the page.
    pub headers: FxHashMap<String, String>,

    /// Free-form remainder of the block.
    #[serde(flatten)]
    pub custom: FxHashMap<String, serde_yaml::Value>,
}

impl PageMetadata {
    /// True when the `type` field selects the HTML-escaping engine.
    pub fn wants_html_engine(&self) -> bool {
        match self.kind.as_deref() {
            None | Some("") => true,
            Some(t) => t.contains("html") || t.contains("xml"),
        }
    }
}

/// Locate the start of a metadata block.
/// Returns `(index past the opening delimiter line, lines consumed so far)`.
fn find_metadata_start(source: &str) -> Option<(usize, usize)> {
    let bytes = source.as_bytes();
    let mut i = 0;
    let mut lines = 0;

    // skip leading whitespace, counting lines
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' => i += 1,
            b'\n' => {
                lines += 1;
                i += 1;
            }
            _ => break,
        }
    }

    // the first non-whitespace run must be 3+ dashes ending in a newline
    let sep_start = i;
    while i < bytes.len() && bytes[i] == b'-' {
        i += 1;
    }
    if i - sep_start < 3 || i >= bytes.len() || bytes[i] != b'\n' {
        return None;
    }

    Some((i + 1, lines + 1))
}

/// Locate the end of a metadata block that started at `start`.
/// Returns `(index of the inner end, index past the closing delimiter)`.
fn find_metadata_end(source: &str, start: usize) -> Option<(usize, usize)> {
    let x = source[start..].find("\n---")?;
    let inner_end = start + x;
    let mut i = inner_end + 4;

    let bytes = source.as_bytes();
    while i < bytes.len() && bytes[i] == b'-' {
        i += 1;
    }

    if i < bytes.len() {
        // not EOF: the delimiter line must end here
        if bytes[i] != b'\n' {
            return None;
        }
        i += 1;
    }

    Some((inner_end, i))
}

/// Parse the metadata block of `source`, if any.
///
/// Returns the metadata and the byte offset where template source begins.
/// `(None, 0)` when the source has no block. YAML errors are reparsed with
/// the consumed leading lines prepended so their line numbers match the
/// user's view of the file.
pub fn parse_metadata(
    name: &str,
    source: &str,
) -> Result<(Option<PageMetadata>, usize), RspError> {
    let Some((inner_start, leading_lines)) = find_metadata_start(source) else {
        return Ok((None, 0));
    };
    let Some((inner_end, outer_end)) = find_metadata_end(source, inner_start) else {
        return Ok((None, 0));
    };

    let yaml_source = &source[inner_start..inner_end];

    match serde_yaml::from_str::<PageMetadata>(yaml_source) {
        Ok(meta) => Ok((Some(meta), outer_end)),
        Err(_) => {
            // reparse with blank lines prepended for a diagnostic whose
            // line number matches the source file
            let padded = format!("{}{}", "\n".repeat(leading_lines), yaml_source);
            let err = serde_yaml::from_str::<PageMetadata>(&padded)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "invalid metadata".to_string());
            Err(RspError::TemplateParse(format!("{name}: {err}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_metadata() {
        let (meta, end) = parse_metadata("p.rsp", "<html>{.URL}</html>").unwrap();
        assert!(meta.is_none());
        assert_eq!(end, 0);
    }

    #[test]
    fn test_basic_block() {
        let src = "---\nparent: base.rsp\ntype: html\n---\nbody";
        let (meta, end) = parse_metadata("p.rsp", src).unwrap();
        let meta = meta.unwrap();
        assert_eq!(meta.parent.as_deref(), Some("base.rsp"));
        assert!(meta.wants_html_engine());
        assert_eq!(&src[end..], "body");
    }

    #[test]
    fn test_leading_blank_lines() {
        let src = "\n\n----\na: 1\n----\nrest";
        let (meta, end) = parse_metadata("p.rsp", src).unwrap();
        assert!(meta.is_some());
        assert_eq!(&src[end..], "rest");
    }

    #[test]
    fn test_closing_delimiter_at_eof() {
        let src = "---\nparent: base.rsp\n---";
        let (meta, end) = parse_metadata("p.rsp", src).unwrap();
        assert_eq!(meta.unwrap().parent.as_deref(), Some("base.rsp"));
        assert_eq!(end, src.len());
    }

    #[test]
    fn test_two_dashes_is_not_a_block() {
        let (meta, end) = parse_metadata("p.rsp", "--\na: 1\n--\nx").unwrap();
        assert!(meta.is_none());
        assert_eq!(end, 0);
    }

    #[test]
    fn test_unterminated_block_is_plain_source() {
        let (meta, end) = parse_metadata("p.rsp", "---\na: 1\nno closer").unwrap();
        assert!(meta.is_none());
        assert_eq!(end, 0);
    }

    #[test]
    fn test_custom_fields_and_headers() {
        let src = "---\nheaders:\n  x-frame-options: deny\nauthor: sam\n---\n";
        let (meta, _) = parse_metadata("p.rsp", src).unwrap();
        let meta = meta.unwrap();
        assert_eq!(meta.headers.get("x-frame-options").unwrap(), "deny");
        assert_eq!(
            meta.custom.get("author"),
            Some(&serde_yaml::Value::String("sam".into()))
        );
    }

    #[test]
    fn test_text_type_disables_html_engine() {
        let src = "---\ntype: text/plain\n---\n";
        let (meta, _) = parse_metadata("p.rsp", src).unwrap();
        assert!(!meta.unwrap().wants_html_engine());
    }

    #[test]
    fn test_yaml_error_reports_shifted_line() {
        // opening delimiter occupies line 1, bad yaml on line 3
        let src = "---\nok: 1\n  bad indent: [\n---\nx";
        let err = parse_metadata("p.rsp", src).unwrap_err();
        assert!(err.to_string().contains("p.rsp"), "got {err}");
    }
}
