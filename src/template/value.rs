//! Render context values.

use rustc_hash::FxHashMap;

/// A value in a template render context.
///
/// `Html` marks a string as pre-escaped markup: the HTML engine writes it
/// through verbatim. Layered page renders use this for the inner `Content`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Html(String),
    List(Vec<Value>),
    Map(FxHashMap<String, Value>),
}

impl Value {
    /// Map constructor shorthand.
    pub fn map() -> FxHashMap<String, Value> {
        FxHashMap::default()
    }

    /// Resolve a dotted path. An empty path is the value itself.
    /// Missing keys resolve to `None` (rendered as empty).
    pub fn lookup(&self, path: &[String]) -> Option<&Value> {
        let mut cur = self;
        for key in path {
            match cur {
                Value::Map(m) => cur = m.get(key)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    /// Truthiness, for `{if ...}`: null, false, zero, empty string/list/map
    /// are false; everything else is true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) | Value::Html(s) => !s.is_empty(),
            Value::List(v) => !v.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    /// The raw (unescaped) textual form of the value.
    pub fn render_raw(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) | Value::Html(s) => s.clone(),
            Value::List(v) => {
                let parts: Vec<String> = v.iter().map(Value::render_raw).collect();
                parts.join(", ")
            }
            Value::Map(_) => String::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(v: serde_yaml::Value) -> Self {
        match v {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_yaml::Value::String(s) => Value::Str(s),
            serde_yaml::Value::Sequence(seq) => {
                Value::List(seq.into_iter().map(Value::from).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let mut out = FxHashMap::default();
                for (k, v) in map {
                    if let serde_yaml::Value::String(k) = k {
                        out.insert(k, Value::from(v));
                    }
                }
                Value::Map(out)
            }
            serde_yaml::Value::Tagged(t) => Value::from(t.value),
        }
    }
}

/// Escape `s` for interpolation into HTML text content.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_nested() {
        let mut inner = Value::map();
        inner.insert("b".into(), Value::Int(7));
        let mut outer = Value::map();
        outer.insert("a".into(), Value::Map(inner));
        let v = Value::Map(outer);

        assert_eq!(v.lookup(&["a".into(), "b".into()]), Some(&Value::Int(7)));
        assert_eq!(v.lookup(&["a".into(), "x".into()]), None);
        assert_eq!(v.lookup(&[]), Some(&v));
    }

    #[test]
    fn test_truthy() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::List(vec![Value::Null]).truthy());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&#34;x&#34;&gt;&amp;&#39;");
    }

    #[test]
    fn test_from_yaml() {
        let y: serde_yaml::Value = serde_yaml::from_str("a: [1, two]\nb: true").unwrap();
        let v = Value::from(y);
        assert_eq!(
            v.lookup(&["a".into()]),
            Some(&Value::List(vec![Value::Int(1), Value::Str("two".into())]))
        );
        assert_eq!(v.lookup(&["b".into()]), Some(&Value::Bool(true)));
    }
}
