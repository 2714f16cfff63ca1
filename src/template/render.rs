//! Template execution.

use std::fmt::Write as _;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::value::escape_html;
use super::{Arg, EngineKind, HelpersMap, Node, Value};
use crate::error::RspError;

/// Bound on nested `{template ...}` includes; self-including template
/// names would otherwise recurse without limit.
const MAX_INCLUDE_DEPTH: usize = 64;

/// A set of named, parsed templates sharing one escaping discipline and
/// one helper registry.
#[derive(Clone)]
pub struct TemplateSet {
    name: String,
    kind: EngineKind,
    templates: FxHashMap<String, Arc<Vec<Node>>>,
    helpers: Arc<HelpersMap>,
}

impl TemplateSet {
    pub fn new(name: &str, kind: EngineKind, helpers: Arc<HelpersMap>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            templates: FxHashMap::default(),
            helpers,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Add (or replace) a named parse tree.
    pub fn add_tree(&mut self, name: &str, nodes: Arc<Vec<Node>>) {
        self.templates.insert(name.to_string(), nodes);
    }

    /// Iterate over all `(name, tree)` pairs; used to graft a parent
    /// page's templates into a child's set.
    pub fn trees(&self) -> impl Iterator<Item = (&String, &Arc<Vec<Node>>)> {
        self.templates.iter()
    }

    /// Execute the primary template.
    pub fn exec(&self, data: &Value) -> Result<String, RspError> {
        self.exec_named(&self.name, data)
    }

    /// Execute a specific named template.
    pub fn exec_named(&self, name: &str, data: &Value) -> Result<String, RspError> {
        let mut out = String::new();
        self.render_named(&mut out, name, data, 0)?;
        Ok(out)
    }

    fn render_named(
        &self,
        out: &mut String,
        name: &str,
        data: &Value,
        depth: usize,
    ) -> Result<(), RspError> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(RspError::TemplateParse(format!(
                "{}: template include depth exceeded at {:?}",
                self.name, name
            )));
        }
        let nodes = self.templates.get(name).ok_or_else(|| {
            RspError::TemplateParse(format!("{}: no template {:?}", self.name, name))
        })?;
        self.render_nodes(out, &nodes.clone(), data, depth)
    }

    fn render_nodes(
        &self,
        out: &mut String,
        nodes: &[Node],
        data: &Value,
        depth: usize,
    ) -> Result<(), RspError> {
        for node in nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Var(path) => {
                    let v = data.lookup(path);
                    self.write_value(out, v)?;
                }
                Node::If { cond, then, otherwise } => {
                    let v = self.eval_arg(cond, data);
                    let branch = if v.truthy() { then } else { otherwise };
                    self.render_nodes(out, branch, data, depth)?;
                }
                Node::Include { name, arg } => {
                    let ctx = match arg {
                        Some(a) => self.eval_arg(a, data),
                        None => data.clone(),
                    };
                    self.render_named(out, name, &ctx, depth + 1)?;
                }
                Node::Call { name, args } => {
                    let helper = self.helpers.get(name.as_str()).ok_or_else(|| {
                        RspError::TemplateParse(format!(
                            "{}: unknown function {:?}",
                            self.name, name
                        ))
                    })?;
                    let argv: Vec<Value> =
                        args.iter().map(|a| self.eval_arg(a, data)).collect();
                    let v = helper(&argv)?;
                    self.write_value(out, Some(&v))?;
                }
            }
        }
        Ok(())
    }

    /// Missing values render as empty (the original's missingkey=zero).
    fn write_value(&self, out: &mut String, v: Option<&Value>) -> Result<(), RspError> {
        let Some(v) = v else { return Ok(()) };
        match (self.kind, v) {
            // pre-escaped markup passes through the HTML engine verbatim
            (EngineKind::Html, Value::Html(s)) => out.push_str(s),
            (EngineKind::Html, other) => {
                write!(out, "{}", escape_html(&other.render_raw()))?;
            }
            (EngineKind::Text, other) => out.push_str(&other.render_raw()),
        }
        Ok(())
    }

    fn eval_arg(&self, arg: &Arg, data: &Value) -> Value {
        match arg {
            Arg::Path(path) => data.lookup(path).cloned().unwrap_or(Value::Null),
            Arg::Str(s) => Value::Str(s.clone()),
            Arg::Int(n) => Value::Int(*n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{base_helpers, parse};
    use super::*;

    fn set_from(src: &str, kind: EngineKind) -> TemplateSet {
        let trees = parse("t.rsp", src, "{", "}").unwrap();
        let mut set = TemplateSet::new("t.rsp", kind, Arc::new(base_helpers()));
        for (name, nodes) in trees {
            set.add_tree(&name, Arc::new(nodes));
        }
        set
    }

    fn data() -> Value {
        let mut m = Value::map();
        m.insert("Name".into(), Value::Str("a<b".into()));
        m.insert("Content".into(), Value::Html("<p>hi</p>".into()));
        m.insert("Flag".into(), Value::Bool(true));
        Value::Map(m)
    }

    #[test]
    fn test_html_escapes_strings() {
        let set = set_from("x={.Name}", EngineKind::Html);
        assert_eq!(set.exec(&data()).unwrap(), "x=a&lt;b");
    }

    #[test]
    fn test_html_passes_trusted_content() {
        let set = set_from("{.Content}", EngineKind::Html);
        assert_eq!(set.exec(&data()).unwrap(), "<p>hi</p>");
    }

    #[test]
    fn test_text_engine_does_not_escape() {
        let set = set_from("{.Name}", EngineKind::Text);
        assert_eq!(set.exec(&data()).unwrap(), "a<b");
    }

    #[test]
    fn test_missing_key_renders_empty() {
        let set = set_from("[{.Nope.Deep}]", EngineKind::Html);
        assert_eq!(set.exec(&data()).unwrap(), "[]");
    }

    #[test]
    fn test_if_else() {
        let set = set_from("{if .Flag}y{else}n{end}", EngineKind::Html);
        assert_eq!(set.exec(&data()).unwrap(), "y");
        let set = set_from("{if .Missing}y{else}n{end}", EngineKind::Html);
        assert_eq!(set.exec(&data()).unwrap(), "n");
    }

    #[test]
    fn test_define_and_include() {
        let set = set_from(
            r#"{define "greet"}hello {.Name}{end}<{template "greet"}>"#,
            EngineKind::Html,
        );
        assert_eq!(set.exec(&data()).unwrap(), "<hello a&lt;b>");
    }

    #[test]
    fn test_helper_call() {
        let set = set_from(r#"{upper "abc"}"#, EngineKind::Html);
        assert_eq!(set.exec(&data()).unwrap(), "ABC");
    }

    #[test]
    fn test_unknown_template_errors() {
        let set = set_from(r#"{template "nope"}"#, EngineKind::Html);
        assert!(set.exec(&data()).is_err());
    }

    #[test]
    fn test_self_include_bounded() {
        // t.rsp includes itself; renderer must stop at the depth bound
        let set = set_from(r#"{template "t.rsp"}"#, EngineKind::Html);
        let err = set.exec(&data()).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }
}
