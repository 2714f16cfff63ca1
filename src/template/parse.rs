//! Template source -> named parse trees.

use rustc_hash::FxHashMap;

use super::{Arg, Node};
use crate::error::RspError;

/// Parse `source` into named templates using the given delimiters.
///
/// The primary template is stored under `name`; every `{define "x"}` block
/// adds another entry. Errors carry `name:line:` so diagnostics point at
/// the user's source (callers prepend blank lines when the source was
/// offset by a metadata block).
pub fn parse(
    name: &str,
    source: &str,
    delim_l: &str,
    delim_r: &str,
) -> Result<FxHashMap<String, Vec<Node>>, RspError> {
    if delim_l.is_empty() || delim_r.is_empty() {
        return Err(err(name, 1, "empty template delimiter"));
    }

    let tokens = tokenize(name, source, delim_l, delim_r)?;
    let mut stream = tokens.into_iter().peekable();

    let mut templates = FxHashMap::default();
    let (root, term) = parse_block(name, &mut stream, &mut templates, true)?;
    if let Some((kw, line)) = term {
        return Err(err(name, line, &format!("unexpected {{{kw}}}")));
    }
    templates.insert(name.to_string(), root);
    Ok(templates)
}

fn err(name: &str, line: usize, msg: &str) -> RspError {
    RspError::TemplateParse(format!("{name}:{line}: {msg}"))
}

// ---------------------------------------------------------------------------
// Tokenizer

enum Token {
    Text(String),
    /// Action body (delimiters stripped) and the line it starts on.
    Action(String, usize),
}

fn tokenize(
    name: &str,
    source: &str,
    delim_l: &str,
    delim_r: &str,
) -> Result<Vec<Token>, RspError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut line = 1usize;

    while !rest.is_empty() {
        match rest.find(delim_l) {
            None => {
                tokens.push(Token::Text(rest.to_string()));
                break;
            }
            Some(i) => {
                if i > 0 {
                    let text = &rest[..i];
                    line += text.matches('\n').count();
                    tokens.push(Token::Text(text.to_string()));
                }
                let action_line = line;
                let body_start = i + delim_l.len();
                let body = &rest[body_start..];
                let end = find_action_end(body, delim_r)
                    .ok_or_else(|| err(name, action_line, "unclosed action"))?;
                let action = &body[..end];
                line += action.matches('\n').count();
                tokens.push(Token::Action(action.trim().to_string(), action_line));
                rest = &body[end + delim_r.len()..];
                continue;
            }
        }
    }

    Ok(tokens)
}

/// Find the closing delimiter of an action, skipping quoted strings.
/// Byte-wise scan; a valid UTF-8 needle only matches at char boundaries.
fn find_action_end(body: &str, delim_r: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let delim = delim_r.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            // skip string literal
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            continue;
        }
        if bytes[i..].starts_with(delim) {
            return Some(i);
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Block parser

type Stream = std::iter::Peekable<std::vec::IntoIter<Token>>;

/// Parse nodes until a block terminator (`end` / `else`) or end of input.
/// Returns the nodes and the terminator that stopped the block, if any.
fn parse_block(
    name: &str,
    stream: &mut Stream,
    templates: &mut FxHashMap<String, Vec<Node>>,
    top_level: bool,
) -> Result<(Vec<Node>, Option<(String, usize)>), RspError> {
    let mut nodes = Vec::new();

    while let Some(token) = stream.next() {
        let (action, line) = match token {
            Token::Text(t) => {
                nodes.push(Node::Text(t));
                continue;
            }
            Token::Action(a, line) => (a, line),
        };

        if action.is_empty() {
            return Err(err(name, line, "empty action"));
        }

        let words = split_words(name, line, &action)?;
        let head = &words[0];

        match head.as_str() {
            "end" | "else" => {
                if words.len() > 1 {
                    return Err(err(name, line, &format!("extra arguments after {head}")));
                }
                return Ok((nodes, Some((head.clone(), line))));
            }
            "define" => {
                if !top_level {
                    return Err(err(name, line, "define inside another block"));
                }
                let tname = match words.get(1).map(|w| parse_arg(name, line, w)) {
                    Some(Ok(Arg::Str(s))) if words.len() == 2 => s,
                    _ => return Err(err(name, line, "define expects one quoted name")),
                };
                let (body, term) = parse_block(name, stream, templates, false)?;
                match term {
                    Some((kw, _)) if kw == "end" => {}
                    _ => return Err(err(name, line, "unterminated define")),
                }
                templates.insert(tname, body);
            }
            "if" => {
                if words.len() != 2 {
                    return Err(err(name, line, "if expects one argument"));
                }
                let cond = parse_arg(name, line, &words[1])?;
                let (then, term) = parse_block(name, stream, templates, false)?;
                let (otherwise, term) = match term {
                    Some((kw, _)) if kw == "else" => {
                        let (other, t) = parse_block(name, stream, templates, false)?;
                        (other, t)
                    }
                    other => (Vec::new(), other),
                };
                match term {
                    Some((kw, _)) if kw == "end" => {}
                    _ => return Err(err(name, line, "unterminated if")),
                }
                nodes.push(Node::If { cond, then, otherwise });
            }
            "template" => {
                let tname = match words.get(1).map(|w| parse_arg(name, line, w)) {
                    Some(Ok(Arg::Str(s))) => s,
                    _ => return Err(err(name, line, "template expects a quoted name")),
                };
                let arg = match words.len() {
                    2 => None,
                    3 => Some(parse_arg(name, line, &words[2])?),
                    _ => return Err(err(name, line, "too many arguments to template")),
                };
                nodes.push(Node::Include { name: tname, arg });
            }
            _ if head.starts_with('.') => {
                if words.len() > 1 {
                    return Err(err(name, line, "unexpected arguments after field"));
                }
                nodes.push(Node::Var(split_path(head)));
            }
            _ if is_ident(head) => {
                let mut args = Vec::with_capacity(words.len() - 1);
                for w in &words[1..] {
                    args.push(parse_arg(name, line, w)?);
                }
                nodes.push(Node::Call { name: head.clone(), args });
            }
            _ => return Err(err(name, line, &format!("unexpected {head:?} in action"))),
        }
    }

    Ok((nodes, None))
}

fn split_path(word: &str) -> Vec<String> {
    word.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_ident(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_arg(name: &str, line: usize, word: &str) -> Result<Arg, RspError> {
    if word.starts_with('.') {
        return Ok(Arg::Path(split_path(word)));
    }
    if let Some(inner) = word.strip_prefix('"') {
        let inner = inner.strip_suffix('"').unwrap_or(inner);
        return Ok(Arg::Str(unescape(inner)));
    }
    if let Ok(n) = word.parse::<i64>() {
        return Ok(Arg::Int(n));
    }
    Err(err(name, line, &format!("invalid argument {word:?}")))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split an action body into words, keeping quoted strings intact.
fn split_words(name: &str, line: usize, action: &str) -> Result<Vec<String>, RspError> {
    let mut words = Vec::new();
    let mut chars = action.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut prev_escape = false;
            let mut end = None;
            for (i, c) in chars.by_ref() {
                if prev_escape {
                    prev_escape = false;
                    continue;
                }
                match c {
                    '\\' => prev_escape = true,
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    _ => {}
                }
            }
            let end = end.ok_or_else(|| err(name, line, "unterminated string"))?;
            words.push(action[start..=end].to_string());
            continue;
        }
        // bare word
        let mut end = action.len();
        for (i, c) in chars.by_ref() {
            if c.is_whitespace() {
                end = i;
                break;
            }
        }
        words.push(action[start..end].to_string());
    }

    if words.is_empty() {
        return Err(err(name, line, "empty action"));
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(src: &str) -> Result<FxHashMap<String, Vec<Node>>, RspError> {
        parse("t.rsp", src, "{", "}", )
    }

    #[test]
    fn test_plain_text() {
        let t = parse_default("hello world").unwrap();
        assert_eq!(t["t.rsp"], vec![Node::Text("hello world".into())]);
    }

    #[test]
    fn test_var_and_text() {
        let t = parse_default("a {.Name} b").unwrap();
        assert_eq!(
            t["t.rsp"],
            vec![
                Node::Text("a ".into()),
                Node::Var(vec!["Name".into()]),
                Node::Text(" b".into()),
            ]
        );
    }

    #[test]
    fn test_whole_context_var() {
        let t = parse_default("{.}").unwrap();
        assert_eq!(t["t.rsp"], vec![Node::Var(vec![])]);
    }

    #[test]
    fn test_define_block() {
        let t = parse_default(r#"{define "head"}<title>{.Title}</title>{end}body"#).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(
            t["head"],
            vec![
                Node::Text("<title>".into()),
                Node::Var(vec!["Title".into()]),
                Node::Text("</title>".into()),
            ]
        );
        assert_eq!(t["t.rsp"], vec![Node::Text("body".into())]);
    }

    #[test]
    fn test_if_else() {
        let t = parse_default("{if .X}yes{else}no{end}").unwrap();
        assert_eq!(
            t["t.rsp"],
            vec![Node::If {
                cond: Arg::Path(vec!["X".into()]),
                then: vec![Node::Text("yes".into())],
                otherwise: vec![Node::Text("no".into())],
            }]
        );
    }

    #[test]
    fn test_include_with_arg() {
        let t = parse_default(r#"{template "head" .Meta}"#).unwrap();
        assert_eq!(
            t["t.rsp"],
            vec![Node::Include {
                name: "head".into(),
                arg: Some(Arg::Path(vec!["Meta".into()])),
            }]
        );
    }

    #[test]
    fn test_helper_call() {
        let t = parse_default(r#"{upper .Name "x" 3}"#).unwrap();
        assert_eq!(
            t["t.rsp"],
            vec![Node::Call {
                name: "upper".into(),
                args: vec![
                    Arg::Path(vec!["Name".into()]),
                    Arg::Str("x".into()),
                    Arg::Int(3),
                ],
            }]
        );
    }

    #[test]
    fn test_custom_delims() {
        let t = parse("t.rsp", "a <% .X %> b", "<%", "%>").unwrap();
        assert_eq!(
            t["t.rsp"],
            vec![
                Node::Text("a ".into()),
                Node::Var(vec!["X".into()]),
                Node::Text(" b".into()),
            ]
        );
    }

    #[test]
    fn test_unclosed_action_reports_line() {
        let e = parse_default("line1\nline2 {.X").unwrap_err();
        assert!(e.to_string().contains("t.rsp:2"), "got {e}");
        assert!(e.to_string().contains("unclosed action"));
    }

    #[test]
    fn test_stray_end_is_error() {
        assert!(parse_default("{end}").is_err());
    }

    #[test]
    fn test_delim_inside_string_is_skipped() {
        let t = parse_default(r#"{template "a}b"}"#).unwrap();
        assert_eq!(
            t["t.rsp"],
            vec![Node::Include { name: "a}b".into(), arg: None }]
        );
    }
}
