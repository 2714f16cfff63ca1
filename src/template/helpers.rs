//! Helper functions callable from template actions.

use rustc_hash::FxHashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::Value;
use crate::error::RspError;

pub type Helper = fn(&[Value]) -> Result<Value, RspError>;
pub type HelpersMap = FxHashMap<String, Helper>;

/// The base helper registry every page starts from.
pub fn base_helpers() -> HelpersMap {
    let mut m: HelpersMap = FxHashMap::default();
    m.insert("upper".into(), helper_upper);
    m.insert("lower".into(), helper_lower);
    m.insert("trim".into(), helper_trim);
    m.insert("join".into(), helper_join);
    m.insert("len".into(), helper_len);
    m.insert("default".into(), helper_default);
    m.insert("timestamp".into(), helper_timestamp);
    m
}

fn arity(name: &str, args: &[Value], n: usize) -> Result<(), RspError> {
    if args.len() != n {
        return Err(RspError::TemplateParse(format!(
            "{name} expects {n} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn helper_upper(args: &[Value]) -> Result<Value, RspError> {
    arity("upper", args, 1)?;
    Ok(Value::Str(args[0].render_raw().to_uppercase()))
}

fn helper_lower(args: &[Value]) -> Result<Value, RspError> {
    arity("lower", args, 1)?;
    Ok(Value::Str(args[0].render_raw().to_lowercase()))
}

fn helper_trim(args: &[Value]) -> Result<Value, RspError> {
    arity("trim", args, 1)?;
    Ok(Value::Str(args[0].render_raw().trim().to_string()))
}

/// `join <list> <sep>`
fn helper_join(args: &[Value]) -> Result<Value, RspError> {
    arity("join", args, 2)?;
    let sep = args[1].render_raw();
    let parts: Vec<String> = match &args[0] {
        Value::List(v) => v.iter().map(Value::render_raw).collect(),
        other => vec![other.render_raw()],
    };
    Ok(Value::Str(parts.join(&sep)))
}

fn helper_len(args: &[Value]) -> Result<Value, RspError> {
    arity("len", args, 1)?;
    let n = match &args[0] {
        Value::List(v) => v.len(),
        Value::Map(m) => m.len(),
        Value::Str(s) | Value::Html(s) => s.chars().count(),
        Value::Null => 0,
        _ => 1,
    };
    Ok(Value::Int(n as i64))
}

/// `default <value> <fallback>`: the fallback when value is falsy.
fn helper_default(args: &[Value]) -> Result<Value, RspError> {
    arity("default", args, 2)?;
    if args[0].truthy() {
        Ok(args[0].clone())
    } else {
        Ok(args[1].clone())
    }
}

/// Current unix time in seconds.
fn helper_timestamp(args: &[Value]) -> Result<Value, RspError> {
    arity("timestamp", args, 0)?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(Value::Int(secs as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_lower_trim() {
        assert_eq!(helper_upper(&["ab".into()]).unwrap(), Value::Str("AB".into()));
        assert_eq!(helper_lower(&["AB".into()]).unwrap(), Value::Str("ab".into()));
        assert_eq!(helper_trim(&[" x ".into()]).unwrap(), Value::Str("x".into()));
    }

    #[test]
    fn test_join() {
        let list = Value::List(vec!["a".into(), "b".into()]);
        assert_eq!(
            helper_join(&[list, ", ".into()]).unwrap(),
            Value::Str("a, b".into())
        );
    }

    #[test]
    fn test_default() {
        assert_eq!(
            helper_default(&[Value::Null, "fb".into()]).unwrap(),
            Value::Str("fb".into())
        );
        assert_eq!(
            helper_default(&["v".into(), "fb".into()]).unwrap(),
            Value::Str("v".into())
        );
    }

    #[test]
    fn test_arity_errors() {
        assert!(helper_upper(&[]).is_err());
        assert!(helper_join(&["a".into()]).is_err());
    }
}
