//! `${path}` substitution in connector configuration.
//!
//! A string that is exactly one `${path}` is replaced by the bound JSON value; templates
//! embedded in a longer string are replaced by the value's text form. Referencing a
//! binding that does not exist is a [`GatewayError::BindingNotFound`].

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value as JsonValue};

use crate::{
    core::{GatewayError, GatewayResult},
    pipeline::expression::{parse_path, walk, Segment},
};

static TEMPLATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{\s*([^}]+?)\s*\}").unwrap());

pub fn has_template(text: &str) -> bool {
    TEMPLATE.is_match(text)
}

/// Resolve a dotted path against the bindings, failing if its root is not bound.
pub fn lookup(path: &str, bindings: &Map<String, JsonValue>) -> GatewayResult<JsonValue> {
    let segments = parse_path(path)?;
    let Some((Segment::Key(root), rest)) = segments.split_first() else {
        return Err(GatewayError::BindingNotFound(path.to_string()));
    };
    let value = bindings
        .get(root)
        .ok_or_else(|| GatewayError::BindingNotFound(root.clone()))?;
    Ok(walk(value, rest).cloned().unwrap_or(JsonValue::Null))
}

fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn render_text(text: &str, bindings: &Map<String, JsonValue>) -> GatewayResult<String> {
    if !has_template(text) {
        return Ok(text.to_string());
    }
    let mut failure = None;
    let rendered = TEMPLATE.replace_all(text, |caps: &Captures| match lookup(&caps[1], bindings) {
        Ok(value) => to_text(&value),
        Err(e) => {
            failure.get_or_insert(e);
            String::new()
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

pub fn render_value(value: &JsonValue, bindings: &Map<String, JsonValue>) -> GatewayResult<JsonValue> {
    match value {
        JsonValue::String(text) => {
            if let Some(caps) = TEMPLATE.captures(text) {
                let whole = caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == text.len());
                if whole {
                    return lookup(&caps[1], bindings);
                }
            }
            render_text(text, bindings).map(JsonValue::String)
        }
        JsonValue::Array(items) => items
            .iter()
            .map(|item| render_value(item, bindings))
            .collect::<GatewayResult<Vec<_>>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_value(v, bindings)?)))
            .collect::<GatewayResult<Map<_, _>>>()
            .map(JsonValue::Object),
        other => Ok(other.clone()),
    }
}
