use super::condition::{coerce_string, resolve_path};
use crate::types::VariableMap;
use serde_json::Value;

/// Resolve `{{path}}` placeholders in every string of a config bag.
pub fn render_map(config: &VariableMap, variables: &VariableMap) -> VariableMap {
    config
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, variables)))
        .collect()
}

/// Resolve placeholders inside a JSON value.
///
/// A string that is exactly one placeholder takes the variable's value with its JSON type;
/// placeholders embedded in longer text are substituted as strings. Unknown variables are
/// left untouched.
pub fn render_value(value: &Value, variables: &VariableMap) -> Value {
    match value {
        Value::String(s) => render_string(s, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, variables)).collect()),
        Value::Object(map) => Value::Object(render_map(map, variables)),
        other => other.clone(),
    }
}

fn render_string(template: &str, variables: &VariableMap) -> Value {
    let trimmed = template.trim();
    if let Some(path) = single_placeholder(trimmed) {
        if let Some(v) = resolve_path(variables, path) {
            return v.clone();
        }
        return Value::String(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let path = rest[start + 2..start + 2 + len].trim();
        out.push_str(&rest[..start]);
        match resolve_path(variables, path) {
            Some(v) => out.push_str(&coerce_string(v)),
            None => out.push_str(&rest[start..start + 2 + len + 2]),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);

    Value::String(out)
}

fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
