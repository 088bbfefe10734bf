//! Template variable substitution.
//!
//! Substitutes `{{ path }}` tokens in arbitrary JSON values against the
//! context. A string that is exactly one token takes the resolved
//! value with its type preserved, so `"urls": "{{intel.domains}}"`
//! hands a list to an automation rather than its printed form. Mixed
//! strings splice stringified values in place.

use crate::context::ContextStore;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::warn;

/// Token pattern: `{{ dotted.path }}`, whitespace inside braces ignored.
// Allow expect here as the regex is compile-time verified to be valid
#[allow(clippy::expect_used)]
static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}\s][^{}]*?)\s*\}\}").expect("constant regex pattern is valid")
});

/// Substitute tokens throughout a JSON value, descending into objects
/// and arrays. Unresolved tokens are left literally in place.
pub fn render(value: &Value, ctx: &ContextStore) -> Value {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(input: &str, ctx: &ContextStore) -> Value {
    // Exact-match: the whole string is one token -> typed substitution
    if let Some(caps) = TOKEN_PATTERN.captures(input) {
        if caps.get(0).map(|m| m.as_str()) == Some(input) {
            let path = &caps[1];
            match ctx.resolve_path(path) {
                Some(resolved) => return resolved.clone(),
                None => {
                    warn!("template path '{}' not found in context", path);
                    return Value::String(input.to_string());
                }
            }
        }
    }

    let replaced = TOKEN_PATTERN.replace_all(input, |caps: &regex::Captures| {
        let path = &caps[1];
        match ctx.resolve_path(path) {
            Some(resolved) => stringify(resolved),
            None => {
                warn!("template path '{}' not found in context", path);
                caps[0].to_string()
            }
        }
    });

    Value::String(replaced.into_owned())
}

/// Splice representation for non-exact-match tokens: strings stay raw,
/// everything else renders as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
