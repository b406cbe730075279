use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{ValidationError, ValidationErrors};

use super::shape::Shape;

// ============================================================================
// ISO 8601 Date Regex
// ============================================================================

/// Compiled once at first use.
fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,6})?Z?$")
            .expect("ISO date regex is valid")
    })
}

// ============================================================================
// Validation Context
// ============================================================================

struct ValidationContext {
    errors: Vec<ValidationError>,
    path: Vec<String>,
}

impl ValidationContext {
    fn new() -> Self {
        Self {
            errors: vec![],
            path: vec![],
        }
    }

    fn push_key(&mut self, key: impl Into<String>) {
        self.path.push(key.into());
    }

    fn push_index(&mut self, idx: usize) {
        self.path.push(format!("[{idx}]"));
    }

    fn pop(&mut self) {
        self.path.pop();
    }

    /// Join path segments, collapsing `".[0]"` → `"[0]"`.
    fn current_path(&self) -> String {
        self.path.join(".").replace(".[", "[")
    }

    fn add_error(&mut self, expected: impl Into<String>, received: impl Into<String>) {
        self.errors.push(ValidationError {
            path: self.current_path(),
            expected: expected.into(),
            received: received.into(),
        });
    }
}

// ============================================================================
// Type Name Helpers
// ============================================================================

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate ISO 8601 format + semantic correctness via chrono.
fn is_valid_iso_date(s: &str) -> bool {
    if !iso_date_regex().is_match(s) {
        return false;
    }
    // Normalise for chrono by appending Z when there is no explicit offset.
    let has_offset = s.ends_with('Z') || s[10..].contains('+');
    let normalised = if has_offset {
        s.to_string()
    } else {
        format!("{s}Z")
    };
    chrono::DateTime::parse_from_rfc3339(&normalised).is_ok()
}

const MAX_DEPTH: usize = 100;

// ============================================================================
// Core Walker
// ============================================================================

/// Walk the shape tree, validating `value` and collecting errors into `ctx`.
fn walk(shape: &Shape, value: &Value, ctx: &mut ValidationContext, depth: usize) {
    if depth > MAX_DEPTH {
        panic!("Maximum shape nesting depth exceeded ({MAX_DEPTH})");
    }

    match shape {
        Shape::String => {
            if !value.is_string() {
                ctx.add_error("string", type_name(value));
            }
        }

        Shape::Number => {
            if !value.is_number() {
                ctx.add_error("number", type_name(value));
            }
        }

        Shape::Boolean => {
            if !value.is_boolean() {
                ctx.add_error("boolean", type_name(value));
            }
        }

        Shape::Id => match value.as_str() {
            Some(s) if !s.is_empty() => {}
            Some(_) => ctx.add_error("non-empty string (id)", "empty string"),
            None => ctx.add_error("non-empty string (id)", type_name(value)),
        },

        Shape::Date => match value.as_str() {
            Some(s) if is_valid_iso_date(s) => {}
            Some(s) => ctx.add_error("ISO 8601 date string", format!("{s:?}")),
            None => ctx.add_error("ISO 8601 date string", type_name(value)),
        },

        Shape::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => {}
            Some(s) => {
                ctx.add_error(format!("one of [{}]", allowed.join(", ")), format!("{s:?}"))
            }
            None => ctx.add_error(
                format!("one of [{}]", allowed.join(", ")),
                type_name(value),
            ),
        },

        Shape::Optional(inner) => {
            if !value.is_null() {
                walk(inner, value, ctx, depth + 1);
            }
        }

        Shape::Array(element) => match value.as_array() {
            None => ctx.add_error("array", type_name(value)),
            Some(arr) => {
                for (i, item) in arr.iter().enumerate() {
                    ctx.push_index(i);
                    walk(element, item, ctx, depth + 1);
                    ctx.pop();
                }
            }
        },

        Shape::Object(props) => match value.as_object() {
            None => ctx.add_error("object", type_name(value)),
            Some(map) => {
                // Missing keys validate as null, so required fields fail
                // unless wrapped in Optional.
                for (key, prop_shape) in props {
                    ctx.push_key(key);
                    let prop_value = map.get(key).unwrap_or(&Value::Null);
                    walk(prop_shape, prop_value, ctx, depth + 1);
                    ctx.pop();
                }
            }
        },

        Shape::Any => {}
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Validate `value` against `shape`, returning the accepted value on success
/// or a `ValidationErrors` collection on failure.
pub fn validate(shape: &Shape, value: &Value) -> Result<Value, ValidationErrors> {
    let mut ctx = ValidationContext::new();
    walk(shape, value, &mut ctx, 0);
    if ctx.errors.is_empty() {
        Ok(value.clone())
    } else {
        Err(ValidationErrors(ctx.errors))
    }
}

/// Like `validate` but discards the value; only reports errors.
pub fn validate_shape(shape: &Shape, value: &Value) -> Result<(), ValidationErrors> {
    validate(shape, value).map(|_| ())
}
