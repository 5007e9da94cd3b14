//! `${...}` Template Evaluator
//!
//! Rules:
//! - An expression that is exactly one placeholder yields the referenced
//!   value unchanged (arrays and objects included), or null if missing
//! - Placeholders embedded in text are rendered into a string; unresolved
//!   ones are left as written
//! - A bare JSON array or object literal is parsed as JSON
//! - Anything else is returned as a plain string

use serde_json::Value;

use crate::error::{EngineError, Result};

use super::ExpressionEvaluator;

const OPEN: &str = "${";
const CLOSE: char = '}';

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

impl TemplateEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Looks up a dotted path such as `host.name` or `hosts.0`.
    pub fn lookup<'a>(path: &str, variables: &'a Value) -> Option<&'a Value> {
        path.trim()
            .split('.')
            .try_fold(variables, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    fn interpolate(&self, expression: &str, variables: &Value) -> Result<String> {
        let mut output = String::with_capacity(expression.len());
        let mut rest = expression;

        while let Some(start) = rest.find(OPEN) {
            output.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let end = after.find(CLOSE).ok_or_else(|| {
                EngineError::Expression(format!("Unterminated placeholder in '{}'", expression))
            })?;
            let path = &after[..end];

            match Self::lookup(path, variables) {
                Some(Value::String(s)) => output.push_str(s),
                Some(value) => output.push_str(&value.to_string()),
                None => {
                    output.push_str(OPEN);
                    output.push_str(path);
                    output.push(CLOSE);
                }
            }
            rest = &after[end + 1..];
        }

        output.push_str(rest);
        Ok(output)
    }
}

/// Returns the inner path when `expression` is a single placeholder.
fn single_placeholder(expression: &str) -> Option<&str> {
    let inner = expression.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        None
    } else {
        Some(inner)
    }
}

impl ExpressionEvaluator for TemplateEvaluator {
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value> {
        let trimmed = expression.trim();

        if let Some(path) = single_placeholder(trimmed) {
            return Ok(Self::lookup(path, variables).cloned().unwrap_or(Value::Null));
        }

        if trimmed.contains(OPEN) {
            return self.interpolate(expression, variables).map(Value::String);
        }

        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            return serde_json::from_str(trimmed).map_err(|e| {
                EngineError::Expression(format!("Invalid literal '{}': {}", trimmed, e))
            });
        }

        Ok(Value::String(expression.to_string()))
    }
}
