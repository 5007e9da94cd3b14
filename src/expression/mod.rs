//! Expression Evaluation
//!
//! Steps interpolate their inputs from parameters, context elements and
//! outcomes through an [`ExpressionEvaluator`]. The bundled
//! [`TemplateEvaluator`] understands `${path.to.value}` placeholders.

pub mod template;

use serde_json::Value;

use crate::error::Result;

pub use template::TemplateEvaluator;

/// Evaluates an expression against a JSON object of variables.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value>;
}
