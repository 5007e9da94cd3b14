//! Execution Context
//!
//! The working view a step gets of its instance:
//! - A stack of context elements, looked up per type
//! - A flat parameter map inherited by later states and children
//! - Outcome publishing and resolution at the current node
//! - Expression evaluation over all of the above

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::expression::ExpressionEvaluator;
use crate::machine::{State, StateMachine};
use crate::outcome::{ExecutionRef, OutcomeRef, OutcomeScope, OutcomeStore};

use super::instance::StateExecutionInstance;

/// Kind of scope an element introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextElementType {
    Service,
    Host,
    Instance,
    Infrastructure,
    Artifact,
    Phase,
    Param,
    #[default]
    Other,
}

impl ContextElementType {
    /// Variable name the element is exposed under in expressions.
    pub fn key(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Host => "host",
            Self::Instance => "instance",
            Self::Infrastructure => "infrastructure",
            Self::Artifact => "artifact",
            Self::Phase => "phase",
            Self::Param => "param",
            Self::Other => "element",
        }
    }
}

impl fmt::Display for ContextElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key().to_uppercase())
    }
}

/// A scoped value such as the current host or service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextElement {
    pub element_type: ContextElementType,
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl ContextElement {
    pub fn new(element_type: ContextElementType, name: impl Into<String>, value: Value) -> Self {
        Self {
            element_type,
            name: name.into(),
            value,
        }
    }

    /// Builds an element from one item of a repeat sequence.
    ///
    /// Strings and scalars become the element name; objects use their
    /// `name` field when present.
    pub fn from_item(element_type: ContextElementType, item: Value) -> Self {
        let name = match &item {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("name")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| item.to_string()),
            other => other.to_string(),
        };
        Self::new(element_type, name, item)
    }

    fn as_variable(&self) -> Value {
        let mut fields = match &self.value {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        fields.insert("name".to_string(), Value::String(self.name.clone()));
        Value::Object(fields)
    }
}

/// Per-instance working state handed to steps.
pub struct ExecutionContext {
    instance_id: String,
    workflow_execution_id: String,
    state_name: String,
    lineage: Vec<String>,
    pipeline_execution_id: Option<String>,
    pending_correlation_ids: Vec<String>,
    elements: Vec<ContextElement>,
    params: BTreeMap<String, Value>,
    execution_data: Option<Value>,
    machine: Arc<StateMachine>,
    outcomes: OutcomeStore,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl ExecutionContext {
    pub fn new(
        instance: &StateExecutionInstance,
        machine: Arc<StateMachine>,
        outcomes: OutcomeStore,
        evaluator: Arc<dyn ExpressionEvaluator>,
        pipeline_execution_id: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance.id.clone(),
            workflow_execution_id: instance.workflow_execution_id.clone(),
            state_name: instance.state_name.clone(),
            lineage: instance.lineage.clone(),
            pipeline_execution_id,
            pending_correlation_ids: instance.correlation_ids.clone(),
            elements: instance.context_elements.clone(),
            params: instance.params.clone(),
            execution_data: instance.execution_data.clone(),
            machine,
            outcomes,
            evaluator,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn workflow_execution_id(&self) -> &str {
        &self.workflow_execution_id
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    pub fn state(&self) -> Option<&State> {
        self.machine.get_state(&self.state_name)
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Correlation ids still outstanding, excluding those being handled.
    pub fn pending_correlation_ids(&self) -> &[String] {
        &self.pending_correlation_ids
    }

    pub fn push_context_element(&mut self, element: ContextElement) {
        self.elements.push(element);
    }

    /// Most recently pushed element of the given type.
    pub fn get_context_element(&self, element_type: ContextElementType) -> Option<&ContextElement> {
        self.elements
            .iter()
            .rev()
            .find(|e| e.element_type == element_type)
    }

    pub fn context_elements(&self) -> &[ContextElement] {
        &self.elements
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: Value) {
        self.params.insert(key.into(), value);
    }

    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    /// Reads the state's progress data.
    pub fn execution_data<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.execution_data
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(EngineError::from)
    }

    pub fn set_execution_data<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.execution_data = Some(serde_json::to_value(data)?);
        Ok(())
    }

    /// Position of this instance for outcome lookups.
    pub fn execution_ref(&self) -> ExecutionRef {
        let mut at = ExecutionRef::new(&self.workflow_execution_id, &self.instance_id)
            .with_ancestors(&self.lineage);
        at.pipeline_execution_id = self.pipeline_execution_id.clone();
        at
    }

    pub fn consume_outcome(
        &self,
        name: &str,
        payload: Option<Value>,
        scope: OutcomeScope,
    ) -> Result<String> {
        self.outcomes
            .consume(&self.execution_ref(), name, payload, scope)
    }

    pub fn resolve_outcome(&self, reference: &OutcomeRef) -> Result<Option<Value>> {
        self.outcomes.resolve(&self.execution_ref(), reference)
    }

    /// Variables visible to expressions.
    ///
    /// Outcomes come first, nearest producer winning. Context elements
    /// override them under their type key and parameters override both.
    pub fn variables(&self) -> Result<Value> {
        let mut vars = Map::new();

        for outcome in self.outcomes.visible(&self.execution_ref())? {
            vars.entry(outcome.name)
                .or_insert_with(|| outcome.payload.unwrap_or(Value::Null));
        }
        for element in &self.elements {
            vars.insert(element.element_type.key().to_string(), element.as_variable());
        }
        for (key, value) in &self.params {
            vars.insert(key.clone(), value.clone());
        }

        Ok(Value::Object(vars))
    }

    pub fn evaluate_expression(&self, expression: &str) -> Result<Value> {
        let vars = self.variables()?;
        self.evaluator.evaluate(expression, &vars)
    }

    /// Evaluates an expression and renders the result as text.
    pub fn render_expression(&self, expression: &str) -> Result<String> {
        Ok(match self.evaluate_expression(expression)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    /// Evaluates an expression that must yield a list of elements.
    pub fn evaluate_repeat_expression(
        &self,
        element_type: ContextElementType,
        expression: &str,
    ) -> Result<Vec<ContextElement>> {
        match self.evaluate_expression(expression)? {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|item| ContextElement::from_item(element_type, item))
                .collect()),
            other => Err(EngineError::Expression(format!(
                "Repeat expression '{}' did not resolve to a list (got {})",
                expression, other
            ))),
        }
    }

    /// Copies step-visible changes back onto the instance.
    pub(crate) fn apply_to(self, instance: &mut StateExecutionInstance) {
        instance.context_elements = self.elements;
        instance.params = self.params;
        instance.execution_data = self.execution_data;
    }
}
