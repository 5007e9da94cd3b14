//! Outcome Module
//!
//! Steps publish results as named outcomes that later steps can read.
//!
//! # Scopes
//!
//! - `NODE`: visible to the producing instance and instances nested under it
//! - `STAGE`: visible to every instance of the same workflow run
//! - `PIPELINE`: visible across runs sharing a pipeline execution id
//!
//! # Structure
//!
//! - [`Outcome`]: the persisted record
//! - [`OutcomeStore`]: consume, resolve and fetch operations

pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::Entity;

pub use store::OutcomeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeScope {
    Node,
    #[default]
    Stage,
    Pipeline,
}

impl OutcomeScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "NODE",
            Self::Stage => "STAGE",
            Self::Pipeline => "PIPELINE",
        }
    }
}

impl fmt::Display for OutcomeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named result published by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    /// Workflow run that produced the outcome
    pub producing_execution_id: String,
    /// State execution instance that produced the outcome
    pub producing_node_id: String,
    pub pipeline_execution_id: Option<String>,
    pub name: String,
    pub scope: OutcomeScope,
    /// Node id, run id or pipeline id depending on `scope`
    pub scope_key: String,
    /// `None` records an explicit "no outcome"
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Outcome {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "producing_execution_id" => Some(self.producing_execution_id.clone()),
            "producing_node_id" => Some(self.producing_node_id.clone()),
            "pipeline_execution_id" => self.pipeline_execution_id.clone(),
            "name" => Some(self.name.clone()),
            "scope" => Some(self.scope.as_str().to_string()),
            "scope_key" => Some(self.scope_key.clone()),
            _ => None,
        }
    }
}

/// Position of the caller within a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionRef {
    pub workflow_execution_id: String,
    pub pipeline_execution_id: Option<String>,
    /// Instance ids from the outermost ancestor down to the current node
    pub node_path: Vec<String>,
}

impl ExecutionRef {
    pub fn new(workflow_execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            workflow_execution_id: workflow_execution_id.into(),
            pipeline_execution_id: None,
            node_path: vec![node_id.into()],
        }
    }

    pub fn with_pipeline(mut self, pipeline_execution_id: impl Into<String>) -> Self {
        self.pipeline_execution_id = Some(pipeline_execution_id.into());
        self
    }

    pub fn with_ancestors(mut self, ancestors: &[String]) -> Self {
        let mut path = ancestors.to_vec();
        path.append(&mut self.node_path);
        self.node_path = path;
        self
    }

    /// The current node id.
    pub fn node_id(&self) -> &str {
        self.node_path.last().map(String::as_str).unwrap_or("")
    }

    /// The key an outcome published at `scope` from here is stored under.
    pub fn scope_key(&self, scope: OutcomeScope) -> String {
        match scope {
            OutcomeScope::Node => self.node_id().to_string(),
            OutcomeScope::Stage => self.workflow_execution_id.clone(),
            OutcomeScope::Pipeline => self
                .pipeline_execution_id
                .clone()
                .unwrap_or_else(|| self.workflow_execution_id.clone()),
        }
    }
}

/// Reference to an outcome by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutcomeRef {
    pub name: String,
    /// Restrict the lookup to one producing instance
    pub producer_node_id: Option<String>,
    /// Restrict the lookup to one scope; `None` searches outward
    pub scope: Option<OutcomeScope>,
}

impl OutcomeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_node(mut self, node_id: impl Into<String>) -> Self {
        self.producer_node_id = Some(node_id.into());
        self
    }

    pub fn in_scope(mut self, scope: OutcomeScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_keys() {
        let at = ExecutionRef::new("run-1", "node-2").with_ancestors(&["node-1".to_string()]);
        assert_eq!(at.node_path, vec!["node-1", "node-2"]);
        assert_eq!(at.scope_key(OutcomeScope::Node), "node-2");
        assert_eq!(at.scope_key(OutcomeScope::Stage), "run-1");
        assert_eq!(at.scope_key(OutcomeScope::Pipeline), "run-1");

        let at = at.with_pipeline("pipe-9");
        assert_eq!(at.scope_key(OutcomeScope::Pipeline), "pipe-9");
    }

    #[test]
    fn test_scope_serde() {
        let scope: OutcomeScope = serde_json::from_str("\"PIPELINE\"").unwrap();
        assert_eq!(scope, OutcomeScope::Pipeline);
        assert_eq!(OutcomeScope::default(), OutcomeScope::Stage);
    }
}
