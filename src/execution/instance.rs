//! Runtime Records
//!
//! - [`StateExecutionInstance`]: one state's execution within one run
//! - [`WorkflowRun`]: groups every instance of a run and carries its status

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::machine::State;
use crate::persistence::{generate_id, Entity};

use super::advice::ErrorStrategy;
use super::context::ContextElement;
use super::status::ExecutionStatus;
use super::step::{ChildExecution, ResponseData};

/// Persisted record of one state execution.
///
/// Only the engine and the event manager change these; steps see a
/// working copy through their execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExecutionInstance {
    pub id: String,
    pub workflow_execution_id: String,
    pub state_machine_id: String,
    pub state_name: String,
    pub state_type: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Repeat or fork instance that spawned this chain
    pub parent_instance_id: Option<String>,
    /// Instance whose transition created this one
    pub prev_instance_id: Option<String>,
    /// Ancestor instance ids, outermost first
    #[serde(default)]
    pub lineage: Vec<String>,
    pub repeat_element_index: Option<usize>,
    /// Correlation id reported to the parent when this chain ends
    pub notify_id: Option<String>,
    /// Correlation ids still outstanding
    #[serde(default)]
    pub correlation_ids: Vec<String>,

    #[serde(default)]
    pub context_elements: Vec<ContextElement>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// State-owned progress data
    pub execution_data: Option<Value>,
    pub error_message: Option<String>,

    /// Status held before a pause, restored on resume
    pub paused_from: Option<ExecutionStatus>,
    /// Notifications received while paused
    #[serde(default)]
    pub buffered_responses: BTreeMap<String, ResponseData>,
    #[serde(default)]
    pub retry_count: u32,
    /// Set once the run's advisor has seen this attempt
    #[serde(default)]
    pub advised: bool,
}

impl StateExecutionInstance {
    pub fn new(workflow_execution_id: &str, state_machine_id: &str, state: &State) -> Self {
        Self {
            id: generate_id(),
            workflow_execution_id: workflow_execution_id.to_string(),
            state_machine_id: state_machine_id.to_string(),
            state_name: state.name.clone(),
            state_type: state.state_type.clone(),
            status: ExecutionStatus::New,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            parent_instance_id: None,
            prev_instance_id: None,
            lineage: Vec::new(),
            repeat_element_index: None,
            notify_id: None,
            correlation_ids: Vec::new(),
            context_elements: Vec::new(),
            params: BTreeMap::new(),
            execution_data: None,
            error_message: None,
            paused_from: None,
            buffered_responses: BTreeMap::new(),
            retry_count: 0,
            advised: false,
        }
    }

    /// The instance for the state reached by a transition from this one.
    ///
    /// It stays in the same chain: same parent, same notify id, same
    /// context and parameters.
    pub fn next(&self, state: &State) -> Self {
        let mut next = Self::new(&self.workflow_execution_id, &self.state_machine_id, state);
        next.prev_instance_id = Some(self.id.clone());
        next.parent_instance_id = self.parent_instance_id.clone();
        next.lineage = self.lineage.clone();
        next.repeat_element_index = self.repeat_element_index;
        next.notify_id = self.notify_id.clone();
        next.context_elements = self.context_elements.clone();
        next.params = self.params.clone();
        next
    }

    /// The first instance of a chain spawned by this repeat or fork state.
    pub fn child(&self, state: &State, launch: &ChildExecution) -> Self {
        let mut child = Self::new(&self.workflow_execution_id, &self.state_machine_id, state);
        child.parent_instance_id = Some(self.id.clone());
        child.lineage = self.lineage.clone();
        child.lineage.push(self.id.clone());
        child.repeat_element_index = launch.repeat_element_index;
        child.notify_id = Some(launch.correlation_id.clone());
        child.context_elements = self.context_elements.clone();
        if let Some(element) = &launch.element {
            child.context_elements.push(element.clone());
        }
        child.params = self.params.clone();
        child
    }

    /// Short label for logs and the timeline.
    pub fn label(&self) -> String {
        match self.repeat_element_index {
            Some(index) => format!("{}[{}]", self.state_name, index),
            None => self.state_name.clone(),
        }
    }
}

impl Entity for StateExecutionInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "workflow_execution_id" => Some(self.workflow_execution_id.clone()),
            "state_machine_id" => Some(self.state_machine_id.clone()),
            "state_name" => Some(self.state_name.clone()),
            "status" => Some(self.status.as_str().to_string()),
            "parent_instance_id" => self.parent_instance_id.clone(),
            "prev_instance_id" => self.prev_instance_id.clone(),
            "notify_id" => self.notify_id.clone(),
            _ => None,
        }
    }
}

/// A single execution of a state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub state_machine_id: String,
    pub app_id: Option<String>,
    pub env_id: Option<String>,
    pub pipeline_execution_id: Option<String>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Applies to states without their own `error_strategy`
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
}

impl WorkflowRun {
    pub fn new(state_machine_id: &str) -> Self {
        Self {
            id: generate_id(),
            state_machine_id: state_machine_id.to_string(),
            app_id: None,
            env_id: None,
            pipeline_execution_id: None,
            status: ExecutionStatus::Running,
            created_at: Utc::now(),
            end_time: None,
            params: BTreeMap::new(),
            error_strategy: ErrorStrategy::Fail,
        }
    }
}

impl Entity for WorkflowRun {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "state_machine_id" => Some(self.state_machine_id.clone()),
            "app_id" => self.app_id.clone(),
            "env_id" => self.env_id.clone(),
            "pipeline_execution_id" => self.pipeline_execution_id.clone(),
            "status" => Some(self.status.as_str().to_string()),
            _ => None,
        }
    }
}
