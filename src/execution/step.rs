//! Step Abstraction
//!
//! Every state type maps to a [`Step`] implementation through the
//! [`StepRegistry`]. A step either finishes synchronously or returns an
//! asynchronous response carrying correlation ids, optionally asking the
//! engine to spawn child executions for them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DefinitionError, Result};
use crate::machine::{State, StateMachine, FORK_STATE_TYPE, REPEAT_STATE_TYPE};

use super::builtin;
use super::context::{ContextElement, ExecutionContext};
use super::repeat::{ForkStep, RepeatStep};
use super::status::ExecutionStatus;

/// Result delivered for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub payload: Option<Value>,
}

impl ResponseData {
    pub fn success() -> Self {
        Self {
            status: ExecutionStatus::Success,
            error_message: None,
            payload: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error_message: Some(message.into()),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A child chain the engine should start for a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildExecution {
    pub correlation_id: String,
    /// First state of the child chain
    pub state_name: String,
    /// Element pushed onto the child's context
    pub element: Option<ContextElement>,
    pub repeat_element_index: Option<usize>,
}

/// What a step reports back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    pub is_async: bool,
    /// New correlation ids to wait on
    pub correlation_ids: Vec<String>,
    pub children: Vec<ChildExecution>,
    pub error_message: Option<String>,
}

impl ExecutionResponse {
    pub fn success() -> Self {
        Self::finished(ExecutionStatus::Success, None)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::finished(ExecutionStatus::Failed, Some(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::finished(ExecutionStatus::Error, Some(message.into()))
    }

    pub fn finished(status: ExecutionStatus, error_message: Option<String>) -> Self {
        Self {
            status,
            is_async: false,
            correlation_ids: Vec::new(),
            children: Vec::new(),
            error_message,
        }
    }

    /// Waits for external notifications on `correlation_ids`.
    pub fn async_wait(correlation_ids: Vec<String>) -> Self {
        Self {
            status: ExecutionStatus::Running,
            is_async: true,
            correlation_ids,
            children: Vec::new(),
            error_message: None,
        }
    }

    /// Keeps waiting on the ids already outstanding.
    pub fn still_waiting() -> Self {
        Self::async_wait(Vec::new())
    }

    /// Starts child chains and waits for each of them to report.
    pub fn spawn(children: Vec<ChildExecution>) -> Self {
        let correlation_ids = children.iter().map(|c| c.correlation_id.clone()).collect();
        Self {
            children,
            ..Self::async_wait(correlation_ids)
        }
    }
}

/// Behaviour of one state type.
pub trait Step: Send + Sync {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse>;

    /// Called once per reported correlation id.
    ///
    /// The default finishes with FAILED on the first unsuccessful report,
    /// keeps waiting while ids remain, and succeeds once all have reported.
    fn handle_async_response(
        &self,
        context: &mut ExecutionContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<ExecutionResponse> {
        if let Some((id, response)) = responses
            .iter()
            .find(|(_, r)| r.status != ExecutionStatus::Success)
        {
            let message = response
                .error_message
                .clone()
                .unwrap_or_else(|| format!("correlation {} reported {}", id, response.status));
            return Ok(ExecutionResponse::failed(message));
        }

        if context.pending_correlation_ids().is_empty() {
            Ok(ExecutionResponse::success())
        } else {
            Ok(ExecutionResponse::still_waiting())
        }
    }
}

/// Builds the step for a state from its definition.
pub type StepFactory = Arc<dyn Fn(&State) -> Result<Arc<dyn Step>> + Send + Sync>;

/// Parses a state's config into `T`; a missing config reads as `{}`.
pub fn state_config<T: DeserializeOwned>(state: &State) -> Result<T> {
    let value = if state.config.is_null() {
        Value::Object(Default::default())
    } else {
        state.config.clone()
    };
    serde_json::from_value(value).map_err(|e| {
        DefinitionError::InvalidStateConfig {
            state: state.name.clone(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Lookup table from state type tag to step factory.
#[derive(Clone)]
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl StepRegistry {
    /// A registry with only the engine-owned REPEAT and FORK types.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(REPEAT_STATE_TYPE, |state| {
            Ok(Arc::new(RepeatStep::from_state(state)?) as Arc<dyn Step>)
        });
        registry.register(FORK_STATE_TYPE, |state| {
            Ok(Arc::new(ForkStep::from_state(state)?) as Arc<dyn Step>)
        });
        registry
    }

    /// A registry that also knows NOOP, FAIL, ECHO, SET_PARAM and WAIT.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, state_type: &str, factory: F)
    where
        F: Fn(&State) -> Result<Arc<dyn Step>> + Send + Sync + 'static,
    {
        debug!("Registering step type: {}", state_type);
        self.factories
            .insert(state_type.to_string(), Arc::new(factory));
    }

    /// Registers one shared step instance for every state of a type.
    pub fn register_step(&mut self, state_type: &str, step: Arc<dyn Step>) {
        self.register(state_type, move |_| Ok(Arc::clone(&step)));
    }

    pub fn contains(&self, state_type: &str) -> bool {
        self.factories.contains_key(state_type)
    }

    pub fn create(&self, state: &State) -> Result<Arc<dyn Step>> {
        let factory = self.factories.get(&state.state_type).ok_or_else(|| {
            DefinitionError::UnknownStateType {
                state: state.name.clone(),
                state_type: state.state_type.clone(),
            }
        })?;
        factory(state)
    }

    /// Builds the step for every state of a machine.
    pub fn resolve(&self, machine: &StateMachine) -> Result<HashMap<String, Arc<dyn Step>>> {
        machine
            .states
            .iter()
            .map(|state| self.create(state).map(|step| (state.name.clone(), step)))
            .collect()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
