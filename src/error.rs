//! Error Types
//!
//! Engine-level rejections are grouped by kind:
//! - [`DefinitionError`]: the state machine itself is malformed
//! - [`InvalidArgument`]: a request names something that does not exist
//! - [`IllegalTransition`]: a control event does not fit the current status
//!
//! Step failures are not errors here; they surface as the final status
//! of the owning instance.

use thiserror::Error;

use crate::execution::events::ExecutionEventType;
use crate::execution::status::ExecutionStatus;
use crate::machine::model::TransitionType;

/// Problems found while building or validating a state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("State machine has no states")]
    EmptyMachine,

    #[error("Duplicate state name: '{0}'")]
    DuplicateStateName(String),

    #[error("Duplicate state names: {}", .0.join(", "))]
    DuplicateStateNames(Vec<String>),

    #[error("State machine has no initial state")]
    MissingInitialState,

    #[error("Initial state '{0}' does not exist")]
    UnknownInitialState(String),

    #[error("Transition '{from}' -> '{to}' references an unknown state")]
    UnknownTransitionState { from: String, to: String },

    #[error("State '{state}' already has a {transition_type} transition")]
    DuplicateTransition {
        state: String,
        transition_type: TransitionType,
    },

    #[error("State '{state}' has unknown type '{state_type}'")]
    UnknownStateType { state: String, state_type: String },

    #[error("Repeat state '{0}' has no REPEAT transition")]
    MissingRepeatTransition(String),

    #[error("State machine '{0}' has not been validated")]
    NotValidated(String),

    #[error("Unknown state '{0}'")]
    UnknownState(String),

    #[error("State '{state}' has invalid config: {reason}")]
    InvalidStateConfig { state: String, reason: String },
}

/// A request referenced a missing or unresolvable entity.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidArgument {
    #[error("{0} event requires a target state execution instance id")]
    MissingTargetInstance(ExecutionEventType),

    #[error("No state execution instance with id '{0}'")]
    UnknownInstance(String),

    #[error("No workflow execution with id '{0}'")]
    UnknownExecution(String),

    #[error("No registered state machine with id '{0}'")]
    UnknownStateMachine(String),

    #[error("Execution event has no workflow execution id")]
    MissingExecutionId,
}

/// A control event was rejected because of the target's current status.
///
/// Rejections never modify the target.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IllegalTransition {
    #[error("State '{state}' is not eligible for pause (status {status})")]
    StateNotForPause {
        state: String,
        status: ExecutionStatus,
    },

    #[error("State '{state}' is not eligible for resume (status {status})")]
    StateNotForResume {
        state: String,
        status: ExecutionStatus,
    },

    #[error("State '{state}' is not eligible for retry (status {status})")]
    StateNotForRetry {
        state: String,
        status: ExecutionStatus,
    },

    #[error("State '{state}' is not eligible for abort (status {status})")]
    StateNotForAbort {
        state: String,
        status: ExecutionStatus,
    },

    #[error("Pause-all already in effect for execution '{0}'")]
    PauseAllAlreadyInEffect(String),

    #[error("Abort-all already in effect for execution '{0}'")]
    AbortAllAlreadyInEffect(String),

    #[error("No pause-all in effect for execution '{0}'")]
    NoPauseAllInEffect(String),
}

/// Top-level error returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Outcome error: {0}")]
    Outcome(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Work queue is full ({0} pending items)")]
    QueueFull(usize),

    #[error("Timed out waiting for execution '{0}'")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
