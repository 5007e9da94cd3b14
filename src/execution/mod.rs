//! Execution Module
//!
//! Runs state machines: instance records, steps, the engine that drives
//! them and the operator events that intervene.
//!
//! # Architecture
//!
//! - [`engine`]: executor, work processing and transitions
//! - [`advice`]: error strategy, advisors and completion callbacks
//! - [`step`]: the step contract, responses and the step registry
//! - [`repeat`]: REPEAT and FORK fan-out and fan-in
//! - [`builtin`]: NOOP, FAIL, ECHO, SET_PARAM and WAIT steps
//! - [`context`]: what a step sees while it runs
//! - [`events`]: pause, resume, retry and abort, per instance or per run
//! - [`correlation`]: correlation ids and notification delivery
//! - [`dispatcher`]: work queue and worker pool
//! - [`instance`]: persisted runtime records
//! - [`status`]: the status lifecycle

pub mod advice;
pub mod builtin;
pub mod context;
pub mod correlation;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod instance;
pub mod repeat;
pub mod status;
pub mod step;

pub use advice::{Advice, ErrorStrategy, ExecutionAdvisor, ExecutionCallback};
pub use context::{ContextElement, ContextElementType, ExecutionContext};
pub use correlation::{CorrelationRegistry, Notification, QueueNotifier, WaitNotify};
pub use engine::{ExecutionArgs, StateMachineExecutor};
pub use events::{
    Directive, DirectiveState, ExecutionEvent, ExecutionEventManager, ExecutionEventType,
};
pub use instance::{StateExecutionInstance, WorkflowRun};
pub use repeat::{ExecutionStrategy, ForkStep, RepeatFailurePolicy, RepeatStep};
pub use status::ExecutionStatus;
pub use step::{ChildExecution, ExecutionResponse, ResponseData, Step, StepRegistry};
