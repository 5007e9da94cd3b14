//! Run Hooks
//!
//! Per-run behavior supplied with an execution request:
//! - [`ErrorStrategy`]: what happens when a state fails with no FAILURE edge
//! - [`ExecutionAdvisor`]: consulted before each state starts
//! - [`ExecutionCallback`]: invoked once when the run reaches a final status

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::machine::State;

use super::instance::{StateExecutionInstance, WorkflowRun};

/// Config key a state uses to override the run's error strategy.
pub const ERROR_STRATEGY_KEY: &str = "error_strategy";

/// Handling of a failed state that has no FAILURE transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStrategy {
    /// End the chain with the failure
    #[default]
    Fail,
    /// Hold the instance in WAITING until an operator resumes, retries or aborts it
    Pause,
}

impl ErrorStrategy {
    /// The state's own override, if its config names a valid strategy.
    pub fn for_state(state: &State) -> Option<Self> {
        state
            .config
            .get(ERROR_STRATEGY_KEY)
            .cloned()
            .and_then(|value: Value| serde_json::from_value(value).ok())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "FAIL",
            Self::Pause => "PAUSE",
        }
    }
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision returned by an [`ExecutionAdvisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advice {
    Proceed,
    /// Mark the state SUCCESS without running its step
    Skip,
    /// Park the state in PAUSED until it is resumed
    Pause,
    /// Mark the state FAILED with the given message
    Fail(String),
}

/// Intercepts states of a run before they execute.
pub trait ExecutionAdvisor: Send + Sync {
    fn before_execution(&self, instance: &StateExecutionInstance) -> Advice;
}

impl<F> ExecutionAdvisor for F
where
    F: Fn(&StateExecutionInstance) -> Advice + Send + Sync,
{
    fn before_execution(&self, instance: &StateExecutionInstance) -> Advice {
        self(instance)
    }
}

/// Receives the run once it has finished.
pub trait ExecutionCallback: Send + Sync {
    fn on_complete(&self, run: &WorkflowRun);
}

impl<F> ExecutionCallback for F
where
    F: Fn(&WorkflowRun) + Send + Sync,
{
    fn on_complete(&self, run: &WorkflowRun) {
        self(run)
    }
}

/// In-process hooks kept for a run until it finishes.
#[derive(Clone, Default)]
pub(crate) struct RunHooks {
    pub(crate) advisor: Option<Arc<dyn ExecutionAdvisor>>,
    pub(crate) callback: Option<Arc<dyn ExecutionCallback>>,
}

impl RunHooks {
    pub(crate) fn is_empty(&self) -> bool {
        self.advisor.is_none() && self.callback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_error_strategy_from_state_config() {
        let state = State::new("deploy", "NOOP").with_config(json!({"error_strategy": "PAUSE"}));
        assert_eq!(ErrorStrategy::for_state(&state), Some(ErrorStrategy::Pause));

        let plain = State::new("deploy", "NOOP");
        assert_eq!(ErrorStrategy::for_state(&plain), None);

        let bogus = State::new("deploy", "NOOP").with_config(json!({"error_strategy": "SHRUG"}));
        assert_eq!(ErrorStrategy::for_state(&bogus), None);
    }

    #[test]
    fn test_error_strategy_serde() {
        assert_eq!(serde_json::to_value(ErrorStrategy::Pause).unwrap(), json!("PAUSE"));
        assert_eq!(ErrorStrategy::default(), ErrorStrategy::Fail);
        assert_eq!(ErrorStrategy::Fail.to_string(), "FAIL");
    }

    #[test]
    fn test_closures_as_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let callback: Arc<dyn ExecutionCallback> = Arc::new(move |_run: &WorkflowRun| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        callback.on_complete(&WorkflowRun::new("m-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let advisor: Arc<dyn ExecutionAdvisor> = Arc::new(|instance: &StateExecutionInstance| {
            if instance.state_name == "skip-me" {
                Advice::Skip
            } else {
                Advice::Proceed
            }
        });
        let instance = StateExecutionInstance::new("run-1", "m-1", &State::new("skip-me", "NOOP"));
        assert_eq!(advisor.before_execution(&instance), Advice::Skip);
    }
}
