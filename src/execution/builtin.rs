//! Built-in Steps
//!
//! Small step types useful for wiring and testing machines:
//!
//! | Type        | Behaviour                                                  |
//! |-------------|------------------------------------------------------------|
//! | `NOOP`      | Succeeds immediately                                       |
//! | `FAIL`      | Finishes FAILED (or ERROR) with a rendered message         |
//! | `ECHO`      | Logs a rendered message, optionally publishing an outcome  |
//! | `SET_PARAM` | Evaluates expressions into parameters                      |
//! | `WAIT`      | Waits for an external notification                         |

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::machine::State;
use crate::outcome::OutcomeScope;
use crate::persistence::generate_id;

use super::context::ExecutionContext;
use super::status::ExecutionStatus;
use super::step::{state_config, ExecutionResponse, Step, StepRegistry};

pub const NOOP_STATE_TYPE: &str = "NOOP";
pub const FAIL_STATE_TYPE: &str = "FAIL";
pub const ECHO_STATE_TYPE: &str = "ECHO";
pub const SET_PARAM_STATE_TYPE: &str = "SET_PARAM";
pub const WAIT_STATE_TYPE: &str = "WAIT";

pub(crate) fn register_builtins(registry: &mut StepRegistry) {
    registry.register_step(NOOP_STATE_TYPE, Arc::new(NoopStep));
    registry.register(FAIL_STATE_TYPE, |state| Ok(Arc::new(FailStep::from_state(state)?) as Arc<dyn Step>));
    registry.register(ECHO_STATE_TYPE, |state| Ok(Arc::new(EchoStep::from_state(state)?) as Arc<dyn Step>));
    registry.register(SET_PARAM_STATE_TYPE, |state| {
        Ok(Arc::new(SetParamStep::from_state(state)?) as Arc<dyn Step>)
    });
    registry.register(WAIT_STATE_TYPE, |state| Ok(Arc::new(WaitStep::from_state(state)?) as Arc<dyn Step>));
}

pub struct NoopStep;

impl Step for NoopStep {
    fn execute(&self, _context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        Ok(ExecutionResponse::success())
    }
}

#[derive(Debug, Deserialize)]
struct FailConfig {
    #[serde(default = "default_fail_message")]
    message: String,
    #[serde(default = "default_fail_status")]
    status: ExecutionStatus,
}

fn default_fail_message() -> String {
    "step failed".to_string()
}

fn default_fail_status() -> ExecutionStatus {
    ExecutionStatus::Failed
}

pub struct FailStep {
    config: FailConfig,
}

impl FailStep {
    pub fn from_state(state: &State) -> Result<Self> {
        Ok(Self {
            config: state_config(state)?,
        })
    }
}

impl Step for FailStep {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        let message = context.render_expression(&self.config.message)?;
        let status = match self.config.status {
            ExecutionStatus::Error => ExecutionStatus::Error,
            _ => ExecutionStatus::Failed,
        };
        Ok(ExecutionResponse::finished(status, Some(message)))
    }
}

#[derive(Debug, Deserialize)]
struct EchoConfig {
    #[serde(default)]
    message: String,
    /// Publish the message as an outcome with this name
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    outcome_scope: OutcomeScope,
    /// Also store the message in this parameter
    #[serde(default)]
    param: Option<String>,
}

pub struct EchoStep {
    config: EchoConfig,
}

impl EchoStep {
    pub fn from_state(state: &State) -> Result<Self> {
        Ok(Self {
            config: state_config(state)?,
        })
    }
}

impl Step for EchoStep {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        let message = context.render_expression(&self.config.message)?;
        info!("[{}] {}", context.state_name(), message);

        if let Some(name) = &self.config.outcome {
            context.consume_outcome(
                name,
                Some(json!({ "message": message })),
                self.config.outcome_scope,
            )?;
        }
        if let Some(param) = &self.config.param {
            context.set_param(param.clone(), Value::String(message));
        }
        Ok(ExecutionResponse::success())
    }
}

#[derive(Debug, Deserialize)]
struct SetParamConfig {
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

pub struct SetParamStep {
    config: SetParamConfig,
}

impl SetParamStep {
    pub fn from_state(state: &State) -> Result<Self> {
        Ok(Self {
            config: state_config(state)?,
        })
    }
}

impl Step for SetParamStep {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        for (key, raw) in &self.config.params {
            let value = match raw {
                Value::String(expression) => context.evaluate_expression(expression)?,
                other => other.clone(),
            };
            context.set_param(key.clone(), value);
        }
        Ok(ExecutionResponse::success())
    }
}

#[derive(Debug, Deserialize)]
struct WaitConfig {
    /// Expression for the id to wait on; random when absent
    #[serde(default)]
    correlation_id: Option<String>,
}

pub struct WaitStep {
    config: WaitConfig,
}

impl WaitStep {
    pub fn from_state(state: &State) -> Result<Self> {
        Ok(Self {
            config: state_config(state)?,
        })
    }
}

impl Step for WaitStep {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        let correlation_id = match &self.config.correlation_id {
            Some(expression) => context.render_expression(expression)?,
            None => generate_id(),
        };
        info!(
            "[{}] waiting for notification {}",
            context.state_name(),
            correlation_id
        );
        Ok(ExecutionResponse::async_wait(vec![correlation_id]))
    }
}
