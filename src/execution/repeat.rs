//! Repeat and Fork States
//!
//! A REPEAT state evaluates an expression to a list of elements and runs
//! the sub-graph behind its REPEAT transition once per element:
//! - SERIAL runs one child at a time in list order
//! - PARALLEL starts every child at once
//!
//! A FORK state starts one child per branch listed in `fork_states`.
//! Both fan in through correlation ids, one per child.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{DefinitionError, Result};
use crate::machine::validator::fork_branches;
use crate::machine::{State, TransitionType};
use crate::persistence::generate_id;

use super::context::{ContextElement, ContextElementType, ExecutionContext};
use super::status::ExecutionStatus;
use super::step::{state_config, ChildExecution, ExecutionResponse, ResponseData, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    #[default]
    Serial,
    Parallel,
}

/// What a SERIAL repeat does when an element fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatFailurePolicy {
    /// Stop and fail without running the remaining elements
    #[default]
    AbortRemaining,
    /// Run every element, then fail if any failed
    Continue,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepeatConfig {
    pub repeat_element_expression: String,
    #[serde(default)]
    pub repeat_element_type: ContextElementType,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub failure_policy: RepeatFailurePolicy,
}

/// Results received so far, keyed by correlation id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanIn {
    results: BTreeMap<String, ExecutionStatus>,
}

impl FanIn {
    /// Records a result; false if the id already reported.
    pub fn record(&mut self, correlation_id: &str, status: ExecutionStatus) -> bool {
        if self.results.contains_key(correlation_id) {
            return false;
        }
        self.results.insert(correlation_id.to_string(), status);
        true
    }

    pub fn reported(&self) -> usize {
        self.results.len()
    }

    pub fn failures(&self) -> usize {
        self.results
            .values()
            .filter(|s| **s != ExecutionStatus::Success)
            .count()
    }

    fn outcome(&self, total: usize, what: &str) -> ExecutionResponse {
        match self.failures() {
            0 => ExecutionResponse::success(),
            failed => ExecutionResponse::failed(format!("{} of {} {} failed", failed, total, what)),
        }
    }
}

/// Progress of a repeat state, kept in its execution data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatExecutionData {
    pub target_state: String,
    pub strategy: ExecutionStrategy,
    pub failure_policy: RepeatFailurePolicy,
    pub elements: Vec<ContextElement>,
    /// Element currently running; unset for PARALLEL
    pub repeat_element_index: Option<usize>,
    pub fan_in: FanIn,
    pub element_by_correlation: BTreeMap<String, usize>,
}

impl RepeatExecutionData {
    fn child(&mut self, index: usize) -> ChildExecution {
        let correlation_id = generate_id();
        self.element_by_correlation
            .insert(correlation_id.clone(), index);
        ChildExecution {
            correlation_id,
            state_name: self.target_state.clone(),
            element: self.elements.get(index).cloned(),
            repeat_element_index: Some(index),
        }
    }
}

pub struct RepeatStep {
    state_name: String,
    config: RepeatConfig,
}

impl RepeatStep {
    pub fn from_state(state: &State) -> Result<Self> {
        Ok(Self {
            state_name: state.name.clone(),
            config: state_config(state)?,
        })
    }

    pub fn config(&self) -> &RepeatConfig {
        &self.config
    }
}

impl Step for RepeatStep {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        let target_state = context
            .state_machine()
            .next_state(&self.state_name, TransitionType::Repeat)
            .map(|s| s.name.clone())
            .ok_or_else(|| DefinitionError::MissingRepeatTransition(self.state_name.clone()))?;

        let elements = context.evaluate_repeat_expression(
            self.config.repeat_element_type,
            &self.config.repeat_element_expression,
        )?;

        if elements.is_empty() {
            info!("Repeat '{}' has no elements, nothing to run", self.state_name);
            return Ok(ExecutionResponse::success());
        }

        let mut data = RepeatExecutionData {
            target_state,
            strategy: self.config.execution_strategy,
            failure_policy: self.config.failure_policy,
            elements,
            repeat_element_index: None,
            fan_in: FanIn::default(),
            element_by_correlation: BTreeMap::new(),
        };

        let children = match data.strategy {
            ExecutionStrategy::Serial => {
                data.repeat_element_index = Some(0);
                vec![data.child(0)]
            }
            ExecutionStrategy::Parallel => (0..data.elements.len()).map(|i| data.child(i)).collect(),
        };

        info!(
            "Repeat '{}' over {} elements ({:?})",
            self.state_name,
            data.elements.len(),
            data.strategy
        );
        context.set_execution_data(&data)?;
        Ok(ExecutionResponse::spawn(children))
    }

    fn handle_async_response(
        &self,
        context: &mut ExecutionContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<ExecutionResponse> {
        let Some(mut data) = context.execution_data::<RepeatExecutionData>()? else {
            return Ok(ExecutionResponse::error(format!(
                "Repeat '{}' has no progress data",
                self.state_name
            )));
        };
        let total = data.elements.len();

        for (correlation_id, response) in responses {
            let Some(&index) = data.element_by_correlation.get(correlation_id) else {
                warn!(
                    "Repeat '{}' got a response for foreign id {}",
                    self.state_name, correlation_id
                );
                continue;
            };
            if !data.fan_in.record(correlation_id, response.status) {
                debug!("Duplicate response for {} ignored", correlation_id);
                continue;
            }

            let element_name = data.elements.get(index).map(|e| e.name.clone()).unwrap_or_default();
            debug!(
                "Repeat '{}' element {} ('{}') reported {}",
                self.state_name, index, element_name, response.status
            );

            if data.strategy != ExecutionStrategy::Serial {
                continue;
            }

            if response.status != ExecutionStatus::Success
                && data.failure_policy == RepeatFailurePolicy::AbortRemaining
            {
                context.set_execution_data(&data)?;
                return Ok(ExecutionResponse::failed(format!(
                    "Repeat element '{}' ({}) finished {}; {} remaining skipped",
                    element_name,
                    index,
                    response.status,
                    total - index - 1
                )));
            }

            let next = index + 1;
            if next < total {
                data.repeat_element_index = Some(next);
                let child = data.child(next);
                context.set_execution_data(&data)?;
                return Ok(ExecutionResponse::spawn(vec![child]));
            }
        }

        context.set_execution_data(&data)?;
        if data.fan_in.reported() >= total {
            Ok(data.fan_in.outcome(total, "repeat elements"))
        } else {
            Ok(ExecutionResponse::still_waiting())
        }
    }
}

/// Progress of a fork state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForkExecutionData {
    pub fan_in: FanIn,
    pub branch_by_correlation: BTreeMap<String, String>,
}

pub struct ForkStep {
    state_name: String,
    branches: Vec<String>,
}

impl ForkStep {
    pub fn from_state(state: &State) -> Result<Self> {
        let branches: Vec<String> = fork_branches(&state.config)
            .into_iter()
            .map(String::from)
            .collect();
        if branches.is_empty() {
            return Err(DefinitionError::InvalidStateConfig {
                state: state.name.clone(),
                reason: "no fork branches".to_string(),
            }
            .into());
        }
        Ok(Self {
            state_name: state.name.clone(),
            branches,
        })
    }
}

impl Step for ForkStep {
    fn execute(&self, context: &mut ExecutionContext) -> Result<ExecutionResponse> {
        let mut data = ForkExecutionData::default();
        let children: Vec<ChildExecution> = self
            .branches
            .iter()
            .map(|branch| {
                let correlation_id = generate_id();
                data.branch_by_correlation
                    .insert(correlation_id.clone(), branch.clone());
                ChildExecution {
                    correlation_id,
                    state_name: branch.clone(),
                    element: None,
                    repeat_element_index: None,
                }
            })
            .collect();

        info!("Fork '{}' into {:?}", self.state_name, self.branches);
        context.set_execution_data(&data)?;
        Ok(ExecutionResponse::spawn(children))
    }

    fn handle_async_response(
        &self,
        context: &mut ExecutionContext,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<ExecutionResponse> {
        let mut data: ForkExecutionData = context.execution_data()?.unwrap_or_default();

        for (correlation_id, response) in responses {
            if !data.branch_by_correlation.contains_key(correlation_id) {
                warn!(
                    "Fork '{}' got a response for foreign id {}",
                    self.state_name, correlation_id
                );
                continue;
            }
            data.fan_in.record(correlation_id, response.status);
        }

        context.set_execution_data(&data)?;
        let total = data.branch_by_correlation.len();
        if data.fan_in.reported() >= total {
            Ok(data.fan_in.outcome(total, "fork branches"))
        } else {
            Ok(ExecutionResponse::still_waiting())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::tests::test_context;
    use crate::machine::StateMachine;
    use serde_json::json;

    fn repeat_machine(strategy: &str, policy: &str) -> StateMachine {
        let mut machine = StateMachine::new("repeat");
        machine
            .add_state(State::new("loop", "REPEAT").with_config(json!({
                "repeat_element_expression": "${hosts}",
                "repeat_element_type": "HOST",
                "execution_strategy": strategy,
                "failure_policy": policy,
            })))
            .unwrap();
        machine.add_state(State::new("body", "NOOP")).unwrap();
        machine
            .add_transition("loop", "body", TransitionType::Repeat)
            .unwrap();
        machine.set_initial_state("loop");
        machine.validate().unwrap();
        machine
    }

    fn step_for(machine: &StateMachine) -> RepeatStep {
        RepeatStep::from_state(machine.get_state("loop").unwrap()).unwrap()
    }

    fn report(id: &str, status: ExecutionStatus) -> BTreeMap<String, ResponseData> {
        let mut map = BTreeMap::new();
        map.insert(
            id.to_string(),
            ResponseData {
                status,
                error_message: None,
                payload: None,
            },
        );
        map
    }

    #[test]
    fn test_serial_spawns_one_child() {
        let machine = repeat_machine("SERIAL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!(["a", "b"]));

        let response = step.execute(&mut ctx).unwrap();
        assert!(response.is_async);
        assert_eq!(response.correlation_ids.len(), 1);
        assert_eq!(response.children[0].state_name, "body");
        assert_eq!(response.children[0].element.as_ref().unwrap().name, "a");

        let data: RepeatExecutionData = ctx.execution_data().unwrap().unwrap();
        assert_eq!(data.repeat_element_index, Some(0));
    }

    #[test]
    fn test_serial_advances_then_completes() {
        let machine = repeat_machine("SERIAL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!(["a", "b"]));

        let first = step.execute(&mut ctx).unwrap();
        let response = step
            .handle_async_response(&mut ctx, &report(&first.correlation_ids[0], ExecutionStatus::Success))
            .unwrap();
        assert_eq!(response.children.len(), 1);
        assert_eq!(response.children[0].element.as_ref().unwrap().name, "b");
        assert_eq!(response.children[0].repeat_element_index, Some(1));

        let done = step
            .handle_async_response(&mut ctx, &report(&response.correlation_ids[0], ExecutionStatus::Success))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert!(!done.is_async);
    }

    #[test]
    fn test_serial_failure_aborts_remaining() {
        let machine = repeat_machine("SERIAL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!(["a", "b", "c"]));

        let first = step.execute(&mut ctx).unwrap();
        let response = step
            .handle_async_response(&mut ctx, &report(&first.correlation_ids[0], ExecutionStatus::Failed))
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::Failed);
        assert!(response.children.is_empty());
        assert!(response.error_message.unwrap().contains("2 remaining skipped"));
    }

    #[test]
    fn test_serial_continue_policy_aggregates() {
        let machine = repeat_machine("SERIAL", "CONTINUE");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!(["a", "b"]));

        let first = step.execute(&mut ctx).unwrap();
        let second = step
            .handle_async_response(&mut ctx, &report(&first.correlation_ids[0], ExecutionStatus::Failed))
            .unwrap();
        assert_eq!(second.children.len(), 1);

        let done = step
            .handle_async_response(&mut ctx, &report(&second.correlation_ids[0], ExecutionStatus::Success))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("1 of 2 repeat elements failed"));
    }

    #[test]
    fn test_parallel_waits_for_all_in_any_order() {
        let machine = repeat_machine("PARALLEL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!(["a", "b"]));

        let response = step.execute(&mut ctx).unwrap();
        assert_eq!(response.correlation_ids.len(), 2);
        let data: RepeatExecutionData = ctx.execution_data().unwrap().unwrap();
        assert_eq!(data.repeat_element_index, None);

        let second_id = response.correlation_ids[1].clone();
        let first_id = response.correlation_ids[0].clone();

        let waiting = step
            .handle_async_response(&mut ctx, &report(&second_id, ExecutionStatus::Success))
            .unwrap();
        assert!(waiting.is_async);
        assert!(waiting.correlation_ids.is_empty());

        // Duplicate report is ignored
        let waiting = step
            .handle_async_response(&mut ctx, &report(&second_id, ExecutionStatus::Failed))
            .unwrap();
        assert!(waiting.is_async);

        let done = step
            .handle_async_response(&mut ctx, &report(&first_id, ExecutionStatus::Success))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
    }

    #[test]
    fn test_parallel_any_failure_fails() {
        let machine = repeat_machine("PARALLEL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!(["a", "b"]));

        let response = step.execute(&mut ctx).unwrap();
        let waiting = step
            .handle_async_response(&mut ctx, &report(&response.correlation_ids[0], ExecutionStatus::Failed))
            .unwrap();
        assert!(waiting.is_async);

        let done = step
            .handle_async_response(&mut ctx, &report(&response.correlation_ids[1], ExecutionStatus::Success))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_empty_list_is_synchronous_success() {
        let machine = repeat_machine("PARALLEL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!([]));

        let response = step.execute(&mut ctx).unwrap();
        assert_eq!(response.status, ExecutionStatus::Success);
        assert!(!response.is_async);
        assert!(response.correlation_ids.is_empty());
    }

    #[test]
    fn test_non_list_expression_errors() {
        let machine = repeat_machine("SERIAL", "ABORT_REMAINING");
        let step = step_for(&machine);
        let mut ctx = test_context(machine, "loop");
        ctx.set_param("hosts", json!({"a": 1}));
        assert!(step.execute(&mut ctx).is_err());
    }

    #[test]
    fn test_fork_fans_out_and_in() {
        let mut machine = StateMachine::new("fork");
        machine
            .add_state(State::new("split", "FORK").with_config(json!({"fork_states": ["x", "y"]})))
            .unwrap();
        machine.add_state(State::new("x", "NOOP")).unwrap();
        machine.add_state(State::new("y", "NOOP")).unwrap();
        machine.set_initial_state("split");
        machine.validate().unwrap();

        let step = ForkStep::from_state(machine.get_state("split").unwrap()).unwrap();
        let mut ctx = test_context(machine, "split");

        let response = step.execute(&mut ctx).unwrap();
        let names: Vec<&str> = response.children.iter().map(|c| c.state_name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);

        let waiting = step
            .handle_async_response(&mut ctx, &report(&response.correlation_ids[0], ExecutionStatus::Success))
            .unwrap();
        assert!(waiting.is_async);
        let done = step
            .handle_async_response(&mut ctx, &report(&response.correlation_ids[1], ExecutionStatus::Success))
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
    }

    #[test]
    fn test_fork_requires_branches() {
        assert!(ForkStep::from_state(&State::new("split", "FORK")).is_err());
    }
}
