//! Execution Events
//!
//! Operator interventions on a running workflow:
//!
//! | Event        | Target   | Allowed from                          | Effect                       |
//! |--------------|----------|---------------------------------------|------------------------------|
//! | `PAUSE`      | instance | RUNNING, QUEUED, NEW                  | PAUSED, cascades to children |
//! | `RESUME`     | instance | PAUSED, WAITING                       | status held before the pause |
//! | `RETRY`      | instance | FAILED, ERROR, WAITING                | NEW, re-queued               |
//! | `ABORT`      | instance | RUNNING, QUEUED, NEW, PAUSED, WAITING | ABORTED with its children    |
//! | `PAUSE_ALL`  | run      | no active pause-all, abort-all | pauses and parks the run     |
//! | `RESUME_ALL` | run      | an active pause-all            | lifts the pause              |
//! | `ABORT_ALL`  | run      | no active abort-all            | aborts every active instance |
//!
//! Run-wide events are persisted together with a [`Directive`] that stays
//! active until it is cleared or superseded. Instance events are applied
//! immediately and not stored.
//!
//! A WAITING instance failed under the PAUSE error strategy. Resuming it
//! accepts the failure and ends its chain; retrying runs it again.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{IllegalTransition, InvalidArgument, Result};
use crate::monitoring::EventType;
use crate::persistence::{generate_id, Criteria, Entity};

use super::correlation::Notification;
use super::dispatcher::WorkItem;
use super::engine::{hold, EngineCore};
use super::instance::{StateExecutionInstance, WorkflowRun};
use super::status::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventType {
    Pause,
    Resume,
    Retry,
    Abort,
    PauseAll,
    ResumeAll,
    AbortAll,
}

impl ExecutionEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Retry => "RETRY",
            Self::Abort => "ABORT",
            Self::PauseAll => "PAUSE_ALL",
            Self::ResumeAll => "RESUME_ALL",
            Self::AbortAll => "ABORT_ALL",
        }
    }

    /// Whether the event applies to a whole run rather than one instance.
    pub fn is_run_wide(self) -> bool {
        matches!(self, Self::PauseAll | Self::ResumeAll | Self::AbortAll)
    }
}

impl fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator request against a run or one of its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: String,
    pub workflow_execution_id: String,
    pub app_scope_id: Option<String>,
    pub env_scope_id: Option<String>,
    pub execution_event_type: ExecutionEventType,
    pub target_state_execution_instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(event_type: ExecutionEventType, workflow_execution_id: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            workflow_execution_id: workflow_execution_id.into(),
            app_scope_id: None,
            env_scope_id: None,
            execution_event_type: event_type,
            target_state_execution_instance_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn targeting(mut self, instance_id: impl Into<String>) -> Self {
        self.target_state_execution_instance_id = Some(instance_id.into());
        self
    }

    pub fn with_scope(mut self, app_id: impl Into<String>, env_id: impl Into<String>) -> Self {
        self.app_scope_id = Some(app_id.into());
        self.env_scope_id = Some(env_id.into());
        self
    }
}

impl Entity for ExecutionEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "workflow_execution_id" => Some(self.workflow_execution_id.clone()),
            "execution_event_type" => Some(self.execution_event_type.as_str().to_string()),
            "target_state_execution_instance_id" => {
                self.target_state_execution_instance_id.clone()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectiveState {
    Active,
    Cleared,
    Superseded,
}

impl DirectiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Cleared => "CLEARED",
            Self::Superseded => "SUPERSEDED",
        }
    }
}

/// A run-wide event's lasting effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub id: String,
    pub workflow_execution_id: String,
    pub directive_type: ExecutionEventType,
    pub state: DirectiveState,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Directive {
    fn for_event(event: &ExecutionEvent) -> Self {
        Self {
            id: generate_id(),
            workflow_execution_id: event.workflow_execution_id.clone(),
            directive_type: event.execution_event_type,
            state: DirectiveState::Active,
            event_id: event.id.clone(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

impl Entity for Directive {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "workflow_execution_id" => Some(self.workflow_execution_id.clone()),
            "directive_type" => Some(self.directive_type.as_str().to_string()),
            "state" => Some(self.state.as_str().to_string()),
            "event_id" => Some(self.event_id.clone()),
            _ => None,
        }
    }
}

const PAUSABLE: [ExecutionStatus; 3] = [
    ExecutionStatus::Running,
    ExecutionStatus::Queued,
    ExecutionStatus::New,
];

const ABORTABLE: [ExecutionStatus; 5] = [
    ExecutionStatus::Running,
    ExecutionStatus::Queued,
    ExecutionStatus::New,
    ExecutionStatus::Paused,
    ExecutionStatus::Waiting,
];

/// Validates and applies execution events.
#[derive(Clone)]
pub struct ExecutionEventManager {
    core: Arc<EngineCore>,
}

impl ExecutionEventManager {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Validates an event and applies it, returning the accepted event.
    ///
    /// Rejected events leave every status unchanged.
    pub fn register(&self, event: ExecutionEvent) -> Result<ExecutionEvent> {
        let event_type = event.execution_event_type;
        if event.workflow_execution_id.trim().is_empty() {
            return Err(InvalidArgument::MissingExecutionId.into());
        }
        let run = self
            .core
            .persistence
            .runs
            .get(&event.workflow_execution_id)?
            .ok_or_else(|| InvalidArgument::UnknownExecution(event.workflow_execution_id.clone()))?;

        info!("{} requested for run {}", event_type, run.id);

        if event_type.is_run_wide() {
            let _directives = hold(&self.core.directive_lock);
            match event_type {
                ExecutionEventType::PauseAll => self.pause_all(&run, &event)?,
                ExecutionEventType::ResumeAll => self.resume_all(&run, &event)?,
                _ => self.abort_all(&run, &event)?,
            }
            return Ok(event);
        }

        let target_id = event
            .target_state_execution_instance_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(InvalidArgument::MissingTargetInstance(event_type))?;
        let target = self
            .core
            .persistence
            .instances
            .get(target_id)?
            .filter(|instance| instance.workflow_execution_id == run.id)
            .ok_or_else(|| InvalidArgument::UnknownInstance(target_id.to_string()))?;

        match event_type {
            ExecutionEventType::Pause => self.pause(&target.id, true)?,
            ExecutionEventType::Resume => self.resume(&target.id, true)?,
            ExecutionEventType::Retry => self.retry(&target.id)?,
            _ => self.abort(&target.id)?,
        }
        Ok(event)
    }

    fn instance(&self, instance_id: &str) -> Result<StateExecutionInstance> {
        self.core
            .persistence
            .instances
            .get(instance_id)?
            .ok_or_else(|| InvalidArgument::UnknownInstance(instance_id.to_string()).into())
    }

    fn children(
        &self,
        parent_id: &str,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<StateExecutionInstance>> {
        let criteria = Criteria::new()
            .eq("parent_instance_id", parent_id)
            .in_set("status", statuses.iter().map(|s| s.as_str()));
        self.core.persistence.instances.find_all(&criteria)
    }

    fn run_instances(
        &self,
        run_id: &str,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<StateExecutionInstance>> {
        let criteria = Criteria::new()
            .eq("workflow_execution_id", run_id)
            .in_set("status", statuses.iter().map(|s| s.as_str()));
        self.core.persistence.instances.find_all(&criteria)
    }

    fn pause(&self, instance_id: &str, cascade: bool) -> Result<()> {
        {
            let _guard = self.core.lock_instance(instance_id);

            let mut instance = self.instance(instance_id)?;
            if !PAUSABLE.contains(&instance.status) {
                return Err(IllegalTransition::StateNotForPause {
                    state: instance.state_name,
                    status: instance.status,
                }
                .into());
            }
            instance.paused_from = Some(instance.status);
            instance.status = ExecutionStatus::Paused;
            self.core.save_instance(&instance)?;
            self.core.record(&instance, EventType::Paused);
            info!("Paused '{}'", instance.label());
        }

        if cascade {
            for child in self.children(instance_id, &PAUSABLE)? {
                if let Err(e) = self.pause(&child.id, true) {
                    debug!("Child {} not paused: {}", child.id, e);
                }
            }
        }
        Ok(())
    }

    fn resume(&self, instance_id: &str, cascade: bool) -> Result<()> {
        let accepted_failure = {
            let _guard = self.core.lock_instance(instance_id);

            let mut instance = self.instance(instance_id)?;
            if instance.status == ExecutionStatus::Waiting {
                instance.status = instance.paused_from.take().unwrap_or(ExecutionStatus::Failed);
                self.core.save_instance(&instance)?;
                info!("Accepted failure of '{}' ({})", instance.label(), instance.status);
                Some(instance)
            } else {
                self.resume_paused(instance)?;
                None
            }
        };
        if let Some(instance) = accepted_failure {
            return self.core.end_transition(&instance);
        }

        if cascade {
            for child in self.children(instance_id, &[ExecutionStatus::Paused])? {
                if let Err(e) = self.resume(&child.id, true) {
                    debug!("Child {} not resumed: {}", child.id, e);
                }
            }
        }
        Ok(())
    }

    /// Restores a PAUSED instance. Called with its lock held.
    fn resume_paused(&self, mut instance: StateExecutionInstance) -> Result<()> {
        if instance.status != ExecutionStatus::Paused {
            return Err(IllegalTransition::StateNotForResume {
                state: instance.state_name,
                status: instance.status,
            }
            .into());
        }

        let resumed_to = instance.paused_from.take();
        if resumed_to == Some(ExecutionStatus::Running) {
            instance.status = ExecutionStatus::Running;
            let buffered = std::mem::take(&mut instance.buffered_responses);
            self.core.save_instance(&instance)?;
            for (correlation_id, response) in buffered {
                debug!("Replaying buffered notification {}", correlation_id);
                self.core.correlations.register(
                    &correlation_id,
                    &instance.id,
                    &instance.workflow_execution_id,
                );
                self.core.queue.push(WorkItem::Resume(Notification {
                    correlation_id,
                    response,
                }));
            }
        } else {
            instance.status = ExecutionStatus::Queued;
            self.core.save_instance(&instance)?;
            self.core.queue.push(WorkItem::Start {
                instance_id: instance.id.clone(),
            });
        }
        self.core.record(&instance, EventType::Resumed);
        info!("Resumed '{}' ({})", instance.label(), instance.status);
        Ok(())
    }

    fn retry(&self, instance_id: &str) -> Result<()> {
        let instance = {
            let _guard = self.core.lock_instance(instance_id);

            let mut instance = self.instance(instance_id)?;
            if !matches!(
                instance.status,
                ExecutionStatus::Failed | ExecutionStatus::Error | ExecutionStatus::Waiting
            ) {
                return Err(IllegalTransition::StateNotForRetry {
                    state: instance.state_name,
                    status: instance.status,
                }
                .into());
            }
            instance.status = ExecutionStatus::New;
            instance.retry_count += 1;
            instance.error_message = None;
            instance.start_time = None;
            instance.end_time = None;
            instance.correlation_ids.clear();
            instance.execution_data = None;
            instance.paused_from = None;
            instance.buffered_responses.clear();
            instance.advised = false;
            self.core.save_instance(&instance)?;
            instance
        };

        let removed = self.core.outcomes.clean_for_node(instance_id)?;
        if removed > 0 {
            debug!("Removed {} outcomes of '{}' before retry", removed, instance.label());
        }

        if instance.parent_instance_id.is_none() {
            self.core
                .persistence
                .runs
                .update(&instance.workflow_execution_id, &mut |run: &mut WorkflowRun| {
                    if !run.status.is_final() {
                        return false;
                    }
                    run.status = ExecutionStatus::Running;
                    run.end_time = None;
                    true
                })?;
        }

        self.core.queue.push(WorkItem::Start {
            instance_id: instance.id.clone(),
        });
        info!(
            "Retrying '{}' (attempt {})",
            instance.label(),
            instance.retry_count + 1
        );
        Ok(())
    }

    fn abort(&self, instance_id: &str) -> Result<()> {
        {
            let _guard = self.core.lock_instance(instance_id);

            let mut instance = self.instance(instance_id)?;
            if !ABORTABLE.contains(&instance.status) {
                return Err(IllegalTransition::StateNotForAbort {
                    state: instance.state_name,
                    status: instance.status,
                }
                .into());
            }
            instance.status = ExecutionStatus::Discontinuing;
            self.core.save_instance(&instance)?;
        }

        self.abort_children(instance_id)?;

        let aborted = {
            let _guard = self.core.lock_instance(instance_id);
            self.mark_aborted(self.instance(instance_id)?)?
        };
        self.core.end_transition(&aborted)
    }

    fn mark_aborted(&self, mut instance: StateExecutionInstance) -> Result<StateExecutionInstance> {
        instance.status = ExecutionStatus::Aborted;
        instance.end_time = Some(Utc::now());
        instance.correlation_ids.clear();
        instance.buffered_responses.clear();
        instance.paused_from = None;
        self.core.release_correlations(&instance.id);
        self.core.save_instance(&instance)?;
        self.core.record(&instance, EventType::Aborted);
        info!("Aborted '{}'", instance.label());
        Ok(instance)
    }

    /// Aborts an instance without reporting to its parent.
    fn abort_quietly(&self, instance_id: &str) -> Result<()> {
        {
            let _guard = self.core.lock_instance(instance_id);

            let instance = self.instance(instance_id)?;
            if instance.status.is_final() {
                return Ok(());
            }
            self.mark_aborted(instance)?;
        }
        self.abort_children(instance_id)
    }

    fn abort_children(&self, parent_id: &str) -> Result<()> {
        for child in self.children(parent_id, &ExecutionStatus::ACTIVE)? {
            self.abort_quietly(&child.id)?;
        }
        Ok(())
    }

    fn supersede(&self, run_id: &str, types: &[ExecutionEventType]) -> Result<()> {
        for directive_type in types {
            if let Some(directive) = self.core.active_directive(run_id, *directive_type)? {
                self.set_directive_state(&directive.id, DirectiveState::Superseded)?;
                debug!("{} directive on run {} superseded", directive_type, run_id);
            }
        }
        Ok(())
    }

    fn set_directive_state(&self, directive_id: &str, state: DirectiveState) -> Result<()> {
        self.core
            .persistence
            .directives
            .update(directive_id, &mut |directive: &mut Directive| {
                directive.state = state;
                directive.updated_at = Some(Utc::now());
                true
            })?;
        Ok(())
    }

    fn record_directive(&self, event: &ExecutionEvent) -> Result<()> {
        self.core.persistence.events.save(event.clone())?;
        self.core
            .persistence
            .directives
            .save(Directive::for_event(event))?;
        Ok(())
    }

    fn set_run_status(&self, run_id: &str, from: &[ExecutionStatus], to: ExecutionStatus) -> Result<()> {
        let updated = self
            .core
            .persistence
            .runs
            .update(run_id, &mut |run: &mut WorkflowRun| {
                if !from.contains(&run.status) {
                    return false;
                }
                run.status = to;
                if to.is_final() {
                    run.end_time = Some(Utc::now());
                }
                true
            })?;
        if let Some(run) = updated.filter(|run| run.status.is_final()) {
            self.core.run_finished(&run);
        }
        Ok(())
    }

    fn pause_all(&self, run: &WorkflowRun, event: &ExecutionEvent) -> Result<()> {
        if self
            .core
            .active_directive(&run.id, ExecutionEventType::AbortAll)?
            .is_some()
        {
            return Err(IllegalTransition::AbortAllAlreadyInEffect(run.id.clone()).into());
        }
        if self
            .core
            .active_directive(&run.id, ExecutionEventType::PauseAll)?
            .is_some()
        {
            return Err(IllegalTransition::PauseAllAlreadyInEffect(run.id.clone()).into());
        }

        self.supersede(&run.id, &[ExecutionEventType::ResumeAll])?;
        self.record_directive(event)?;
        self.set_run_status(&run.id, &[ExecutionStatus::Running], ExecutionStatus::Paused)?;

        for instance in self.run_instances(&run.id, &PAUSABLE)? {
            if let Err(e) = self.pause(&instance.id, false) {
                debug!("Instance {} not paused: {}", instance.id, e);
            }
        }
        info!("Run {} paused", run.id);
        Ok(())
    }

    fn resume_all(&self, run: &WorkflowRun, event: &ExecutionEvent) -> Result<()> {
        let Some(pause) = self
            .core
            .active_directive(&run.id, ExecutionEventType::PauseAll)?
        else {
            return Err(IllegalTransition::NoPauseAllInEffect(run.id.clone()).into());
        };

        self.set_directive_state(&pause.id, DirectiveState::Cleared)?;
        self.record_directive(event)?;
        self.set_run_status(&run.id, &[ExecutionStatus::Paused], ExecutionStatus::Running)?;

        for instance in self.run_instances(&run.id, &[ExecutionStatus::Paused])? {
            if let Err(e) = self.resume(&instance.id, false) {
                warn!("Instance {} not resumed: {}", instance.id, e);
            }
        }
        info!("Run {} resumed", run.id);
        Ok(())
    }

    fn abort_all(&self, run: &WorkflowRun, event: &ExecutionEvent) -> Result<()> {
        if self
            .core
            .active_directive(&run.id, ExecutionEventType::AbortAll)?
            .is_some()
        {
            return Err(IllegalTransition::AbortAllAlreadyInEffect(run.id.clone()).into());
        }

        self.supersede(
            &run.id,
            &[ExecutionEventType::PauseAll, ExecutionEventType::ResumeAll],
        )?;
        self.record_directive(event)?;
        self.set_run_status(&run.id, &ExecutionStatus::ACTIVE, ExecutionStatus::Aborted)?;

        for instance in self.run_instances(&run.id, &ExecutionStatus::ACTIVE)? {
            self.abort_quietly(&instance.id)?;
        }
        info!("Run {} aborted", run.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::execution::engine::tests::{executor, find, machine, run_status};
    use crate::execution::advice::ErrorStrategy;
    use crate::execution::engine::{ExecutionArgs, StateMachineExecutor};
    use crate::execution::step::{ExecutionResponse, ResponseData, Step, StepRegistry};
    use crate::execution::context::ExecutionContext;
    use crate::config::EngineConfig;
    use crate::expression::TemplateEvaluator;
    use crate::machine::{State, TransitionType};
    use crate::persistence::Persistence;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn waiting_run(executor: &StateMachineExecutor) -> (WorkflowRun, StateExecutionInstance) {
        let m = machine(
            "waiting",
            vec![
                State::new("wait", "WAIT").with_config(json!({"correlation_id": "job"})),
                State::new("after", "NOOP"),
            ],
            &[("wait", "after", TransitionType::Success)],
        );
        let m = executor.register_machine(m).unwrap();
        let run = executor.execute(&m.id, ExecutionArgs::new()).unwrap();
        executor.run_until_idle();
        let wait = executor.instances(&run.id).unwrap().remove(0);
        (run, wait)
    }

    fn event(kind: ExecutionEventType, run: &WorkflowRun) -> ExecutionEvent {
        ExecutionEvent::new(kind, run.id.clone())
    }

    fn status_of(executor: &StateMachineExecutor, id: &str) -> ExecutionStatus {
        executor.instance(id).unwrap().unwrap().status
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(ExecutionEventType::PauseAll.to_string(), "PAUSE_ALL");
        assert!(ExecutionEventType::AbortAll.is_run_wide());
        assert!(!ExecutionEventType::Retry.is_run_wide());
    }

    #[test]
    fn test_validation_errors() {
        let executor = executor();
        let (run, _) = waiting_run(&executor);

        let missing_run = ExecutionEvent::new(ExecutionEventType::Pause, "");
        assert!(matches!(
            executor.submit_event(missing_run),
            Err(EngineError::InvalidArgument(InvalidArgument::MissingExecutionId))
        ));
        assert!(matches!(
            executor.submit_event(ExecutionEvent::new(ExecutionEventType::Pause, "ghost")),
            Err(EngineError::InvalidArgument(InvalidArgument::UnknownExecution(_)))
        ));
        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::Pause, &run)),
            Err(EngineError::InvalidArgument(InvalidArgument::MissingTargetInstance(
                ExecutionEventType::Pause
            )))
        ));
        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::Abort, &run).targeting("ghost")),
            Err(EngineError::InvalidArgument(InvalidArgument::UnknownInstance(_)))
        ));
    }

    #[test]
    fn test_instance_of_other_run_rejected() {
        let executor = executor();
        let (_, first_wait) = waiting_run(&executor);
        let (second, _) = waiting_run(&executor);

        let result = executor.submit_event(event(ExecutionEventType::Pause, &second).targeting(&first_wait.id));
        assert!(matches!(
            result,
            Err(EngineError::InvalidArgument(InvalidArgument::UnknownInstance(_)))
        ));
        assert_eq!(status_of(&executor, &first_wait.id), ExecutionStatus::Running);
    }

    #[test]
    fn test_pause_buffers_and_resume_replays() {
        let executor = executor();
        let (run, wait) = waiting_run(&executor);

        executor
            .submit_event(event(ExecutionEventType::Pause, &run).targeting(&wait.id))
            .unwrap();
        assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Paused);

        assert!(executor.notify("job", ResponseData::success()));
        executor.run_until_idle();
        let paused = executor.instance(&wait.id).unwrap().unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.buffered_responses.len(), 1);

        executor
            .submit_event(event(ExecutionEventType::Resume, &run).targeting(&wait.id))
            .unwrap();
        executor.run_until_idle();

        assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Success);
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Success);
    }

    #[test]
    fn test_rejected_events_leave_status() {
        let executor = executor();
        let (run, wait) = waiting_run(&executor);

        let resume = executor.submit_event(event(ExecutionEventType::Resume, &run).targeting(&wait.id));
        assert!(matches!(
            resume,
            Err(EngineError::IllegalTransition(IllegalTransition::StateNotForResume { .. }))
        ));
        let retry = executor.submit_event(event(ExecutionEventType::Retry, &run).targeting(&wait.id));
        assert!(matches!(
            retry,
            Err(EngineError::IllegalTransition(IllegalTransition::StateNotForRetry { .. }))
        ));
        assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Running);

        executor.notify("job", ResponseData::success());
        executor.run_until_idle();

        for kind in [ExecutionEventType::Pause, ExecutionEventType::Abort] {
            let result = executor.submit_event(event(kind, &run).targeting(&wait.id));
            assert!(matches!(result, Err(EngineError::IllegalTransition(_))));
            assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Success);
        }
    }

    #[test]
    fn test_pause_all_twice_rejected() {
        let executor = executor();
        let (run, _) = waiting_run(&executor);

        executor.submit_event(event(ExecutionEventType::PauseAll, &run)).unwrap();
        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::PauseAll, &run)),
            Err(EngineError::IllegalTransition(IllegalTransition::PauseAllAlreadyInEffect(_)))
        ));
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Paused);
    }

    #[test]
    fn test_pause_resume_pause_all_cycle() {
        let executor = executor();
        let (run, wait) = waiting_run(&executor);

        executor.submit_event(event(ExecutionEventType::PauseAll, &run)).unwrap();
        assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Paused);

        executor.submit_event(event(ExecutionEventType::ResumeAll, &run)).unwrap();
        assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Running);
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Running);

        executor.submit_event(event(ExecutionEventType::PauseAll, &run)).unwrap();

        let directives = executor
            .persistence()
            .directives
            .find_all(&Criteria::new().eq("workflow_execution_id", run.id.as_str()))
            .unwrap();
        let states: Vec<(ExecutionEventType, DirectiveState)> = directives
            .iter()
            .map(|d| (d.directive_type, d.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (ExecutionEventType::PauseAll, DirectiveState::Cleared),
                (ExecutionEventType::ResumeAll, DirectiveState::Superseded),
                (ExecutionEventType::PauseAll, DirectiveState::Active),
            ]
        );
        assert_eq!(
            executor
                .persistence()
                .events
                .find_all(&Criteria::new())
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn test_resume_all_scoped_to_run() {
        let executor = executor();
        let (first, _) = waiting_run(&executor);
        let (second, _) = waiting_run(&executor);

        executor.submit_event(event(ExecutionEventType::PauseAll, &first)).unwrap();
        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::ResumeAll, &second)),
            Err(EngineError::IllegalTransition(IllegalTransition::NoPauseAllInEffect(_)))
        ));

        let manager = executor.event_manager();
        assert!(manager
            .core
            .active_directive(&first.id, ExecutionEventType::PauseAll)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_pause_all_parks_new_instances() {
        let executor = executor();
        let (run, wait) = waiting_run(&executor);

        executor.submit_event(event(ExecutionEventType::PauseAll, &run)).unwrap();
        executor
            .submit_event(event(ExecutionEventType::Resume, &run).targeting(&wait.id))
            .unwrap();
        executor.notify("job", ResponseData::success());
        executor.run_until_idle();

        let instances = executor.instances(&run.id).unwrap();
        let after = find(&instances, "after")[0].clone();
        assert_eq!(after.status, ExecutionStatus::Paused);
        assert_eq!(after.paused_from, Some(ExecutionStatus::New));

        executor.submit_event(event(ExecutionEventType::ResumeAll, &run)).unwrap();
        executor.run_until_idle();
        assert_eq!(status_of(&executor, &after.id), ExecutionStatus::Success);
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Success);
    }

    #[test]
    fn test_abort_cascades_to_children() {
        let m = machine(
            "fanout",
            vec![
                State::new("loop", "REPEAT").with_config(json!({
                    "repeat_element_expression": "${hosts}",
                    "repeat_element_type": "HOST",
                    "execution_strategy": "PARALLEL",
                })),
                State::new("deploy", "WAIT").with_config(json!({"correlation_id": "${host.name}"})),
            ],
            &[("loop", "deploy", TransitionType::Repeat)],
        );
        let executor = executor();
        let m = executor.register_machine(m).unwrap();
        let run = executor
            .execute(&m.id, ExecutionArgs::new().with_param("hosts", json!(["h1", "h2"])))
            .unwrap();
        executor.run_until_idle();

        let instances = executor.instances(&run.id).unwrap();
        let parent = find(&instances, "loop")[0].clone();
        executor
            .submit_event(event(ExecutionEventType::Abort, &run).targeting(&parent.id))
            .unwrap();

        let instances = executor.instances(&run.id).unwrap();
        assert!(instances.iter().all(|i| i.status == ExecutionStatus::Aborted));
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Aborted);

        // Late results for aborted children are dropped
        assert!(!executor.notify("h1", ResponseData::success()));
        executor.run_until_idle();
        assert_eq!(status_of(&executor, &parent.id), ExecutionStatus::Aborted);
    }

    #[test]
    fn test_abort_all_blocks_new_work() {
        let executor = executor();
        let (run, wait) = waiting_run(&executor);

        executor.submit_event(event(ExecutionEventType::AbortAll, &run)).unwrap();
        assert_eq!(status_of(&executor, &wait.id), ExecutionStatus::Aborted);
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Aborted);

        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::AbortAll, &run)),
            Err(EngineError::IllegalTransition(IllegalTransition::AbortAllAlreadyInEffect(_)))
        ));
        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::PauseAll, &run)),
            Err(EngineError::IllegalTransition(IllegalTransition::AbortAllAlreadyInEffect(_)))
        ));
    }

    struct Flaky(AtomicUsize);

    impl Step for Flaky {
        fn execute(&self, _context: &mut ExecutionContext) -> Result<ExecutionResponse> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ExecutionResponse::failed("first attempt fails"))
            } else {
                Ok(ExecutionResponse::success())
            }
        }
    }

    #[test]
    fn test_retry_reruns_failed_state() {
        let mut registry = StepRegistry::with_builtins();
        registry.register_step("FLAKY", Arc::new(Flaky(AtomicUsize::new(0))));
        let executor = StateMachineExecutor::with_collaborators(
            EngineConfig::default(),
            Persistence::in_memory(),
            registry,
            Arc::new(TemplateEvaluator::new()),
        );
        let m = executor
            .register_machine(machine(
                "flaky",
                vec![
                    State::new("publish", "ECHO").with_config(json!({
                        "message": "attempt",
                        "outcome": "note",
                    })),
                    State::new("deploy", "FLAKY"),
                    State::new("verify", "NOOP"),
                ],
                &[
                    ("publish", "deploy", TransitionType::Success),
                    ("deploy", "verify", TransitionType::Success),
                ],
            ))
            .unwrap();
        let run = executor.execute(&m.id, ExecutionArgs::new()).unwrap();
        executor.run_until_idle();
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Failed);

        let instances = executor.instances(&run.id).unwrap();
        let deploy = find(&instances, "deploy")[0].clone();
        executor
            .submit_event(event(ExecutionEventType::Retry, &run).targeting(&deploy.id))
            .unwrap();
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Running);
        executor.run_until_idle();

        let retried = executor.instance(&deploy.id).unwrap().unwrap();
        assert_eq!(retried.status, ExecutionStatus::Success);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_message.is_none());
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Success);
    }

    #[test]
    fn test_waiting_instance_retried_or_aborted() {
        let mut registry = StepRegistry::with_builtins();
        registry.register_step("FLAKY", Arc::new(Flaky(AtomicUsize::new(0))));
        let executor = StateMachineExecutor::with_collaborators(
            EngineConfig::default(),
            Persistence::in_memory(),
            registry,
            Arc::new(TemplateEvaluator::new()),
        );
        let m = executor
            .register_machine(machine(
                "held",
                vec![State::new("deploy", "FLAKY"), State::new("verify", "NOOP")],
                &[("deploy", "verify", TransitionType::Success)],
            ))
            .unwrap();
        let args = ExecutionArgs::new().with_error_strategy(ErrorStrategy::Pause);

        let run = executor.execute(&m.id, args.clone()).unwrap();
        executor.run_until_idle();
        let deploy = executor.instances(&run.id).unwrap().remove(0);
        assert_eq!(deploy.status, ExecutionStatus::Waiting);

        // Pausing a held failure makes no sense
        assert!(matches!(
            executor.submit_event(event(ExecutionEventType::Pause, &run).targeting(&deploy.id)),
            Err(EngineError::IllegalTransition(IllegalTransition::StateNotForPause { .. }))
        ));

        executor
            .submit_event(event(ExecutionEventType::Retry, &run).targeting(&deploy.id))
            .unwrap();
        executor.run_until_idle();
        assert_eq!(status_of(&executor, &deploy.id), ExecutionStatus::Success);
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Success);

        let held = executor
            .register_machine(machine("held-fail", vec![State::new("x", "FAIL")], &[]))
            .unwrap();
        let run = executor.execute(&held.id, args).unwrap();
        executor.run_until_idle();
        let x = executor.instances(&run.id).unwrap().remove(0);
        assert_eq!(x.status, ExecutionStatus::Waiting);

        executor
            .submit_event(event(ExecutionEventType::Abort, &run).targeting(&x.id))
            .unwrap();
        assert_eq!(status_of(&executor, &x.id), ExecutionStatus::Aborted);
        assert_eq!(run_status(&executor, &run.id), ExecutionStatus::Aborted);
    }

    #[test]
    fn test_pause_racing_completion_with_workers() {
        let executor = StateMachineExecutor::with_config(EngineConfig::default().with_worker_threads(4));
        let m = executor
            .register_machine(machine(
                "race",
                vec![State::new("first", "NOOP"), State::new("second", "NOOP")],
                &[("first", "second", TransitionType::Success)],
            ))
            .unwrap();
        executor.start_workers().unwrap();

        for _ in 0..25 {
            let run = executor.execute(&m.id, ExecutionArgs::new()).unwrap();
            let first = executor.instances(&run.id).unwrap().remove(0);
            let paused = executor.submit_event(event(ExecutionEventType::Pause, &run).targeting(&first.id));

            match paused {
                Ok(_) => {
                    thread::sleep(Duration::from_millis(10));
                    assert_eq!(status_of(&executor, &first.id), ExecutionStatus::Paused);
                    executor
                        .submit_event(event(ExecutionEventType::Resume, &run).targeting(&first.id))
                        .unwrap();
                }
                Err(e) => {
                    assert!(matches!(
                        e,
                        EngineError::IllegalTransition(IllegalTransition::StateNotForPause { .. })
                    ));
                    assert_eq!(status_of(&executor, &first.id), ExecutionStatus::Success);
                }
            }

            let finished = executor.wait_for_run(&run.id, Duration::from_secs(10)).unwrap();
            assert_eq!(finished.status, ExecutionStatus::Success);
            assert_eq!(status_of(&executor, &first.id), ExecutionStatus::Success);
        }
        executor.shutdown();
    }
}
