//! State Machine Execution Engine
//!
//! The engine that walks registered state machines:
//! - Creates a run record and root instance per execution request
//! - Executes each state through its step and follows typed transitions
//! - Suspends on asynchronous responses and resumes on notifications
//! - Spawns and fans in child chains for repeat and fork states
//!
//! Work flows through a queue consumed either by a worker pool or on the
//! caller's thread with [`StateMachineExecutor::run_until_idle`]. Every
//! status change of an instance happens under that instance's lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::error::{DefinitionError, EngineError, InvalidArgument, Result};
use crate::expression::{ExpressionEvaluator, TemplateEvaluator};
use crate::machine::{StateMachine, TransitionType};
use crate::monitoring::{EventType, ExecutionTimeline, TimelineStore};
use crate::outcome::OutcomeStore;
use crate::persistence::{Criteria, Persistence};

use super::advice::{Advice, ErrorStrategy, ExecutionAdvisor, ExecutionCallback, RunHooks};
use super::context::{ContextElement, ExecutionContext};
use super::correlation::{CorrelationRegistry, Notification, QueueNotifier, WaitNotify};
use super::dispatcher::{WorkHandler, WorkItem, WorkQueue, WorkerPool};
use super::events::{Directive, DirectiveState, ExecutionEvent, ExecutionEventManager, ExecutionEventType};
use super::instance::{StateExecutionInstance, WorkflowRun};
use super::status::ExecutionStatus;
use super::step::{ExecutionResponse, ResponseData, Step, StepRegistry};

/// A registered machine with a step built for each state.
pub(crate) struct ResolvedMachine {
    pub(crate) machine: Arc<StateMachine>,
    steps: HashMap<String, Arc<dyn Step>>,
}

impl ResolvedMachine {
    fn step(&self, state_name: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(state_name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownState(state_name.to_string()).into())
    }
}

/// Number of mutexes instance ids are hashed onto.
const LOCK_STRIPES: usize = 64;

/// Fixed set of mutexes shared by instance id hash.
///
/// No code path holds two instance locks at once, so ids that share a
/// stripe only serialize.
struct InstanceLocks {
    stripes: Vec<Mutex<()>>,
}

impl InstanceLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, instance_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        instance_id.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[index]
    }
}

/// Acquires a lock, recovering it if a holder panicked.
pub(crate) fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|p| p.into_inner())
}

/// Shared engine state used by the executor, the workers and the event manager.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) persistence: Persistence,
    pub(crate) registry: StepRegistry,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) outcomes: OutcomeStore,
    pub(crate) correlations: CorrelationRegistry,
    pub(crate) notifier: Arc<dyn WaitNotify>,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) directive_lock: Mutex<()>,
    machines: RwLock<HashMap<String, Arc<ResolvedMachine>>>,
    locks: InstanceLocks,
    timelines: Mutex<TimelineStore>,
    run_hooks: Mutex<HashMap<String, RunHooks>>,
}

impl EngineCore {
    pub(crate) fn lock_instance(&self, instance_id: &str) -> MutexGuard<'_, ()> {
        hold(self.locks.stripe(instance_id))
    }

    fn timelines(&self) -> MutexGuard<'_, TimelineStore> {
        self.timelines.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn hooks(&self) -> MutexGuard<'_, HashMap<String, RunHooks>> {
        self.run_hooks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn advisor(&self, run_id: &str) -> Option<Arc<dyn ExecutionAdvisor>> {
        self.hooks().get(run_id).and_then(|hooks| hooks.advisor.clone())
    }

    pub(crate) fn save_instance(&self, instance: &StateExecutionInstance) -> Result<()> {
        self.persistence.instances.save(instance.clone())?;
        Ok(())
    }

    pub(crate) fn record(&self, instance: &StateExecutionInstance, event: EventType) {
        self.timelines()
            .record(&instance.workflow_execution_id, instance.label(), event);
    }

    /// Bookkeeping once a run reaches a final status.
    ///
    /// The timeline becomes evictable. The completion callback, if any, is
    /// queued to run outside every instance lock.
    pub(crate) fn run_finished(&self, run: &WorkflowRun) {
        self.timelines().finish(&run.id);
        let has_callback = self
            .hooks()
            .get(&run.id)
            .map_or(false, |hooks| hooks.callback.is_some());
        if has_callback {
            self.queue.push(WorkItem::Complete {
                run_id: run.id.clone(),
            });
        } else {
            self.hooks().remove(&run.id);
        }
    }

    fn complete_run(&self, run_id: &str) -> Result<()> {
        let Some(callback) = self.hooks().remove(run_id).and_then(|hooks| hooks.callback) else {
            return Ok(());
        };
        let Some(run) = self.persistence.runs.get(run_id)? else {
            return Ok(());
        };
        debug!("Invoking completion callback of run {} ({})", run.id, run.status);
        callback.on_complete(&run);
        Ok(())
    }

    /// Forgets every correlation id the instance still waits on.
    pub(crate) fn release_correlations(&self, instance_id: &str) {
        for correlation_id in self.correlations.remove_for_instance(instance_id) {
            self.notifier.cancel(&correlation_id);
        }
    }

    pub(crate) fn active_directive(
        &self,
        workflow_execution_id: &str,
        directive_type: ExecutionEventType,
    ) -> Result<Option<Directive>> {
        let criteria = Criteria::new()
            .eq("workflow_execution_id", workflow_execution_id)
            .eq("directive_type", directive_type.as_str())
            .eq("state", DirectiveState::Active.as_str());
        self.persistence.directives.find_one(&criteria)
    }

    fn resolved_machine(&self, machine_id: &str) -> Result<Arc<ResolvedMachine>> {
        if let Some(resolved) = self
            .machines
            .read()
            .map_err(|_| EngineError::Persistence("machine cache poisoned".to_string()))?
            .get(machine_id)
        {
            return Ok(Arc::clone(resolved));
        }

        let mut machine = self
            .persistence
            .machines
            .get(machine_id)?
            .ok_or_else(|| InvalidArgument::UnknownStateMachine(machine_id.to_string()))?;
        machine.validate()?;
        self.cache_machine(machine)
    }

    fn cache_machine(&self, machine: StateMachine) -> Result<Arc<ResolvedMachine>> {
        let steps = self.registry.resolve(&machine)?;
        let resolved = Arc::new(ResolvedMachine {
            machine: Arc::new(machine),
            steps,
        });
        self.machines
            .write()
            .map_err(|_| EngineError::Persistence("machine cache poisoned".to_string()))?
            .insert(resolved.machine.id.clone(), Arc::clone(&resolved));
        Ok(resolved)
    }

    fn context_for(
        &self,
        instance: &StateExecutionInstance,
        resolved: &ResolvedMachine,
    ) -> Result<ExecutionContext> {
        let pipeline_execution_id = self
            .persistence
            .runs
            .get(&instance.workflow_execution_id)?
            .and_then(|run| run.pipeline_execution_id);
        Ok(ExecutionContext::new(
            instance,
            Arc::clone(&resolved.machine),
            self.outcomes.clone(),
            Arc::clone(&self.evaluator),
            pipeline_execution_id,
        ))
    }

    fn start_instance(&self, instance_id: &str) -> Result<()> {
        let _guard = self.lock_instance(instance_id);

        let Some(mut instance) = self.persistence.instances.get(instance_id)? else {
            warn!("Start requested for unknown instance {}", instance_id);
            return Ok(());
        };
        if !matches!(instance.status, ExecutionStatus::New | ExecutionStatus::Queued) {
            debug!(
                "Skipping start of '{}' ({})",
                instance.label(),
                instance.status
            );
            return Ok(());
        }

        let run_id = instance.workflow_execution_id.clone();
        if self
            .active_directive(&run_id, ExecutionEventType::AbortAll)?
            .is_some()
        {
            instance.status = ExecutionStatus::Aborted;
            instance.end_time = Some(Utc::now());
            self.save_instance(&instance)?;
            self.record(&instance, EventType::Aborted);
            info!("'{}' aborted before start (abort-all in effect)", instance.label());
            return Ok(());
        }
        if self
            .active_directive(&run_id, ExecutionEventType::PauseAll)?
            .is_some()
        {
            instance.paused_from = Some(instance.status);
            instance.status = ExecutionStatus::Paused;
            self.save_instance(&instance)?;
            self.record(&instance, EventType::Paused);
            info!("'{}' parked (pause-all in effect)", instance.label());
            return Ok(());
        }

        let resolved = self.resolved_machine(&instance.state_machine_id)?;
        let step = resolved.step(&instance.state_name)?;

        if !instance.advised {
            if let Some(advisor) = self.advisor(&run_id) {
                instance.advised = true;
                match advisor.before_execution(&instance) {
                    Advice::Proceed => {}
                    Advice::Skip => {
                        info!("'{}' skipped by advisor", instance.label());
                        instance.start_time = Some(Utc::now());
                        return self.finish(instance, ExecutionStatus::Success, None, &resolved);
                    }
                    Advice::Pause => {
                        instance.paused_from = Some(instance.status);
                        instance.status = ExecutionStatus::Paused;
                        self.save_instance(&instance)?;
                        self.record(&instance, EventType::Paused);
                        info!("'{}' paused by advisor", instance.label());
                        return Ok(());
                    }
                    Advice::Fail(message) => {
                        instance.start_time = Some(Utc::now());
                        return self.finish(
                            instance,
                            ExecutionStatus::Failed,
                            Some(message),
                            &resolved,
                        );
                    }
                }
            }
        }

        instance.status = ExecutionStatus::Running;
        instance.start_time = Some(Utc::now());
        self.save_instance(&instance)?;
        self.record(&instance, EventType::Started);
        info!("Starting state '{}' ({})", instance.label(), instance.id);

        let mut context = self.context_for(&instance, &resolved)?;
        let response = step.execute(&mut context).unwrap_or_else(|e| {
            error!("State '{}' raised: {}", instance.label(), e);
            ExecutionResponse::error(e.to_string())
        });
        context.apply_to(&mut instance);
        self.handle_response(instance, response, &resolved)
    }

    fn resume_instance(&self, notification: Notification) -> Result<()> {
        let Notification {
            correlation_id,
            response,
        } = notification;

        let Some(waiter) = self.correlations.take(&correlation_id) else {
            warn!(
                "No instance waiting on correlation id {}, notification ignored",
                correlation_id
            );
            return Ok(());
        };

        let _guard = self.lock_instance(&waiter.instance_id);

        let Some(mut instance) = self.persistence.instances.get(&waiter.instance_id)? else {
            warn!("Waiter {} no longer exists", waiter.instance_id);
            return Ok(());
        };
        if instance.status.is_final() || instance.status == ExecutionStatus::Discontinuing {
            warn!(
                "'{}' is {}, notification {} ignored",
                instance.label(),
                instance.status,
                correlation_id
            );
            return Ok(());
        }
        if instance.status == ExecutionStatus::Paused {
            info!(
                "'{}' is paused, buffering notification {}",
                instance.label(),
                correlation_id
            );
            instance.buffered_responses.insert(correlation_id, response);
            return self.save_instance(&instance);
        }

        instance.correlation_ids.retain(|c| *c != correlation_id);
        let resolved = self.resolved_machine(&instance.state_machine_id)?;
        let step = resolved.step(&instance.state_name)?;

        let mut context = self.context_for(&instance, &resolved)?;
        let mut responses = BTreeMap::new();
        responses.insert(correlation_id, response);
        let outcome = step
            .handle_async_response(&mut context, &responses)
            .unwrap_or_else(|e| {
                error!("State '{}' raised on resume: {}", instance.label(), e);
                ExecutionResponse::error(e.to_string())
            });
        context.apply_to(&mut instance);
        self.handle_response(instance, outcome, &resolved)
    }

    fn handle_response(
        &self,
        mut instance: StateExecutionInstance,
        response: ExecutionResponse,
        resolved: &ResolvedMachine,
    ) -> Result<()> {
        if response.is_async {
            for correlation_id in &response.correlation_ids {
                self.correlations.register(
                    correlation_id,
                    &instance.id,
                    &instance.workflow_execution_id,
                );
                self.notifier.register_waiter(correlation_id);
                if !instance.correlation_ids.contains(correlation_id) {
                    instance.correlation_ids.push(correlation_id.clone());
                }
            }

            if instance.correlation_ids.is_empty() {
                return self.finish(
                    instance,
                    ExecutionStatus::Error,
                    Some("Asynchronous response without correlation ids".to_string()),
                    resolved,
                );
            }

            instance.status = ExecutionStatus::Running;
            self.save_instance(&instance)?;

            for child in &response.children {
                let state = resolved
                    .machine
                    .get_state(&child.state_name)
                    .ok_or_else(|| DefinitionError::UnknownState(child.state_name.clone()))?;
                let child_instance = instance.child(state, child);
                self.save_instance(&child_instance)?;
                debug!(
                    "'{}' spawned '{}' for {}",
                    instance.label(),
                    child_instance.label(),
                    child.correlation_id
                );
                self.queue.push(WorkItem::Start {
                    instance_id: child_instance.id,
                });
            }

            debug!(
                "'{}' waiting on {} correlation ids",
                instance.label(),
                instance.correlation_ids.len()
            );
            return Ok(());
        }

        if response.status.is_final() {
            self.finish(instance, response.status, response.error_message, resolved)
        } else {
            let message = format!("Step returned non-terminal status {}", response.status);
            self.finish(instance, ExecutionStatus::Error, Some(message), resolved)
        }
    }

    fn finish(
        &self,
        mut instance: StateExecutionInstance,
        status: ExecutionStatus,
        error_message: Option<String>,
        resolved: &ResolvedMachine,
    ) -> Result<()> {
        instance.status = status;
        instance.error_message = error_message;
        instance.end_time = Some(Utc::now());
        instance.correlation_ids.clear();
        self.release_correlations(&instance.id);
        self.save_instance(&instance)?;

        match status {
            ExecutionStatus::Success => {
                self.record(&instance, EventType::Completed);
                info!("State '{}' completed successfully", instance.label());
            }
            ExecutionStatus::Aborted => {
                self.record(&instance, EventType::Aborted);
                info!("State '{}' aborted", instance.label());
            }
            _ => {
                self.record(&instance, EventType::Failed);
                warn!(
                    "State '{}' finished {}: {}",
                    instance.label(),
                    status,
                    instance.error_message.as_deref().unwrap_or("no message")
                );
            }
        }

        self.transition(&instance, resolved)
    }

    fn transition(
        &self,
        instance: &StateExecutionInstance,
        resolved: &ResolvedMachine,
    ) -> Result<()> {
        let edge = match instance.status {
            ExecutionStatus::Success => Some(TransitionType::Success),
            ExecutionStatus::Failed | ExecutionStatus::Error => Some(TransitionType::Failure),
            _ => None,
        };
        let next_state = edge.and_then(|t| resolved.machine.next_state(&instance.state_name, t));

        let Some(state) = next_state else {
            let failed = matches!(
                instance.status,
                ExecutionStatus::Failed | ExecutionStatus::Error
            );
            if failed && self.error_strategy(instance, resolved)? == ErrorStrategy::Pause {
                return self.hold_failure(instance);
            }
            return self.end_transition(instance);
        };

        let next = instance.next(state);
        self.save_instance(&next)?;
        info!(
            "Transition '{}' -> '{}' ({})",
            instance.state_name, next.state_name, instance.status
        );
        self.queue.push(WorkItem::Start {
            instance_id: next.id,
        });
        Ok(())
    }

    /// The state's own error strategy, else the run's.
    fn error_strategy(
        &self,
        instance: &StateExecutionInstance,
        resolved: &ResolvedMachine,
    ) -> Result<ErrorStrategy> {
        if let Some(strategy) = resolved
            .machine
            .get_state(&instance.state_name)
            .and_then(ErrorStrategy::for_state)
        {
            return Ok(strategy);
        }
        Ok(self
            .persistence
            .runs
            .get(&instance.workflow_execution_id)?
            .map(|run| run.error_strategy)
            .unwrap_or_default())
    }

    /// Parks a failed instance in WAITING; the failure is kept in `paused_from`.
    fn hold_failure(&self, instance: &StateExecutionInstance) -> Result<()> {
        let mut waiting = instance.clone();
        waiting.paused_from = Some(waiting.status);
        waiting.status = ExecutionStatus::Waiting;
        self.save_instance(&waiting)?;
        warn!(
            "'{}' finished {}, waiting for an operator",
            waiting.label(),
            instance.status
        );
        Ok(())
    }

    /// Reports the end of a chain to its parent, or closes the run.
    pub(crate) fn end_transition(&self, instance: &StateExecutionInstance) -> Result<()> {
        if let Some(correlation_id) = &instance.notify_id {
            let response = ResponseData {
                status: instance.status,
                error_message: instance.error_message.clone(),
                payload: Some(json!({
                    "instance_id": instance.id,
                    "state_name": instance.state_name,
                })),
            };
            if self.notifier.notify(correlation_id, response) {
                debug!("'{}' reported to parent via {}", instance.label(), correlation_id);
            }
            return Ok(());
        }
        if instance.parent_instance_id.is_some() {
            return Ok(());
        }

        let status = instance.status;
        let updated = self
            .persistence
            .runs
            .update(&instance.workflow_execution_id, &mut |run: &mut WorkflowRun| {
                if run.status.is_final() {
                    return false;
                }
                run.status = status;
                run.end_time = Some(Utc::now());
                true
            })?;
        if let Some(run) = updated {
            info!("Workflow run {} finished: {}", run.id, run.status);
            self.run_finished(&run);
        }
        Ok(())
    }
}

impl WorkHandler for EngineCore {
    fn handle(&self, item: WorkItem) {
        let result = match item {
            WorkItem::Start { instance_id } => self
                .start_instance(&instance_id)
                .map_err(|e| format!("start of {}: {}", instance_id, e)),
            WorkItem::Resume(notification) => {
                let correlation_id = notification.correlation_id.clone();
                self.resume_instance(notification)
                    .map_err(|e| format!("resume for {}: {}", correlation_id, e))
            }
            WorkItem::Complete { run_id } => self
                .complete_run(&run_id)
                .map_err(|e| format!("completion of {}: {}", run_id, e)),
        };
        if let Err(message) = result {
            error!("Failed to process {}", message);
        }
    }
}

/// Inputs of one execution request.
#[derive(Clone, Default)]
pub struct ExecutionArgs {
    pub app_id: Option<String>,
    pub env_id: Option<String>,
    pub pipeline_execution_id: Option<String>,
    pub params: BTreeMap<String, Value>,
    pub context_elements: Vec<ContextElement>,
    pub error_strategy: ErrorStrategy,
    pub advisor: Option<Arc<dyn ExecutionAdvisor>>,
    pub callback: Option<Arc<dyn ExecutionCallback>>,
}

impl fmt::Debug for ExecutionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionArgs")
            .field("app_id", &self.app_id)
            .field("env_id", &self.env_id)
            .field("pipeline_execution_id", &self.pipeline_execution_id)
            .field("params", &self.params)
            .field("context_elements", &self.context_elements)
            .field("error_strategy", &self.error_strategy)
            .field("advisor", &self.advisor.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ExecutionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_element(mut self, element: ContextElement) -> Self {
        self.context_elements.push(element);
        self
    }

    pub fn with_scope(mut self, app_id: impl Into<String>, env_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self.env_id = Some(env_id.into());
        self
    }

    pub fn with_pipeline(mut self, pipeline_execution_id: impl Into<String>) -> Self {
        self.pipeline_execution_id = Some(pipeline_execution_id.into());
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    pub fn with_advisor(mut self, advisor: impl ExecutionAdvisor + 'static) -> Self {
        self.advisor = Some(Arc::new(advisor));
        self
    }

    /// Called once with the run when it first reaches a final status.
    pub fn with_callback(mut self, callback: impl ExecutionCallback + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
}

/// Public entry point for registering and running state machines.
///
/// # Example
///
/// ```rust,no_run
/// use staterunner::execution::{ExecutionArgs, StateMachineExecutor};
/// use staterunner::machine::load_state_machine;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let executor = StateMachineExecutor::new();
///     let machine = executor.register_machine(load_state_machine("deploy.yaml")?)?;
///
///     let run = executor.execute(&machine.id, ExecutionArgs::new())?;
///     executor.run_until_idle();
///
///     println!("{:?}", executor.workflow_run(&run.id)?.map(|r| r.status));
///     Ok(())
/// }
/// ```
pub struct StateMachineExecutor {
    core: Arc<EngineCore>,
    workers: Mutex<Option<WorkerPool>>,
}

impl StateMachineExecutor {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_collaborators(
            config,
            Persistence::in_memory(),
            StepRegistry::with_builtins(),
            Arc::new(TemplateEvaluator::new()),
        )
    }

    pub fn with_collaborators(
        config: EngineConfig,
        persistence: Persistence,
        registry: StepRegistry,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        let (resume_tx, resume_rx) = channel();
        let queue = Arc::new(WorkQueue::new(config.queue_capacity, resume_rx));
        let outcomes = OutcomeStore::new(Arc::clone(&persistence.outcomes));

        let core = EngineCore {
            persistence,
            registry,
            evaluator,
            outcomes,
            correlations: CorrelationRegistry::new(),
            notifier: Arc::new(QueueNotifier::new(resume_tx)),
            queue,
            directive_lock: Mutex::new(()),
            timelines: Mutex::new(TimelineStore::new(config.timeline_retention)),
            config,
            machines: RwLock::new(HashMap::new()),
            locks: InstanceLocks::new(LOCK_STRIPES),
            run_hooks: Mutex::new(HashMap::new()),
        };

        Self {
            core: Arc::new(core),
            workers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn persistence(&self) -> &Persistence {
        &self.core.persistence
    }

    /// Registers a validated machine and builds its steps.
    ///
    /// The definition is validated again before it is stored, covering
    /// edits made to its fields after the caller validated it.
    pub fn register_machine(&self, mut machine: StateMachine) -> Result<Arc<StateMachine>> {
        if !machine.is_validated() {
            return Err(DefinitionError::NotValidated(machine.name.clone()).into());
        }
        machine.validate()?;
        self.core.persistence.machines.save(machine.clone())?;
        let resolved = self.core.cache_machine(machine)?;
        info!(
            "Registered state machine '{}' ({} states)",
            resolved.machine.name,
            resolved.machine.len()
        );
        Ok(Arc::clone(&resolved.machine))
    }

    /// Starts a run of a registered machine.
    pub fn execute(&self, machine_id: &str, args: ExecutionArgs) -> Result<WorkflowRun> {
        let resolved = self.core.resolved_machine(machine_id)?;
        let initial = resolved
            .machine
            .initial_state()
            .ok_or(DefinitionError::MissingInitialState)?;

        if !self.core.queue.has_capacity() {
            return Err(EngineError::QueueFull(self.core.queue.pending()));
        }

        let mut run = WorkflowRun::new(machine_id);
        run.app_id = args.app_id;
        run.env_id = args.env_id;
        run.pipeline_execution_id = args.pipeline_execution_id;
        run.params = args.params.clone();
        run.error_strategy = args.error_strategy;

        let mut root = StateExecutionInstance::new(&run.id, machine_id, initial);
        root.params = args.params;
        root.context_elements = args.context_elements;

        self.core.persistence.runs.save(run.clone())?;
        self.core.save_instance(&root)?;
        self.core.timelines().start(&run.id);
        let hooks = RunHooks {
            advisor: args.advisor,
            callback: args.callback,
        };
        if !hooks.is_empty() {
            self.core.hooks().insert(run.id.clone(), hooks);
        }

        if let Err(e) = self.core.queue.submit(WorkItem::Start {
            instance_id: root.id.clone(),
        }) {
            self.core.hooks().remove(&run.id);
            root.status = ExecutionStatus::Error;
            root.error_message = Some(e.to_string());
            self.core.save_instance(&root)?;
            run.status = ExecutionStatus::Error;
            run.end_time = Some(Utc::now());
            self.core.persistence.runs.save(run.clone())?;
            self.core.timelines().finish(&run.id);
            return Err(e);
        }

        info!(
            "Started workflow run {} of '{}'",
            run.id, resolved.machine.name
        );
        Ok(run)
    }

    /// Delivers an external result for a correlation id.
    pub fn notify(&self, correlation_id: &str, response: ResponseData) -> bool {
        self.core.notifier.notify(correlation_id, response)
    }

    pub fn event_manager(&self) -> ExecutionEventManager {
        ExecutionEventManager::new(Arc::clone(&self.core))
    }

    pub fn submit_event(&self, event: ExecutionEvent) -> Result<ExecutionEvent> {
        self.event_manager().register(event)
    }

    /// Processes queued work on the calling thread until none is left.
    ///
    /// Returns the number of items handled.
    pub fn run_until_idle(&self) -> usize {
        let mut handled = 0;
        while let Some(item) = self.core.queue.try_next() {
            self.core.handle(item);
            handled += 1;
        }
        handled
    }

    /// Starts the worker pool if it is not running yet.
    pub fn start_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if workers.is_some() {
            return Ok(());
        }
        let pool = WorkerPool::start(
            self.core.config.worker_threads,
            Arc::clone(&self.core.queue),
            Arc::clone(&self.core) as Arc<dyn WorkHandler>,
            self.core.config.poll_interval(),
        )?;
        *workers = Some(pool);
        Ok(())
    }

    pub fn shutdown(&self) {
        let pool = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(pool) = pool {
            info!("Stopping {} worker threads", pool.size());
            pool.shutdown();
        }
    }

    fn workers_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Blocks until the run reaches a final status or `timeout` passes.
    ///
    /// Without a worker pool the queue is drained on this thread.
    pub fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<WorkflowRun> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.workers_running() {
                self.run_until_idle();
            }
            let run = self
                .workflow_run(run_id)?
                .ok_or_else(|| InvalidArgument::UnknownExecution(run_id.to_string()))?;
            if run.status.is_final() {
                return Ok(run);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(run_id.to_string()));
            }
            thread::sleep(self.core.config.poll_interval());
        }
    }

    pub fn workflow_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        self.core.persistence.runs.get(run_id)
    }

    pub fn instance(&self, instance_id: &str) -> Result<Option<StateExecutionInstance>> {
        self.core.persistence.instances.get(instance_id)
    }

    /// Every instance of a run in creation order.
    pub fn instances(&self, run_id: &str) -> Result<Vec<StateExecutionInstance>> {
        self.core
            .persistence
            .instances
            .find_all(&Criteria::new().eq("workflow_execution_id", run_id))
    }

    pub fn outcomes(&self) -> &OutcomeStore {
        &self.core.outcomes
    }

    pub fn timeline(&self, run_id: &str) -> Option<ExecutionTimeline> {
        self.core.timelines().get(run_id).cloned()
    }
}

impl Default for StateMachineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StateMachineExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
