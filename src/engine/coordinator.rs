use crate::engine::context::ContextError;
use crate::engine::executor::{ExecutorError, StepExecutor};
use crate::engine::registry::{RegistryError, StepRegistry};
use crate::model::{BranchRule, WorkflowDefinition, WorkflowError};
use crate::state::run::{RunEvent, RunId, RunState, RunStatus};
use crate::state::store::{StateStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Error type for coordinator operations
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Active run {run_id} already exists for work item {work_item_id} under workflow {workflow}")]
    DuplicateRun {
        work_item_id: String,
        workflow: String,
        run_id: RunId,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {run_id} is {status}; operation requires one of: {allowed}")]
    InvalidStatus {
        run_id: RunId,
        status: RunStatus,
        allowed: &'static str,
    },

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Run {run_id} halted, state store unavailable: {detail}")]
    Halted { run_id: RunId, detail: String },
}

/// Per-run bookkeeping for an active drive task
struct RunHandle {
    /// Set to `Some(reason)` to request cancellation at the next step boundary
    cancel: Arc<Mutex<Option<String>>>,
    /// True while the drive task is between retry attempts of a step
    retrying: Arc<AtomicBool>,
    task: JoinHandle<Result<(), CoordinatorError>>,
}

/// Supervisor for workflow runs.
///
/// Owns the registered workflow definitions, a step executor over the
/// capability registry, and the state store. Each started run gets its
/// own drive task that executes one step at a time and persists the run
/// state synchronously after every step, so a crash never loses more
/// than the in-flight step. The drive task is the only writer for its
/// run; everything else reads through the store or signals through the
/// run handle.
#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<StepRegistry>,
    executor: Arc<StepExecutor>,
    store: Arc<dyn StateStore>,
    workflows: Arc<RwLock<HashMap<String, Arc<WorkflowDefinition>>>>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
    // Serializes the duplicate-run check against run creation
    admission: Arc<Mutex<()>>,
    default_timeout: Duration,
}

impl Coordinator {
    pub fn new(registry: Arc<StepRegistry>, store: Arc<dyn StateStore>) -> Self {
        Coordinator {
            executor: Arc::new(StepExecutor::new(registry.clone())),
            registry,
            store,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
            admission: Arc::new(Mutex::new(())),
            default_timeout: Duration::from_secs(60),
        }
    }

    /// Timeout applied to steps with no explicit entry in their workflow
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a workflow definition, validating it first. Re-registering
    /// a name replaces the definition for future runs only.
    pub async fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(), CoordinatorError> {
        definition.validate()?;
        let mut workflows = self.workflows.write().await;
        workflows.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    async fn definition(&self, workflow: &str) -> Result<Arc<WorkflowDefinition>, CoordinatorError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(workflow)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(workflow.to_string()))
    }

    /// Every step of a definition must have a capability before a run may
    /// start; catching this here keeps it out of the drive loop.
    fn check_registered(&self, definition: &WorkflowDefinition) -> Result<(), CoordinatorError> {
        for step in &definition.steps {
            if !self.registry.contains(step) {
                return Err(RegistryError::UnknownStep(step.clone()).into());
            }
        }
        Ok(())
    }

    /// Start a new run of `workflow` for `work_item_id`. At most one
    /// non-terminal run per work item per workflow.
    pub async fn start(
        &self,
        work_item_id: impl Into<String>,
        workflow: &str,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<RunId, CoordinatorError> {
        let work_item_id = work_item_id.into();
        let definition = self.definition(workflow).await?;
        self.check_registered(&definition)?;

        // Held through launch so two concurrent starts cannot both pass
        // the duplicate check before either run is persisted
        let _admission = self.admission.lock().await;

        let active = self.store.list_active(&work_item_id, workflow).await?;
        if let Some(existing) = active.into_iter().next() {
            return Err(CoordinatorError::DuplicateRun {
                work_item_id,
                workflow: workflow.to_string(),
                run_id: existing.run_id,
            });
        }

        let mut state = RunState::new(workflow, work_item_id);
        state.context.inputs = inputs;

        log::info!("Starting run {} of workflow {workflow}", state.run_id);
        self.launch(state, definition).await
    }

    /// Persist the idle record, flip it to running, and spawn the drive task
    async fn launch(
        &self,
        mut state: RunState,
        definition: Arc<WorkflowDefinition>,
    ) -> Result<RunId, CoordinatorError> {
        let version = self.store.create(&state).await?;

        state.status = RunStatus::Running;
        let version = self.store.update(&state.run_id, &state, version).await?;

        let run_id = state.run_id.clone();
        self.spawn_drive(definition, state, version).await;
        Ok(run_id)
    }

    async fn spawn_drive(
        &self,
        definition: Arc<WorkflowDefinition>,
        state: RunState,
        version: u64,
    ) {
        let cancel = Arc::new(Mutex::new(None));
        let retrying = Arc::new(AtomicBool::new(false));
        let run_id = state.run_id.clone();

        let task = tokio::spawn(self.clone().drive(
            definition,
            state,
            version,
            cancel.clone(),
            retrying.clone(),
        ));

        let mut runs = self.runs.write().await;
        runs.insert(
            run_id,
            RunHandle {
                cancel,
                retrying,
                task,
            },
        );
    }

    /// Drop the handle of a drive task that has finished, logging a
    /// stranded drive error. Runs whose persist failed keep their handle
    /// so `join` can still surface the error.
    async fn reap(&self, run_id: &RunId) {
        let mut runs = self.runs.write().await;
        let finished = matches!(runs.get(run_id), Some(h) if h.task.is_finished());
        if finished {
            if let Some(handle) = runs.remove(run_id) {
                if let Ok(Err(e)) = handle.task.await {
                    log::warn!("Run {run_id} drive task ended with: {e}");
                }
            }
        }
    }

    /// Current state of a run, read from the store. While a live drive
    /// task is waiting out a retry backoff the reported status is
    /// `Retrying`; that overlay is never persisted. A run observed in a
    /// terminal state has its finished drive handle dropped here, so
    /// embedders that never call `join` do not accumulate handles.
    pub async fn status(&self, run_id: &RunId) -> Result<RunState, CoordinatorError> {
        let (mut state, _) = self.store.get(run_id).await.map_err(not_found)?;

        if state.status.is_terminal() {
            self.reap(run_id).await;
            return Ok(state);
        }

        if state.status == RunStatus::Running {
            let runs = self.runs.read().await;
            if let Some(handle) = runs.get(run_id) {
                if !handle.task.is_finished() && handle.retrying.load(Ordering::Relaxed) {
                    state.status = RunStatus::Retrying;
                }
            }
        }

        Ok(state)
    }

    /// Request cancellation. For a run with a live drive task the request
    /// takes effect at the next step boundary (the in-flight step finishes
    /// and its outcome is recorded, but the run does not advance); the
    /// drive task persists the cancellation itself. Resting runs are
    /// written directly. If the drive task finishes before it can see the
    /// request, the persisted outcome decides the result rather than a
    /// blind `Ok`.
    pub async fn cancel(
        &self,
        run_id: &RunId,
        reason: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        let reason = reason.into();
        let mut flagged = false;

        {
            let runs = self.runs.read().await;
            if let Some(handle) = runs.get(run_id) {
                if !handle.task.is_finished() {
                    let mut cancel = handle.cancel.lock().await;
                    *cancel = Some(reason.clone());
                    flagged = true;
                    drop(cancel);
                    // The task may have finished without another boundary
                    // check while the request was being recorded
                    if !handle.task.is_finished() {
                        log::info!("Cancellation requested for active run {run_id}: {reason}");
                        return Ok(());
                    }
                }
            }
        }

        self.reap(run_id).await;

        let (mut state, version) = self.store.get(run_id).await.map_err(not_found)?;

        if flagged && state.status == RunStatus::Cancelled {
            return Ok(());
        }

        match state.status {
            RunStatus::Idle
            | RunStatus::Running
            | RunStatus::WaitingForInput
            | RunStatus::Escalated => {}
            status => {
                return Err(CoordinatorError::InvalidStatus {
                    run_id: run_id.clone(),
                    status,
                    allowed: "idle, running, waiting_for_input, escalated",
                })
            }
        }

        log::info!("Cancelling resting run {run_id}: {reason}");
        state.status = RunStatus::Cancelled;
        state.current_step = None;
        state.completed_at = Some(Utc::now());
        state.record(RunEvent::Cancelled { reason });
        self.store.update(run_id, &state, version).await?;
        Ok(())
    }

    /// Resume a parked or crashed run.
    ///
    /// From `Escalated` or `WaitingForInput` the parked step's failure is
    /// cleared and the step retried under its full policy. A run found
    /// `Running` with no live drive task was abandoned by a crashed
    /// process; its in-flight step is re-executed from scratch, which is
    /// why capabilities must be idempotent. The step may then appear twice
    /// in history; `completed_steps` still lists it once.
    pub async fn resume(&self, run_id: &RunId) -> Result<(), CoordinatorError> {
        {
            let runs = self.runs.read().await;
            if let Some(handle) = runs.get(run_id) {
                if !handle.task.is_finished() {
                    return Err(CoordinatorError::InvalidStatus {
                        run_id: run_id.clone(),
                        status: RunStatus::Running,
                        allowed: "escalated, waiting_for_input, or an abandoned running run",
                    });
                }
            }
        }

        let (mut state, version) = self.store.get(run_id).await.map_err(not_found)?;
        let definition = self.definition(&state.workflow).await?;
        self.check_registered(&definition)?;

        let mut retried_step = None;
        match state.status {
            RunStatus::Escalated | RunStatus::WaitingForInput => {
                if let Some(step) = &state.current_step {
                    state.failed_steps.retain(|s| s != step);
                    retried_step = state.current_step.clone();
                }
            }
            RunStatus::Running => {}
            status => {
                return Err(CoordinatorError::InvalidStatus {
                    run_id: run_id.clone(),
                    status,
                    allowed: "escalated, waiting_for_input, or an abandoned running run",
                })
            }
        }

        log::info!("Resuming run {run_id} from {}", state.status);
        state.status = RunStatus::Running;
        state.record(RunEvent::Resumed { step: retried_step });
        let version = self.store.update(run_id, &state, version).await?;

        self.spawn_drive(definition, state, version).await;
        Ok(())
    }

    /// Wait for a run's drive task to finish. Surfaces drive failures such
    /// as a halted persistence layer; a run with no live task joins
    /// immediately.
    pub async fn join(&self, run_id: &RunId) -> Result<(), CoordinatorError> {
        let handle = {
            let mut runs = self.runs.write().await;
            runs.remove(run_id)
        };

        match handle {
            Some(handle) => match handle.task.await {
                Ok(result) => result,
                Err(e) => Err(CoordinatorError::Halted {
                    run_id: run_id.clone(),
                    detail: format!("drive task failed: {e}"),
                }),
            },
            None => {
                self.store.get(run_id).await.map_err(not_found)?;
                Ok(())
            }
        }
    }

    /// The per-run execution loop, boxed explicitly. A routed run spawns
    /// a child drive from inside its parent's, and the recursion through
    /// `spawn_routed` would otherwise make the future's `Send` bound
    /// refer to itself.
    fn drive(
        self,
        definition: Arc<WorkflowDefinition>,
        state: RunState,
        version: u64,
        cancel: Arc<Mutex<Option<String>>>,
        retrying: Arc<AtomicBool>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CoordinatorError>> + Send>> {
        Box::pin(self.drive_inner(definition, state, version, cancel, retrying))
    }

    /// One step at a time, persisted after every transition
    async fn drive_inner(
        self,
        definition: Arc<WorkflowDefinition>,
        mut state: RunState,
        mut version: u64,
        cancel: Arc<Mutex<Option<String>>>,
        retrying: Arc<AtomicBool>,
    ) -> Result<(), CoordinatorError> {
        let run_id = state.run_id.clone();

        loop {
            // Cooperative cancellation, checked only at step boundaries
            let requested = {
                let mut cancel = cancel.lock().await;
                cancel.take()
            };
            if let Some(reason) = requested {
                log::info!("Run {run_id} cancelled: {reason}");
                state.status = RunStatus::Cancelled;
                state.current_step = None;
                state.completed_at = Some(Utc::now());
                state.record(RunEvent::Cancelled { reason });
                self.persist(&state, version).await?;
                return Ok(());
            }

            let completed = state.completed_set();
            let failed = state.failed_set();

            if definition.is_complete(&completed) {
                log::info!("Run {run_id} completed successfully");
                state.status = RunStatus::Success;
                state.current_step = None;
                state.completed_at = Some(Utc::now());
                self.persist(&state, version).await?;
                return Ok(());
            }

            let Some(step) = definition.next_eligible(&completed, &failed).cloned() else {
                let detail = "no eligible step remains; dependency graph cannot make progress"
                    .to_string();
                log::error!("Run {run_id} deadlocked: {detail}");
                state.status = RunStatus::Failed;
                state.current_step = None;
                state.completed_at = Some(Utc::now());
                state.record(RunEvent::Deadlock { detail });
                self.persist(&state, version).await?;
                return Ok(());
            };

            state.current_step = Some(step.clone());
            state.record(RunEvent::StepStarted { step: step.clone() });
            version = self.persist(&state, version).await?;

            let policy = definition.retry_policy_for(&step);
            let step_timeout = definition.timeout_for(&step, self.default_timeout);

            let flag = retrying.clone();
            let result = self
                .executor
                .execute_observed(&step, &state.context, &policy, step_timeout, move |_| {
                    flag.store(true, Ordering::Relaxed)
                })
                .await;
            retrying.store(false, Ordering::Relaxed);

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    state.status = RunStatus::Failed;
                    state.current_step = None;
                    state.completed_at = Some(Utc::now());
                    state.record(RunEvent::StepFailed {
                        step: step.clone(),
                        attempts_used: 0,
                        error: e.to_string(),
                    });
                    state.mark_failed(step);
                    self.persist(&state, version).await?;
                    return Err(e.into());
                }
            };

            if outcome.is_success() {
                state.record(RunEvent::StepSucceeded {
                    step: step.clone(),
                    attempts_used: outcome.attempts_used,
                    duration_ms: outcome.duration_ms,
                });
                state.context.record(step.clone(), outcome.output)?;
                state.mark_completed(step);
                state.current_step = None;
                version = self.persist(&state, version).await?;
                continue;
            }

            let error = outcome.error_detail.unwrap_or_default();
            log::warn!("Run {run_id} step {step} failed: {error}");
            state.record(RunEvent::StepFailed {
                step: step.clone(),
                attempts_used: outcome.attempts_used,
                error,
            });
            state.mark_failed(step.clone());

            match definition.branch_for(&step).cloned() {
                Some(BranchRule::Escalate) => {
                    log::warn!("Run {run_id} escalated on step {step}");
                    state.status = RunStatus::Escalated;
                    state.record(RunEvent::Escalated { step });
                    self.persist(&state, version).await?;
                    return Ok(());
                }
                Some(BranchRule::WaitForInput) => {
                    log::warn!("Run {run_id} waiting for input on step {step}");
                    state.status = RunStatus::WaitingForInput;
                    state.record(RunEvent::InputRequested { step });
                    self.persist(&state, version).await?;
                    return Ok(());
                }
                Some(BranchRule::RouteToWorkflow { workflow }) => {
                    match self.spawn_routed(&state, &workflow).await {
                        Ok(child_run_id) => {
                            log::info!(
                                "Run {run_id} routed to workflow {workflow} as {child_run_id}"
                            );
                            state.record(RunEvent::Routed {
                                step,
                                workflow,
                                child_run_id,
                            });
                        }
                        Err(e) => {
                            log::error!(
                                "Run {run_id} failed to route to workflow {workflow}: {e}"
                            );
                            state.record(RunEvent::Halted {
                                detail: format!("routing to workflow {workflow} failed: {e}"),
                            });
                        }
                    }
                    state.status = RunStatus::Failed;
                    state.current_step = None;
                    state.completed_at = Some(Utc::now());
                    self.persist(&state, version).await?;
                    return Ok(());
                }
                None => {
                    log::error!("Run {run_id} failed terminally on step {step}");
                    state.status = RunStatus::Failed;
                    state.current_step = None;
                    state.completed_at = Some(Utc::now());
                    self.persist(&state, version).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Launch the run a branch rule routed to: a fresh run id for the same
    /// work item, linked through `parent_run_id`, with the parent's
    /// accumulated results carried forward as inputs.
    async fn spawn_routed(
        &self,
        parent: &RunState,
        workflow: &str,
    ) -> Result<RunId, CoordinatorError> {
        let definition = self.definition(workflow).await?;
        self.check_registered(&definition)?;

        let _admission = self.admission.lock().await;

        let active = self.store.list_active(parent.work_item_id(), workflow).await?;
        if let Some(existing) = active.into_iter().next() {
            return Err(CoordinatorError::DuplicateRun {
                work_item_id: parent.work_item_id().to_string(),
                workflow: workflow.to_string(),
                run_id: existing.run_id,
            });
        }

        let mut child = RunState::new(workflow, parent.work_item_id());
        child.parent_run_id = Some(parent.run_id.clone());
        child.context = parent.context.derive_for(child.run_id.clone());

        self.launch(child, definition).await
    }

    /// Write the run state through the versioned store. Transient store
    /// faults are retried with backoff; a version conflict means another
    /// writer touched the run and aborts immediately; exhausting retries
    /// halts the run in place, with the last persisted state still valid.
    async fn persist(&self, state: &RunState, version: u64) -> Result<u64, CoordinatorError> {
        const ATTEMPTS: u32 = 3;
        let mut delay = Duration::from_millis(50);
        let mut last = String::new();

        for attempt in 0..ATTEMPTS {
            match self.store.update(&state.run_id, state, version).await {
                Ok(new_version) => return Ok(new_version),
                Err(e @ StoreError::Conflict { .. }) | Err(e @ StoreError::NotFound(_)) => {
                    log::error!("Persist aborted for run {}: {e}", state.run_id);
                    return Err(e.into());
                }
                Err(e) => {
                    last = e.to_string();
                    if attempt + 1 < ATTEMPTS {
                        log::warn!(
                            "Persist attempt {} failed for run {} ({last}), retrying in {:?}",
                            attempt + 1,
                            state.run_id,
                            delay
                        );
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        log::error!("Run {} halted, state store unavailable: {last}", state.run_id);
        Err(CoordinatorError::Halted {
            run_id: state.run_id.clone(),
            detail: last,
        })
    }
}

fn not_found(e: StoreError) -> CoordinatorError {
    match e {
        StoreError::NotFound(run_id) => CoordinatorError::RunNotFound(run_id),
        other => CoordinatorError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{Capability, CapabilityError};
    use crate::engine::ExecutionContext;
    use crate::model::{StepName, WorkflowBuilder};
    use crate::state::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct AlwaysOk;

    #[async_trait]
    impl Capability for AlwaysOk {
        async fn invoke(
            &self,
            _ctx: &ExecutionContext,
        ) -> Result<serde_json::Value, CapabilityError> {
            Ok(json!({"ok": true}))
        }
    }

    async fn single_step_coordinator() -> Coordinator {
        let mut registry = StepRegistry::new();
        registry.register("only", Arc::new(AlwaysOk));
        let workflow = WorkflowBuilder::new("single").step("only").build().unwrap();
        let coordinator = Coordinator::new(Arc::new(registry), Arc::new(MemoryStore::new()));
        coordinator.register_workflow(workflow).await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_status_drops_finished_drive_handles() {
        let coordinator = single_step_coordinator().await;
        let run_id = coordinator
            .start("item-1", "single", HashMap::new())
            .await
            .unwrap();

        let mut reaped = false;
        for _ in 0..200 {
            let state = coordinator.status(&run_id).await.unwrap();
            if state.status == RunStatus::Success && coordinator.runs.read().await.is_empty() {
                reaped = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(reaped, "finished handle was never dropped");
    }

    #[tokio::test]
    async fn test_cancel_reconciles_with_a_finished_run() {
        let coordinator = single_step_coordinator().await;
        let run_id = coordinator
            .start("item-1", "single", HashMap::new())
            .await
            .unwrap();

        // Wait for the drive task itself to finish, without reaping it
        let mut finished = false;
        for _ in 0..200 {
            finished = {
                let runs = coordinator.runs.read().await;
                matches!(runs.get(&run_id), Some(h) if h.task.is_finished())
            };
            if finished {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(finished, "drive task never finished");

        // The run already succeeded, so cancellation must report that
        // instead of a blind ok, and the stale handle goes away
        let err = coordinator.cancel(&run_id, "too late").await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InvalidStatus {
                status: RunStatus::Success,
                ..
            }
        ));
        assert!(coordinator.runs.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_capability_fails_the_run_consistently() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(Arc::new(StepRegistry::new()), store.clone());

        let definition = Arc::new(WorkflowBuilder::new("single").step("only").build().unwrap());

        let mut state = RunState::new("single", "item-1");
        state.status = RunStatus::Running;
        let run_id = state.run_id.clone();
        let version = store.create(&state).await.unwrap();

        let cancel = Arc::new(Mutex::new(None));
        let retrying = Arc::new(AtomicBool::new(false));
        let result = coordinator
            .clone()
            .drive(definition, state, version, cancel, retrying)
            .await;
        assert!(matches!(result, Err(CoordinatorError::Executor(_))));

        // The persisted run marks the step failed, and replaying its
        // history agrees with that
        let (state, _) = store.get(&run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failed_steps, vec![StepName::from("only")]);
        let (_, failed) = state.replayed_sets();
        assert_eq!(failed, state.failed_set());
    }
}
