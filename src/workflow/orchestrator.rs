//! Workflow orchestration.
//!
//! The orchestrator turns a stored definition into a durable execution for
//! one customer and drives its steps in order on a background task. Each live
//! execution owns an [`ExecutionSignal`]: a small control state (run, pause,
//! cancel) behind an async mutex. The step loop writes its transitions while
//! holding that mutex, and so do `pause_workflow`, `resume_workflow` and
//! `cancel_workflow`, so a control request is never overwritten by a
//! concurrent step commit.
//!
//! Lifecycle:
//!
//! ```text
//! pending -> running -> completed | failed | cancelled
//!              ^  |
//!              |  v
//!             paused -> cancelled
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::cache::DefinitionCache;
use super::context::ContextStore;
use super::steps::{StepContext, StepExecutor, StepRegistry};
use super::types::{DefinitionSpec, StepSpec, WorkflowDefinition};
use super::validator::{check_context_size, truncate_error, validate_definition, validate_steps};
use crate::error::{Error, Result};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{
    ExecutionQuery, ExecutionStatus, SqliteStorage, StepStatus, WorkflowExecution, WorkflowStep,
};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// Where execution context is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// Every transition, context included, is committed to SQLite.
    #[default]
    Database,
    /// Context lives in process memory and expires after a TTL; execution
    /// and step records are still written to storage.
    Memory,
}

impl std::str::FromStr for PersistenceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "database" => Ok(PersistenceMode::Database),
            "memory" => Ok(PersistenceMode::Memory),
            other => Err(Error::Config(format!("Unknown persistence mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub persistence_mode: PersistenceMode,
    pub context_ttl: Duration,
    pub cleanup_interval: Duration,
    pub max_context_bytes: usize,
    pub max_error_length: usize,
    pub step_retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            persistence_mode: PersistenceMode::Database,
            context_ttl: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            max_context_bytes: 1024 * 1024,
            max_error_length: 2000,
            step_retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug)]
struct LoopState {
    control: Control,
    /// Set once the step loop has stopped for good.
    finished: bool,
}

struct ExecutionSignal {
    state: tokio::sync::Mutex<LoopState>,
    notify: Notify,
}

impl ExecutionSignal {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(LoopState {
                control: Control::Run,
                finished: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Resolve once the execution has been cancelled.
    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().await.control == Control::Cancel {
                return;
            }
            notified.await;
        }
    }
}

/// How a step's attempts ended.
enum StepRun {
    Completed(Map<String, Value>),
    Failed(Error),
    /// Shutdown arrived between attempts.
    Interrupted(Error),
    Cancelled,
}

struct Inner {
    storage: SqliteStorage,
    steps: StepRegistry,
    config: OrchestratorConfig,
    definitions: DefinitionCache,
    contexts: ContextStore,
    live: Mutex<HashMap<String, Arc<ExecutionSignal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownCoordinator,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates, runs and controls workflow executions.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl WorkflowOrchestrator {
    pub fn new(storage: SqliteStorage, steps: StepRegistry, config: OrchestratorConfig) -> Self {
        Self::with_shutdown(storage, steps, config, ShutdownCoordinator::new())
    }

    /// Share a shutdown coordinator with other components.
    pub fn with_shutdown(
        storage: SqliteStorage,
        steps: StepRegistry,
        config: OrchestratorConfig,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                steps,
                config,
                definitions: DefinitionCache::new(),
                contexts: ContextStore::new(),
                live: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                cleanup_task: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.inner.shutdown
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Create a definition, or update the one with the same name.
    pub async fn create_workflow_definition(
        &self,
        spec: DefinitionSpec,
    ) -> Result<WorkflowDefinition> {
        validate_definition(&spec)?;
        if let Some(steps) = &spec.steps {
            validate_steps(steps)?;
        }

        let mut spec = spec;
        spec.name = spec.name.trim().to_string();
        let saved = self
            .inner
            .storage
            .save_definition(&WorkflowDefinition::from_spec(spec))
            .await?;
        self.inner.definitions.invalidate(&saved.name).await;

        info!(
            workflow = %saved.name,
            version = saved.version,
            steps = saved.steps.len(),
            "Workflow definition saved"
        );
        Ok(saved)
    }

    /// Enable or disable a definition. Running executions are unaffected.
    pub async fn set_definition_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        if !self
            .inner
            .storage
            .set_definition_enabled(name, enabled)
            .await?
        {
            return Err(Error::NotFound(format!("Workflow not found: {}", name)));
        }
        self.inner.definitions.invalidate(name).await;
        info!(workflow = %name, enabled, "Workflow definition toggled");
        Ok(())
    }

    pub async fn get_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        self.inner.storage.get_definition(name).await
    }

    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        self.inner.storage.list_definitions().await
    }

    async fn resolve_definition(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        if let Some(definition) = self.inner.definitions.get(name).await {
            return Ok(definition);
        }
        let definition = self
            .inner
            .storage
            .get_definition(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow not found: {}", name)))?;
        Ok(self.inner.definitions.insert(definition).await)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start an execution and drive its steps on a background task.
    ///
    /// Fails fast with [`Error::AlreadyRunning`] if a pending or running
    /// execution exists for the same workflow and customer. Returns the
    /// execution in `running` state.
    #[instrument(
        name = "workflow.start",
        skip(self, workflow_name, customer_id, initial_context),
        fields(workflow = %workflow_name, customer_id = %customer_id)
    )]
    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        customer_id: &str,
        initial_context: Map<String, Value>,
    ) -> Result<WorkflowExecution> {
        let (execution, signal) = self
            .prepare(workflow_name, customer_id, initial_context)
            .await?;

        let orchestrator = self.clone();
        let returned = self.with_context(execution.clone());
        self.spawn_tracked(async move {
            let _ = orchestrator.drive(execution, signal).await;
        });
        Ok(returned)
    }

    /// Start an execution and drive it on the current task until it stops.
    ///
    /// Returns the execution as stored once the step loop exits.
    pub async fn run_workflow(
        &self,
        workflow_name: &str,
        customer_id: &str,
        initial_context: Map<String, Value>,
    ) -> Result<WorkflowExecution> {
        let (execution, signal) = self
            .prepare(workflow_name, customer_id, initial_context)
            .await?;
        let id = execution.id.clone();
        self.drive(execution, signal).await?;
        self.load_execution(&id).await
    }

    async fn prepare(
        &self,
        workflow_name: &str,
        customer_id: &str,
        initial_context: Map<String, Value>,
    ) -> Result<(WorkflowExecution, Arc<ExecutionSignal>)> {
        if self.inner.shutdown.is_shutdown_requested() {
            return Err(Error::ShuttingDown);
        }
        if customer_id.trim().is_empty() {
            return Err(Error::Validation("customer_id is required".into()));
        }

        let definition = self.resolve_definition(workflow_name).await?;
        if !definition.enabled {
            return Err(Error::Workflow(format!(
                "Workflow '{}' is disabled",
                workflow_name
            )));
        }
        validate_steps(&definition.steps)?;
        for step in &definition.steps {
            if !self.inner.steps.has(&step.target_service) {
                return Err(Error::Validation(format!(
                    "Step '{}' targets unknown service '{}'",
                    step.name, step.target_service
                )));
            }
        }
        check_context_size(&initial_context, self.inner.config.max_context_bytes)?;

        let memory_mode = self.inner.config.persistence_mode == PersistenceMode::Memory;
        let mut execution = WorkflowExecution {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_definition_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            customer_id: customer_id.to_string(),
            status: ExecutionStatus::Pending,
            current_step: 0,
            context: if memory_mode {
                Map::new()
            } else {
                initial_context.clone()
            },
            steps: definition.steps.clone(),
            started_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            error: None,
        };

        self.inner.storage.save_execution_guarded(&execution).await?;
        if memory_mode {
            self.inner.contexts.put(&execution.id, initial_context);
        }

        execution.status = ExecutionStatus::Running;
        let signal = Arc::new(ExecutionSignal::new());
        self.register(&execution.id, signal.clone());
        if let Err(e) = self.persist(&execution, None).await {
            self.unregister(&execution.id, &signal);
            return Err(e);
        }

        info!(
            execution_id = %execution.id,
            version = definition.version,
            steps = execution.steps.len(),
            "Workflow execution started"
        );
        Ok((execution, signal))
    }

    /// Pause a pending or running execution.
    ///
    /// A step already in flight finishes and is committed; the loop stops
    /// before the next step.
    pub async fn pause_workflow(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let signal = self.live_signal(execution_id);
        let mut guard = match &signal {
            Some(signal) => Some(signal.state.lock().await),
            None => None,
        };

        let mut execution = self.load_execution(execution_id).await?;
        if !execution.status.is_active() {
            return Err(Error::InvalidState(format!(
                "Cannot pause execution in status {}",
                execution.status
            )));
        }

        execution.status = ExecutionStatus::Paused;
        self.persist(&execution, None).await?;
        if let Some(state) = guard.as_mut() {
            state.control = Control::Pause;
        }

        metrics::record_workflow_execution(&execution.workflow_name, "paused");
        info!(execution_id, current_step = execution.current_step, "Workflow execution paused");
        Ok(execution)
    }

    /// Resume a paused execution at its `current_step`.
    ///
    /// The definition is re-resolved and must still exist; steps run from
    /// the snapshot captured at start. Subject to the concurrency guard.
    pub async fn resume_workflow(&self, execution_id: &str) -> Result<WorkflowExecution> {
        if self.inner.shutdown.is_shutdown_requested() {
            return Err(Error::ShuttingDown);
        }

        let signal = self.live_signal(execution_id);
        let mut guard = match &signal {
            Some(signal) => Some(signal.state.lock().await),
            None => None,
        };

        let mut execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Paused {
            return Err(Error::InvalidState(format!(
                "Cannot resume execution in status {}",
                execution.status
            )));
        }
        self.resolve_definition(&execution.workflow_name).await?;
        if self.inner.config.persistence_mode == PersistenceMode::Memory
            && self.inner.contexts.get(execution_id).is_none()
        {
            return Err(Error::InvalidState(format!(
                "Context for execution {} has expired",
                execution_id
            )));
        }

        execution.status = ExecutionStatus::Running;
        self.persist_guarded(&execution).await?;
        info!(execution_id, current_step = execution.current_step, "Workflow execution resumed");

        // The old loop is still finishing its in-flight step and will carry on.
        if let Some(state) = guard.as_mut() {
            if !state.finished {
                state.control = Control::Run;
                return Ok(execution);
            }
        }
        drop(guard);

        let signal = Arc::new(ExecutionSignal::new());
        self.register(execution_id, signal.clone());
        let orchestrator = self.clone();
        let task_execution = execution.clone();
        self.spawn_tracked(async move {
            let _ = orchestrator.drive(task_execution, signal).await;
        });
        Ok(execution)
    }

    /// Cancel an execution that is pending, running or paused.
    ///
    /// Takes effect immediately: the in-flight step record is marked failed
    /// and the step future is dropped at its next suspension point. An
    /// execution left `running` by a process that died is not live here, so
    /// cancelling it only updates the stored status and releases the
    /// workflow for its customer.
    pub async fn cancel_workflow(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let signal = self.live_signal(execution_id);
        let mut guard = match &signal {
            Some(signal) => Some(signal.state.lock().await),
            None => None,
        };

        let mut execution = self.load_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Cannot cancel execution in status {}",
                execution.status
            )));
        }

        let now = Utc::now();
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);

        let in_flight = self
            .inner
            .storage
            .get_steps(execution_id)
            .await?
            .into_iter()
            .find(|step| step.status == StepStatus::Running)
            .map(|mut step| {
                step.status = StepStatus::Failed;
                step.completed_at = Some(now);
                step.error = Some("Execution cancelled".to_string());
                step
            });

        self.persist(&execution, in_flight.as_ref()).await?;
        if let Some(state) = guard.as_mut() {
            state.control = Control::Cancel;
        }
        drop(guard);
        if let Some(signal) = &signal {
            signal.notify.notify_waiters();
        }

        metrics::record_workflow_execution(&execution.workflow_name, "cancelled");
        info!(execution_id, "Workflow execution cancelled");
        Ok(execution)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(self
            .inner
            .storage
            .get_execution(execution_id)
            .await?
            .map(|execution| self.with_context(execution)))
    }

    pub async fn get_execution_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStep>> {
        self.inner.storage.get_steps(execution_id).await
    }

    pub async fn list_executions(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        Ok(self
            .inner
            .storage
            .query_executions(query)
            .await?
            .into_iter()
            .map(|execution| self.with_context(execution))
            .collect())
    }

    /// Wait until the step loop of an execution has stopped and its status
    /// is neither pending nor running.
    pub async fn wait_until_settled(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowExecution> {
        let deadline = Instant::now() + timeout;
        loop {
            let looping = match self.live_signal(execution_id) {
                Some(signal) => !signal.state.lock().await.finished,
                None => false,
            };
            if !looping {
                let execution = self.load_execution(execution_id).await?;
                if !execution.status.is_active() {
                    return Ok(execution);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Execution(format!(
                    "Timed out waiting for execution {} to settle",
                    execution_id
                )));
            }
            sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    // ========================================================================
    // Memory-mode context maintenance
    // ========================================================================

    /// Drop in-memory contexts older than the configured TTL.
    pub fn cleanup_expired_contexts(&self) -> usize {
        evict_contexts(&self.inner.contexts, self.inner.config.context_ttl)
    }

    /// Spawn the periodic context cleanup task. Returns false if it already runs.
    pub fn start_cleanup_task(&self) -> bool {
        let mut slot = lock(&self.inner.cleanup_task);
        if slot.is_some() {
            return false;
        }

        let contexts = self.inner.contexts.clone();
        let ttl = self.inner.config.context_ttl;
        let period = self.inner.config.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        let shutdown = self.inner.shutdown.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        evict_contexts(&contexts, ttl);
                    }
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }
            debug!("Context cleanup task stopped");
        }));
        true
    }

    /// Stop accepting work, stop the cleanup task and wait for every step
    /// loop to exit. Loops park their execution as paused at the next step
    /// boundary.
    pub async fn shutdown(&self) {
        self.inner.shutdown.request_shutdown();

        let cleanup = lock(&self.inner.cleanup_task).take();
        if let Some(handle) = cleanup {
            handle.abort();
            let _ = handle.await;
        }

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        let count = tasks.len();
        for handle in tasks {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Workflow task panicked: {}", e);
                }
            }
        }
        info!(tasks = count, "Workflow orchestrator shut down");
    }

    // ========================================================================
    // Step loop
    // ========================================================================

    async fn drive(&self, mut execution: WorkflowExecution, signal: Arc<ExecutionSignal>) -> Result<()> {
        metrics::inc_active_executions();
        let result = self.run_steps(&mut execution, &signal).await;
        metrics::dec_active_executions();

        {
            let mut state = signal.state.lock().await;
            if let Err(e) = &result {
                error!(execution_id = %execution.id, "Step loop aborted: {}", e);
                if state.control != Control::Cancel {
                    self.abandon(&mut execution, e).await;
                }
            }
            state.finished = true;
        }
        self.unregister(&execution.id, &signal);
        result
    }

    /// Best-effort terminal write after a failed commit so the execution
    /// does not stay active. If this write fails too, `cancel_workflow` is
    /// the way to release the workflow for the customer.
    async fn abandon(&self, execution: &mut WorkflowExecution, error: &Error) {
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.error = Some(self.truncate(&format!("Execution aborted: {}", error)));
        match self.persist(execution, None).await {
            Ok(()) => metrics::record_workflow_execution(&execution.workflow_name, "failed"),
            Err(e) => error!(
                execution_id = %execution.id,
                "Failed to mark aborted execution as failed: {}",
                e
            ),
        }
    }

    #[instrument(
        name = "workflow.run_steps",
        skip(self, execution, signal),
        fields(execution_id = %execution.id, workflow = %execution.workflow_name)
    )]
    async fn run_steps(
        &self,
        execution: &mut WorkflowExecution,
        signal: &ExecutionSignal,
    ) -> Result<()> {
        while (execution.current_step as usize) < execution.steps.len() {
            let position = execution.current_step;
            let spec = execution.steps[position as usize].clone();
            let mut step = WorkflowStep::pending(&execution.id, &spec.name, position);

            {
                let mut state = signal.state.lock().await;
                match state.control {
                    Control::Cancel => return Ok(()),
                    Control::Pause => {
                        state.finished = true;
                        return Ok(());
                    }
                    Control::Run => {}
                }
                if self.inner.shutdown.is_shutdown_requested() {
                    self.park(execution, None).await?;
                    state.finished = true;
                    return Ok(());
                }

                execution.status = ExecutionStatus::Running;
                step.status = StepStatus::Running;
                step.started_at = Utc::now();
                self.persist(execution, Some(&step)).await?;
            }
            debug!(step = %spec.name, position, "Step started");

            let run = match self.inner.steps.resolve(&spec.target_service) {
                Ok(executor) => {
                    self.run_step_attempts(execution, &spec, &mut step, executor, signal)
                        .await
                }
                Err(e) => StepRun::Failed(e),
            };

            let mut state = signal.state.lock().await;
            if state.control == Control::Cancel {
                return Ok(());
            }

            match run {
                StepRun::Cancelled => return Ok(()),
                StepRun::Failed(e) => {
                    self.fail(execution, &mut step, &spec, &e).await?;
                    state.finished = true;
                    return Ok(());
                }
                StepRun::Interrupted(e) => {
                    step.status = StepStatus::Failed;
                    step.completed_at = Some(Utc::now());
                    step.error = Some(self.truncate(&e.to_string()));
                    self.park(execution, Some(&step)).await?;
                    state.finished = true;
                    return Ok(());
                }
                StepRun::Completed(update) => {
                    if let Err(e) = self.merge_context(execution, update) {
                        self.fail(execution, &mut step, &spec, &e).await?;
                        state.finished = true;
                        return Ok(());
                    }

                    step.status = StepStatus::Completed;
                    step.completed_at = Some(Utc::now());
                    execution.current_step += 1;
                    execution.status = if state.control == Control::Pause {
                        ExecutionStatus::Paused
                    } else {
                        ExecutionStatus::Running
                    };
                    self.persist(execution, Some(&step)).await?;
                    metrics::record_step_execution(&spec.target_service, "completed");
                    debug!(step = %spec.name, position, "Step completed");
                }
            }
        }

        let mut state = signal.state.lock().await;
        match state.control {
            Control::Cancel => return Ok(()),
            Control::Pause => {
                state.finished = true;
                return Ok(());
            }
            Control::Run => {}
        }

        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(Utc::now());
        execution.error = None;
        self.persist(execution, None).await?;
        state.finished = true;

        metrics::record_workflow_execution(&execution.workflow_name, "completed");
        info!(steps = execution.steps.len(), "Workflow execution completed");
        Ok(())
    }

    async fn run_step_attempts(
        &self,
        execution: &mut WorkflowExecution,
        spec: &StepSpec,
        step: &mut WorkflowStep,
        executor: Arc<dyn StepExecutor>,
        signal: &ExecutionSignal,
    ) -> StepRun {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let context = match self.current_context(execution) {
                Ok(context) => context,
                Err(e) => return StepRun::Failed(e),
            };
            let ctx = StepContext {
                execution_id: execution.id.clone(),
                workflow_name: execution.workflow_name.clone(),
                customer_id: execution.customer_id.clone(),
                step_name: spec.name.clone(),
                position: step.position,
                attempt,
                config: spec.config.clone(),
                context,
            };

            let result = tokio::select! {
                result = executor.execute(&ctx) => result,
                _ = signal.cancelled() => return StepRun::Cancelled,
            };
            let error = match result {
                Ok(update) => return StepRun::Completed(update),
                Err(e) => e,
            };

            if self.inner.shutdown.is_shutdown_requested() {
                return StepRun::Interrupted(error);
            }
            if attempt > spec.retry_count {
                return StepRun::Failed(error);
            }

            step.retry_count = attempt;
            execution.retry_count += 1;
            metrics::record_step_execution(&spec.target_service, "retried");
            warn!(
                step = %spec.name,
                attempt,
                retries = spec.retry_count,
                "Step attempt failed: {}. Retrying",
                error
            );

            tokio::select! {
                _ = sleep(self.inner.config.step_retry_delay) => {}
                _ = signal.cancelled() => return StepRun::Cancelled,
                _ = self.inner.shutdown.wait_for_shutdown() => return StepRun::Interrupted(error),
            }
        }
    }

    /// Mark the step and the execution failed. Caller holds the control lock.
    async fn fail(
        &self,
        execution: &mut WorkflowExecution,
        step: &mut WorkflowStep,
        spec: &StepSpec,
        error: &Error,
    ) -> Result<()> {
        let now = Utc::now();
        step.status = StepStatus::Failed;
        step.completed_at = Some(now);
        step.error = Some(self.truncate(&error.to_string()));

        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(now);
        execution.error = Some(self.truncate(&format!("Step '{}' failed: {}", spec.name, error)));
        self.persist(execution, Some(&*step)).await?;

        metrics::record_step_execution(&spec.target_service, "failed");
        metrics::record_workflow_execution(&execution.workflow_name, "failed");
        warn!(step = %spec.name, retries = step.retry_count, "Workflow execution failed: {}", error);
        Ok(())
    }

    /// Leave the execution paused for a later resume. Caller holds the control lock.
    async fn park(&self, execution: &mut WorkflowExecution, step: Option<&WorkflowStep>) -> Result<()> {
        execution.status = ExecutionStatus::Paused;
        self.persist(execution, step).await?;
        metrics::record_workflow_execution(&execution.workflow_name, "paused");
        info!(
            current_step = execution.current_step,
            "Execution parked as paused for shutdown"
        );
        Ok(())
    }

    fn truncate(&self, message: &str) -> String {
        truncate_error(message, self.inner.config.max_error_length)
    }

    // ========================================================================
    // Persistence helpers
    // ========================================================================

    fn current_context(&self, execution: &WorkflowExecution) -> Result<Map<String, Value>> {
        match self.inner.config.persistence_mode {
            PersistenceMode::Database => Ok(execution.context.clone()),
            PersistenceMode::Memory => self.inner.contexts.get(&execution.id).ok_or_else(|| {
                Error::InvalidState(format!("Context for execution {} has expired", execution.id))
            }),
        }
    }

    fn with_context(&self, mut execution: WorkflowExecution) -> WorkflowExecution {
        if self.inner.config.persistence_mode == PersistenceMode::Memory {
            if let Some(context) = self.inner.contexts.get(&execution.id) {
                execution.context = context;
            }
        }
        execution
    }

    async fn load_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Execution not found: {}", execution_id)))
    }

    fn storable(&self, execution: &WorkflowExecution) -> WorkflowExecution {
        let mut record = execution.clone();
        if self.inner.config.persistence_mode == PersistenceMode::Memory {
            record.context = Map::new();
        }
        record
    }

    /// Commit an execution transition (and step record) in one transaction.
    async fn persist(&self, execution: &WorkflowExecution, step: Option<&WorkflowStep>) -> Result<()> {
        self.inner
            .storage
            .commit_transition(&self.storable(execution), step)
            .await
    }

    async fn persist_guarded(&self, execution: &WorkflowExecution) -> Result<()> {
        self.inner
            .storage
            .save_execution_guarded(&self.storable(execution))
            .await
    }

    /// Merge a step's output into the execution context, keeping it under
    /// the size ceiling. Nothing changes when the merged context is too large.
    fn merge_context(&self, execution: &mut WorkflowExecution, update: Map<String, Value>) -> Result<()> {
        let limit = self.inner.config.max_context_bytes;
        match self.inner.config.persistence_mode {
            PersistenceMode::Database => {
                let mut merged = execution.context.clone();
                merged.extend(update);
                check_context_size(&merged, limit)?;
                execution.context = merged;
            }
            PersistenceMode::Memory => {
                self.inner.contexts.merge(&execution.id, update, limit)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Task bookkeeping
    // ========================================================================

    fn register(&self, execution_id: &str, signal: Arc<ExecutionSignal>) {
        lock(&self.inner.live).insert(execution_id.to_string(), signal);
    }

    fn unregister(&self, execution_id: &str, signal: &Arc<ExecutionSignal>) {
        let mut live = lock(&self.inner.live);
        if live
            .get(execution_id)
            .map(|current| Arc::ptr_eq(current, signal))
            .unwrap_or(false)
        {
            live.remove(execution_id);
        }
    }

    fn live_signal(&self, execution_id: &str) -> Option<Arc<ExecutionSignal>> {
        lock(&self.inner.live).get(execution_id).cloned()
    }

    fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

fn evict_contexts(contexts: &ContextStore, ttl: Duration) -> usize {
    let evicted = contexts.evict_expired(ttl);
    if evicted > 0 {
        info!(evicted, "Evicted expired execution contexts");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails `fail_times` times, then returns `{"<service>_done": n}`.
    struct CountingStep {
        service: String,
        calls: AtomicUsize,
        fail_times: usize,
        seen: Mutex<Vec<Map<String, Value>>>,
    }

    impl CountingStep {
        fn new(service: &str, fail_times: usize) -> Arc<Self> {
            Arc::new(Self {
                service: service.to_string(),
                calls: AtomicUsize::new(0),
                fail_times,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StepExecutor for CountingStep {
        fn service(&self) -> &str {
            &self.service
        }

        async fn execute(&self, ctx: &StepContext) -> Result<Map<String, Value>> {
            lock(&self.seen).push(ctx.context.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(Error::Execution(format!("{} attempt {} failed", self.service, call + 1)));
            }
            let mut update = Map::new();
            update.insert(format!("{}_done", self.service), json!(call + 1));
            Ok(update)
        }
    }

    /// Announces entry on `entered`, then waits for a permit from `open`.
    struct GatedStep {
        calls: AtomicUsize,
        entered: Notify,
        release: tokio::sync::Semaphore,
    }

    impl GatedStep {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                release: tokio::sync::Semaphore::new(0),
            })
        }

        fn open(&self) {
            self.release.add_permits(1);
        }
    }

    #[async_trait]
    impl StepExecutor for GatedStep {
        fn service(&self) -> &str {
            "gated"
        }

        async fn execute(&self, _ctx: &StepContext) -> Result<Map<String, Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release
                .acquire()
                .await
                .map_err(|e| Error::Execution(e.to_string()))?
                .forget();
            let mut update = Map::new();
            update.insert("gated_done".into(), json!(true));
            Ok(update)
        }
    }

    /// Returns a payload of the configured size.
    struct BloatStep;

    #[async_trait]
    impl StepExecutor for BloatStep {
        fn service(&self) -> &str {
            "bloat"
        }

        async fn execute(&self, ctx: &StepContext) -> Result<Map<String, Value>> {
            let size = ctx.config["bytes"].as_u64().unwrap_or(0) as usize;
            let mut update = Map::new();
            update.insert("blob".into(), json!("x".repeat(size)));
            Ok(update)
        }
    }

    struct Harness {
        orchestrator: WorkflowOrchestrator,
        storage: SqliteStorage,
        first: Arc<CountingStep>,
        second: Arc<CountingStep>,
        flaky: Arc<CountingStep>,
        gated: Arc<GatedStep>,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let first = CountingStep::new("first", 0);
        let second = CountingStep::new("second", 0);
        let flaky = CountingStep::new("flaky", 2);
        let gated = GatedStep::new();

        let mut steps = StepRegistry::new();
        steps.register(first.clone());
        steps.register(second.clone());
        steps.register(flaky.clone());
        steps.register(gated.clone());
        steps.register(Arc::new(BloatStep));

        Harness {
            orchestrator: WorkflowOrchestrator::new(storage.clone(), steps, config),
            storage,
            first,
            second,
            flaky,
            gated,
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            step_retry_delay: Duration::from_millis(1),
            ..OrchestratorConfig::default()
        }
    }

    async fn define(h: &Harness, name: &str, steps: Vec<StepSpec>) {
        h.orchestrator
            .create_workflow_definition(DefinitionSpec::new(name, steps))
            .await
            .unwrap();
    }

    const SETTLE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_definition_creation_rules() {
        let h = harness(test_config());
        let err = h
            .orchestrator
            .create_workflow_definition(DefinitionSpec::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = h
            .orchestrator
            .create_workflow_definition(DefinitionSpec::new(
                "weekly",
                vec![StepSpec::new("a", "")],
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing a service"));

        let v1 = h
            .orchestrator
            .create_workflow_definition(DefinitionSpec::new(
                "weekly",
                vec![StepSpec::new("a", "first")],
            ))
            .await
            .unwrap();
        let v2 = h
            .orchestrator
            .create_workflow_definition(DefinitionSpec::new(
                "weekly",
                vec![StepSpec::new("a", "first"), StepSpec::new("b", "second")],
            ))
            .await
            .unwrap();
        assert_eq!(v1.id, v2.id);
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_merge_context() {
        let h = harness(test_config());
        define(
            &h,
            "weekly",
            vec![StepSpec::new("a", "first"), StepSpec::new("b", "second")],
        )
        .await;

        let mut initial = Map::new();
        initial.insert("account".into(), json!("acme"));
        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", initial)
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.current_step, 2);
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.context["account"], "acme");
        assert_eq!(execution.context["first_done"], 1);
        assert_eq!(execution.context["second_done"], 1);

        // the second step saw the first step's output
        let seen = lock(&h.second.seen);
        assert_eq!(seen[0]["first_done"], 1);
        drop(seen);

        let steps = h.orchestrator.get_execution_steps(&execution.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_concurrency_guard_until_terminal() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("wait", "gated")]).await;

        let running = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);

        let err = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_RUNNING");
        assert!(err.to_string().contains("already running"));

        // another customer is unaffected
        h.gated.open();
        let other = h
            .orchestrator
            .start_workflow("weekly", "cust-2", Map::new())
            .await
            .unwrap();
        h.gated.open();

        let done = h
            .orchestrator
            .wait_until_settled(&running.id, SETTLE)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        h.orchestrator.wait_until_settled(&other.id, SETTLE).await.unwrap();

        h.gated.open();
        let again = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.orchestrator.wait_until_settled(&again.id, SETTLE).await.unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_starts_admit_exactly_one() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("wait", "gated")]).await;

        let (a, b) = tokio::join!(
            h.orchestrator.start_workflow("weekly", "cust-1", Map::new()),
            h.orchestrator.start_workflow("weekly", "cust-1", Map::new()),
        );
        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(err.code(), "ALREADY_RUNNING");

        h.gated.open();
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_continue_at_current_step() {
        let h = harness(test_config());
        define(
            &h,
            "weekly",
            vec![StepSpec::new("wait", "gated"), StepSpec::new("b", "second")],
        )
        .await;

        let execution = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.gated.entered.notified().await;

        let paused = h.orchestrator.pause_workflow(&execution.id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);

        // the in-flight step completes, then the loop stops
        h.gated.open();
        let settled = h
            .orchestrator
            .wait_until_settled(&execution.id, SETTLE)
            .await
            .unwrap();
        assert_eq!(settled.status, ExecutionStatus::Paused);
        assert_eq!(settled.current_step, 1);
        assert_eq!(h.second.calls(), 0);

        let resumed = h.orchestrator.resume_workflow(&execution.id).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert_eq!(resumed.current_step, 1);

        let done = h
            .orchestrator
            .wait_until_settled(&execution.id, SETTLE)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(h.gated.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.second.calls(), 1);
    }

    #[tokio::test]
    async fn test_pause_rules() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("a", "first")]).await;
        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();

        let err = h.orchestrator.pause_workflow(&execution.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        let err = h.orchestrator.resume_workflow(&execution.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        let err = h.orchestrator.pause_workflow("missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_running_stops_further_steps() {
        let h = harness(test_config());
        define(
            &h,
            "weekly",
            vec![StepSpec::new("wait", "gated"), StepSpec::new("b", "second")],
        )
        .await;

        let execution = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.gated.entered.notified().await;

        let cancelled = h.orchestrator.cancel_workflow(&execution.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let settled = h
            .orchestrator
            .wait_until_settled(&execution.id, SETTLE)
            .await
            .unwrap();
        assert_eq!(settled.status, ExecutionStatus::Cancelled);
        assert_eq!(settled.current_step, 0);
        assert_eq!(h.second.calls(), 0);

        let steps = h.orchestrator.get_execution_steps(&execution.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error.as_deref(), Some("Execution cancelled"));

        let err = h.orchestrator.cancel_workflow(&execution.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_cancel_paused_execution() {
        let h = harness(test_config());
        define(
            &h,
            "weekly",
            vec![StepSpec::new("wait", "gated"), StepSpec::new("b", "second")],
        )
        .await;

        let execution = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.gated.entered.notified().await;
        h.orchestrator.pause_workflow(&execution.id).await.unwrap();
        h.gated.open();
        h.orchestrator
            .wait_until_settled(&execution.id, SETTLE)
            .await
            .unwrap();

        let cancelled = h.orchestrator.cancel_workflow(&execution.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(h.second.calls(), 0);

        let err = h.orchestrator.resume_workflow(&execution.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_step_retries_then_succeeds() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("f", "flaky").with_retries(2)]).await;

        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(h.flaky.calls(), 3);
        assert_eq!(execution.retry_count, 2);

        let steps = h.orchestrator.get_execution_steps(&execution.id).await.unwrap();
        assert_eq!(steps[0].retry_count, 2);
        assert_eq!(steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_step_exhaustion_fails_execution() {
        let h = harness(test_config());
        define(
            &h,
            "weekly",
            vec![
                StepSpec::new("f", "flaky").with_retries(1),
                StepSpec::new("b", "second"),
            ],
        )
        .await;

        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.completed_at.is_some());
        assert!(execution.error.unwrap().contains("Step 'f' failed"));
        assert_eq!(h.flaky.calls(), 2);
        assert_eq!(h.second.calls(), 0);

        let steps = h.orchestrator.get_execution_steps(&execution.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_error_text_is_truncated() {
        let h = harness(OrchestratorConfig {
            max_error_length: 16,
            ..test_config()
        });
        define(&h, "weekly", vec![StepSpec::new("f", "flaky")]).await;

        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        let error = execution.error.unwrap();
        assert!(error.ends_with(crate::workflow::TRUNCATION_MARKER));
        assert!(error.starts_with("Step 'f' failed"));
    }

    #[tokio::test]
    async fn test_oversized_initial_context_rejected() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("a", "first")]).await;

        let mut initial = Map::new();
        initial.insert("blob".into(), json!("x".repeat(1_048_577)));
        let err = h
            .orchestrator
            .start_workflow("weekly", "cust-1", initial)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONTEXT_TOO_LARGE");
        assert_eq!(h.first.calls(), 0);

        let executions = h
            .orchestrator
            .list_executions(&ExecutionQuery::default())
            .await
            .unwrap();
        assert!(executions.is_empty());
    }

    #[tokio::test]
    async fn test_context_growth_beyond_ceiling_fails_execution() {
        let h = harness(OrchestratorConfig {
            max_context_bytes: 1024,
            ..test_config()
        });
        define(
            &h,
            "weekly",
            vec![
                StepSpec::new("grow", "bloat").with_retries(3).with_config(json!({"bytes": 4096})),
                StepSpec::new("b", "second"),
            ],
        )
        .await;

        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("exceeds limit"));
        assert!(!execution.context.contains_key("blob"));
        assert_eq!(h.second.calls(), 0);
    }

    #[tokio::test]
    async fn test_memory_mode_context_growth_beyond_ceiling_fails_execution() {
        let h = harness(OrchestratorConfig {
            persistence_mode: PersistenceMode::Memory,
            max_context_bytes: 1024,
            ..test_config()
        });
        define(
            &h,
            "weekly",
            vec![
                StepSpec::new("a", "first"),
                StepSpec::new("grow", "bloat").with_config(json!({"bytes": 4096})),
            ],
        )
        .await;

        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.current_step, 1);
        assert_eq!(execution.context["first_done"], 1);
        assert!(!execution.context.contains_key("blob"));
    }

    #[tokio::test]
    async fn test_invalid_steps_rejected_at_start() {
        let h = harness(test_config());
        // bypass creation-time validation
        h.storage
            .save_definition(&WorkflowDefinition::from_spec(DefinitionSpec::new(
                "broken",
                vec![StepSpec::new("a", "first"), StepSpec::new("b", "")],
            )))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .start_workflow("broken", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        define(&h, "unknown", vec![StepSpec::new("a", "mailer")]).await;
        let err = h
            .orchestrator
            .start_workflow("unknown", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown service 'mailer'"));
        assert_eq!(h.first.calls(), 0);

        let err = h
            .orchestrator
            .start_workflow("nope", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_disabled_definition_cannot_start() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("a", "first")]).await;
        // warm the cache, then make sure toggling invalidates it
        h.orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();

        h.orchestrator.set_definition_enabled("weekly", false).await.unwrap();
        let err = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));

        h.orchestrator.set_definition_enabled("weekly", true).await.unwrap();
        assert!(h
            .orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .is_ok());

        let err = h
            .orchestrator
            .set_definition_enabled("missing", true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_memory_mode_keeps_context_out_of_storage() {
        let h = harness(OrchestratorConfig {
            persistence_mode: PersistenceMode::Memory,
            context_ttl: Duration::from_millis(50),
            ..test_config()
        });
        define(
            &h,
            "weekly",
            vec![StepSpec::new("a", "first"), StepSpec::new("b", "second")],
        )
        .await;

        let mut initial = Map::new();
        initial.insert("account".into(), json!("acme"));
        let execution = h
            .orchestrator
            .run_workflow("weekly", "cust-1", initial)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.context["account"], "acme");
        assert_eq!(execution.context["second_done"], 1);
        assert_eq!(lock(&h.second.seen)[0]["first_done"], 1);

        let stored = h.storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert!(stored.context.is_empty());

        sleep(Duration::from_millis(80)).await;
        assert_eq!(h.orchestrator.cleanup_expired_contexts(), 1);
        let evicted = h.orchestrator.get_execution(&execution.id).await.unwrap().unwrap();
        assert!(evicted.context.is_empty());
    }

    #[tokio::test]
    async fn test_memory_mode_resume_after_eviction_fails() {
        let h = harness(OrchestratorConfig {
            persistence_mode: PersistenceMode::Memory,
            context_ttl: Duration::from_millis(1),
            cleanup_interval: Duration::from_millis(10),
            ..test_config()
        });
        define(
            &h,
            "weekly",
            vec![StepSpec::new("wait", "gated"), StepSpec::new("b", "second")],
        )
        .await;

        let execution = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.gated.entered.notified().await;
        h.orchestrator.pause_workflow(&execution.id).await.unwrap();
        h.gated.open();
        h.orchestrator
            .wait_until_settled(&execution.id, SETTLE)
            .await
            .unwrap();

        assert!(h.orchestrator.start_cleanup_task());
        assert!(!h.orchestrator.start_cleanup_task());
        sleep(Duration::from_millis(100)).await;

        let err = h.orchestrator.resume_workflow(&execution.id).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_parks_execution_and_awaits_tasks() {
        let h = harness(test_config());
        define(
            &h,
            "weekly",
            vec![StepSpec::new("wait", "gated"), StepSpec::new("b", "second")],
        )
        .await;

        let execution = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.gated.entered.notified().await;
        h.orchestrator.start_cleanup_task();

        let orchestrator = h.orchestrator.clone();
        let shutdown = tokio::spawn(async move { orchestrator.shutdown().await });
        while !h.orchestrator.shutdown_coordinator().is_shutdown_requested() {
            sleep(Duration::from_millis(5)).await;
        }
        h.gated.open();
        tokio::time::timeout(SETTLE, shutdown).await.unwrap().unwrap();

        let parked = h.orchestrator.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(parked.status, ExecutionStatus::Paused);
        assert_eq!(parked.current_step, 1);
        assert_eq!(h.second.calls(), 0);

        let err = h
            .orchestrator
            .start_workflow("weekly", "cust-2", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SHUTTING_DOWN");
        let err = h.orchestrator.resume_workflow(&execution.id).await.unwrap_err();
        assert_eq!(err.code(), "SHUTTING_DOWN");
    }

    /// Blocks until shutdown is requested, then fails.
    struct ListeningStep {
        shutdown: ShutdownCoordinator,
        entered: Notify,
    }

    #[async_trait]
    impl StepExecutor for ListeningStep {
        fn service(&self) -> &str {
            "listener"
        }

        async fn execute(&self, _ctx: &StepContext) -> Result<Map<String, Value>> {
            self.entered.notify_one();
            self.shutdown.wait_for_shutdown().await;
            Err(Error::Execution("Analyzer interrupted by shutdown".into()))
        }
    }

    #[tokio::test]
    async fn test_step_failing_on_shutdown_parks_without_retries_left() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let coordinator = ShutdownCoordinator::new();
        let listener = Arc::new(ListeningStep {
            shutdown: coordinator.clone(),
            entered: Notify::new(),
        });
        let mut steps = StepRegistry::new();
        steps.register(listener.clone());
        steps.register(CountingStep::new("second", 0));
        let orchestrator =
            WorkflowOrchestrator::with_shutdown(storage.clone(), steps, test_config(), coordinator);
        orchestrator
            .create_workflow_definition(DefinitionSpec::new(
                "weekly",
                vec![StepSpec::new("a", "listener"), StepSpec::new("b", "second")],
            ))
            .await
            .unwrap();

        let execution = orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        listener.entered.notified().await;
        tokio::time::timeout(SETTLE, orchestrator.shutdown()).await.unwrap();

        let parked = orchestrator.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(parked.status, ExecutionStatus::Paused);
        assert_eq!(parked.current_step, 0);
        assert!(parked.completed_at.is_none());
        let records = orchestrator.get_execution_steps(&execution.id).await.unwrap();
        assert_eq!(records[0].status, StepStatus::Failed);

        // a fresh process picks the execution up from the interrupted step
        let listener = CountingStep::new("listener", 0);
        let mut steps = StepRegistry::new();
        steps.register(listener.clone());
        steps.register(CountingStep::new("second", 0));
        let restarted = WorkflowOrchestrator::new(storage, steps, test_config());
        restarted.resume_workflow(&execution.id).await.unwrap();
        let finished = restarted
            .wait_until_settled(&execution.id, SETTLE)
            .await
            .unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(listener.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_step_commit_marks_execution_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adflow.db");
        let storage = SqliteStorage::open(&path).unwrap();
        let mut steps = StepRegistry::new();
        steps.register(CountingStep::new("first", 0));
        let orchestrator = WorkflowOrchestrator::new(storage, steps, test_config());
        orchestrator
            .create_workflow_definition(DefinitionSpec::new(
                "weekly",
                vec![StepSpec::new("a", "first")],
            ))
            .await
            .unwrap();

        // completed step records can no longer be written
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_completed_insert BEFORE INSERT ON workflow_steps
             WHEN NEW.status = 'completed' BEGIN SELECT RAISE(ABORT, 'disk full'); END;
             CREATE TRIGGER reject_completed_update BEFORE UPDATE ON workflow_steps
             WHEN NEW.status = 'completed' BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        let err = orchestrator
            .run_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        let executions = orchestrator
            .list_executions(&ExecutionQuery::default())
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0].error.as_deref().unwrap().contains("Execution aborted"));

        // the workflow is free for the customer again
        let next = orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        orchestrator.wait_until_settled(&next.id, SETTLE).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_execution_owned_by_another_process() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("wait", "gated")]).await;
        let stuck = h
            .orchestrator
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap();
        h.gated.entered.notified().await;

        let mut steps = StepRegistry::new();
        steps.register(CountingStep::new("gated", 0));
        let other = WorkflowOrchestrator::new(h.storage.clone(), steps, test_config());
        let err = other
            .start_workflow("weekly", "cust-1", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_RUNNING");

        let cancelled = other.cancel_workflow(&stuck.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        let execution = other.run_workflow("weekly", "cust-1", Map::new()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_executions_filters() {
        let h = harness(test_config());
        define(&h, "weekly", vec![StepSpec::new("a", "first")]).await;
        define(&h, "daily", vec![StepSpec::new("f", "flaky")]).await;

        h.orchestrator.run_workflow("weekly", "cust-1", Map::new()).await.unwrap();
        h.orchestrator.run_workflow("weekly", "cust-2", Map::new()).await.unwrap();
        h.orchestrator.run_workflow("daily", "cust-1", Map::new()).await.unwrap();

        let for_customer = h
            .orchestrator
            .list_executions(&ExecutionQuery {
                customer_id: Some("cust-1".into()),
                ..ExecutionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(for_customer.len(), 2);

        let failed = h
            .orchestrator
            .list_executions(&ExecutionQuery {
                customer_id: Some("cust-1".into()),
                status: Some(ExecutionStatus::Failed),
                ..ExecutionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].workflow_name, "daily");
    }
}
