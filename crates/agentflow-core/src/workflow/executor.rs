//! Workflow executor: dependency-driven concurrent step dispatch.
//!
//! The `DagExecutor` runs every step of a validated [`Workflow`] as soon as
//! all of its dependencies have completed, bounded by a per-run concurrency
//! semaphore. Agent calls run as tasks on a `JoinSet`; the engine loop is the
//! only writer of the run's records in the state store.
//!
//! # Execution flow
//!
//! 1. Construct configured agents through the `AgentFactory`.
//! 2. Register the workflow, its steps and its agents, then mark it Running.
//! 3. Loop: skip steps behind a failed dependency, dispatch eligible steps
//!    while permits are free, then wait for a completion, the cancellation
//!    token or the run deadline.
//! 4. Merge each successful output into the `WorkflowContext`.
//! 5. Once every step is terminal, write metrics and the terminal status and
//!    return a `RunResult`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentflow_types::config::EngineConfig;
use agentflow_types::error::{AgentError, StateError};
use agentflow_types::event::WorkflowEvent;
use agentflow_types::state::WorkflowStatusSummary;
use agentflow_types::status::{AgentStatus, StepStatus, WorkflowStatus};
use agentflow_types::workflow::{ContextMap, RunResult, StepDefinition, StepOutcome};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::{AgentFactory, AgentPool, BuiltinAgentFactory};
use crate::event::EventBus;
use crate::state::WorkflowStateManager;

use super::context::WorkflowContext;
use super::definition::{Workflow, WorkflowError};
use super::ledger::RunLedger;
use super::step_runner::{StepError, StepRun, panic_message, run_step};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Error recorded on the workflow and on aborted steps when the deadline passes.
pub const WORKFLOW_TIMED_OUT: &str = "workflow timed out";

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Run a workflow to completion with `input` as the initial context.
    fn execute(
        &self,
        workflow: &Workflow,
        input: ContextMap,
    ) -> impl std::future::Future<Output = Result<RunResult, ExecutorError>> + Send;

    /// Run a workflow that stops dispatching once `cancel` is triggered.
    fn execute_with_cancellation(
        &self,
        workflow: &Workflow,
        input: ContextMap,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<RunResult, ExecutorError>> + Send;

    /// Trigger cancellation of the active run of `workflow_id`.
    fn cancel(&self, workflow_id: &str) -> Result<(), ExecutorError>;

    /// Aggregate progress of a workflow known to the state store.
    fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusSummary, ExecutorError>;
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Concurrent DAG executor backed by a shared [`WorkflowStateManager`].
///
/// Generic over `F: AgentFactory` so embedders can supply their own agent kinds.
pub struct DagExecutor<F: AgentFactory = BuiltinAgentFactory> {
    store: Arc<WorkflowStateManager>,
    factory: F,
    event_bus: EventBus,
    config: EngineConfig,
    /// Cancellation tokens of active runs keyed by workflow id.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl DagExecutor<BuiltinAgentFactory> {
    /// Executor with the built-in agent kinds and default engine settings.
    pub fn new(store: Arc<WorkflowStateManager>, event_bus: EventBus) -> Self {
        Self::with_factory(store, BuiltinAgentFactory, event_bus)
    }
}

impl<F: AgentFactory> DagExecutor<F> {
    pub fn with_factory(store: Arc<WorkflowStateManager>, factory: F, event_bus: EventBus) -> Self {
        Self {
            store,
            factory,
            event_bus,
            config: EngineConfig::default(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<WorkflowStateManager> {
        &self.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `workflow` using agents already placed in `pool`.
    ///
    /// Configured agents missing from the pool are constructed through the
    /// factory; pooled agents take precedence over their configuration.
    pub async fn execute_with_pool(
        &self,
        workflow: &Workflow,
        mut pool: AgentPool,
        input: ContextMap,
        cancel: CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        let workflow_id = workflow.id();
        pool.construct_missing(&workflow.definition().agents, &self.factory)?;

        self.register(workflow)?;
        self.cancellation_tokens
            .insert(workflow_id.to_string(), cancel.clone());
        let _token_guard = TokenGuard {
            tokens: &self.cancellation_tokens,
            workflow_id,
        };

        let run_id = Uuid::now_v7();
        let span = tracing::info_span!("workflow_run", workflow_id, run_id = %run_id);
        let run = Run::new(self, workflow, run_id, pool, input);
        match run.drive(&cancel).instrument(span).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.abandon(workflow_id, run_id, &e);
                Err(e)
            }
        }
    }

    /// Register the workflow, its steps and every agent it mentions.
    fn register(&self, workflow: &Workflow) -> Result<(), ExecutorError> {
        let def = workflow.definition();
        self.store.initialize_workflow(&def.id, &def.name)?;

        for step in &def.steps {
            self.store
                .initialize_step(&def.id, &step.id, step.display_name())?;
        }

        let mut registered = HashSet::new();
        for agent in &def.agents {
            self.store
                .initialize_agent(&def.id, &agent.id, agent.display_name())?;
            registered.insert(agent.id.as_str());
        }
        for agent_id in def.steps.iter().flat_map(|s| s.agents.iter()) {
            if registered.insert(agent_id.as_str()) {
                self.store.initialize_agent(&def.id, agent_id, agent_id)?;
            }
        }
        Ok(())
    }

    /// Best-effort failure marking after an engine error. Store errors are
    /// ignored here; the original error is what the caller sees.
    fn abandon(&self, workflow_id: &str, run_id: Uuid, error: &ExecutorError) {
        let message = error.to_string();
        if let Ok(snapshot) = self.store.snapshot(workflow_id) {
            if snapshot.workflow.is_terminal() {
                return;
            }
            for (step_id, step) in &snapshot.steps {
                if !step.is_terminal() {
                    let _ = self
                        .store
                        .update_step_status(workflow_id, step_id, StepStatus::Skipped);
                }
            }
        }
        let _ = self.store.set_workflow_error(workflow_id, &message);
        if self
            .store
            .update_workflow_status(workflow_id, WorkflowStatus::Failed)
            .is_ok()
        {
            self.event_bus.publish(WorkflowEvent::RunFinished {
                run_id,
                workflow_id: workflow_id.to_string(),
                status: WorkflowStatus::Failed,
            });
        }
        tracing::error!(workflow_id, run_id = %run_id, error = %message, "workflow run aborted");
    }
}

impl<F: AgentFactory> WorkflowExecutor for DagExecutor<F> {
    async fn execute(
        &self,
        workflow: &Workflow,
        input: ContextMap,
    ) -> Result<RunResult, ExecutorError> {
        self.execute_with_cancellation(workflow, input, CancellationToken::new())
            .await
    }

    async fn execute_with_cancellation(
        &self,
        workflow: &Workflow,
        input: ContextMap,
        cancel: CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        self.execute_with_pool(workflow, AgentPool::new(), input, cancel)
            .await
    }

    fn cancel(&self, workflow_id: &str) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(workflow_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| ExecutorError::RunNotFound(workflow_id.to_string()))?;
        token.cancel();
        tracing::info!(workflow_id, "workflow cancellation requested");
        Ok(())
    }

    fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusSummary, ExecutorError> {
        Ok(self.store.workflow_status(workflow_id)?)
    }
}

/// Unregisters a run's cancellation token when the run ends, however it ends.
struct TokenGuard<'a> {
    tokens: &'a DashMap<String, CancellationToken>,
    workflow_id: &'a str,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.tokens.remove(self.workflow_id);
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Bookkeeping for one dispatched step.
struct InFlight {
    step_id: String,
    agent_id: String,
    _permit: OwnedSemaphorePermit,
}

/// State of a single execution attempt, owned by the engine loop.
struct Run<'a, F: AgentFactory> {
    executor: &'a DagExecutor<F>,
    workflow_id: &'a str,
    run_id: Uuid,
    steps: HashMap<&'a str, &'a StepDefinition>,
    /// Configured agent ids in declaration order, used by steps that list none.
    workflow_agents: Vec<String>,
    ledger: RunLedger<'a>,
    context: WorkflowContext,
    pool: AgentPool,
    concurrency: usize,
    step_timeout_secs: Option<u64>,
    workflow_timeout: Duration,
    /// Step id to the agent it was dispatched to.
    assigned: HashMap<String, String>,
    /// Agents that have left `Initialized`.
    activated: HashSet<String>,
    /// Agents with a call in flight. An agent serves one step at a time.
    busy: HashSet<String>,
    /// Agents that failed in this run and are never dispatched again.
    failed_agents: HashSet<String>,
    in_flight: HashMap<tokio::task::Id, InFlight>,
    max_in_flight: usize,
    cancelled: bool,
    timed_out: bool,
    started: Instant,
}

impl<'a, F: AgentFactory> Run<'a, F> {
    fn new(
        executor: &'a DagExecutor<F>,
        workflow: &'a Workflow,
        run_id: Uuid,
        pool: AgentPool,
        input: ContextMap,
    ) -> Self {
        let def = workflow.definition();
        let limit = def
            .concurrency
            .unwrap_or(executor.config.default_concurrency);
        let workflow_timeout = Duration::from_secs(
            def.timeout_secs
                .unwrap_or(executor.config.workflow_timeout_secs),
        );

        Self {
            executor,
            workflow_id: workflow.id(),
            run_id,
            steps: def.steps.iter().map(|s| (s.id.as_str(), s)).collect(),
            workflow_agents: def.agents.iter().map(|a| a.id.clone()).collect(),
            ledger: RunLedger::new(workflow.graph()),
            context: WorkflowContext::new(workflow.id(), run_id, input),
            pool,
            concurrency: limit.min(def.steps.len()).max(1),
            step_timeout_secs: executor.config.step_timeout_secs,
            workflow_timeout,
            assigned: HashMap::new(),
            activated: HashSet::new(),
            busy: HashSet::new(),
            failed_agents: HashSet::new(),
            in_flight: HashMap::new(),
            max_in_flight: 0,
            cancelled: false,
            timed_out: false,
            started: Instant::now(),
        }
    }

    fn store(&self) -> &'a WorkflowStateManager {
        &self.executor.store
    }

    fn publish(&self, event: WorkflowEvent) {
        self.executor.event_bus.publish(event);
    }

    /// No new steps are dispatched once the run is cancelled or timed out.
    fn halted(&self) -> bool {
        self.cancelled || self.timed_out
    }

    async fn drive(mut self, cancel: &CancellationToken) -> Result<RunResult, ExecutorError> {
        self.store()
            .update_workflow_status(self.workflow_id, WorkflowStatus::Running)?;
        self.publish(WorkflowEvent::RunStarted {
            run_id: self.run_id,
            workflow_id: self.workflow_id.to_string(),
            total_steps: self.steps.len(),
        });
        tracing::info!(
            run_id = %self.run_id,
            workflow_id = self.workflow_id,
            steps = self.steps.len(),
            concurrency = self.concurrency,
            "starting workflow execution"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<StepRun> = JoinSet::new();
        let deadline = tokio::time::sleep(self.workflow_timeout);
        tokio::pin!(deadline);

        loop {
            if !self.halted() && cancel.is_cancelled() {
                self.on_cancel(&mut join_set).await?;
            }

            self.apply_skips()?;

            if !self.halted() {
                let failed_early = self.dispatch_ready(&semaphore, &mut join_set)?;
                if failed_early && join_set.is_empty() {
                    continue;
                }
            }

            if join_set.is_empty() {
                if self.halted() || self.ledger.is_complete() {
                    break;
                }
                let pending = self
                    .ledger
                    .deadlocked(0)
                    .unwrap_or_else(|| self.ledger.with_status(StepStatus::Pending));
                return Err(ExecutorError::Deadlock {
                    workflow_id: self.workflow_id.to_string(),
                    pending,
                });
            }

            let cancel_armed = !self.halted();
            let deadline_armed = !self.timed_out;
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if cancel_armed => {
                    self.on_cancel(&mut join_set).await?;
                }
                _ = &mut deadline, if deadline_armed => {
                    self.on_timeout(&mut join_set).await?;
                }
                Some(joined) = join_set.join_next_with_id() => {
                    self.on_joined(joined)?;
                }
            }
        }

        self.finish()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch eligible steps while permits are free. Returns whether any
    /// step failed without being spawned.
    fn dispatch_ready(
        &mut self,
        semaphore: &Arc<Semaphore>,
        join_set: &mut JoinSet<StepRun>,
    ) -> Result<bool, ExecutorError> {
        let mut failed_early = false;

        for step_id in self.ledger.eligible() {
            let Some(step) = self.steps.get(step_id.as_str()).copied() else {
                continue;
            };

            let Some(agent_id) = self.pick_agent(step) else {
                self.fail_unspawned(&step_id, StepError::NoAgentAvailable(step_id.clone()))?;
                failed_early = true;
                continue;
            };

            if self.busy.contains(&agent_id) {
                tracing::trace!(step_id, agent_id, "agent busy, step deferred");
                continue;
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };

            let agent = match self
                .pool
                .resolve_or_materialize(&agent_id, &self.executor.factory)
            {
                Ok(agent) => agent,
                Err(e) => {
                    self.failed_agents.insert(agent_id);
                    self.fail_unspawned(&step_id, StepError::Agent(e))?;
                    failed_early = true;
                    continue;
                }
            };

            if self.activated.insert(agent_id.clone()) {
                self.store()
                    .update_agent_status(self.workflow_id, &agent_id, AgentStatus::Idle)?;
            }
            self.store()
                .update_agent_status(self.workflow_id, &agent_id, AgentStatus::Running)?;
            self.store()
                .update_step_status(self.workflow_id, &step_id, StepStatus::Running)?;
            self.ledger.set(&step_id, StepStatus::Running);
            self.busy.insert(agent_id.clone());
            self.assigned.insert(step_id.clone(), agent_id.clone());

            self.publish(WorkflowEvent::StepStarted {
                run_id: self.run_id,
                step_id: step_id.clone(),
                agent_id: agent_id.clone(),
            });
            tracing::debug!(run_id = %self.run_id, step_id, agent_id, "step dispatched");

            let timeout = step
                .timeout_secs
                .or(self.step_timeout_secs)
                .map(Duration::from_secs);
            let handle = join_set.spawn(run_step(agent, self.context.snapshot(), timeout));
            self.in_flight.insert(
                handle.id(),
                InFlight {
                    step_id,
                    agent_id,
                    _permit: permit,
                },
            );
            self.max_in_flight = self.max_in_flight.max(self.in_flight.len());
        }

        Ok(failed_early)
    }

    /// First agent that has not failed in this run. A step that lists no
    /// agents is served from the workflow's configured agents.
    fn pick_agent(&self, step: &StepDefinition) -> Option<String> {
        let candidates = if step.agents.is_empty() {
            &self.workflow_agents
        } else {
            &step.agents
        };
        candidates
            .iter()
            .find(|id| !self.failed_agents.contains(*id))
            .cloned()
    }

    /// Fail a step that never reached an agent: Pending -> Running -> Failed.
    fn fail_unspawned(&mut self, step_id: &str, error: StepError) -> Result<(), ExecutorError> {
        self.store()
            .update_step_status(self.workflow_id, step_id, StepStatus::Running)?;
        self.fail_step(step_id, None, &error)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn on_joined(
        &mut self,
        joined: Result<(tokio::task::Id, StepRun), JoinError>,
    ) -> Result<(), ExecutorError> {
        let (task_id, outcome, elapsed) = match joined {
            Ok((id, run)) => (id, run.outcome, Some(run.elapsed)),
            Err(e) => {
                let id = e.id();
                let error = if e.is_panic() {
                    StepError::Panicked(panic_message(e.into_panic()))
                } else {
                    StepError::Aborted
                };
                (id, Err(error), None)
            }
        };

        let Some(flight) = self.in_flight.remove(&task_id) else {
            tracing::warn!(run_id = %self.run_id, "completion for unknown task ignored");
            return Ok(());
        };
        let InFlight {
            step_id, agent_id, ..
        } = flight;

        let output = match outcome {
            Ok(output) => output,
            Err(error) => return self.fail_step(&step_id, Some(&agent_id), &error),
        };

        match self.context.merge_step_output(&step_id, output) {
            Ok(_) => self.complete_step(&step_id, &agent_id, elapsed.unwrap_or_default()),
            Err(e) => {
                // The call itself succeeded, so the agent stays usable.
                self.fail_step(&step_id, None, &StepError::from(e))?;
                self.release_agent(&agent_id)
            }
        }
    }

    /// Return an agent whose call finished to Idle.
    fn release_agent(&mut self, agent_id: &str) -> Result<(), ExecutorError> {
        self.busy.remove(agent_id);
        let store = self.store();
        store.increment_agent_metric(self.workflow_id, agent_id, "calls", 1)?;
        store.update_agent_status(self.workflow_id, agent_id, AgentStatus::Idle)?;
        Ok(())
    }

    fn complete_step(
        &mut self,
        step_id: &str,
        agent_id: &str,
        elapsed: Duration,
    ) -> Result<(), ExecutorError> {
        let store = self.store();
        let duration_ms = elapsed.as_millis() as u64;
        let output = self.context.step_output(step_id).cloned().unwrap_or_default();

        store.set_step_result(self.workflow_id, step_id, output.clone())?;
        store.set_step_metric(self.workflow_id, step_id, "duration_ms", json!(duration_ms))?;
        store.update_step_status(self.workflow_id, step_id, StepStatus::Completed)?;
        self.ledger.set(step_id, StepStatus::Completed);

        store.set_agent_result(self.workflow_id, agent_id, output)?;
        self.release_agent(agent_id)?;

        self.publish(WorkflowEvent::StepCompleted {
            run_id: self.run_id,
            step_id: step_id.to_string(),
            duration_ms,
        });
        tracing::debug!(run_id = %self.run_id, step_id, agent_id, duration_ms, "step completed");
        Ok(())
    }

    /// Mark a Running step Failed, and its agent with it when there is one.
    fn fail_step(
        &mut self,
        step_id: &str,
        agent_id: Option<&str>,
        error: &StepError,
    ) -> Result<(), ExecutorError> {
        let store = self.store();
        let message = error.to_string();

        store.set_step_error(self.workflow_id, step_id, &message)?;
        store.update_step_status(self.workflow_id, step_id, StepStatus::Failed)?;
        self.ledger.set(step_id, StepStatus::Failed);

        if let Some(agent_id) = agent_id {
            self.busy.remove(agent_id);
            self.failed_agents.insert(agent_id.to_string());
            store.set_agent_error(self.workflow_id, agent_id, &message)?;
            store.increment_agent_metric(self.workflow_id, agent_id, "calls", 1)?;
            store.update_agent_status(self.workflow_id, agent_id, AgentStatus::Failed)?;
        }

        self.publish(WorkflowEvent::StepFailed {
            run_id: self.run_id,
            step_id: step_id.to_string(),
            error: message.clone(),
        });
        tracing::warn!(run_id = %self.run_id, step_id, agent_id, error = %message, "step failed");
        Ok(())
    }

    /// Skip every pending step behind a failed or skipped dependency.
    fn apply_skips(&mut self) -> Result<(), ExecutorError> {
        for (step_id, cause) in self.ledger.propagate_skips() {
            let reason = format!("dependency '{cause}' did not complete");
            self.skip_step(&step_id, reason)?;
        }
        Ok(())
    }

    fn skip_step(&self, step_id: &str, reason: String) -> Result<(), ExecutorError> {
        self.store()
            .set_step_error(self.workflow_id, step_id, &reason)?;
        self.store()
            .update_step_status(self.workflow_id, step_id, StepStatus::Skipped)?;
        tracing::debug!(run_id = %self.run_id, step_id, reason, "step skipped");
        self.publish(WorkflowEvent::StepSkipped {
            run_id: self.run_id,
            step_id: step_id.to_string(),
            reason,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancellation and deadline
    // -----------------------------------------------------------------------

    async fn on_cancel(&mut self, join_set: &mut JoinSet<StepRun>) -> Result<(), ExecutorError> {
        self.cancelled = true;
        tracing::info!(
            run_id = %self.run_id,
            workflow_id = self.workflow_id,
            in_flight = self.in_flight.len(),
            abort = self.executor.config.abort_in_flight_on_cancel,
            "workflow cancelled"
        );
        if !self.executor.config.abort_in_flight_on_cancel {
            return Ok(());
        }

        join_set.shutdown().await;
        for (_, flight) in std::mem::take(&mut self.in_flight) {
            self.busy.remove(&flight.agent_id);
            self.store().update_agent_status(
                self.workflow_id,
                &flight.agent_id,
                AgentStatus::Idle,
            )?;
            self.ledger.set(&flight.step_id, StepStatus::Skipped);
            self.skip_step(&flight.step_id, "run cancelled".to_string())?;
        }
        Ok(())
    }

    async fn on_timeout(&mut self, join_set: &mut JoinSet<StepRun>) -> Result<(), ExecutorError> {
        self.timed_out = true;
        tracing::warn!(
            run_id = %self.run_id,
            workflow_id = self.workflow_id,
            timeout_secs = self.workflow_timeout.as_secs(),
            in_flight = self.in_flight.len(),
            "workflow deadline exceeded"
        );

        join_set.shutdown().await;
        for (_, flight) in std::mem::take(&mut self.in_flight) {
            self.fail_step(
                &flight.step_id,
                Some(&flight.agent_id),
                &StepError::WorkflowTimedOut,
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    fn finish(mut self) -> Result<RunResult, ExecutorError> {
        let leftover_reason = if self.cancelled {
            "run cancelled"
        } else if self.timed_out {
            WORKFLOW_TIMED_OUT
        } else {
            "run ended before the step was dispatched"
        };
        for step_id in self.ledger.with_status(StepStatus::Pending) {
            self.ledger.set(&step_id, StepStatus::Skipped);
            self.skip_step(&step_id, leftover_reason.to_string())?;
        }

        let status = if self.cancelled {
            WorkflowStatus::Cancelled
        } else if self.timed_out || self.ledger.any_failed() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        let run_error = self.timed_out.then(|| WORKFLOW_TIMED_OUT.to_string());

        let store = self.store();
        let wf = self.workflow_id;
        let duration_ms = self.started.elapsed().as_millis() as u64;
        store.set_workflow_metric(wf, "duration_ms", json!(duration_ms))?;
        store.set_workflow_metric(wf, "steps_total", json!(self.steps.len()))?;
        for (key, step_status) in [
            ("steps_completed", StepStatus::Completed),
            ("steps_failed", StepStatus::Failed),
            ("steps_skipped", StepStatus::Skipped),
        ] {
            store.set_workflow_metric(wf, key, json!(self.ledger.count(step_status)))?;
        }
        store.set_workflow_metric(wf, "concurrency_limit", json!(self.concurrency))?;
        store.set_workflow_metric(wf, "max_in_flight", json!(self.max_in_flight))?;
        store.set_workflow_result(wf, self.context.data().clone())?;
        if let Some(error) = &run_error {
            store.set_workflow_error(wf, error)?;
        }
        store.update_workflow_status(wf, status)?;

        self.publish(WorkflowEvent::RunFinished {
            run_id: self.run_id,
            workflow_id: wf.to_string(),
            status,
        });
        tracing::info!(
            run_id = %self.run_id,
            workflow_id = wf,
            status = %status,
            duration_ms,
            completed = self.ledger.count(StepStatus::Completed),
            failed = self.ledger.count(StepStatus::Failed),
            skipped = self.ledger.count(StepStatus::Skipped),
            "workflow execution finished"
        );

        let snapshot = store.snapshot(wf)?;
        let steps = snapshot
            .steps
            .into_iter()
            .map(|(id, step)| {
                let outcome = StepOutcome {
                    status: step.status,
                    agent_id: self.assigned.get(&id).cloned(),
                    result: step.result,
                    error: step.error,
                };
                (id, outcome)
            })
            .collect();

        Ok(RunResult {
            workflow_id: wf.to_string(),
            run_id: self.run_id,
            status,
            steps,
            completion_order: self.context.completion_order().to_vec(),
            context: self.context.into_data(),
            error: run_error,
            started_at: snapshot.workflow.start_time.unwrap_or_else(Utc::now),
            finished_at: snapshot.workflow.end_time.unwrap_or_else(Utc::now),
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that end a workflow run (or prevent it from starting).
///
/// Step failures are not errors at this level: they are recorded on the step
/// and reflected in the run's final status.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Invalid workflow definition.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// State store rejected an update.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// A configured agent could not be constructed.
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// Steps remain but none can ever become eligible.
    #[error("workflow '{workflow_id}' deadlocked with unfinished steps: {}", pending.join(", "))]
    Deadlock {
        workflow_id: String,
        pending: Vec<String>,
    },

    /// No active run for the workflow id (for cancel).
    #[error("no active run for workflow '{0}'")]
    RunNotFound(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use agentflow_types::status::Lifecycle;
    use crate::agent::builtin::ScriptedAgent;
    use crate::workflow::context::MAX_CONTEXT_SIZE;
    use agentflow_types::workflow::{AgentConfig, WorkflowDefinition};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Barrier, Notify};

    // -----------------------------------------------------------------------
    // Test agents
    // -----------------------------------------------------------------------

    /// Waits at a shared barrier, so it only returns once `n` callers arrive.
    struct BarrierAgent {
        id: String,
        barrier: Arc<Barrier>,
    }

    impl Agent for BarrierAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
            self.barrier.wait().await;
            Ok(ContextMap::new())
        }
    }

    /// Records its id when invoked and echoes it under `last`.
    struct RecordingAgent {
        id: String,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl Agent for RecordingAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
            self.log.lock().unwrap().push(self.id.clone());
            tokio::time::sleep(self.delay).await;
            let mut out = ContextMap::new();
            out.insert("last".into(), json!(self.id));
            out.insert(format!("{}_done", self.id), json!(true));
            Ok(out)
        }
    }

    /// Tracks how many calls overlap.
    struct GaugeAgent {
        id: String,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Agent for GaugeAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ContextMap::new())
        }
    }

    /// Signals `started`, then blocks until `release` is notified.
    struct GateAgent {
        id: String,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl Agent for GateAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
            self.started.notify_one();
            self.release.notified().await;
            let mut out = ContextMap::new();
            out.insert(format!("{}_done", self.id), json!(true));
            Ok(out)
        }
    }

    struct PanickingAgent;

    impl Agent for PanickingAgent {
        fn id(&self) -> &str {
            "crashy"
        }

        async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
            panic!("agent blew up");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn executor() -> DagExecutor {
        DagExecutor::new(Arc::new(WorkflowStateManager::new()), EventBus::new(64))
    }

    fn step(id: &str, agent: &str, deps: &[&str]) -> StepDefinition {
        deps.iter()
            .fold(StepDefinition::new(id).with_agent(agent), |s, d| s.depends_on(*d))
    }

    fn workflow(id: &str, steps: Vec<StepDefinition>) -> Workflow {
        let def = steps
            .into_iter()
            .fold(WorkflowDefinition::new(id, id), WorkflowDefinition::with_step);
        Workflow::new(def).unwrap()
    }

    fn output(key: &str, value: serde_json::Value) -> ContextMap {
        let mut map = ContextMap::new();
        map.insert(key.into(), value);
        map
    }

    fn recorder(id: &str, log: &Arc<Mutex<Vec<String>>>, delay_ms: u64) -> RecordingAgent {
        RecordingAgent {
            id: id.to_string(),
            log: Arc::clone(log),
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Every recorded transition is legal and consecutive entries chain.
    fn assert_history_chains<S: Lifecycle>(history: &[agentflow_types::state::StatusChange<S>]) {
        for change in history {
            assert!(
                change.previous_status.can_transition_to(change.new_status),
                "illegal transition {} -> {}",
                change.previous_status,
                change.new_status
            );
        }
        for pair in history.windows(2) {
            assert_eq!(pair[0].new_status, pair[1].previous_status);
        }
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn independent_steps_run_concurrently() {
        let exec = executor();
        let barrier = Arc::new(Barrier::new(2));
        let mut pool = AgentPool::new();
        for id in ["left", "right"] {
            pool.insert(BarrierAgent {
                id: id.to_string(),
                barrier: Arc::clone(&barrier),
            });
        }
        let def = WorkflowDefinition::new("fanout", "Fan out")
            .with_concurrency(2)
            .with_step(step("a", "left", &[]))
            .with_step(step("b", "right", &[]));
        let wf = Workflow::new(def).unwrap();

        // Both calls must be in flight at once for the barrier to open.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            exec.execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new()),
        )
        .await
        .expect("steps were not dispatched concurrently")
        .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps_with_status(StepStatus::Completed), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn chain_runs_in_dependency_order() {
        let exec = executor();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pool = AgentPool::new();
        for id in ["x", "y", "z"] {
            pool.insert(recorder(id, &log, 5));
        }
        let wf = workflow(
            "chain",
            vec![step("c", "z", &["b"]), step("b", "y", &["a"]), step("a", "x", &[])],
        );

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["x", "y", "z"]);
        assert_eq!(result.completion_order, vec!["a", "b", "c"]);
        assert_eq!(result.context["last"], json!("z"));
        assert_eq!(result.steps["b"].agent_id.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_siblings() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(ScriptedAgent::new("bad", ContextMap::new()).failing("boom"));
        pool.insert(ScriptedAgent::new("good", output("c_ran", json!(true))));
        pool.insert(ScriptedAgent::new("after", output("b_ran", json!(true))));
        let wf = workflow(
            "partial",
            vec![
                step("a", "bad", &[]),
                step("b", "after", &["a"]),
                step("c", "good", &[]),
            ],
        );

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.steps["a"].status, StepStatus::Failed);
        assert!(result.steps["a"].error.as_deref().unwrap().contains("boom"));
        assert_eq!(result.steps["b"].status, StepStatus::Skipped);
        assert_eq!(result.steps["c"].status, StepStatus::Completed);
        assert!(result.context.get("b_ran").is_none());
        assert_eq!(result.context["c_ran"], json!(true));

        let bad = exec.store().agent_state("partial", "bad").unwrap();
        assert_eq!(bad.status, AgentStatus::Failed);
        let after = exec.store().agent_state("partial", "after").unwrap();
        assert_eq!(after.status, AgentStatus::Initialized);
    }

    #[tokio::test]
    async fn cyclic_definition_is_rejected_before_dispatch() {
        let def = WorkflowDefinition::new("loop", "Loop")
            .with_step(step("a", "x", &["b"]))
            .with_step(step("b", "x", &["a"]));

        let err = Workflow::new(def).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)), "got: {err}");
    }

    #[tokio::test]
    async fn cancellation_stops_further_dispatch() {
        let exec = Arc::new(executor());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pool = AgentPool::new();
        pool.insert(GateAgent {
            id: "gate".into(),
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        pool.insert(recorder("later", &log, 0));
        let wf = workflow("cancel-me", vec![step("a", "gate", &[]), step("b", "later", &["a"])]);

        let run = {
            let exec = Arc::clone(&exec);
            let wf = wf.clone();
            tokio::spawn(async move {
                exec.execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
                    .await
            })
        };

        started.notified().await;
        exec.cancel("cancel-me").unwrap();
        release.notify_one();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.steps["a"].status, StepStatus::Completed);
        assert_eq!(result.steps["b"].status, StepStatus::Skipped);
        assert!(log.lock().unwrap().is_empty());
        assert!(matches!(
            exec.cancel("cancel-me"),
            Err(ExecutorError::RunNotFound(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn concurrency_limit_is_never_exceeded() {
        let exec = executor();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = AgentPool::new();
        let mut def = WorkflowDefinition::new("wide", "Wide").with_concurrency(2);
        for i in 0..6 {
            let agent_id = format!("g{i}");
            pool.insert(GaugeAgent {
                id: agent_id.clone(),
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            });
            def = def.with_step(step(&format!("s{i}"), &agent_id, &[]));
        }
        let wf = Workflow::new(def).unwrap();

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let state = exec.store().workflow_state("wide").unwrap();
        assert_eq!(state.metrics["concurrency_limit"], json!(2));
        assert!(state.metrics["max_in_flight"].as_u64().unwrap() <= 2);
    }

    #[tokio::test]
    async fn shared_agent_serves_one_step_at_a_time() {
        let exec = executor();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = AgentPool::new();
        pool.insert(GaugeAgent {
            id: "solo".into(),
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        });
        let wf = workflow(
            "shared",
            vec![step("a", "solo", &[]), step("b", "solo", &[]), step("c", "solo", &[])],
        );

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let solo = exec.store().agent_state("shared", "solo").unwrap();
        assert_eq!(solo.status, AgentStatus::Idle);
        assert_eq!(solo.metrics["calls"], json!(3));
    }

    #[tokio::test]
    async fn every_recorded_transition_is_legal() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(ScriptedAgent::new("ok", output("k", json!(1))));
        pool.insert(ScriptedAgent::new("bad", ContextMap::new()).failing("nope"));
        let wf = workflow(
            "history",
            vec![
                step("a", "ok", &[]),
                step("b", "bad", &["a"]),
                step("c", "ok", &["b"]),
                step("d", "ok", &["a"]),
            ],
        );

        exec.execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        let snapshot = exec.store().snapshot("history").unwrap();
        assert_history_chains(&snapshot.workflow.history);
        for step in snapshot.steps.values() {
            assert!(step.is_terminal());
            assert_history_chains(&step.history);
        }
        for agent in snapshot.agents.values() {
            assert_history_chains(&agent.history);
        }
        assert!(snapshot.workflow.start_time.is_some());
        assert!(snapshot.workflow.end_time.is_some());
    }

    #[tokio::test]
    async fn workflow_status_is_idempotent_and_counts_steps() {
        let exec = executor();
        let wf = workflow("counts", vec![step("a", "x", &[]), step("b", "x", &["a"])]);
        exec.execute(&wf, ContextMap::new()).await.unwrap();

        let first = exec.workflow_status("counts").unwrap();
        let second = exec.workflow_status("counts").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, WorkflowStatus::Completed);
        assert_eq!(first.total_steps, 2);
        assert_eq!(first.completed_steps, 2);
        assert!(matches!(
            exec.workflow_status("missing"),
            Err(ExecutorError::State(StateError::UnknownWorkflow(_)))
        ));
    }

    #[tokio::test]
    async fn empty_workflow_completes_immediately() {
        let exec = executor();
        let wf = workflow("empty", vec![]);
        let result = exec.execute(&wf, output("seed", json!(1))).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.steps.is_empty());
        assert_eq!(result.context["seed"], json!(1));
    }

    #[tokio::test]
    async fn unconfigured_agent_is_materialized_as_placeholder() {
        let exec = executor();
        let wf = workflow("lazy", vec![step("a", "ghost", &[])]);

        let result = exec.execute(&wf, ContextMap::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        let ghost = exec.store().agent_state("lazy", "ghost").unwrap();
        assert_eq!(ghost.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn configured_agents_are_built_by_the_factory() {
        let exec = executor();
        let def = WorkflowDefinition::new("built", "Built")
            .with_agent(
                AgentConfig::new("searcher", "scripted").with_param("output", json!({"hits": 3})),
            )
            .with_step(step("search", "searcher", &[]));
        let wf = Workflow::new(def).unwrap();

        let result = exec.execute(&wf, ContextMap::new()).await.unwrap();
        assert_eq!(result.context["hits"], json!(3));
        assert_eq!(result.steps["search"].result.as_ref().unwrap()["hits"], json!(3));
    }

    #[tokio::test]
    async fn unsupported_agent_kind_fails_before_registration() {
        let exec = executor();
        let def = WorkflowDefinition::new("llm", "LLM")
            .with_agent(AgentConfig::new("writer", "llm"))
            .with_step(step("write", "writer", &[]));
        let wf = Workflow::new(def).unwrap();

        let err = exec.execute(&wf, ContextMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Agent(AgentError::UnsupportedKind { .. })));
        assert!(!exec.store().contains("llm"));
    }

    #[tokio::test]
    async fn fallback_agent_takes_over_after_primary_fails() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(ScriptedAgent::new("primary", ContextMap::new()).failing("down"));
        pool.insert(ScriptedAgent::new("backup", output("via", json!("backup"))));
        let wf = workflow(
            "fallback",
            vec![
                step("first", "primary", &[]),
                step("second", "primary", &[]).with_agent("backup"),
            ],
        );
        let wf = Workflow::new(WorkflowDefinition {
            concurrency: Some(1),
            ..wf.into_definition()
        })
        .unwrap();

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.steps["first"].status, StepStatus::Failed);
        assert_eq!(result.steps["second"].status, StepStatus::Completed);
        assert_eq!(result.steps["second"].agent_id.as_deref(), Some("backup"));
        assert_eq!(result.context["via"], json!("backup"));
    }

    #[tokio::test]
    async fn step_without_usable_agent_fails() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(ScriptedAgent::new("flaky", ContextMap::new()).failing("down"));
        let def = WorkflowDefinition::new("stranded", "Stranded")
            .with_concurrency(1)
            .with_agent(AgentConfig::placeholder("flaky"))
            .with_step(step("a", "flaky", &[]))
            .with_step(step("b", "flaky", &[]))
            .with_step(StepDefinition::new("c"));
        let wf = Workflow::new(def).unwrap();

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.steps["a"].status, StepStatus::Failed);
        assert!(result.steps["b"].error.as_deref().unwrap().contains("no usable agent"));
        // c falls back to the workflow's agents, and the only one has failed
        assert!(result.steps["c"].error.as_deref().unwrap().contains("no usable agent"));
        assert!(result.steps["c"].agent_id.is_none());
    }

    #[tokio::test]
    async fn step_without_agents_uses_workflow_agents() {
        let exec = executor();
        let def = WorkflowDefinition::new("pooled", "Pooled")
            .with_agent(AgentConfig::new("w", "scripted").with_param("output", json!({"done": 1})))
            .with_step(StepDefinition::new("s"));
        let wf = Workflow::new(def).unwrap();

        let result = exec.execute(&wf, ContextMap::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps["s"].status, StepStatus::Completed);
        assert_eq!(result.steps["s"].agent_id.as_deref(), Some("w"));
        assert_eq!(result.context["done"], json!(1));
    }

    #[tokio::test]
    async fn step_without_agents_skips_failed_workflow_agents() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(ScriptedAgent::new("first", ContextMap::new()).failing("down"));
        pool.insert(ScriptedAgent::new("second", output("via", json!("second"))));
        let def = WorkflowDefinition::new("ordered", "Ordered")
            .with_concurrency(1)
            .with_agent(AgentConfig::placeholder("first"))
            .with_agent(AgentConfig::placeholder("second"))
            .with_step(step("a", "first", &[]))
            .with_step(StepDefinition::new("b"));
        let wf = Workflow::new(def).unwrap();

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.steps["a"].status, StepStatus::Failed);
        assert_eq!(result.steps["b"].status, StepStatus::Completed);
        assert_eq!(result.steps["b"].agent_id.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn workflow_without_any_agents_fails_agentless_step() {
        let exec = executor();
        let wf = workflow("bare", vec![StepDefinition::new("s")]);

        let result = exec.execute(&wf, ContextMap::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.steps["s"].error.as_deref().unwrap().contains("no usable agent"));
    }

    #[tokio::test]
    async fn oversized_merge_fails_step_but_keeps_agent() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(ScriptedAgent::new("w", output("note", json!("x".repeat(64)))));
        let wf = workflow("full", vec![step("a", "w", &[]), step("b", "w", &[])]);
        let seed = output("blob", json!("y".repeat(MAX_CONTEXT_SIZE - 20)));

        let result = exec
            .execute_with_pool(&wf, pool, seed, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        for id in ["a", "b"] {
            assert_eq!(result.steps[id].status, StepStatus::Failed);
            assert_eq!(result.steps[id].agent_id.as_deref(), Some("w"));
            assert!(result.steps[id].error.as_deref().unwrap().contains("context merge failed"));
        }
        let w = exec.store().agent_state("full", "w").unwrap();
        assert_eq!(w.status, AgentStatus::Idle);
        assert_eq!(w.metrics["calls"], json!(2));
    }

    #[tokio::test]
    async fn panicking_agent_fails_only_its_step() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(PanickingAgent);
        pool.insert(ScriptedAgent::new("fine", output("ok", json!(true))));
        let wf = workflow("panic", vec![step("a", "crashy", &[]), step("b", "fine", &[])]);

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.steps["a"].error.as_deref().unwrap().contains("agent blew up"));
        assert_eq!(result.steps["b"].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn step_timeout_fails_the_step() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(
            ScriptedAgent::new("slow", ContextMap::new()).with_delay(Duration::from_secs(30)),
        );
        let wf = workflow("slow-step", vec![step("a", "slow", &[]).with_timeout_secs(1)]);

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.steps["a"].error.as_deref().unwrap().contains("timed out"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn workflow_deadline_aborts_in_flight_steps() {
        let exec = executor();
        let mut pool = AgentPool::new();
        pool.insert(
            ScriptedAgent::new("slow", ContextMap::new()).with_delay(Duration::from_secs(30)),
        );
        pool.insert(ScriptedAgent::new("next", ContextMap::new()));
        let wf = workflow("deadline", vec![step("a", "slow", &[]), step("b", "next", &["a"])]);
        let wf = Workflow::new(wf.into_definition().with_timeout_secs(1)).unwrap();

        let started = Instant::now();
        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.error.as_deref(), Some(WORKFLOW_TIMED_OUT));
        assert_eq!(result.steps["a"].status, StepStatus::Failed);
        assert_eq!(result.steps["b"].status, StepStatus::Skipped);
        let slow = exec.store().agent_state("deadline", "slow").unwrap();
        assert_eq!(slow.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn abort_on_cancel_skips_in_flight_steps() {
        let config = EngineConfig {
            abort_in_flight_on_cancel: true,
            ..EngineConfig::default()
        };
        let exec = executor().with_config(config);
        let started = Arc::new(Notify::new());
        let mut pool = AgentPool::new();
        pool.insert(GateAgent {
            id: "gate".into(),
            started: Arc::clone(&started),
            release: Arc::new(Notify::new()),
        });
        let wf = workflow("abort", vec![step("a", "gate", &[])]);
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            let started = Arc::clone(&started);
            async move {
                started.notified().await;
                cancel.cancel();
            }
        };
        let (result, ()) = tokio::join!(
            exec.execute_with_pool(&wf, pool, ContextMap::new(), cancel.clone()),
            trigger
        );
        let result = result.unwrap();

        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.steps["a"].status, StepStatus::Skipped);
        let gate = exec.store().agent_state("abort", "gate").unwrap();
        assert_eq!(gate.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn pre_cancelled_token_dispatches_nothing() {
        let exec = executor();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pool = AgentPool::new();
        pool.insert(recorder("x", &log, 0));
        let wf = workflow("never", vec![step("a", "x", &[])]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), cancel)
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.steps["a"].status, StepStatus::Skipped);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let exec = executor();
        let mut rx = exec.event_bus().subscribe();
        let wf = workflow("events", vec![step("a", "x", &[]), step("b", "x", &["a"])]);

        let result = exec.execute(&wf, ContextMap::new()).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), result.run_id);
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(WorkflowEvent::RunStarted { total_steps: 2, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::RunFinished {
                status: WorkflowStatus::Completed,
                ..
            })
        ));
        let completed = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::StepCompleted { .. }))
            .count();
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn active_workflow_cannot_be_started_twice() {
        let exec = Arc::new(executor());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut pool = AgentPool::new();
        pool.insert(GateAgent {
            id: "gate".into(),
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let wf = workflow("once", vec![step("a", "gate", &[])]);

        let first = {
            let exec = Arc::clone(&exec);
            let wf = wf.clone();
            tokio::spawn(async move {
                exec.execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
                    .await
            })
        };
        started.notified().await;

        let err = exec.execute(&wf, ContextMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::State(StateError::DuplicateWorkflow(_))));
        // the rejected attempt must not unregister the active run's token
        exec.cancel("once").unwrap();

        release.notify_one();
        let result = first.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);

        // a finished workflow may be run again
        let rerun = exec.execute(&wf, ContextMap::new()).await.unwrap();
        assert_eq!(rerun.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn initial_input_reaches_agents_and_result() {
        let exec = executor();
        let wf = workflow("seeded", vec![step("a", "x", &[])]);
        let result = exec
            .execute(&wf, output("topic", json!("rust")))
            .await
            .unwrap();
        assert_eq!(result.context["topic"], json!("rust"));
        let state = exec.store().workflow_state("seeded").unwrap();
        assert_eq!(state.result.unwrap()["topic"], json!("rust"));
    }

    /// Forces step `target` into Running behind the engine's back, so the
    /// engine's own dispatch of it is rejected by the store.
    struct MeddlingAgent {
        store: Arc<WorkflowStateManager>,
        workflow_id: String,
        target: String,
    }

    impl Agent for MeddlingAgent {
        fn id(&self) -> &str {
            "meddler"
        }

        async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
            self.store
                .update_step_status(&self.workflow_id, &self.target, StepStatus::Running)
                .map_err(|e| AgentError::failed("meddler", e.to_string()))?;
            Ok(ContextMap::new())
        }
    }

    #[tokio::test]
    async fn engine_error_leaves_run_failed_and_terminal() {
        let store = Arc::new(WorkflowStateManager::new());
        let exec = DagExecutor::new(Arc::clone(&store), EventBus::new(64));
        let mut rx = exec.event_bus().subscribe();
        let mut pool = AgentPool::new();
        pool.insert(MeddlingAgent {
            store: Arc::clone(&store),
            workflow_id: "broken".into(),
            target: "b".into(),
        });
        let wf = workflow(
            "broken",
            vec![step("a", "meddler", &[]), step("b", "x", &["a"]), step("c", "x", &["b"])],
        );

        let err = exec
            .execute_with_pool(&wf, pool, ContextMap::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ExecutorError::State(StateError::InvalidTransition { .. })),
            "got: {err}"
        );

        let snapshot = store.snapshot("broken").unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Failed);
        assert!(snapshot.workflow.error.as_deref().unwrap().contains("invalid step transition"));
        assert_eq!(snapshot.steps["a"].status, StepStatus::Completed);
        assert_eq!(snapshot.steps["b"].status, StepStatus::Skipped);
        assert_eq!(snapshot.steps["c"].status, StepStatus::Skipped);
        assert!(snapshot.steps.values().all(|s| s.is_terminal()));
        assert_history_chains(&snapshot.workflow.history);

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(WorkflowEvent::RunFinished {
                status: WorkflowStatus::Failed,
                ..
            })
        ));
        assert!(matches!(exec.cancel("broken"), Err(ExecutorError::RunNotFound(_))));
    }

    #[test]
    fn executor_error_display() {
        let err = ExecutorError::Deadlock {
            workflow_id: "wf".into(),
            pending: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "workflow 'wf' deadlocked with unfinished steps: a, b"
        );
        assert_eq!(
            ExecutorError::RunNotFound("wf".into()).to_string(),
            "no active run for workflow 'wf'"
        );
    }
}
