//! Wires the queue, scheduler, executor, workflow engine, and dispatcher
//! into the single object callers (a gateway handler, the demo CLI)
//! actually talk to.
//!
//! Field grouping: core services first, then the narrower collaborators
//! layered on top.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use ao_domain::detach::Ctx;
use ao_domain::error::{Error, Result};
use ao_domain::model::{
    AgentExecutionId, AgentProfileId, ExecutorId, Message, MessageType, QueuedMessage, Session,
    SessionId, SessionState, StepId, Task, TaskId, TaskState, WorkflowStep,
};
use ao_dispatch::{AgentReady, Bus, EventDispatcher, StreamEvent, StreamEventData, StreamMultiplexer};
use ao_executor::agent_manager::{AgentManager, PromptResult};
use ao_executor::classify::{classify_prompt_error, FailureClass};
use ao_executor::collaborators::{ExecutorKind, RepositoryResolver, WorktreeManager};
use ao_executor::executor::{Executor, TaskExecution};
use ao_executor::scheduler::{ExecutionParams, Scheduler, TaskExecutor, TaskSource};
use ao_queue::PriorityQueue;
use ao_sessions::{update_session_state, SessionMessageQueue, TurnManager};
use ao_store::Store;
use ao_workflow::{AgentManagerClient, Collaborators, Engine, PromptEnqueuer, PromptIssuer, TransitionStore, WorkflowStepGetter};

use crate::intent::{LaunchIntent, LaunchSessionRequest, LaunchSessionResponse};

/// Feeds the scheduler tasks straight from the store, the same pattern
/// the executor test module's `StoreTaskSource` uses.
struct StoreTaskSource(Arc<dyn Store>);

#[async_trait]
impl TaskSource for StoreTaskSource {
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.0.get_task(id).await
    }
}

/// A `&dyn Store` can't be reborrowed as `&dyn TransitionStore`/`&dyn
/// WorkflowStepGetter` directly — trait objects don't remember enough
/// to support that coercion even with the blanket impl in scope — so
/// this thin local wrapper forwards by hand instead.
struct StoreCollab<'a>(&'a dyn Store);

#[async_trait]
impl TransitionStore for StoreCollab<'_> {
    async fn apply_transition(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        from_step_id: Option<&StepId>,
        to_step_id: &StepId,
        trigger: &str,
    ) -> Result<()> {
        tracing::info!(%task_id, %session_id, from = ?from_step_id, to = %to_step_id, trigger, "applying workflow step transition");
        self.0.apply_transition(task_id, session_id, to_step_id).await
    }

    async fn is_operation_applied(&self, operation_id: &str) -> Result<bool> {
        self.0.is_operation_applied(operation_id).await
    }

    async fn mark_operation_applied(&self, operation_id: &str) -> Result<()> {
        self.0.mark_operation_applied(operation_id).await
    }
}

#[async_trait]
impl WorkflowStepGetter for StoreCollab<'_> {
    async fn get_step(&self, id: &StepId) -> Result<Option<WorkflowStep>> {
        self.0.get_workflow_step(id).await
    }

    async fn next_step(&self, current: &StepId) -> Result<Option<WorkflowStep>> {
        Store::next_step(self.0, current).await
    }
}

/// Result of a startup reconciliation pass over every `ExecutorRunning`
/// row.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub rows_examined: usize,
    pub rows_deleted: usize,
    pub rows_retained: usize,
    pub sessions_marked_waiting: usize,
    pub tasks_moved_to_review: usize,
}

pub struct Service {
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,

    queue: Arc<PriorityQueue>,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor>,
    agent_manager: Arc<dyn AgentManager>,

    dispatcher: EventDispatcher,
    message_queue: Arc<SessionMessageQueue>,
    turns: Arc<TurnManager>,
    stream: StreamMultiplexer,
    workflow_engine: Engine,

    /// Open Question 1: a session mid-reset rejects a second concurrent
    /// reset with `Error::SessionResetInProgress` rather than queueing
    /// or silently ignoring it.
    resets_in_progress: Mutex<std::collections::HashSet<SessionId>>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        agent_manager: Arc<dyn AgentManager>,
        worktrees: Arc<dyn WorktreeManager>,
        repos: Arc<dyn RepositoryResolver>,
        executor_kinds: HashMap<ExecutorId, ExecutorKind>,
        max_concurrent: usize,
        queue_max_size: usize,
        retry: ao_domain::config::RetryConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(PriorityQueue::new(queue_max_size));
        let executor = Arc::new(Executor::new(
            store.clone(),
            agent_manager.clone(),
            worktrees,
            repos,
            executor_kinds,
        ));
        let turns = Arc::new(TurnManager::new());

        Arc::new_cyclic(|weak: &Weak<Service>| {
            let task_source: Arc<dyn TaskSource> = Arc::new(StoreTaskSource(store.clone()));
            let executor_as_trait: Arc<dyn TaskExecutor> = executor.clone();
            let scheduler = Arc::new(Scheduler::new(
                queue.clone(),
                executor_as_trait,
                task_source,
                max_concurrent,
                retry,
            ));

            let ready_weak = weak.clone();
            let stream_weak = weak.clone();
            let dispatcher = EventDispatcher::new()
                .with_on_agent_ready(move |payload: AgentReady, _ctx| {
                    let weak = ready_weak.clone();
                    Box::pin(async move {
                        if let Some(service) = weak.upgrade() {
                            service.drain_queue_for_session(&payload.session_id).await;
                        }
                    })
                })
                .with_on_agent_stream_event(move |payload, _ctx| {
                    let weak = stream_weak.clone();
                    Box::pin(async move {
                        let Some(service) = weak.upgrade() else {
                            return;
                        };
                        match serde_json::from_value::<StreamEventData>(payload.data.clone()) {
                            Ok(data) => {
                                let is_complete = matches!(data, StreamEventData::Complete { .. });
                                let session_id = payload.session_id.clone();
                                let event = StreamEvent {
                                    task_id: payload.task_id,
                                    session_id: payload.session_id,
                                    agent_id: payload.agent_id,
                                    data,
                                };
                                if let Err(err) = service.stream.handle(event).await {
                                    tracing::warn!(error = %err, "stream event handling failed");
                                }
                                // The turn is only truly closed once `stream.handle`
                                // returns, so `on_turn_complete` runs after it, not
                                // as part of the multiplexer's own dispatch.
                                if is_complete {
                                    if let Err(err) = service.handle_turn_complete(&session_id).await {
                                        tracing::warn!(%session_id, error = %err, "on_turn_complete workflow evaluation failed");
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to decode agent stream event payload")
                            }
                        }
                    })
                });

            Service {
                stream: StreamMultiplexer::new(store.clone(), bus.clone(), turns.clone()),
                store,
                bus,
                queue,
                scheduler,
                executor,
                agent_manager,
                dispatcher,
                message_queue: Arc::new(SessionMessageQueue::new()),
                turns,
                workflow_engine: Engine::new(),
                resets_in_progress: Mutex::new(std::collections::HashSet::new()),
            }
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn message_queue(&self) -> &Arc<SessionMessageQueue> {
        &self.message_queue
    }

    /// Enqueues a task for the scheduler. `priority`/`queued_at` feed
    /// the priority queue's ordering law directly.
    pub fn enqueue_task(
        &self,
        task_id: TaskId,
        priority: i64,
        queued_at: u64,
        params: ExecutionParams,
    ) -> std::result::Result<(), ao_queue::QueueError> {
        self.scheduler.enqueue(task_id, priority, queued_at, params)
    }

    // ------------------------------------------------------------ LaunchSession

    pub async fn launch_session(&self, ctx: &Ctx, req: LaunchSessionRequest) -> Result<LaunchSessionResponse> {
        match req.intent() {
            LaunchIntent::WorkflowStep => self.launch_workflow_step(&req).await,
            LaunchIntent::Resume => self.launch_resume(ctx, &req).await,
            LaunchIntent::StartCreated => self.launch_start_created(ctx, &req).await,
            LaunchIntent::Prepare => self.launch_prepare(ctx, &req).await,
            LaunchIntent::Start => self.launch_start(ctx, &req).await,
        }
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))
    }

    fn require_profile(req: &LaunchSessionRequest) -> Result<AgentProfileId> {
        req.agent_profile_id
            .clone()
            .ok_or_else(|| Error::Validation("agent_profile_id is required".to_string()))
    }

    fn require_executor(req: &LaunchSessionRequest) -> Result<ExecutorId> {
        req.executor_id
            .clone()
            .ok_or_else(|| Error::Validation("executor_id is required".to_string()))
    }

    fn require_session_id(req: &LaunchSessionRequest) -> Result<SessionId> {
        req.session_id
            .clone()
            .ok_or_else(|| Error::Validation("session_id is required".to_string()))
    }

    fn to_response(intent: LaunchIntent, execution: TaskExecution) -> LaunchSessionResponse {
        LaunchSessionResponse {
            intent,
            session_id: execution.session_id,
            agent_execution_id: execution.agent_execution_id,
            container_id: execution.container_id,
            status: execution.status,
        }
    }

    async fn queue_prompt_best_effort(&self, session_id: &SessionId, task_id: &TaskId, prompt: Option<String>) {
        let Some(prompt) = prompt.filter(|p| !p.is_empty()) else {
            return;
        };
        let queued = QueuedMessage::new(session_id.clone(), task_id.clone(), prompt);
        if self.message_queue.queue_message(queued).is_err() {
            tracing::info!(%session_id, "prompt dropped: a message is already queued for this session");
        }
    }

    /// `Prepare`: seed a worktree, never start an agent.
    async fn launch_prepare(&self, ctx: &Ctx, req: &LaunchSessionRequest) -> Result<LaunchSessionResponse> {
        let task = self.get_task(&req.task_id).await?;
        let profile = Self::require_profile(req)?;
        let executor_id = Self::require_executor(req)?;

        let session_id = self
            .executor
            .prepare_session(&task, profile, executor_id, req.workflow_step_id.clone(), req.repository_id.clone())
            .await?;
        let execution = self
            .executor
            .launch_prepared_session(ctx, &session_id, req.model_override.clone(), false)
            .await?;
        Ok(Self::to_response(LaunchIntent::Prepare, execution))
    }

    /// `Start`: `execute_with_profile` end to end, then queue the
    /// initial prompt if one was given.
    async fn launch_start(&self, ctx: &Ctx, req: &LaunchSessionRequest) -> Result<LaunchSessionResponse> {
        let task = self.get_task(&req.task_id).await?;
        let profile = Self::require_profile(req)?;
        let executor_id = Self::require_executor(req)?;

        let execution = self
            .executor
            .execute_with_profile(ctx, &task, profile, executor_id, req.workflow_step_id.clone(), req.repository_id.clone())
            .await?;
        self.queue_prompt_best_effort(&execution.session_id, &task.id, req.prompt.clone()).await;
        Ok(Self::to_response(LaunchIntent::Start, execution))
    }

    /// `StartCreated`: start the agent on a session that `Prepare`
    /// already created.
    async fn launch_start_created(&self, ctx: &Ctx, req: &LaunchSessionRequest) -> Result<LaunchSessionResponse> {
        let session_id = Self::require_session_id(req)?;
        let execution = self
            .executor
            .launch_prepared_session(ctx, &session_id, req.model_override.clone(), true)
            .await?;
        self.queue_prompt_best_effort(&execution.session_id, &req.task_id, req.prompt.clone()).await;
        Ok(Self::to_response(LaunchIntent::StartCreated, execution))
    }

    /// `Resume`: reconnect to a crashed or restarted agent process.
    async fn launch_resume(&self, ctx: &Ctx, req: &LaunchSessionRequest) -> Result<LaunchSessionResponse> {
        let session_id = Self::require_session_id(req)?;
        let execution = self
            .executor
            .resume_session(ctx, &session_id, req.allow_wake_from_waiting)
            .await?;
        Ok(Self::to_response(LaunchIntent::Resume, execution))
    }

    /// `WorkflowStep`: move a session onto a named step, running that
    /// step's `on_exit` (old step) and `on_enter` (new step) action
    /// lists around the transition.
    async fn launch_workflow_step(&self, req: &LaunchSessionRequest) -> Result<LaunchSessionResponse> {
        let session_id = Self::require_session_id(req)?;
        let step_id = req
            .workflow_step_id
            .clone()
            .ok_or_else(|| Error::Validation("workflow_step_id is required".to_string()))?;

        let mut session = self
            .store
            .get_session(&session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let step = self
            .store
            .get_workflow_step(&step_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow step {step_id}")))?;

        if let Some(old_step_id) = session.workflow_step_id.clone() {
            if let Some(old_step) = self.store.get_workflow_step(&old_step_id).await? {
                let collab = self.collaborators();
                self.workflow_engine.evaluate_on_exit(&collab, &mut session, &old_step).await?;
            }
        }

        session.workflow_step_id = Some(step.id.clone());
        session.review_status = None;
        self.store.update_session(session.clone()).await?;

        if let Some(mut task) = self.store.get_task(&req.task_id).await? {
            task.current_step_id = Some(step.id.clone());
            self.store.update_task(task).await?;
        }

        let collab = self.collaborators();
        self.workflow_engine.evaluate_on_enter(&collab, &mut session, &step).await?;
        self.store.update_session(session.clone()).await?;

        Ok(LaunchSessionResponse {
            intent: LaunchIntent::WorkflowStep,
            session_id: session.id,
            agent_execution_id: session.agent_execution_id,
            container_id: None,
            status: "workflow_step".to_string(),
        })
    }

    // ------------------------------------------------------------ Per-turn workflow hooks

    /// Runs the current step's `on_turn_start` actions. Called right
    /// before a prompt is issued — the per-turn lifecycle hook that lets
    /// a step inject state (plan mode, workflow data) as a new turn
    /// begins.
    async fn handle_turn_start(&self, session_id: &SessionId) -> Result<()> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(());
        };
        let Some(step_id) = session.workflow_step_id.clone() else {
            return Ok(());
        };
        let Some(step) = self.store.get_workflow_step(&step_id).await? else {
            return Ok(());
        };
        let collab = self.collaborators();
        let outcome = self
            .workflow_engine
            .evaluate_on_turn_start(&collab, &mut session, &step)
            .await?;
        self.store.update_session(session.clone()).await?;
        if outcome.transitioned {
            self.chain_step_transition(&mut session, &step).await?;
        }
        Ok(())
    }

    /// Runs the current step's `on_turn_complete` actions once the
    /// stream multiplexer closes a turn, then chains `on_exit`/`on_enter`
    /// around any transition those actions triggered.
    async fn handle_turn_complete(&self, session_id: &SessionId) -> Result<()> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(());
        };
        let Some(step_id) = session.workflow_step_id.clone() else {
            return Ok(());
        };
        let Some(step) = self.store.get_workflow_step(&step_id).await? else {
            return Ok(());
        };
        let collab = self.collaborators();
        let outcome = self
            .workflow_engine
            .evaluate_on_turn_complete(&collab, &mut session, &step)
            .await?;
        self.store.update_session(session.clone()).await?;
        if outcome.transitioned {
            self.chain_step_transition(&mut session, &step).await?;
        }
        Ok(())
    }

    /// After a transition applied by `on_turn_start`/`on_turn_complete`:
    /// updates the task's `current_step_id`, runs the old step's
    /// `on_exit`, then the new step's `on_enter` — mirroring
    /// `launch_workflow_step`'s explicit-move sequencing.
    async fn chain_step_transition(&self, session: &mut Session, old_step: &WorkflowStep) -> Result<()> {
        if let Some(mut task) = self.store.get_task(&session.task_id).await? {
            task.current_step_id = session.workflow_step_id.clone();
            self.store.update_task(task).await?;
        }

        let collab = self.collaborators();
        self.workflow_engine.evaluate_on_exit(&collab, session, old_step).await?;
        self.store.update_session(session.clone()).await?;

        if let Some(new_step_id) = session.workflow_step_id.clone() {
            if let Some(new_step) = self.store.get_workflow_step(&new_step_id).await? {
                let collab = self.collaborators();
                self.workflow_engine.evaluate_on_enter(&collab, session, &new_step).await?;
                self.store.update_session(session.clone()).await?;
            }
        }
        Ok(())
    }

    /// Not one of the five auto-resolved intents: a direct call a
    /// caller makes when only the filesystem needs to come back, not a
    /// running agent.
    pub async fn restore_workspace(&self, session_id: &SessionId) -> Result<Vec<String>> {
        self.executor.restore_workspace(session_id).await
    }

    // ------------------------------------------------------------ Pass-throughs

    /// Thin forward to `Executor::stop` — the distilled spec never gave
    /// a Service-level caller for this Executor operation.
    pub async fn stop_session(&self, session_id: &SessionId, reason: &str, force: bool) -> Result<()> {
        self.executor.stop(session_id, reason, force).await
    }

    pub async fn stop_task(&self, task_id: &TaskId, reason: &str, force: bool) -> Result<()> {
        self.executor.stop_by_task_id(task_id, reason, force).await
    }

    /// Interrupts the current turn without killing the subprocess:
    /// transitions the session to `WAITING_FOR_INPUT` and records a
    /// status message, but never touches the agent manager directly —
    /// that's `stop_session`'s job.
    pub async fn cancel_agent(&self, session_id: &SessionId) -> Result<()> {
        self.agent_manager.cancel_agent(session_id).await?;

        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if let Some(event) = update_session_state(&mut session, SessionState::WaitingForInput, None, true) {
            self.store.update_session(session.clone()).await?;
            self.publish_state_change(event).await;
        }

        self.turns.close_active(self.store.as_ref(), session_id).await?;
        let turn = self.turns.current_or_open(self.store.as_ref(), session_id.clone()).await?;
        let mut status = Message::new(session_id.clone(), turn.id, MessageType::Status);
        status.append("Turn cancelled by user");
        self.store.append_message(status).await?;
        Ok(())
    }

    pub async fn switch_model(&self, ctx: &Ctx, session_id: &SessionId, new_model: String, prompt: String) -> Result<PromptResult> {
        self.executor.switch_model(ctx, session_id, new_model, prompt).await
    }

    // ------------------------------------------------------------ PromptTask

    /// Sends a prompt to a running agent, classifying and recovering
    /// from the failure if any. Runs the session's current step's
    /// `on_turn_start` actions first — the "new user prompt" trigger
    /// point.
    pub async fn prompt_task(&self, ctx: &Ctx, task_id: &TaskId, session_id: &SessionId, prompt: String, attachments: Vec<String>) -> Result<PromptResult> {
        if let Err(err) = self.handle_turn_start(session_id).await {
            tracing::warn!(%session_id, error = %err, "on_turn_start workflow evaluation failed");
        }
        self.prompt_task_inner(ctx, task_id, session_id, prompt, attachments, false).await
    }

    async fn prompt_task_inner(
        &self,
        ctx: &Ctx,
        task_id: &TaskId,
        session_id: &SessionId,
        prompt: String,
        attachments: Vec<String>,
        drained_from_queue: bool,
    ) -> Result<PromptResult> {
        match self.executor.prompt(ctx, task_id, session_id, prompt.clone(), attachments.clone()).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.handle_prompt_error(session_id, &prompt, &attachments, drained_from_queue, &err).await;
                Err(err)
            }
        }
    }

    async fn handle_prompt_error(&self, session_id: &SessionId, prompt: &str, attachments: &[String], requeue_on_transient: bool, err: &Error) {
        match classify_prompt_error(&err.to_string()) {
            FailureClass::Transient => {
                tracing::warn!(%session_id, error = %err, "transient prompt failure");
                if !requeue_on_transient {
                    return;
                }
                let Ok(Some(session)) = self.store.get_session(session_id).await else {
                    return;
                };
                let mut queued = QueuedMessage::new(session_id.clone(), session.task_id, prompt.to_string());
                queued.attachments = attachments.to_vec();
                let _ = self.message_queue.queue_message(queued);
            }
            FailureClass::ResumeFailure => {
                tracing::warn!(%session_id, error = %err, "resume failure, failing session");
                self.fail_session(session_id, &err.to_string()).await;
                let _ = self.store.delete_executor_running(session_id).await;
            }
            FailureClass::Fatal => {
                tracing::warn!(%session_id, error = %err, "fatal prompt failure");
                self.fail_session(session_id, &err.to_string()).await;
            }
        }
    }

    async fn fail_session(&self, session_id: &SessionId, message: &str) {
        let Ok(Some(mut session)) = self.store.get_session(session_id).await else {
            return;
        };
        if let Some(event) = update_session_state(&mut session, SessionState::Failed, Some(message.to_string()), true) {
            if self.store.update_session(session).await.is_ok() {
                self.publish_state_change(event).await;
            }
        }
    }

    /// The queue's drain path: runs once an `OnAgentReady` event fires,
    /// taking (not peeking) the queued message so a transient failure's
    /// own requeue doesn't race a second concurrent drain.
    async fn drain_queue_for_session(&self, session_id: &SessionId) {
        let Some(queued) = self.message_queue.take(session_id) else {
            return;
        };
        if let Err(err) = self.handle_turn_start(session_id).await {
            tracing::warn!(%session_id, error = %err, "on_turn_start workflow evaluation failed");
        }
        let ctx = Ctx::new();
        if let Err(err) = self
            .prompt_task_inner(&ctx, &queued.task_id, session_id, queued.content, queued.attachments, true)
            .await
        {
            tracing::info!(%session_id, error = %err, "drained prompt failed, handled by classify+requeue above");
        }
    }

    async fn publish_state_change(&self, event: ao_sessions::SessionStateChanged) {
        let payload = serde_json::json!({
            "task_id": event.task_id.to_string(),
            "session_id": event.session_id.to_string(),
            "old_state": format!("{:?}", event.old_state),
            "new_state": format!("{:?}", event.new_state),
            "error_message": event.error_message,
            "agent_profile_id": event.agent_profile_id.to_string(),
            "is_passthrough": event.is_passthrough,
            "review_status": event.review_status,
            "workflow_step_id": event.workflow_step_id.as_ref().map(|s| s.to_string()),
        });
        self.bus.publish("task_session.state_changed", payload).await;
    }

    // ------------------------------------------------------------ Reset lock

    /// Open Question 1's resolution: a reset already running for this
    /// session rejects a concurrent second one outright rather than
    /// queueing behind it, mirroring `AgentPromptInProgress`'s
    /// reject-don't-queue precedent elsewhere in the core.
    pub async fn reset_session_context(&self, session_id: &SessionId) -> Result<()> {
        {
            let mut resets = self.resets_in_progress.lock();
            if !resets.insert(session_id.clone()) {
                return Err(Error::SessionResetInProgress(session_id.to_string()));
            }
        }
        let result = self.reset_session_context_inner(session_id).await;
        self.resets_in_progress.lock().remove(session_id);
        result
    }

    async fn reset_session_context_inner(&self, session_id: &SessionId) -> Result<()> {
        let collab = self.collaborators();
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let Some(exec_id) = session.agent_execution_id.clone() else {
            return Ok(());
        };
        match collab.agent_manager.restart_agent_process(&exec_id).await {
            Ok(()) => {
                session.metadata.0.remove("acp_session_id");
                self.store.update_session(session).await?;
            }
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "reset_agent_context failed, leaving session waiting for input");
                update_session_state(&mut session, SessionState::WaitingForInput, None, true);
                self.store.update_session(session).await?;
            }
        }
        Ok(())
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            transitions: self.store.as_ref(),
            steps: self.store.as_ref(),
            agent_manager: self,
            enqueuer: self,
            issuer: self,
        }
    }

    // ------------------------------------------------------------ Startup reconciliation

    /// Scenario S5: for every `ExecutorRunning` row left over from a
    /// prior process's shutdown, bring the session and task state back
    /// into a consistent shape, then decide whether the row itself is
    /// still worth keeping.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for running in self.store.list_executor_running().await? {
            report.rows_examined += 1;

            let Some(mut session) = self.store.get_session(&running.session_id).await? else {
                self.store.delete_executor_running(&running.session_id).await?;
                report.rows_deleted += 1;
                continue;
            };

            if session.state.is_terminal() || session.state == SessionState::Created {
                self.store.delete_executor_running(&running.session_id).await?;
                report.rows_deleted += 1;
                continue;
            }

            if let Some(mut task) = self.store.get_task(&session.task_id).await? {
                if task.state == TaskState::InProgress {
                    task.state = TaskState::Review;
                    task.updated_at = chrono::Utc::now();
                    self.store.update_task(task).await?;
                    report.tasks_moved_to_review += 1;
                }
            }

            if let Some(event) = update_session_state(&mut session, SessionState::WaitingForInput, None, false) {
                self.store.update_session(session.clone()).await?;
                self.publish_state_change(event).await;
                report.sessions_marked_waiting += 1;
            }

            if running.can_resume() {
                report.rows_retained += 1;
            } else {
                self.store.delete_executor_running(&running.session_id).await?;
                report.rows_deleted += 1;
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl AgentManagerClient for Service {
    async fn restart_agent_process(&self, agent_execution_id: &AgentExecutionId) -> Result<()> {
        self.agent_manager.restart_agent_process(agent_execution_id).await
    }
}

impl PromptEnqueuer for Service {
    /// `auto_start_agent` on a `RUNNING` session: hand the prompt to the
    /// queue rather than issuing it directly, same as any other queued
    /// follow-up.
    fn enqueue_prompt(&self, session_id: &SessionId, task_id: &TaskId, content: String) -> Result<()> {
        let queued = QueuedMessage::new(session_id.clone(), task_id.clone(), content);
        self.message_queue
            .queue_message(queued)
            .map_err(|_| Error::AgentPromptInProgress(session_id.to_string()))
    }
}

#[async_trait]
impl PromptIssuer for Service {
    /// `auto_start_agent`'s direct-issue path (session not `RUNNING`).
    /// Deliberately bypasses `prompt_task`'s `on_turn_start` hook and
    /// goes straight to `prompt_task_inner` — this call *is* the result
    /// of evaluating `on_turn_start`/`on_turn_complete` for the
    /// session's current step, so re-running that evaluation here would
    /// recurse into `auto_start_agent` again for the same step.
    async fn issue_prompt(&self, task_id: &TaskId, session_id: &SessionId, content: String) -> Result<()> {
        let ctx = Ctx::new();
        self.prompt_task_inner(&ctx, task_id, session_id, content, Vec::new(), false).await.map(|_| ())
    }
}

