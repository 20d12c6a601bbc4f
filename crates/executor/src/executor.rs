//! Materializes session intents into agent-manager operations and keeps
//! the session row consistent with the agent subprocess's life.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use ao_domain::detach::Ctx;
use ao_domain::error::{Error, Result};
use ao_domain::model::{
    AgentExecutionId, AgentProfileId, ExecutorId, ExecutorRunning, RepositoryId, Session,
    SessionId, SessionState, StepId, Task, TaskId,
};
use ao_sessions::update_session_state;
use ao_store::Store;

use crate::agent_manager::{AgentManager, LaunchAgentRequest, PromptResult};
use crate::collaborators::{ExecutorKind, RepositoryResolver, WorktreeManager};
use crate::scheduler::{ExecutionParams, TaskExecutor};
use crate::worktree_lock::WorktreeLockRegistry;

/// What `LaunchPreparedSession`/`ExecuteWithProfile`/`ResumeSession`
/// return: the caller-visible handle on the (possibly still-starting)
/// agent process.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub session_id: SessionId,
    pub agent_execution_id: Option<AgentExecutionId>,
    pub container_id: Option<String>,
    pub status: String,
}

pub struct Executor {
    store: Arc<dyn Store>,
    agent_manager: Arc<dyn AgentManager>,
    worktrees: Arc<dyn WorktreeManager>,
    repos: Arc<dyn RepositoryResolver>,
    /// Which collaborator path an executor-id routes through. A real
    /// deployment would resolve this from an executor-config table;
    /// worktree mechanics themselves are out of scope here, so a small
    /// explicit registry stands in for it.
    executor_kinds: HashMap<ExecutorId, ExecutorKind>,
    worktree_locks: Arc<WorktreeLockRegistry>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn Store>,
        agent_manager: Arc<dyn AgentManager>,
        worktrees: Arc<dyn WorktreeManager>,
        repos: Arc<dyn RepositoryResolver>,
        executor_kinds: HashMap<ExecutorId, ExecutorKind>,
    ) -> Self {
        Self {
            store,
            agent_manager,
            worktrees,
            repos,
            executor_kinds,
            worktree_locks: Arc::new(WorktreeLockRegistry::new()),
        }
    }

    fn kind_of(&self, executor_id: &ExecutorId) -> ExecutorKind {
        self.executor_kinds
            .get(executor_id)
            .copied()
            .unwrap_or(ExecutorKind::Local)
    }

    /// Creates a `CREATED` session row, resolves the primary repository
    /// and base branch, optionally seeds worktree metadata. Does not
    /// start an agent.
    pub async fn prepare_session(
        &self,
        task: &Task,
        agent_profile_id: AgentProfileId,
        executor_id: ExecutorId,
        workflow_step_id: Option<StepId>,
        repository_id: Option<RepositoryId>,
    ) -> Result<SessionId> {
        let mut session = Session::new(
            SessionId::from(uuid::Uuid::new_v4().to_string()),
            task.id.clone(),
            agent_profile_id,
            executor_id.clone(),
        );
        session.workflow_step_id = workflow_step_id;

        if let Some(repo_id) = repository_id {
            let repo = self.repos.resolve(&repo_id).await?;

            if self.kind_of(&executor_id) == ExecutorKind::RemoteDocker && repo.clone_url.is_none() {
                return Err(Error::RemoteDockerNoRepoURL);
            }

            session.repository_id = Some(repo.id.clone());
            session.base_branch = Some(repo.default_branch.clone());

            if self.kind_of(&executor_id) == ExecutorKind::Worktree {
                // Serializes worktree creation per repository so two
                // sessions prepared concurrently for the same repo
                // don't race the same clone/checkout.
                let _guard = self.worktree_locks.acquire(repo.id.clone()).await;
                let paths = self.worktrees.create(&session, &repo).await?;
                session.worktrees = paths;
            } else if let Some(path) = repo.local_path.clone() {
                session.worktrees = vec![path];
            }
        }

        self.store.create_session(session.clone()).await?;
        Ok(session.id)
    }

    /// Launches (or, if `start_agent = false`, merely workspace-preps)
    /// an existing `CREATED` session. Reuses any existing
    /// `AgentExecutionID` rather than minting a second one.
    pub async fn launch_prepared_session(
        &self,
        ctx: &Ctx,
        session_id: &SessionId,
        model_override: Option<String>,
        start_agent: bool,
    ) -> Result<TaskExecution> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let agent_execution_id = match &session.agent_execution_id {
            Some(existing) => existing.clone(),
            None => {
                let launched = self
                    .agent_manager
                    .launch_agent(LaunchAgentRequest {
                        session_id: session.id.clone(),
                        agent_profile_id: session.agent_profile_id.clone(),
                        model_override,
                        resume_token: None,
                        worktree: session.primary_worktree().map(str::to_string),
                    })
                    .await?;
                session.agent_execution_id = Some(launched.agent_execution_id.clone());
                launched.agent_execution_id
            }
        };

        if !start_agent {
            self.store.update_session(session.clone()).await?;
            return Ok(TaskExecution {
                session_id: session.id,
                agent_execution_id: Some(agent_execution_id),
                container_id: None,
                status: "created".to_string(),
            });
        }

        if let Some(event) = update_session_state(&mut session, SessionState::Starting, None, false) {
            tracing::info!(session_id = %event.session_id, old = ?event.old_state, new = ?event.new_state, "session starting");
        }
        self.store.update_session(session.clone()).await?;

        let detached = ctx.detach();
        let agent_manager = self.agent_manager.clone();
        let exec_id = agent_execution_id.clone();
        tokio::spawn(async move {
            if detached.is_stopped() {
                return;
            }
            if let Err(err) = agent_manager.start_agent_process(&exec_id).await {
                tracing::warn!(%exec_id, error = %err, "failed to start agent process");
            }
        });

        Ok(TaskExecution {
            session_id: session.id,
            agent_execution_id: Some(agent_execution_id),
            container_id: None,
            status: "starting".to_string(),
        })
    }

    /// `PrepareSession` then `LaunchPreparedSession(startAgent=true)`,
    /// atomic to the caller.
    pub async fn execute_with_profile(
        &self,
        ctx: &Ctx,
        task: &Task,
        agent_profile_id: AgentProfileId,
        executor_id: ExecutorId,
        workflow_step_id: Option<StepId>,
        repository_id: Option<RepositoryId>,
    ) -> Result<TaskExecution> {
        let session_id = self
            .prepare_session(task, agent_profile_id, executor_id, workflow_step_id, repository_id)
            .await?;
        self.launch_prepared_session(ctx, &session_id, None, true).await
    }

    /// Resumes a crashed/restarted session. Precondition: the session's
    /// `ExecutorRunning` row is resumable and every worktree path still
    /// exists on disk — a missing path is recreated from stored metadata
    /// before giving up.
    pub async fn resume_session(&self, ctx: &Ctx, session_id: &SessionId, allow_wake_from_waiting: bool) -> Result<TaskExecution> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let running = self
            .store
            .get_executor_running(session_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(session_id.to_string()))?;

        if !running.can_resume() {
            return Err(Error::Validation(format!(
                "session {session_id} is not resumable (no token or resumable=false)"
            )));
        }

        for path in &session.worktrees {
            if !self.worktrees.exists(path).await {
                self.worktrees.recreate(&session).await?;
                break;
            }
        }

        let launched = self
            .agent_manager
            .launch_agent(LaunchAgentRequest {
                session_id: session.id.clone(),
                agent_profile_id: session.agent_profile_id.clone(),
                model_override: None,
                resume_token: running.resume_token.clone(),
                worktree: session.primary_worktree().map(str::to_string),
            })
            .await?;

        session.agent_execution_id = Some(launched.agent_execution_id.clone());
        // Prior state is preserved, not reset — except the one
        // caller-asserted wake from WAITING_FOR_INPUT.
        if session.state == SessionState::WaitingForInput && allow_wake_from_waiting {
            update_session_state(&mut session, SessionState::Running, None, true);
        }
        self.store.update_session(session.clone()).await?;

        let detached = ctx.detach();
        let agent_manager = self.agent_manager.clone();
        let exec_id = launched.agent_execution_id.clone();
        tokio::spawn(async move {
            if detached.is_stopped() {
                return;
            }
            let _ = agent_manager.start_agent_process(&exec_id).await;
        });

        Ok(TaskExecution {
            session_id: session.id,
            agent_execution_id: Some(launched.agent_execution_id),
            container_id: launched.container_id,
            status: launched.status,
        })
    }

    /// Stops the current subprocess, launches a new one with a model
    /// override, best-effort pre-seeds it with the prior resume token,
    /// and sends the prompt.
    pub async fn switch_model(
        &self,
        ctx: &Ctx,
        session_id: &SessionId,
        new_model: String,
        prompt: String,
    ) -> Result<PromptResult> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if let Some(exec_id) = &session.agent_execution_id {
            let _ = self.agent_manager.stop_agent(exec_id, false).await;
        }

        let resume_token = self
            .store
            .get_executor_running(session_id)
            .await?
            .and_then(|r| r.resume_token);

        let launched = self
            .agent_manager
            .launch_agent(LaunchAgentRequest {
                session_id: session.id.clone(),
                agent_profile_id: session.agent_profile_id.clone(),
                model_override: Some(new_model.clone()),
                resume_token,
                worktree: session.primary_worktree().map(str::to_string),
            })
            .await?;

        session.agent_execution_id = Some(launched.agent_execution_id.clone());
        session.metadata.0.insert("model".to_string(), serde_json::json!(new_model));
        self.store.update_session(session.clone()).await?;

        let detached = ctx.detach();
        self.prompt_execution(&detached, &launched.agent_execution_id, prompt, Vec::new())
            .await
    }

    /// Blocks until the agent reports turn completion.
    pub async fn prompt(&self, ctx: &Ctx, task_id: &TaskId, session_id: &SessionId, prompt: String, attachments: Vec<String>) -> Result<PromptResult> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if &session.task_id != task_id {
            return Err(Error::Validation("session does not belong to task".to_string()));
        }
        let exec_id = session
            .agent_execution_id
            .clone()
            .ok_or_else(|| Error::ExecutionNotFound(session_id.to_string()))?;

        let detached = ctx.detach();
        self.prompt_execution(&detached, &exec_id, prompt, attachments).await
    }

    async fn prompt_execution(
        &self,
        ctx: &Ctx,
        exec_id: &AgentExecutionId,
        prompt: String,
        attachments: Vec<String>,
    ) -> Result<PromptResult> {
        if ctx.is_stopped() {
            return Err(Error::Other("prompt context was stopped before it started".to_string()));
        }
        self.agent_manager.prompt_agent(exec_id, &prompt, &attachments).await
    }

    /// Sends a stop to the agent manager and transitions the session to
    /// `CANCELLED` unconditionally — cleanup continues even if the
    /// agent-manager call reports "not found".
    pub async fn stop(&self, session_id: &SessionId, reason: &str, force: bool) -> Result<()> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if let Some(exec_id) = &session.agent_execution_id {
            if let Err(err) = self.agent_manager.stop_agent_with_reason(exec_id, reason, force).await {
                tracing::info!(%session_id, error = %err, "stop_agent reported an error; continuing cleanup");
            }
        }

        update_session_state(&mut session, SessionState::Cancelled, Some(reason.to_string()), true);
        self.store.update_session(session).await?;
        Ok(())
    }

    /// Stops every non-terminal session for a task. Returns the last
    /// error only if every stop failed.
    pub async fn stop_by_task_id(&self, task_id: &TaskId, reason: &str, force: bool) -> Result<()> {
        let sessions = self.store.sessions_for_task(task_id).await?;
        let non_terminal: Vec<_> = sessions.into_iter().filter(|s| !s.state.is_terminal()).collect();

        let mut last_err = None;
        let mut any_ok = false;
        for session in &non_terminal {
            match self.stop(&session.id, reason, force).await {
                Ok(()) => any_ok = true,
                Err(err) => last_err = Some(err),
            }
        }

        if any_ok {
            Ok(())
        } else if let Some(err) = last_err {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Recreates the session's worktree set without touching the agent
    /// subprocess or session state — used by the `restore_workspace`
    /// launch intent, which only needs the filesystem back, not a
    /// running agent.
    pub async fn restore_workspace(&self, session_id: &SessionId) -> Result<Vec<String>> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if session.worktrees.is_empty() {
            return Ok(Vec::new());
        }
        self.worktrees.recreate(&session).await
    }

    /// Upserts the `ExecutorRunning` row once the agent reports its own
    /// session identifier. Called by the stream multiplexer, not a
    /// direct spec operation, but the sole writer of this table.
    pub async fn record_executor_running(
        &self,
        session: &Session,
        resume_token: Option<String>,
        resumable: bool,
    ) -> Result<()> {
        let Some(exec_id) = session.agent_execution_id.clone() else {
            return Ok(());
        };
        self.store
            .upsert_executor_running(ExecutorRunning {
                session_id: session.id.clone(),
                task_id: session.task_id.clone(),
                executor_id: session.executor_id.clone(),
                status: "running".to_string(),
                resumable,
                resume_token,
                agent_execution_id: exec_id,
                container_id: None,
                worktrees: session.worktrees.clone(),
                updated_at: chrono::Utc::now(),
            })
            .await
    }
}

#[async_trait]
impl TaskExecutor for Executor {
    /// The Scheduler's generic entry point: launches the task's session
    /// per its embedded execution parameters.
    async fn execute(&self, task: Task, params: ExecutionParams) -> Result<()> {
        let ctx = Ctx::new();
        let session_id = self
            .prepare_session(
                &task,
                params.agent_profile_id,
                params.executor_id,
                params.workflow_step_id,
                None,
            )
            .await?;
        self.launch_prepared_session(&ctx, &session_id, None, true).await?;
        Ok(())
    }
}
