//! Narrow capability traits the engine depends on, plus blanket
//! implementations over [`ao_store::Store`] so any store-backed caller
//! gets them for free.

use async_trait::async_trait;

use ao_domain::error::Result;
use ao_domain::model::{AgentExecutionId, SessionId, StepId, TaskId, WorkflowStep};
use ao_store::Store;

/// `reset_agent_context`'s sole dependency on the agent-manager
/// collaborator — the full `AgentManager` interface is out of scope
/// here, the engine only ever calls this one method.
#[async_trait]
pub trait AgentManagerClient: Send + Sync {
    async fn restart_agent_process(&self, agent_execution_id: &AgentExecutionId) -> Result<()>;
}

/// Step lookups `move_to_next` needs, without depending on the whole
/// `Store`.
#[async_trait]
pub trait WorkflowStepGetter: Send + Sync {
    async fn get_step(&self, id: &StepId) -> Result<Option<WorkflowStep>>;
    async fn next_step(&self, current: &StepId) -> Result<Option<WorkflowStep>>;
}

/// The subset of `TransitionStore.ApplyTransition` the engine needs,
/// plus the at-most-once operation guard.
#[async_trait]
pub trait TransitionStore: Send + Sync {
    async fn apply_transition(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        from_step_id: Option<&StepId>,
        to_step_id: &StepId,
        trigger: &str,
    ) -> Result<()>;

    async fn is_operation_applied(&self, operation_id: &str) -> Result<bool>;
    async fn mark_operation_applied(&self, operation_id: &str) -> Result<()>;
}

/// `auto_start_agent` on a `RUNNING` session enqueues rather than
/// prompts directly — the queue's drain path hands the prompt off once
/// the agent reports ready.
pub trait PromptEnqueuer: Send + Sync {
    fn enqueue_prompt(&self, session_id: &SessionId, task_id: &TaskId, content: String) -> Result<()>;
}

/// `auto_start_agent` on a non-running session issues the prompt
/// immediately via the same path `PromptTask` uses.
#[async_trait]
pub trait PromptIssuer: Send + Sync {
    async fn issue_prompt(&self, task_id: &TaskId, session_id: &SessionId, content: String) -> Result<()>;
}

#[async_trait]
impl<T: Store + ?Sized> WorkflowStepGetter for T {
    async fn get_step(&self, id: &StepId) -> Result<Option<WorkflowStep>> {
        self.get_workflow_step(id).await
    }

    async fn next_step(&self, current: &StepId) -> Result<Option<WorkflowStep>> {
        Store::next_step(self, current).await
    }
}

#[async_trait]
impl<T: Store + ?Sized> TransitionStore for T {
    async fn apply_transition(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        from_step_id: Option<&StepId>,
        to_step_id: &StepId,
        trigger: &str,
    ) -> Result<()> {
        tracing::info!(
            %task_id,
            %session_id,
            from = ?from_step_id,
            to = %to_step_id,
            trigger,
            "applying workflow step transition"
        );
        Store::apply_transition(self, task_id, session_id, to_step_id).await
    }

    async fn is_operation_applied(&self, operation_id: &str) -> Result<bool> {
        Store::is_operation_applied(self, operation_id).await
    }

    async fn mark_operation_applied(&self, operation_id: &str) -> Result<()> {
        Store::mark_operation_applied(self, operation_id).await
    }
}

/// Bundles every collaborator the engine needs for one evaluation. The
/// caller (the Service, in practice) assembles this from its own
/// concrete components; the engine only ever sees these trait objects.
pub struct Collaborators<'a> {
    pub transitions: &'a dyn TransitionStore,
    pub steps: &'a dyn WorkflowStepGetter,
    pub agent_manager: &'a dyn AgentManagerClient,
    pub enqueuer: &'a dyn PromptEnqueuer,
    pub issuer: &'a dyn PromptIssuer,
}
