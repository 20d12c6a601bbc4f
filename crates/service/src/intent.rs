//! `LaunchSession`'s implicit routing table: one request shape, five
//! mutually-exclusive intents, resolved by which fields the caller
//! filled in rather than an explicit discriminant.

use ao_domain::model::{AgentProfileId, ExecutorId, RepositoryId, SessionId, StepId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchIntent {
    /// `session_id` and `workflow_step_id` both present: move an
    /// existing session onto a workflow step.
    WorkflowStep,
    /// `session_id` present, no prompt/profile override: reconnect to a
    /// crashed or restarted agent process.
    Resume,
    /// `session_id` present but neither of the above: start the agent
    /// on a session that was already prepared.
    StartCreated,
    /// No `session_id`, no prompt, `launch_workspace` set: seed a
    /// worktree without starting an agent.
    Prepare,
    /// No `session_id`, anything else: the common case, prepare and
    /// start a session from scratch.
    Start,
}

#[derive(Debug, Clone)]
pub struct LaunchSessionRequest {
    pub task_id: TaskId,
    pub session_id: Option<SessionId>,
    pub workflow_step_id: Option<StepId>,
    pub prompt: Option<String>,
    pub agent_profile_id: Option<AgentProfileId>,
    pub executor_id: Option<ExecutorId>,
    pub repository_id: Option<RepositoryId>,
    pub model_override: Option<String>,
    /// `Prepare`-only signal: seed a worktree without starting an agent.
    pub launch_workspace: bool,
    /// Passed through to `Executor::resume_session`; ignored by every
    /// other intent.
    pub allow_wake_from_waiting: bool,
}

impl LaunchSessionRequest {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            session_id: None,
            workflow_step_id: None,
            prompt: None,
            agent_profile_id: None,
            executor_id: None,
            repository_id: None,
            model_override: None,
            launch_workspace: false,
            allow_wake_from_waiting: false,
        }
    }

    fn prompt_is_empty(&self) -> bool {
        self.prompt.as_deref().map(str::is_empty).unwrap_or(true)
    }

    pub fn intent(&self) -> LaunchIntent {
        if self.session_id.is_some() && self.workflow_step_id.is_some() {
            return LaunchIntent::WorkflowStep;
        }
        if self.session_id.is_some() && self.prompt_is_empty() && self.agent_profile_id.is_none() {
            return LaunchIntent::Resume;
        }
        if self.session_id.is_some() {
            return LaunchIntent::StartCreated;
        }
        if self.launch_workspace && self.prompt_is_empty() {
            return LaunchIntent::Prepare;
        }
        LaunchIntent::Start
    }
}

/// Uniform response shape across every intent, mirroring
/// `ao_executor::executor::TaskExecution` plus the intent that produced
/// it.
#[derive(Debug, Clone)]
pub struct LaunchSessionResponse {
    pub intent: LaunchIntent,
    pub session_id: SessionId,
    pub agent_execution_id: Option<ao_domain::model::AgentExecutionId>,
    pub container_id: Option<String>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LaunchSessionRequest {
        LaunchSessionRequest::new(TaskId::from("t1"))
    }

    #[test]
    fn session_and_step_present_resolves_to_workflow_step() {
        let mut req = base();
        req.session_id = Some(SessionId::from("s1"));
        req.workflow_step_id = Some(StepId::from("step1"));
        assert_eq!(req.intent(), LaunchIntent::WorkflowStep);
    }

    #[test]
    fn bare_session_id_resolves_to_resume() {
        let mut req = base();
        req.session_id = Some(SessionId::from("s1"));
        assert_eq!(req.intent(), LaunchIntent::Resume);
    }

    #[test]
    fn session_id_with_a_prompt_resolves_to_start_created() {
        let mut req = base();
        req.session_id = Some(SessionId::from("s1"));
        req.prompt = Some("go".to_string());
        assert_eq!(req.intent(), LaunchIntent::StartCreated);
    }

    #[test]
    fn session_id_with_a_profile_override_resolves_to_start_created() {
        let mut req = base();
        req.session_id = Some(SessionId::from("s1"));
        req.agent_profile_id = Some(AgentProfileId::from("p1"));
        assert_eq!(req.intent(), LaunchIntent::StartCreated);
    }

    #[test]
    fn no_session_with_launch_workspace_and_no_prompt_resolves_to_prepare() {
        let mut req = base();
        req.launch_workspace = true;
        assert_eq!(req.intent(), LaunchIntent::Prepare);
    }

    #[test]
    fn no_session_and_no_launch_workspace_resolves_to_start() {
        let req = base();
        assert_eq!(req.intent(), LaunchIntent::Start);
    }

    #[test]
    fn launch_workspace_with_a_prompt_still_resolves_to_start() {
        let mut req = base();
        req.launch_workspace = true;
        req.prompt = Some("go".to_string());
        assert_eq!(req.intent(), LaunchIntent::Start);
    }
}
