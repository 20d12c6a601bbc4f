//! Compiles and evaluates a workflow step's four action lists.

use ao_domain::error::Result;
use ao_domain::model::{Action, ActionList, Session, SessionState, WorkflowStep};

use crate::action::EvalOutcome;
use crate::collaborators::Collaborators;

#[derive(Default)]
pub struct Engine;

impl Engine {
    pub fn new() -> Self {
        Self
    }

    pub async fn evaluate_on_enter(
        &self,
        collab: &Collaborators<'_>,
        session: &mut Session,
        step: &WorkflowStep,
    ) -> Result<EvalOutcome> {
        self.evaluate(collab, session, step, &step.on_enter, "on_enter")
            .await
    }

    pub async fn evaluate_on_exit(
        &self,
        collab: &Collaborators<'_>,
        session: &mut Session,
        step: &WorkflowStep,
    ) -> Result<EvalOutcome> {
        self.evaluate(collab, session, step, &step.on_exit, "on_exit")
            .await
    }

    pub async fn evaluate_on_turn_start(
        &self,
        collab: &Collaborators<'_>,
        session: &mut Session,
        step: &WorkflowStep,
    ) -> Result<EvalOutcome> {
        self.evaluate(collab, session, step, &step.on_turn_start, "on_turn_start")
            .await
    }

    pub async fn evaluate_on_turn_complete(
        &self,
        collab: &Collaborators<'_>,
        session: &mut Session,
        step: &WorkflowStep,
    ) -> Result<EvalOutcome> {
        self.evaluate(
            collab,
            session,
            step,
            &step.on_turn_complete,
            "on_turn_complete",
        )
        .await
    }

    /// Runs every action in `actions` sequentially against `session`,
    /// then applies at most one step transition (the first one any
    /// action requested) through `collab.transitions`.
    async fn evaluate(
        &self,
        collab: &Collaborators<'_>,
        session: &mut Session,
        step: &WorkflowStep,
        actions: &ActionList,
        trigger: &str,
    ) -> Result<EvalOutcome> {
        let mut transition_to = None;

        for action in &actions.0 {
            match action {
                Action::EnablePlanMode => {
                    if !session.is_passthrough {
                        session.metadata.set_plan_mode(true);
                    }
                }
                Action::DisablePlanMode => {
                    if !session.is_passthrough {
                        session.metadata.set_plan_mode(false);
                    }
                }
                Action::ResetAgentContext => {
                    if let Some(exec_id) = session.agent_execution_id.clone() {
                        match collab.agent_manager.restart_agent_process(&exec_id).await {
                            Ok(()) => {
                                session.metadata.0.remove("acp_session_id");
                            }
                            Err(err) => {
                                tracing::warn!(
                                    session_id = %session.id,
                                    error = %err,
                                    "reset_agent_context failed, leaving session waiting for input"
                                );
                                session.state = SessionState::WaitingForInput;
                            }
                        }
                    }
                }
                Action::AutoStartAgent { prompt } => {
                    if session.is_passthrough {
                        continue;
                    }
                    let body = prompt.clone().unwrap_or_default();
                    let rendered = step.render_prompt(&body, &session.task_id);
                    if session.state == SessionState::Running {
                        collab
                            .enqueuer
                            .enqueue_prompt(&session.id, &session.task_id, rendered)?;
                    } else {
                        collab
                            .issuer
                            .issue_prompt(&session.task_id, &session.id, rendered)
                            .await?;
                    }
                }
                Action::MoveToNext => {
                    if transition_to.is_none() {
                        if let Some(next) = collab.steps.next_step(&step.id).await? {
                            transition_to = Some(next.id);
                        }
                        // No next step: a no-op, not an error.
                    }
                }
                Action::MoveToStep {
                    step_id,
                    requires_approval,
                } => {
                    if transition_to.is_none() && !requires_approval {
                        transition_to = Some(step_id.clone());
                    }
                }
                Action::SetWorkflowData { key, value } => {
                    session.metadata.set_workflow_data(key, value.clone());
                }
            }
        }

        let Some(to_step_id) = transition_to else {
            return Ok(EvalOutcome { transitioned: false });
        };

        let operation_id = format!("{}:{}:{}:{}", session.task_id, session.id, step.id, to_step_id);
        if collab.transitions.is_operation_applied(&operation_id).await? {
            return Ok(EvalOutcome { transitioned: false });
        }

        collab
            .transitions
            .apply_transition(&session.task_id, &session.id, Some(&step.id), &to_step_id, trigger)
            .await?;
        collab.transitions.mark_operation_applied(&operation_id).await?;

        session.workflow_step_id = Some(to_step_id);
        session.review_status = None;

        Ok(EvalOutcome { transitioned: true })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ao_domain::model::{
        AgentProfileId, ExecutorId, SessionId, StepId, TaskId, WorkflowId,
    };
    use ao_store::{InMemoryStore, Store};

    use super::*;

    struct NoopAgentManager;

    #[async_trait::async_trait]
    impl crate::collaborators::AgentManagerClient for NoopAgentManager {
        async fn restart_agent_process(
            &self,
            _agent_execution_id: &ao_domain::model::AgentExecutionId,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEnqueuer {
        prompts: Mutex<Vec<String>>,
    }

    impl crate::collaborators::PromptEnqueuer for RecordingEnqueuer {
        fn enqueue_prompt(
            &self,
            _session_id: &SessionId,
            _task_id: &TaskId,
            content: String,
        ) -> Result<()> {
            self.prompts.lock().unwrap().push(content);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingIssuer {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::collaborators::PromptIssuer for RecordingIssuer {
        async fn issue_prompt(
            &self,
            _task_id: &TaskId,
            _session_id: &SessionId,
            content: String,
        ) -> Result<()> {
            self.prompts.lock().unwrap().push(content);
            Ok(())
        }
    }

    fn new_session() -> Session {
        Session::new(
            SessionId::from("s1"),
            TaskId::from("t1"),
            AgentProfileId::from("p1"),
            ExecutorId::from("e1"),
        )
    }

    #[tokio::test]
    async fn on_turn_complete_disables_plan_mode_and_moves_to_next_step() {
        let store = InMemoryStore::new();
        let wf = WorkflowId::from("wf1");
        let step1 = {
            let mut s = WorkflowStep::new(StepId::from("s1"), wf.clone(), "impl", 0);
            s.on_turn_complete = ActionList(vec![Action::DisablePlanMode, Action::MoveToNext]);
            s
        };
        let step2 = WorkflowStep::new(StepId::from("s2"), wf.clone(), "review", 1);

        store
            .create_task(ao_domain::model::Task::new(TaskId::from("t1"), "x", 0))
            .await
            .unwrap();

        // `next_step` is looked up via the raw store, so the steps need
        // to be reachable through the same backing map the blanket impl
        // delegates to. InMemoryStore doesn't expose a seeding API beyond
        // its fields, so we go through the crate-visible test seam.
        seed_step(&store, step1.clone());
        seed_step(&store, step2.clone());

        let mut session = new_session();
        session.metadata.set_plan_mode(true);
        store.create_session(session.clone()).await.unwrap();

        let agent_manager = NoopAgentManager;
        let enqueuer = RecordingEnqueuer::default();
        let issuer = RecordingIssuer::default();
        let collab = Collaborators {
            transitions: &store,
            steps: &store,
            agent_manager: &agent_manager,
            enqueuer: &enqueuer,
            issuer: &issuer,
        };

        let engine = Engine::new();
        let outcome = engine
            .evaluate_on_turn_complete(&collab, &mut session, &step1)
            .await
            .unwrap();

        assert!(outcome.transitioned);
        assert!(!session.metadata.plan_mode());
        assert_eq!(session.workflow_step_id, Some(step2.id.clone()));
        assert!(session.review_status.is_none());

        let task = store.get_task(&TaskId::from("t1")).await.unwrap().unwrap();
        assert_eq!(task.current_step_id, Some(step2.id));
    }

    #[tokio::test]
    async fn move_to_next_with_no_further_step_is_a_no_op() {
        let store = InMemoryStore::new();
        let wf = WorkflowId::from("wf1");
        let only_step = {
            let mut s = WorkflowStep::new(StepId::from("only"), wf.clone(), "only", 0);
            s.on_turn_complete = ActionList(vec![Action::MoveToNext]);
            s
        };
        seed_step(&store, only_step.clone());

        let mut session = new_session();
        store.create_session(session.clone()).await.unwrap();

        let agent_manager = NoopAgentManager;
        let enqueuer = RecordingEnqueuer::default();
        let issuer = RecordingIssuer::default();
        let collab = Collaborators {
            transitions: &store,
            steps: &store,
            agent_manager: &agent_manager,
            enqueuer: &enqueuer,
            issuer: &issuer,
        };

        let engine = Engine::new();
        let outcome = engine
            .evaluate_on_turn_complete(&collab, &mut session, &only_step)
            .await
            .unwrap();
        assert!(!outcome.transitioned);
    }

    #[tokio::test]
    async fn move_to_step_skipped_when_requires_approval() {
        let store = InMemoryStore::new();
        let wf = WorkflowId::from("wf1");
        let step1 = {
            let mut s = WorkflowStep::new(StepId::from("s1"), wf.clone(), "impl", 0);
            s.on_turn_complete = ActionList(vec![Action::MoveToStep {
                step_id: StepId::from("s2"),
                requires_approval: true,
            }]);
            s
        };
        seed_step(&store, step1.clone());

        let mut session = new_session();
        store.create_session(session.clone()).await.unwrap();

        let agent_manager = NoopAgentManager;
        let enqueuer = RecordingEnqueuer::default();
        let issuer = RecordingIssuer::default();
        let collab = Collaborators {
            transitions: &store,
            steps: &store,
            agent_manager: &agent_manager,
            enqueuer: &enqueuer,
            issuer: &issuer,
        };

        let engine = Engine::new();
        let outcome = engine
            .evaluate_on_turn_complete(&collab, &mut session, &step1)
            .await
            .unwrap();
        assert!(!outcome.transitioned);
        assert!(session.workflow_step_id.is_none());
    }

    #[tokio::test]
    async fn auto_start_agent_enqueues_when_running_else_issues_directly() {
        let store = InMemoryStore::new();
        let wf = WorkflowId::from("wf1");
        let mut step = WorkflowStep::new(StepId::from("s1"), wf, "impl", 0);
        step.on_enter = ActionList(vec![Action::AutoStartAgent {
            prompt: Some("go".to_string()),
        }]);
        step.prompt_prefix = Some("Task {task_id}: ".to_string());
        seed_step(&store, step.clone());

        let agent_manager = NoopAgentManager;
        let enqueuer = RecordingEnqueuer::default();
        let issuer = RecordingIssuer::default();
        let collab = Collaborators {
            transitions: &store,
            steps: &store,
            agent_manager: &agent_manager,
            enqueuer: &enqueuer,
            issuer: &issuer,
        };
        let engine = Engine::new();

        let mut running = new_session();
        running.state = SessionState::Running;
        store.create_session(running.clone()).await.unwrap();
        engine
            .evaluate_on_enter(&collab, &mut running, &step)
            .await
            .unwrap();
        assert_eq!(
            enqueuer.prompts.lock().unwrap().as_slice(),
            ["Task t1: go"]
        );
        assert!(issuer.prompts.lock().unwrap().is_empty());

        let mut created = new_session();
        created.id = SessionId::from("s2");
        store.create_session(created.clone()).await.unwrap();
        engine
            .evaluate_on_enter(&collab, &mut created, &step)
            .await
            .unwrap();
        assert_eq!(issuer.prompts.lock().unwrap().as_slice(), ["Task t1: go"]);
    }

    #[tokio::test]
    async fn passthrough_sessions_skip_plan_mode_and_auto_start() {
        let store = InMemoryStore::new();
        let wf = WorkflowId::from("wf1");
        let mut step = WorkflowStep::new(StepId::from("s1"), wf, "impl", 0);
        step.on_enter = ActionList(vec![
            Action::EnablePlanMode,
            Action::AutoStartAgent { prompt: None },
        ]);
        seed_step(&store, step.clone());

        let mut session = new_session();
        session.is_passthrough = true;
        store.create_session(session.clone()).await.unwrap();

        let agent_manager = NoopAgentManager;
        let enqueuer = RecordingEnqueuer::default();
        let issuer = RecordingIssuer::default();
        let collab = Collaborators {
            transitions: &store,
            steps: &store,
            agent_manager: &agent_manager,
            enqueuer: &enqueuer,
            issuer: &issuer,
        };
        let engine = Engine::new();
        engine
            .evaluate_on_enter(&collab, &mut session, &step)
            .await
            .unwrap();

        assert!(!session.metadata.plan_mode());
        assert!(enqueuer.prompts.lock().unwrap().is_empty());
        assert!(issuer.prompts.lock().unwrap().is_empty());
    }

    fn seed_step(store: &InMemoryStore, step: WorkflowStep) {
        store.seed_workflow_step(step);
    }
}
