//! In-memory [`Store`] implementation. Backs tests and the demo CLI;
//! state does not survive a process restart, so crash-recovery demos
//! seed an `InMemoryStore` directly with pre-crash rows.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use ao_domain::error::Result;
use ao_domain::model::{
    AgentExecutionId, ExecutorRunning, Message, MessageId, QueuedMessage, Session, SessionId,
    StepId, Task, TaskId, Turn, TurnId, TurnState, WorkflowId, WorkflowStep,
};

use crate::Store;

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    sessions: HashMap<SessionId, Session>,
    executor_running: HashMap<SessionId, ExecutorRunning>,
    turns: HashMap<TurnId, Turn>,
    messages: HashMap<SessionId, Vec<Message>>,
    queued: HashMap<SessionId, QueuedMessage>,
    workflow_steps: HashMap<StepId, WorkflowStep>,
    applied_operations: HashSet<String>,
    snapshot_hashes: HashMap<SessionId, HashSet<String>>,
    reserved_execution_ids: HashSet<AgentExecutionId>,
}

pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Test/demo seam: other crates' tests assemble a workflow and need
    /// to seed its steps without going through a full `Store` write path
    /// (there's no `create_workflow_step` in the trait — steps are
    /// configuration, not runtime-written data).
    pub fn seed_workflow_step(&self, step: WorkflowStep) {
        self.tables.write().workflow_steps.insert(step.id.clone(), step);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, task: Task) -> Result<()> {
        self.tables.write().tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().tasks.get(id).cloned())
    }

    async fn update_task(&self, task: Task) -> Result<()> {
        self.tables.write().tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tables.read().tasks.values().cloned().collect())
    }

    async fn create_session(&self, session: Session) -> Result<()> {
        self.tables
            .write()
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.tables.read().sessions.get(id).cloned())
    }

    async fn update_session(&self, session: Session) -> Result<()> {
        self.tables
            .write()
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn sessions_for_task(&self, task_id: &TaskId) -> Result<Vec<Session>> {
        Ok(self
            .tables
            .read()
            .sessions
            .values()
            .filter(|s| &s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn upsert_executor_running(&self, row: ExecutorRunning) -> Result<()> {
        self.tables
            .write()
            .executor_running
            .insert(row.session_id.clone(), row);
        Ok(())
    }

    async fn get_executor_running(&self, session_id: &SessionId) -> Result<Option<ExecutorRunning>> {
        Ok(self.tables.read().executor_running.get(session_id).cloned())
    }

    async fn delete_executor_running(&self, session_id: &SessionId) -> Result<()> {
        self.tables.write().executor_running.remove(session_id);
        Ok(())
    }

    async fn list_executor_running(&self) -> Result<Vec<ExecutorRunning>> {
        Ok(self
            .tables
            .read()
            .executor_running
            .values()
            .cloned()
            .collect())
    }

    async fn open_turn(&self, turn: Turn) -> Result<()> {
        self.tables.write().turns.insert(turn.id, turn);
        Ok(())
    }

    async fn get_turn(&self, id: &TurnId) -> Result<Option<Turn>> {
        Ok(self.tables.read().turns.get(id).cloned())
    }

    async fn active_turn(&self, session_id: &SessionId) -> Result<Option<Turn>> {
        Ok(self
            .tables
            .read()
            .turns
            .values()
            .find(|t| &t.session_id == session_id && t.state == TurnState::Active)
            .cloned())
    }

    async fn close_turn(&self, id: &TurnId) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(turn) = tables.turns.get_mut(id) {
            turn.close();
        }
        Ok(())
    }

    async fn append_message(&self, message: Message) -> Result<()> {
        let mut tables = self.tables.write();
        let bucket = tables.messages.entry(message.session_id.clone()).or_default();
        if let Some(existing) = bucket.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
        } else {
            bucket.push(message);
        }
        Ok(())
    }

    async fn get_message(&self, session_id: &SessionId, id: &MessageId) -> Result<Option<Message>> {
        Ok(self
            .tables
            .read()
            .messages
            .get(session_id)
            .and_then(|bucket| bucket.iter().find(|m| &m.id == id).cloned()))
    }

    async fn update_message(&self, message: Message) -> Result<()> {
        self.append_message(message).await
    }

    async fn find_by_tool_call_id(
        &self,
        session_id: &SessionId,
        tool_call_id: &str,
    ) -> Result<Option<Message>> {
        Ok(self.tables.read().messages.get(session_id).and_then(|bucket| {
            bucket
                .iter()
                .find(|m| m.tool_call_id.as_deref() == Some(tool_call_id))
                .cloned()
        }))
    }

    async fn queue_message(&self, queued: QueuedMessage) -> Result<()> {
        self.tables
            .write()
            .queued
            .insert(queued.session_id.clone(), queued);
        Ok(())
    }

    async fn get_queued_message(&self, session_id: &SessionId) -> Result<Option<QueuedMessage>> {
        Ok(self.tables.read().queued.get(session_id).cloned())
    }

    async fn cancel_queued_message(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.tables.write().queued.remove(session_id).is_some())
    }

    async fn get_workflow_step(&self, id: &StepId) -> Result<Option<WorkflowStep>> {
        Ok(self.tables.read().workflow_steps.get(id).cloned())
    }

    async fn steps_for_workflow(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowStep>> {
        let mut steps: Vec<WorkflowStep> = self
            .tables
            .read()
            .workflow_steps
            .values()
            .filter(|s| &s.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn next_step(&self, current: &StepId) -> Result<Option<WorkflowStep>> {
        let tables = self.tables.read();
        let Some(current_step) = tables.workflow_steps.get(current) else {
            return Ok(None);
        };
        Ok(tables
            .workflow_steps
            .values()
            .filter(|s| s.workflow_id == current_step.workflow_id && s.position > current_step.position)
            .min_by_key(|s| s.position)
            .cloned())
    }

    async fn apply_transition(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        to_step_id: &StepId,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(task) = tables.tasks.get_mut(task_id) {
            task.current_step_id = Some(to_step_id.clone());
        }
        if let Some(session) = tables.sessions.get_mut(session_id) {
            session.workflow_step_id = Some(to_step_id.clone());
            session.review_status = None;
        }
        Ok(())
    }

    async fn is_operation_applied(&self, operation_id: &str) -> Result<bool> {
        Ok(self.tables.read().applied_operations.contains(operation_id))
    }

    async fn mark_operation_applied(&self, operation_id: &str) -> Result<()> {
        self.tables
            .write()
            .applied_operations
            .insert(operation_id.to_string());
        Ok(())
    }

    async fn record_snapshot_hash(&self, session_id: &SessionId, hash: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .snapshot_hashes
            .entry(session_id.clone())
            .or_default()
            .insert(hash.to_string()))
    }

    async fn reserve_agent_execution_id(&self, id: &AgentExecutionId) -> Result<bool> {
        Ok(self.tables.write().reserved_execution_ids.insert(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_step_walks_position_order() {
        let store = InMemoryStore::new();
        let wf = WorkflowId::from("wf");
        let a = WorkflowStep::new(StepId::from("a"), wf.clone(), "a", 0);
        let b = WorkflowStep::new(StepId::from("b"), wf.clone(), "b", 1);
        let c = WorkflowStep::new(StepId::from("c"), wf.clone(), "c", 2);
        store.tables.write().workflow_steps.insert(a.id.clone(), a.clone());
        store.tables.write().workflow_steps.insert(b.id.clone(), b.clone());
        store.tables.write().workflow_steps.insert(c.id.clone(), c.clone());

        let next = store.next_step(&a.id).await.unwrap().unwrap();
        assert_eq!(next.id, b.id);

        let last = store.next_step(&c.id).await.unwrap();
        assert!(last.is_none());
    }

    #[tokio::test]
    async fn apply_transition_updates_task_and_session_atomically() {
        let store = InMemoryStore::new();
        let task_id = TaskId::from("t1");
        let session_id = SessionId::from("s1");
        store
            .create_task(Task::new(task_id.clone(), "x", 0))
            .await
            .unwrap();
        let mut session = Session::new(
            session_id.clone(),
            task_id.clone(),
            ao_domain::model::AgentProfileId::from("p"),
            ao_domain::model::ExecutorId::from("e"),
        );
        session.review_status = Some("pending".to_string());
        store.create_session(session).await.unwrap();

        store
            .apply_transition(&task_id, &session_id, &StepId::from("step-2"))
            .await
            .unwrap();

        let task = store.get_task(&task_id).await.unwrap().unwrap();
        let session = store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(task.current_step_id, Some(StepId::from("step-2")));
        assert_eq!(session.workflow_step_id, Some(StepId::from("step-2")));
        assert!(session.review_status.is_none());
    }
}
