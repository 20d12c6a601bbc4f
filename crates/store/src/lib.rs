//! Typed persistence façade over tasks, sessions, turns, messages,
//! workflow steps, and executor-running rows.
//!
//! The core only ever talks to the [`Store`] trait; this crate also
//! ships [`InMemoryStore`], the implementation used by tests and the
//! demo CLI. A durable implementation (sqlite/postgres) would live in
//! its own crate behind the same trait.

use async_trait::async_trait;

use ao_domain::error::Result;
use ao_domain::model::{
    AgentExecutionId, ExecutorRunning, Message, MessageId, QueuedMessage, Session, SessionId,
    StepId, Task, TaskId, Turn, TurnId, WorkflowId, WorkflowStep,
};

mod memory;
pub use memory::InMemoryStore;

/// Read/write operations the orchestrator core needs. Every write is
/// expected to be durable before it returns; the core never retries a
/// store call on its own.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
    async fn update_task(&self, task: Task) -> Result<()>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn create_session(&self, session: Session) -> Result<()>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;
    async fn update_session(&self, session: Session) -> Result<()>;
    /// Non-terminal sessions belonging to a task, used by `StopByTaskID`
    /// and the primary-session invariant check.
    async fn sessions_for_task(&self, task_id: &TaskId) -> Result<Vec<Session>>;

    async fn upsert_executor_running(&self, row: ExecutorRunning) -> Result<()>;
    async fn get_executor_running(&self, session_id: &SessionId) -> Result<Option<ExecutorRunning>>;
    async fn delete_executor_running(&self, session_id: &SessionId) -> Result<()>;
    async fn list_executor_running(&self) -> Result<Vec<ExecutorRunning>>;

    async fn open_turn(&self, turn: Turn) -> Result<()>;
    async fn get_turn(&self, id: &TurnId) -> Result<Option<Turn>>;
    /// The session's single active turn, if any (invariant: at most one).
    async fn active_turn(&self, session_id: &SessionId) -> Result<Option<Turn>>;
    async fn close_turn(&self, id: &TurnId) -> Result<()>;

    async fn append_message(&self, message: Message) -> Result<()>;
    async fn get_message(&self, session_id: &SessionId, id: &MessageId) -> Result<Option<Message>>;
    async fn update_message(&self, message: Message) -> Result<()>;
    /// Locates a message by (session-id, tool-call-id), enforcing the
    /// "unique per session" invariant on `tool_call` messages.
    async fn find_by_tool_call_id(
        &self,
        session_id: &SessionId,
        tool_call_id: &str,
    ) -> Result<Option<Message>>;

    async fn queue_message(&self, queued: QueuedMessage) -> Result<()>;
    async fn get_queued_message(&self, session_id: &SessionId) -> Result<Option<QueuedMessage>>;
    async fn cancel_queued_message(&self, session_id: &SessionId) -> Result<bool>;

    async fn get_workflow_step(&self, id: &StepId) -> Result<Option<WorkflowStep>>;
    async fn steps_for_workflow(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowStep>>;
    /// The step at `position + 1` within the same workflow, if any.
    async fn next_step(&self, current: &StepId) -> Result<Option<WorkflowStep>>;

    /// Atomically sets `task.workflow_step_id`, `session.workflow_step_id`,
    /// and clears `session.review_status`.
    async fn apply_transition(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        to_step_id: &StepId,
    ) -> Result<()>;

    /// At-most-once guard for externally-initiated transitions.
    async fn is_operation_applied(&self, operation_id: &str) -> Result<bool>;
    async fn mark_operation_applied(&self, operation_id: &str) -> Result<()>;

    /// Dedup guard for git worktree snapshots (invariant 7: same content
    /// hash is a no-op).
    async fn record_snapshot_hash(&self, session_id: &SessionId, hash: &str) -> Result<bool>;

    async fn reserve_agent_execution_id(&self, id: &AgentExecutionId) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_domain::model::{AgentProfileId, ExecutorId, TaskId as TId};

    #[tokio::test]
    async fn create_and_get_task_round_trips() {
        let store = InMemoryStore::new();
        let task = Task::new(TId::from("t1"), "do a thing", 5);
        store.create_task(task.clone()).await.unwrap();

        let fetched = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "do a thing");
        assert_eq!(fetched.priority, 5);
    }

    #[tokio::test]
    async fn sessions_for_task_filters_by_task_id() {
        let store = InMemoryStore::new();
        let t1 = TId::from("t1");
        let t2 = TId::from("t2");

        let s1 = Session::new(
            SessionId::from("s1"),
            t1.clone(),
            AgentProfileId::from("p"),
            ExecutorId::from("e"),
        );
        let s2 = Session::new(
            SessionId::from("s2"),
            t2.clone(),
            AgentProfileId::from("p"),
            ExecutorId::from("e"),
        );
        store.create_session(s1).await.unwrap();
        store.create_session(s2).await.unwrap();

        let for_t1 = store.sessions_for_task(&t1).await.unwrap();
        assert_eq!(for_t1.len(), 1);
        assert_eq!(for_t1[0].id, SessionId::from("s1"));
    }

    #[tokio::test]
    async fn tool_call_messages_are_findable_by_id() {
        let store = InMemoryStore::new();
        let session_id = SessionId::from("s1");
        let turn = Turn::open(session_id.clone());
        store.open_turn(turn.clone()).await.unwrap();

        let mut msg = Message::new(session_id.clone(), turn.id, ao_domain::model::MessageType::ToolCall);
        msg.tool_call_id = Some("call-1".to_string());
        store.append_message(msg).await.unwrap();

        let found = store
            .find_by_tool_call_id(&session_id, "call-1")
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn snapshot_hash_dedup_returns_false_on_repeat() {
        let store = InMemoryStore::new();
        let session_id = SessionId::from("s1");
        assert!(store.record_snapshot_hash(&session_id, "abc").await.unwrap());
        assert!(!store.record_snapshot_hash(&session_id, "abc").await.unwrap());
        assert!(store.record_snapshot_hash(&session_id, "def").await.unwrap());
    }

    #[tokio::test]
    async fn operation_applied_guard_is_idempotent() {
        let store = InMemoryStore::new();
        assert!(!store.is_operation_applied("op-1").await.unwrap());
        store.mark_operation_applied("op-1").await.unwrap();
        assert!(store.is_operation_applied("op-1").await.unwrap());
    }
}
