//! Dispatches agent stream events by `Data.Type`, fanning out to store
//! writes and bus publishes.
//!
//! Ordering guarantee: this type processes one event at a time, in the
//! order its caller hands them to [`StreamMultiplexer::handle`] — it
//! never reorders. Cross-session ordering is not guaranteed or implied;
//! callers own fan-out across sessions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ao_domain::error::Result;
use ao_domain::model::{
    AgentExecutionId, ExecutorRunning, Message, MessageId, MessageType, Session, SessionId,
    SessionState, TaskId, TaskState,
};
use ao_sessions::{update_session_state, TurnManager};
use ao_store::Store;

use crate::bus::Bus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub agent_id: AgentExecutionId,
    pub data: StreamEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventData {
    MessageStreaming {
        message_id: Option<MessageId>,
        is_append: bool,
        text: String,
    },
    ThinkingStreaming {
        message_id: Option<MessageId>,
        is_append: bool,
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_status: String,
        text: String,
        parent_tool_call_id: Option<String>,
    },
    ToolUpdate {
        tool_call_id: String,
        tool_status: String,
        parent_tool_call_id: Option<String>,
    },
    Complete {
        acp_session_id: Option<String>,
        resume_token: Option<String>,
    },
    Error {
        error: Option<String>,
        text: Option<String>,
    },
    SessionStatus {
        resume_token: Option<String>,
        resumed: bool,
    },
    SessionMode {
        mode: String,
    },
    PermissionCancelled {
        pending_id: String,
    },
    Log {
        text: Option<String>,
        level: Option<String>,
        extra: serde_json::Value,
    },
    AvailableCommands {
        commands: serde_json::Value,
    },
}

fn tool_status_is_actionable(status: &str) -> bool {
    matches!(
        status.to_lowercase().as_str(),
        "running" | "complete" | "completed" | "success" | "error" | "failed"
    )
}

pub struct StreamMultiplexer {
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    turns: Arc<TurnManager>,
}

impl StreamMultiplexer {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn Bus>, turns: Arc<TurnManager>) -> Self {
        Self { store, bus, turns }
    }

    pub async fn handle(&self, event: StreamEvent) -> Result<()> {
        match &event.data {
            StreamEventData::MessageStreaming { message_id, is_append, text } => {
                self.handle_text_streaming(&event, message_id, *is_append, text, MessageType::Agent)
                    .await
            }
            StreamEventData::ThinkingStreaming { message_id, is_append, text } => {
                self.handle_text_streaming(&event, message_id, *is_append, text, MessageType::Thinking)
                    .await
            }
            StreamEventData::ToolCall {
                tool_call_id,
                tool_status,
                text,
                parent_tool_call_id,
            } => {
                self.handle_tool_call(&event, tool_call_id, tool_status, text, parent_tool_call_id.clone())
                    .await
            }
            StreamEventData::ToolUpdate {
                tool_call_id,
                tool_status,
                parent_tool_call_id,
            } => {
                self.handle_tool_update(&event, tool_call_id, tool_status, parent_tool_call_id.clone())
                    .await
            }
            StreamEventData::Complete { acp_session_id, resume_token } => {
                self.handle_complete(&event, acp_session_id.clone(), resume_token.clone()).await
            }
            StreamEventData::Error { error, text } => self.handle_error(&event, error.clone(), text.clone()).await,
            StreamEventData::SessionStatus { resume_token, resumed } => {
                self.handle_session_status(&event, resume_token.clone(), *resumed).await
            }
            StreamEventData::SessionMode { mode } => {
                self.bus
                    .publish(&format!("session.{}.mode", event.session_id), serde_json::json!({"mode": mode}))
                    .await;
                Ok(())
            }
            StreamEventData::PermissionCancelled { pending_id } => {
                self.handle_permission_cancelled(&event, pending_id).await
            }
            StreamEventData::Log { text, level, extra } => {
                self.handle_log(&event, text.clone(), level.clone(), extra.clone()).await
            }
            StreamEventData::AvailableCommands { commands } => {
                self.bus
                    .publish(&format!("session.{}.commands", event.session_id), commands.clone())
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_text_streaming(
        &self,
        event: &StreamEvent,
        message_id: &Option<MessageId>,
        is_append: bool,
        text: &str,
        message_type: MessageType,
    ) -> Result<()> {
        let Some(message_id) = message_id else {
            tracing::warn!(session_id = %event.session_id, "streaming event missing MessageID, dropping");
            return Ok(());
        };

        if let Some(mut existing) = self.store.get_message(&event.session_id, message_id).await? {
            // A replayed create (`is_append=false`) event for an id the
            // store already knows about must not clobber what appends
            // since accumulated — the persisted content, not the wire
            // event, is the source of truth.
            if is_append {
                existing.append(text);
                self.store.update_message(existing).await?;
            }
            return Ok(());
        }

        let turn = self.turns.current_or_open(self.store.as_ref(), event.session_id.clone()).await?;
        let mut message = Message::new(event.session_id.clone(), turn.id, message_type);
        message.id = *message_id;
        message.content = text.to_string();
        self.store.append_message(message).await
    }

    async fn handle_tool_call(
        &self,
        event: &StreamEvent,
        tool_call_id: &str,
        tool_status: &str,
        text: &str,
        parent_tool_call_id: Option<String>,
    ) -> Result<()> {
        // Plain streaming text is already persisted per-chunk by
        // `handle_text_streaming`; nothing further needs flushing here.
        let turn = self.turns.current_or_open(self.store.as_ref(), event.session_id.clone()).await?;
        let mut message = Message::new(event.session_id.clone(), turn.id, MessageType::ToolCall);
        message.content = text.to_string();
        message.tool_call_id = Some(tool_call_id.to_string());
        message.parent_tool_call_id = parent_tool_call_id;
        message
            .metadata
            .insert("status".to_string(), serde_json::json!(tool_status));
        self.store.append_message(message).await?;

        if let Some(mut session) = self.store.get_session(&event.session_id).await? {
            if session.state == SessionState::WaitingForInput {
                update_session_state(&mut session, SessionState::Running, None, true);
                self.store.update_session(session).await?;
            }
        }
        Ok(())
    }

    async fn handle_tool_update(
        &self,
        event: &StreamEvent,
        tool_call_id: &str,
        tool_status: &str,
        parent_tool_call_id: Option<String>,
    ) -> Result<()> {
        if !tool_status_is_actionable(tool_status) {
            return Ok(());
        }

        if let Some(mut message) = self.store.find_by_tool_call_id(&event.session_id, tool_call_id).await? {
            message
                .metadata
                .insert("status".to_string(), serde_json::json!(tool_status));
            if parent_tool_call_id.is_some() {
                message.parent_tool_call_id = parent_tool_call_id;
            }
            return self.store.update_message(message).await;
        }

        // Fallback: the originating tool_call event was dropped.
        let turn = self.turns.current_or_open(self.store.as_ref(), event.session_id.clone()).await?;
        let mut message = Message::new(event.session_id.clone(), turn.id, MessageType::ToolCall);
        message.tool_call_id = Some(tool_call_id.to_string());
        message.parent_tool_call_id = parent_tool_call_id;
        message
            .metadata
            .insert("status".to_string(), serde_json::json!(tool_status));
        self.store.append_message(message).await
    }

    async fn handle_complete(
        &self,
        event: &StreamEvent,
        acp_session_id: Option<String>,
        resume_token: Option<String>,
    ) -> Result<()> {
        let Some(mut session) = self.store.get_session(&event.session_id).await? else {
            return Ok(());
        };

        if acp_session_id.is_some() || resume_token.is_some() {
            self.upsert_resume_token(&session, resume_token, event.agent_id.clone()).await?;
            if let Some(acp_id) = acp_session_id {
                session.metadata.set_acp_session_id(acp_id);
            }
        }

        self.turns.close_active(self.store.as_ref(), &event.session_id).await?;
        update_session_state(&mut session, SessionState::WaitingForInput, None, false);
        self.store.update_session(session).await?;

        if let Some(mut task) = self.store.get_task(&event.task_id).await? {
            if task.state == TaskState::InProgress {
                task.state = TaskState::Review;
                task.updated_at = chrono::Utc::now();
                self.store.update_task(task).await?;
            }
        }
        Ok(())
    }

    async fn handle_error(&self, event: &StreamEvent, error: Option<String>, text: Option<String>) -> Result<()> {
        let content = error
            .clone()
            .or(text)
            .unwrap_or_else(|| "An error occurred".to_string());

        let turn = self.turns.current_or_open(self.store.as_ref(), event.session_id.clone()).await?;
        let mut message = Message::new(event.session_id.clone(), turn.id, MessageType::Error);
        message.content = content;
        if let Some(err) = error {
            message.metadata.insert("error".to_string(), serde_json::json!(err));
        }
        self.store.append_message(message).await?;
        self.turns.close_active(self.store.as_ref(), &event.session_id).await
    }

    async fn handle_session_status(&self, event: &StreamEvent, resume_token: Option<String>, resumed: bool) -> Result<()> {
        if let Some(session) = self.store.get_session(&event.session_id).await? {
            self.upsert_resume_token(&session, resume_token, event.agent_id.clone()).await?;
        }

        let turn = self.turns.current_or_open(self.store.as_ref(), event.session_id.clone()).await?;
        let mut message = Message::new(event.session_id.clone(), turn.id, MessageType::Status);
        message.content = if resumed {
            "Session resumed".to_string()
        } else {
            "New session started".to_string()
        };
        self.store.append_message(message).await
    }

    async fn handle_permission_cancelled(&self, event: &StreamEvent, pending_id: &str) -> Result<()> {
        if let Some(mut message) = self.store.find_by_tool_call_id(&event.session_id, pending_id).await? {
            message.metadata.insert("status".to_string(), serde_json::json!("expired"));
            self.store.update_message(message).await?;
        }
        Ok(())
    }

    async fn handle_log(&self, event: &StreamEvent, text: Option<String>, level: Option<String>, extra: serde_json::Value) -> Result<()> {
        let Some(text) = text else {
            return Ok(());
        };
        let turn = self.turns.current_or_open(self.store.as_ref(), event.session_id.clone()).await?;
        let mut message = Message::new(event.session_id.clone(), turn.id, MessageType::Log);
        message.content = text;
        if let Some(level) = level {
            message.metadata.insert("level".to_string(), serde_json::json!(level));
        }
        if !extra.is_null() {
            message.metadata.insert("extra".to_string(), extra);
        }
        self.store.append_message(message).await
    }

    async fn upsert_resume_token(&self, session: &Session, resume_token: Option<String>, agent_execution_id: AgentExecutionId) -> Result<()> {
        let mut row = self
            .store
            .get_executor_running(&session.id)
            .await?
            .unwrap_or_else(|| ExecutorRunning {
                session_id: session.id.clone(),
                task_id: session.task_id.clone(),
                executor_id: session.executor_id.clone(),
                status: "running".to_string(),
                resumable: true,
                resume_token: None,
                agent_execution_id: agent_execution_id.clone(),
                container_id: None,
                worktrees: session.worktrees.clone(),
                updated_at: chrono::Utc::now(),
            });
        if resume_token.is_some() {
            row.resume_token = resume_token;
        }
        row.agent_execution_id = agent_execution_id;
        row.updated_at = chrono::Utc::now();
        self.store.upsert_executor_running(row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use ao_domain::model::{AgentProfileId, ExecutorId};
    use ao_store::InMemoryStore;

    fn harness() -> (StreamMultiplexer, Arc<InMemoryStore>, Arc<InMemoryBus>) {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let turns = Arc::new(TurnManager::new());
        (StreamMultiplexer::new(store.clone(), bus.clone(), turns), store, bus)
    }

    async fn seed_session(store: &InMemoryStore, session_id: &str) {
        store.create_task(ao_domain::model::Task::new(TaskId::from("t1"), "x", 0)).await.unwrap();
        let session = Session::new(
            SessionId::from(session_id),
            TaskId::from("t1"),
            AgentProfileId::from("p1"),
            ExecutorId::from("e1"),
        );
        store.create_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn message_streaming_creates_then_appends() {
        let (mux, store, _bus) = harness();
        seed_session(&store, "s1").await;
        let message_id = MessageId::new();

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::MessageStreaming {
                message_id: Some(message_id),
                is_append: false,
                text: "hello ".to_string(),
            },
        })
        .await
        .unwrap();

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::MessageStreaming {
                message_id: Some(message_id),
                is_append: true,
                text: "world".to_string(),
            },
        })
        .await
        .unwrap();

        let message = store.get_message(&SessionId::from("s1"), &message_id).await.unwrap().unwrap();
        assert_eq!(message.content, "hello world");
    }

    /// Scenario S6: replaying the opening (non-append) event after the
    /// append must not duplicate or reset the accumulated text — the
    /// create path is an upsert keyed by message-id, not a blind insert.
    #[tokio::test]
    async fn replaying_the_opening_event_after_append_does_not_reset_content() {
        let (mux, store, _bus) = harness();
        seed_session(&store, "s1").await;
        let message_id = MessageId::new();

        let first = StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::MessageStreaming {
                message_id: Some(message_id),
                is_append: false,
                text: "Hel".to_string(),
            },
        };
        mux.handle(first.clone()).await.unwrap();
        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::MessageStreaming {
                message_id: Some(message_id),
                is_append: true,
                text: "lo".to_string(),
            },
        })
        .await
        .unwrap();
        mux.handle(first).await.unwrap();

        let message = store.get_message(&SessionId::from("s1"), &message_id).await.unwrap().unwrap();
        assert_eq!(message.content, "Hello");
    }

    #[tokio::test]
    async fn message_streaming_without_message_id_is_a_dropped_warning() {
        let (mux, store, _bus) = harness();
        seed_session(&store, "s1").await;

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::MessageStreaming {
                message_id: None,
                is_append: false,
                text: "oops".to_string(),
            },
        })
        .await
        .unwrap();
        // No panic, no crash; nothing to assert against since nothing
        // was keyed to check for.
    }

    #[tokio::test]
    async fn complete_closes_turn_moves_task_to_review_and_upserts_resume_token() {
        let (mux, store, _bus) = harness();
        seed_session(&store, "s1").await;
        let mut task = store.get_task(&TaskId::from("t1")).await.unwrap().unwrap();
        task.state = TaskState::InProgress;
        store.update_task(task).await.unwrap();

        // Force a turn open via a streaming event first.
        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::MessageStreaming {
                message_id: Some(MessageId::new()),
                is_append: false,
                text: "working".to_string(),
            },
        })
        .await
        .unwrap();

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::Complete {
                acp_session_id: Some("acp-1".to_string()),
                resume_token: Some("tok-1".to_string()),
            },
        })
        .await
        .unwrap();

        let session = store.get_session(&SessionId::from("s1")).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::WaitingForInput);
        assert_eq!(session.metadata.acp_session_id(), Some("acp-1"));

        let task = store.get_task(&TaskId::from("t1")).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Review);

        let running = store.get_executor_running(&SessionId::from("s1")).await.unwrap().unwrap();
        assert_eq!(running.resume_token.as_deref(), Some("tok-1"));

        assert!(store.active_turn(&SessionId::from("s1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_event_falls_back_to_text_then_default_message() {
        let (mux, store, _bus) = harness();
        seed_session(&store, "s1").await;

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::Error { error: None, text: None },
        })
        .await
        .unwrap();

        assert!(store.active_turn(&SessionId::from("s1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tool_update_ignores_non_actionable_statuses() {
        let (mux, store, _bus) = harness();
        seed_session(&store, "s1").await;

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::ToolUpdate {
                tool_call_id: "call-1".to_string(),
                tool_status: "queued".to_string(),
                parent_tool_call_id: None,
            },
        })
        .await
        .unwrap();

        assert!(store.find_by_tool_call_id(&SessionId::from("s1"), "call-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_mode_publishes_without_state_change() {
        let (mux, store, bus) = harness();
        seed_session(&store, "s1").await;
        let mut rx = bus.subscribe("session.s1.mode");

        mux.handle(StreamEvent {
            task_id: TaskId::from("t1"),
            session_id: SessionId::from("s1"),
            agent_id: AgentExecutionId::from("a1"),
            data: StreamEventData::SessionMode { mode: "plan".to_string() },
        })
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, serde_json::json!({"mode": "plan"}));
    }
}
