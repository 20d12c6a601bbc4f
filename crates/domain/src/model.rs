//! The persisted entity graph: tasks, sessions, turns, messages,
//! workflow steps, and the small value types they're built from.
//!
//! `TaskId`/`SessionId`/`WorkflowId`/`StepId` are caller- or
//! config-assigned and therefore plain string newtypes; `TurnId` and
//! `MessageId` are minted internally and use `Uuid`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(TaskId);
string_id!(SessionId);
string_id!(WorkflowId);
string_id!(StepId);
string_id!(AgentProfileId);
string_id!(ExecutorId);
string_id!(RepositoryId);
string_id!(AgentExecutionId);

uuid_id!(TurnId);
uuid_id!(MessageId);

// ---------------------------------------------------------------- Task

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Todo,
    Scheduling,
    InProgress,
    Review,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Higher sorts earlier in the priority queue.
    pub priority: i64,
    pub state: TaskState,
    pub workflow_id: Option<WorkflowId>,
    pub current_step_id: Option<StepId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, title: impl Into<String>, priority: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            description: String::new(),
            priority,
            state: TaskState::Todo,
            workflow_id: None,
            current_step_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ------------------------------------------------------------- Session

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Ordered worktree list; element 0 is the primary worktree a session
/// works from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitStatus {
    pub worktrees: Vec<String>,
    pub base_branch: Option<String>,
    pub dirty: bool,
    pub last_snapshot_hash: Option<String>,
}

/// Free-form metadata bag, with typed accessors for the well-known keys
/// the workflow engine and executor read/write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata(pub HashMap<String, serde_json::Value>);

impl SessionMetadata {
    pub fn plan_mode(&self) -> bool {
        self.0
            .get("plan_mode")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_plan_mode(&mut self, on: bool) {
        self.0.insert("plan_mode".to_string(), serde_json::json!(on));
    }

    pub fn acp_session_id(&self) -> Option<&str> {
        self.0.get("acp_session_id").and_then(|v| v.as_str())
    }

    pub fn set_acp_session_id(&mut self, id: impl Into<String>) {
        self.0
            .insert("acp_session_id".to_string(), serde_json::json!(id.into()));
    }

    pub fn workflow_data(&self) -> Option<&serde_json::Value> {
        self.0.get("workflow_data")
    }

    pub fn set_workflow_data(&mut self, key: &str, value: serde_json::Value) {
        let entry = self
            .0
            .entry("workflow_data".to_string())
            .or_insert_with(|| serde_json::json!({}));
        if let Some(obj) = entry.as_object_mut() {
            obj.insert(key.to_string(), value);
        }
    }

    pub fn context_window(&self) -> Option<u64> {
        self.0.get("context_window").and_then(|v| v.as_u64())
    }

    pub fn set_context_window(&mut self, tokens: u64) {
        self.0
            .insert("context_window".to_string(), serde_json::json!(tokens));
    }

    pub fn git_status(&self) -> Option<GitStatus> {
        self.0
            .get("git_status")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_git_status(&mut self, status: &GitStatus) {
        self.0.insert(
            "git_status".to_string(),
            serde_json::to_value(status).expect("GitStatus is always serializable"),
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub task_id: TaskId,
    pub agent_profile_id: AgentProfileId,
    pub executor_id: ExecutorId,
    pub workflow_step_id: Option<StepId>,
    pub state: SessionState,
    pub agent_execution_id: Option<AgentExecutionId>,
    pub review_status: Option<String>,
    pub metadata: SessionMetadata,
    pub worktrees: Vec<String>,
    pub base_branch: Option<String>,
    pub repository_id: Option<RepositoryId>,
    pub is_primary: bool,
    pub is_passthrough: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: SessionId,
        task_id: TaskId,
        agent_profile_id: AgentProfileId,
        executor_id: ExecutorId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_id,
            agent_profile_id,
            executor_id,
            workflow_step_id: None,
            state: SessionState::Created,
            agent_execution_id: None,
            review_status: None,
            metadata: SessionMetadata::default(),
            worktrees: Vec::new(),
            base_branch: None,
            repository_id: None,
            is_primary: true,
            is_passthrough: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn primary_worktree(&self) -> Option<&str> {
        self.worktrees.first().map(|s| s.as_str())
    }
}

/// Upserted once an agent reports its own session identifier; the sole
/// record that survives a backend restart for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRunning {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub executor_id: ExecutorId,
    pub status: String,
    pub resumable: bool,
    pub resume_token: Option<String>,
    pub agent_execution_id: AgentExecutionId,
    pub container_id: Option<String>,
    pub worktrees: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutorRunning {
    /// The sole condition under which a session may be reloaded after a
    /// crash: a non-empty resume-token and an explicit resumable flag.
    pub fn can_resume(&self) -> bool {
        self.resumable && self.resume_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

// ---------------------------------------------------------------- Turn

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub session_id: SessionId,
    pub state: TurnState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn open(session_id: SessionId) -> Self {
        Self {
            id: TurnId::new(),
            session_id,
            state: TurnState::Active,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn close(&mut self) {
        self.state = TurnState::Completed;
        self.closed_at = Some(Utc::now());
    }
}

// ------------------------------------------------------------- Message

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    ToolCall,
    Status,
    Error,
    Log,
    PermissionRequest,
    ScriptExecution,
    Thinking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub message_type: MessageType,
    pub author: String,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub parent_tool_call_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: SessionId, turn_id: TurnId, message_type: MessageType) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            session_id,
            turn_id,
            message_type,
            author: String::new(),
            content: String::new(),
            tool_call_id: None,
            parent_tool_call_id: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Strictly-additive streaming append; the caller is the stream
    /// multiplexer, which locates the message by (session-id, message-id).
    pub fn append(&mut self, chunk: &str) {
        self.content.push_str(chunk);
        self.updated_at = Utc::now();
    }
}

// ------------------------------------------------------------ Queued message

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub content: String,
    pub model: Option<String>,
    pub plan_mode: bool,
    pub attachments: Vec<String>,
    pub queued_by: String,
    pub queued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(session_id: SessionId, task_id: TaskId, content: impl Into<String>) -> Self {
        Self {
            session_id,
            task_id,
            content: content.into(),
            model: None,
            plan_mode: false,
            attachments: Vec::new(),
            queued_by: String::new(),
            queued_at: Utc::now(),
        }
    }
}

// -------------------------------------------------------- Workflow step

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum Action {
    EnablePlanMode,
    DisablePlanMode,
    ResetAgentContext,
    AutoStartAgent { prompt: Option<String> },
    MoveToNext,
    MoveToStep {
        step_id: StepId,
        #[serde(default)]
        requires_approval: bool,
    },
    SetWorkflowData { key: String, value: serde_json::Value },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionList(pub Vec<Action>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub name: String,
    /// Totally ordered within a workflow.
    pub position: i64,
    pub on_enter: ActionList,
    pub on_exit: ActionList,
    pub on_turn_start: ActionList,
    pub on_turn_complete: ActionList,
    pub require_approval: bool,
    pub prompt_prefix: Option<String>,
    pub prompt_suffix: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: StepId, workflow_id: WorkflowId, name: impl Into<String>, position: i64) -> Self {
        Self {
            id,
            workflow_id,
            name: name.into(),
            position,
            on_enter: ActionList::default(),
            on_exit: ActionList::default(),
            on_turn_start: ActionList::default(),
            on_turn_complete: ActionList::default(),
            require_approval: false,
            prompt_prefix: None,
            prompt_suffix: None,
        }
    }

    /// Expands `{task_id}` and similar placeholders in the prefix/suffix.
    pub fn render_prompt(&self, body: &str, task_id: &TaskId) -> String {
        let sub = |s: &str| s.replace("{task_id}", task_id.as_str());
        let prefix = self.prompt_prefix.as_deref().map(sub).unwrap_or_default();
        let suffix = self.prompt_suffix.as_deref().map(sub).unwrap_or_default();
        format!("{prefix}{body}{suffix}")
    }
}
