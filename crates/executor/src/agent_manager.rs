//! The external agent subprocess manager, modeled as a narrow
//! collaborator trait plus a scriptable in-memory mock used by tests and
//! the CLI demo.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use ao_domain::error::{Error, Result};
use ao_domain::model::{AgentExecutionId, AgentProfileId, SessionId};

#[derive(Debug, Clone)]
pub struct LaunchAgentRequest {
    pub session_id: SessionId,
    pub agent_profile_id: AgentProfileId,
    pub model_override: Option<String>,
    pub resume_token: Option<String>,
    pub worktree: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchAgentResult {
    pub agent_execution_id: AgentExecutionId,
    pub container_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct PromptResult {
    pub stop_reason: String,
    pub agent_message: String,
}

#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub model: String,
    pub supports_mcp: bool,
    pub supports_resume: bool,
}

/// Everything the core needs from the real subprocess manager. All
/// methods are async-safe and expected to be idempotent under retry —
/// the core never wraps these in its own retry loop.
#[async_trait]
pub trait AgentManager: Send + Sync {
    async fn launch_agent(&self, req: LaunchAgentRequest) -> Result<LaunchAgentResult>;
    async fn start_agent_process(&self, id: &AgentExecutionId) -> Result<()>;
    async fn stop_agent(&self, id: &AgentExecutionId, force: bool) -> Result<()>;
    async fn stop_agent_with_reason(
        &self,
        id: &AgentExecutionId,
        reason: &str,
        force: bool,
    ) -> Result<()>;
    async fn prompt_agent(
        &self,
        id: &AgentExecutionId,
        prompt: &str,
        attachments: &[String],
    ) -> Result<PromptResult>;
    async fn cancel_agent(&self, session_id: &SessionId) -> Result<()>;
    async fn restart_agent_process(&self, id: &AgentExecutionId) -> Result<()>;
    async fn respond_to_permission_by_session_id(
        &self,
        session_id: &SessionId,
        pending_id: &str,
        option_id: Option<&str>,
        cancelled: bool,
    ) -> Result<()>;
    async fn is_agent_running_for_session(&self, session_id: &SessionId) -> Result<bool>;
    async fn is_passthrough_session(&self, session_id: &SessionId) -> Result<bool>;
    async fn resolve_agent_profile(&self, profile_id: &AgentProfileId) -> Result<AgentProfile>;
    async fn set_execution_description(&self, id: &AgentExecutionId, description: &str) -> Result<()>;
    async fn ensure_workspace_execution_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<AgentExecutionId>;
}

/// Scriptable in-memory double. Tests pre-load [`ScriptedResponses`] and
/// assert against the recorded call log afterward.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponses {
    pub prompt_results: HashMap<SessionId, PromptResult>,
    pub prompt_errors: HashMap<SessionId, String>,
    pub resume_supported: HashMap<AgentProfileId, bool>,
    pub passthrough_sessions: std::collections::HashSet<SessionId>,
}

#[derive(Default)]
struct State {
    next_execution_seq: u64,
    running: HashMap<AgentExecutionId, SessionId>,
    restart_calls: Vec<AgentExecutionId>,
    stop_calls: Vec<AgentExecutionId>,
    cancel_calls: Vec<SessionId>,
    descriptions: HashMap<AgentExecutionId, String>,
}

pub struct MockAgentManager {
    scripted: Mutex<ScriptedResponses>,
    state: Mutex<State>,
}

impl Default for MockAgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgentManager {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(ScriptedResponses::default()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn script(&self, f: impl FnOnce(&mut ScriptedResponses)) {
        f(&mut self.scripted.lock());
    }

    pub fn restart_calls(&self) -> Vec<AgentExecutionId> {
        self.state.lock().restart_calls.clone()
    }

    pub fn stop_calls(&self) -> Vec<AgentExecutionId> {
        self.state.lock().stop_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<SessionId> {
        self.state.lock().cancel_calls.clone()
    }
}

#[async_trait]
impl AgentManager for MockAgentManager {
    async fn launch_agent(&self, req: LaunchAgentRequest) -> Result<LaunchAgentResult> {
        let mut state = self.state.lock();
        state.next_execution_seq += 1;
        let id = AgentExecutionId::from(format!("exec-{}", state.next_execution_seq));
        state.running.insert(id.clone(), req.session_id.clone());
        Ok(LaunchAgentResult {
            agent_execution_id: id,
            container_id: None,
            status: "starting".to_string(),
        })
    }

    async fn start_agent_process(&self, _id: &AgentExecutionId) -> Result<()> {
        Ok(())
    }

    async fn stop_agent(&self, id: &AgentExecutionId, _force: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.stop_calls.push(id.clone());
        state.running.remove(id);
        Ok(())
    }

    async fn stop_agent_with_reason(
        &self,
        id: &AgentExecutionId,
        _reason: &str,
        force: bool,
    ) -> Result<()> {
        self.stop_agent(id, force).await
    }

    async fn prompt_agent(
        &self,
        id: &AgentExecutionId,
        _prompt: &str,
        _attachments: &[String],
    ) -> Result<PromptResult> {
        let session_id = self
            .state
            .lock()
            .running
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;

        let scripted = self.scripted.lock();
        if let Some(msg) = scripted.prompt_errors.get(&session_id) {
            return Err(Error::Other(msg.clone()));
        }
        Ok(scripted
            .prompt_results
            .get(&session_id)
            .cloned()
            .unwrap_or_else(|| PromptResult {
                stop_reason: "end_turn".to_string(),
                agent_message: String::new(),
            }))
    }

    async fn cancel_agent(&self, session_id: &SessionId) -> Result<()> {
        self.state.lock().cancel_calls.push(session_id.clone());
        Ok(())
    }

    async fn restart_agent_process(&self, id: &AgentExecutionId) -> Result<()> {
        self.state.lock().restart_calls.push(id.clone());
        Ok(())
    }

    async fn respond_to_permission_by_session_id(
        &self,
        _session_id: &SessionId,
        _pending_id: &str,
        _option_id: Option<&str>,
        _cancelled: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn is_agent_running_for_session(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .running
            .values()
            .any(|s| s == session_id))
    }

    async fn is_passthrough_session(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.scripted.lock().passthrough_sessions.contains(session_id))
    }

    async fn resolve_agent_profile(&self, profile_id: &AgentProfileId) -> Result<AgentProfile> {
        let supports_resume = self
            .scripted
            .lock()
            .resume_supported
            .get(profile_id)
            .copied()
            .unwrap_or(true);
        Ok(AgentProfile {
            model: "default-model".to_string(),
            supports_mcp: true,
            supports_resume,
        })
    }

    async fn set_execution_description(&self, id: &AgentExecutionId, description: &str) -> Result<()> {
        self.state
            .lock()
            .descriptions
            .insert(id.clone(), description.to_string());
        Ok(())
    }

    async fn ensure_workspace_execution_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<AgentExecutionId> {
        let mut state = self.state.lock();
        if let Some((id, _)) = state.running.iter().find(|(_, s)| *s == session_id) {
            return Ok(id.clone());
        }
        state.next_execution_seq += 1;
        let id = AgentExecutionId::from(format!("exec-{}", state.next_execution_seq));
        state.running.insert(id.clone(), session_id.clone());
        Ok(id)
    }
}
