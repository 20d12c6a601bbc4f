//! Shared error type used across all orchestrator crates.
//!
//! Variants map onto the core's error taxonomy: lookup failures are
//! surfaced verbatim, sentinels (`SessionResetInProgress`,
//! `AgentPromptInProgress`) signal "retry" rather than "fail". Transient
//! vs. resume vs. fatal prompt failures are classified from free-text
//! agent-manager error messages — see `ao_executor::classify` — rather
//! than encoded as variants here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("queue is full")]
    QueueFull,

    #[error("lifecycle manager not available")]
    LifecycleManagerNotAvailable,

    #[error("registry not available")]
    RegistryNotAvailable,

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("session reset in progress for session {0}")]
    SessionResetInProgress(String),

    #[error("agent prompt already in progress for session {0}")]
    AgentPromptInProgress(String),

    #[error("remote_docker executor requires a repository clone URL")]
    RemoteDockerNoRepoURL,

    #[error("validation: {0}")]
    Validation(String),

    #[error("config: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for sentinel errors that mean "retry shortly", never a
    /// terminal task failure.
    pub fn is_retry_sentinel(&self) -> bool {
        matches!(
            self,
            Error::SessionResetInProgress(_) | Error::AgentPromptInProgress(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
