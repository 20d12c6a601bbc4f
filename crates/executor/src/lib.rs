//! Turns queued tasks into running agent processes: the scheduler pulls
//! work and admits it under a concurrency cap, the Executor prepares
//! sessions and drives their agent-manager lifecycle, and the
//! collaborator traits keep repository/worktree mechanics and the real
//! subprocess manager out of this crate's concern.

pub mod agent_manager;
pub mod classify;
pub mod collaborators;
pub mod executor;
pub mod scheduler;
pub mod worktree_lock;

pub use agent_manager::{
    AgentManager, AgentProfile, LaunchAgentRequest, LaunchAgentResult, MockAgentManager,
    PromptResult, ScriptedResponses,
};
pub use classify::{classify_prompt_error, FailureClass};
pub use collaborators::{
    ExecutorKind, InMemoryRepositoryResolver, InMemoryWorktreeManager, RepositoryInfo,
    RepositoryResolver, WorktreeManager,
};
pub use executor::{Executor, TaskExecution};
pub use scheduler::{ExecutionParams, Scheduler, SchedulerCounters, TaskExecutor, TaskSource};
pub use worktree_lock::{WorktreeLockGuard, WorktreeLockRegistry};
