//! The scripted end-to-end run: enqueue a task, let the scheduler admit
//! and launch it, push a streamed turn through it, chain a workflow
//! transition off `on_turn_complete`, then reconcile a stale
//! `ExecutorRunning` row left behind by a simulated prior crash.
//!
//! Every collaborator here is the in-memory double the workspace's own
//! tests use — there is no real agent subprocess or git worktree behind
//! any of this, just the orchestration core driving its own seams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ao_dispatch::bus::InMemoryBus;
use ao_dispatch::{AgentStreamEvent, StreamEventData};
use ao_domain::config::Config;
use ao_domain::detach::Ctx;
use ao_domain::model::{
    Action, ActionList, AgentExecutionId, AgentProfileId, ExecutorId, ExecutorRunning,
    RepositoryId, Session, SessionId, SessionState, StepId, Task, TaskId, TaskState, WorkflowId,
    WorkflowStep,
};
use ao_executor::agent_manager::MockAgentManager;
use ao_executor::collaborators::{
    ExecutorKind, InMemoryRepositoryResolver, InMemoryWorktreeManager, RepositoryInfo,
};
use ao_executor::scheduler::ExecutionParams;
use ao_service::Service;
use ao_store::{InMemoryStore, Store};

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let agents = Arc::new(MockAgentManager::new());
    let worktrees = Arc::new(InMemoryWorktreeManager::new());
    let repos = Arc::new(InMemoryRepositoryResolver::new());
    repos.register(RepositoryInfo {
        id: RepositoryId::from("demo-repo"),
        local_path: Some("/repos/demo-repo".to_string()),
        clone_url: None,
        default_branch: "main".to_string(),
    });

    let mut executor_kinds = HashMap::new();
    executor_kinds.insert(ExecutorId::from("local"), ExecutorKind::Local);

    let service = Service::new(
        store.clone(),
        bus,
        agents,
        worktrees,
        repos,
        executor_kinds,
        config.scheduler.max_concurrent,
        config.scheduler.queue_max_size,
        config.retry.clone(),
    );

    seed_review_workflow(&store).await?;

    let task_id = TaskId::from("demo-task");
    let task = Task::new(task_id.clone(), "summarize the changelog", 10);
    store.create_task(task).await?;

    tracing::info!(task_id = %task_id, "enqueueing task");
    service.enqueue_task(
        task_id.clone(),
        10,
        0,
        ExecutionParams {
            agent_profile_id: AgentProfileId::from("demo-profile"),
            executor_id: ExecutorId::from("local"),
            prompt: "draft the changelog summary".to_string(),
            workflow_step_id: Some(StepId::from("implement")),
        },
    )?;

    tracing::info!("ticking scheduler to admit and launch the queued task");
    service.scheduler().tick().await;
    while service.scheduler().active_count() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let sessions = store.sessions_for_task(&task_id).await?;
    let session = sessions
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("scheduler did not launch a session for {task_id}"))?;
    tracing::info!(session_id = %session.id, state = ?session.state, "session launched");

    let agent_execution_id = session
        .agent_execution_id
        .clone()
        .unwrap_or_else(|| AgentExecutionId::from("demo-exec"));

    stream_turn(&service, &task_id, &session.id, &agent_execution_id).await?;

    let task = store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task vanished mid-demo"))?;
    let session = store
        .get_session(&session.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session vanished mid-demo"))?;
    tracing::info!(
        task_state = ?task.state,
        session_state = ?session.state,
        workflow_step = ?session.workflow_step_id,
        "turn complete: workflow transition applied"
    );

    seed_crashed_session(&store).await?;

    tracing::info!("reconciling executor_running rows as if the backend just restarted");
    let report = service.reconcile().await?;
    tracing::info!(
        rows_examined = report.rows_examined,
        rows_deleted = report.rows_deleted,
        rows_retained = report.rows_retained,
        tasks_moved_to_review = report.tasks_moved_to_review,
        "reconciliation complete"
    );

    Ok(())
}

/// Seeds a two-step workflow ("implement" -> "review") whose
/// `on_turn_complete` action list clears plan mode and advances the
/// step, so the `Complete` stream event below has a transition to
/// chain.
async fn seed_review_workflow(store: &InMemoryStore) -> anyhow::Result<()> {
    let workflow_id = WorkflowId::from("demo-workflow");

    let mut implement = WorkflowStep::new(StepId::from("implement"), workflow_id.clone(), "implement", 0);
    implement.on_turn_complete = ActionList(vec![Action::DisablePlanMode, Action::MoveToNext]);
    store.seed_workflow_step(implement);

    let review = WorkflowStep::new(StepId::from("review"), workflow_id, "review", 1);
    store.seed_workflow_step(review);

    Ok(())
}

/// Walks the launched session through a thinking update, a tool call,
/// and a completion — the same shapes `StreamMultiplexer` sees from a
/// real agent process.
async fn stream_turn(
    service: &Service,
    task_id: &TaskId,
    session_id: &SessionId,
    agent_execution_id: &AgentExecutionId,
) -> anyhow::Result<()> {
    let ctx = Ctx::new();

    let events = [
        StreamEventData::ThinkingStreaming {
            message_id: None,
            is_append: false,
            text: "reading the diff".to_string(),
        },
        StreamEventData::ToolCall {
            tool_call_id: "tool-1".to_string(),
            tool_status: "running".to_string(),
            text: "git log --oneline -20".to_string(),
            parent_tool_call_id: None,
        },
        StreamEventData::ToolUpdate {
            tool_call_id: "tool-1".to_string(),
            tool_status: "complete".to_string(),
            parent_tool_call_id: None,
        },
        StreamEventData::Complete {
            acp_session_id: Some("acp-demo-1".to_string()),
            resume_token: Some("resume-demo-1".to_string()),
        },
    ];

    for data in events {
        tracing::info!(?data, "streaming agent event");
        service.dispatcher().dispatch_agent_stream_event(
            AgentStreamEvent {
                task_id: task_id.clone(),
                session_id: session_id.clone(),
                agent_id: agent_execution_id.clone(),
                data: serde_json::to_value(data)?,
            },
            &ctx,
        );
    }

    // Each dispatch hands its event to its own detached background task;
    // wait for the `on_turn_complete` workflow transition the final
    // `Complete` event triggers before printing the post-turn state.
    let review_step = StepId::from("review");
    for _ in 0..200 {
        if let Some(session) = service.store().get_session(session_id).await? {
            if session.workflow_step_id.as_ref() == Some(&review_step) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    Ok(())
}

/// Simulates a previous process instance that crashed mid-turn: a
/// session stuck `RUNNING` with a resumable `ExecutorRunning` row, and
/// its task still `IN_PROGRESS`. `reconcile` is what a freshly started
/// backend runs before accepting any new work.
async fn seed_crashed_session(store: &InMemoryStore) -> anyhow::Result<()> {
    let task_id = TaskId::from("recovered-task");
    let session_id = SessionId::from("recovered-session");

    let mut task = Task::new(task_id.clone(), "finish the migration", 5);
    task.state = TaskState::InProgress;
    store.create_task(task).await?;

    let mut session = Session::new(
        session_id.clone(),
        task_id.clone(),
        AgentProfileId::from("demo-profile"),
        ExecutorId::from("local"),
    );
    session.state = SessionState::Running;
    store.create_session(session).await?;

    store
        .upsert_executor_running(ExecutorRunning {
            session_id: session_id.clone(),
            task_id,
            executor_id: ExecutorId::from("local"),
            status: "running".to_string(),
            resumable: true,
            resume_token: Some("resume-recovered-1".to_string()),
            agent_execution_id: AgentExecutionId::from("recovered-exec"),
            container_id: None,
            worktrees: vec![],
            updated_at: chrono::Utc::now(),
        })
        .await?;

    tracing::info!(%session_id, "seeded a crashed session for the reconciliation pass");
    Ok(())
}
