//! Demultiplexes bus-drained events into a fixed set of named callback
//! slots. A concrete struct with named `Option<Callback<_>>` fields,
//! not a generic pub/sub registry — callers register at startup with
//! the `on_*` builder methods and the watcher loop calls `dispatch_*`
//! as events arrive.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ao_domain::detach::Ctx;
use ao_domain::model::{AgentExecutionId, SessionId, StepId, TaskId, TaskState};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type Callback<P> = Arc<dyn Fn(P, Ctx) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskStateChanged {
    pub task_id: TaskId,
    pub old_state: TaskState,
    pub new_state: TaskState,
}

#[derive(Debug, Clone)]
pub struct AgentReady {
    pub session_id: SessionId,
    pub agent_execution_id: AgentExecutionId,
}

#[derive(Debug, Clone)]
pub struct AgentCompleted {
    pub session_id: SessionId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone)]
pub struct AgentFailed {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AgentStreamEvent {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub agent_id: AgentExecutionId,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct AcpSessionCreated {
    pub session_id: SessionId,
    pub acp_session_id: String,
}

#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub pending_id: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct GitEvent {
    pub session_id: SessionId,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ContextWindowUpdated {
    pub session_id: SessionId,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub struct TaskMoved {
    pub task_id: TaskId,
    pub to_step_id: Option<StepId>,
}

#[derive(Debug, Clone)]
pub struct PrFeedback {
    pub task_id: TaskId,
    pub pr_number: u64,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub struct NewReviewPr {
    pub task_id: TaskId,
    pub pr_number: u64,
    pub url: String,
}

macro_rules! slot {
    ($field:ident, $setter:ident, $dispatch:ident, $payload:ty) => {
        pub fn $setter(
            mut self,
            f: impl Fn($payload, Ctx) -> BoxFuture<'static, ()> + Send + Sync + 'static,
        ) -> Self {
            self.$field = Some(Arc::new(f));
            self
        }

        /// Fires the registered callback, if any, on a detached
        /// background task so the watcher thread never blocks on it.
        pub fn $dispatch(&self, payload: $payload, ctx: &Ctx) {
            let Some(cb) = self.$field.clone() else {
                return;
            };
            let detached = ctx.detach();
            tokio::spawn(async move {
                cb(payload, detached).await;
            });
        }
    };
}

#[derive(Default)]
pub struct EventDispatcher {
    on_task_state_changed: Option<Callback<TaskStateChanged>>,
    on_agent_ready: Option<Callback<AgentReady>>,
    on_agent_completed: Option<Callback<AgentCompleted>>,
    on_agent_failed: Option<Callback<AgentFailed>>,
    on_agent_stream_event: Option<Callback<AgentStreamEvent>>,
    on_acp_session_created: Option<Callback<AcpSessionCreated>>,
    on_permission_request: Option<Callback<PermissionRequest>>,
    on_git_event: Option<Callback<GitEvent>>,
    on_context_window_updated: Option<Callback<ContextWindowUpdated>>,
    on_task_moved: Option<Callback<TaskMoved>>,
    on_pr_feedback: Option<Callback<PrFeedback>>,
    on_new_review_pr: Option<Callback<NewReviewPr>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    slot!(
        on_task_state_changed,
        with_on_task_state_changed,
        dispatch_task_state_changed,
        TaskStateChanged
    );
    slot!(on_agent_ready, with_on_agent_ready, dispatch_agent_ready, AgentReady);
    slot!(
        on_agent_completed,
        with_on_agent_completed,
        dispatch_agent_completed,
        AgentCompleted
    );
    slot!(on_agent_failed, with_on_agent_failed, dispatch_agent_failed, AgentFailed);
    slot!(
        on_agent_stream_event,
        with_on_agent_stream_event,
        dispatch_agent_stream_event,
        AgentStreamEvent
    );
    slot!(
        on_acp_session_created,
        with_on_acp_session_created,
        dispatch_acp_session_created,
        AcpSessionCreated
    );
    slot!(
        on_permission_request,
        with_on_permission_request,
        dispatch_permission_request,
        PermissionRequest
    );
    slot!(on_git_event, with_on_git_event, dispatch_git_event, GitEvent);
    slot!(
        on_context_window_updated,
        with_on_context_window_updated,
        dispatch_context_window_updated,
        ContextWindowUpdated
    );
    slot!(on_task_moved, with_on_task_moved, dispatch_task_moved, TaskMoved);
    slot!(on_pr_feedback, with_on_pr_feedback, dispatch_pr_feedback, PrFeedback);
    slot!(
        on_new_review_pr,
        with_on_new_review_pr,
        dispatch_new_review_pr,
        NewReviewPr
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn dispatch_with_no_registered_callback_is_a_silent_no_op() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch_agent_ready(
            AgentReady {
                session_id: SessionId::from("s1"),
                agent_execution_id: AgentExecutionId::from("a1"),
            },
            &Ctx::new(),
        );
        // Nothing to assert beyond "did not panic"; there's no callback.
    }

    #[tokio::test]
    async fn dispatch_runs_the_registered_callback_detached() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = fired.clone();
        let dispatcher = EventDispatcher::new().with_on_agent_failed(move |payload, _ctx| {
            let fired = fired_cb.clone();
            Box::pin(async move {
                assert_eq!(payload.reason, "boom");
                fired.store(true, Ordering::SeqCst);
            })
        });

        let ctx = Ctx::new();
        dispatcher.dispatch_agent_failed(
            AgentFailed {
                session_id: SessionId::from("s1"),
                task_id: TaskId::from("t1"),
                reason: "boom".to_string(),
            },
            &ctx,
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dispatch_is_detached_from_caller_cancellation() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = fired.clone();
        let dispatcher = EventDispatcher::new().with_on_git_event(move |_payload, ctx| {
            let fired = fired_cb.clone();
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                if !ctx.is_stopped() {
                    fired.store(true, Ordering::SeqCst);
                }
            })
        });

        let ctx = Ctx::new();
        dispatcher.dispatch_git_event(
            GitEvent {
                session_id: SessionId::from("s1"),
                kind: "push".to_string(),
                detail: String::new(),
            },
            &ctx,
        );
        ctx.stop(); // the caller's own context cancels immediately...

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(fired.load(Ordering::SeqCst), "...but the detached task runs anyway");
    }
}
