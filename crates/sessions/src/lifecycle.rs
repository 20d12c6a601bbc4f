//! The session state machine: a single guarded mutator enforcing legal
//! transitions and producing the `session_state_changed` bus event.

use ao_domain::model::{AgentProfileId, Session, SessionId, SessionState, StepId, TaskId};

/// Payload for the `task_session_state_changed` bus event. The snapshot
/// and step fields travel with the event so a subscriber can stay
/// consistent without a follow-up query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateChanged {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub error_message: Option<String>,
    pub agent_profile_id: AgentProfileId,
    pub is_passthrough: bool,
    pub review_status: Option<String>,
    pub workflow_step_id: Option<StepId>,
}

fn is_terminal(state: SessionState) -> bool {
    state.is_terminal()
}

/// Applies `next_state` to `session` in place, following a fixed guard
/// order: terminal states never transition, same-state is a no-op, and
/// waking a `WAITING_FOR_INPUT` session into `RUNNING` requires the
/// caller to assert `allow_wake_from_waiting`.
///
/// Returns the event to publish, or `None` if the guard dropped the
/// transition (both cases are legitimate outcomes, not errors).
pub fn update_session_state(
    session: &mut Session,
    next_state: SessionState,
    error_message: Option<String>,
    allow_wake_from_waiting: bool,
) -> Option<SessionStateChanged> {
    let old_state = session.state;

    if is_terminal(old_state) {
        return None;
    }
    if old_state == next_state {
        return None;
    }
    if old_state == SessionState::WaitingForInput
        && next_state == SessionState::Running
        && !allow_wake_from_waiting
    {
        return None;
    }

    session.state = next_state;
    session.updated_at = chrono::Utc::now();

    Some(SessionStateChanged {
        task_id: session.task_id.clone(),
        session_id: session.id.clone(),
        old_state,
        new_state: next_state,
        error_message,
        agent_profile_id: session.agent_profile_id.clone(),
        is_passthrough: session.is_passthrough,
        review_status: session.review_status.clone(),
        workflow_step_id: session.workflow_step_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_domain::model::ExecutorId;

    fn new_session() -> Session {
        Session::new(
            SessionId::from("s1"),
            TaskId::from("t1"),
            AgentProfileId::from("p1"),
            ExecutorId::from("e1"),
        )
    }

    #[test]
    fn terminal_state_drops_further_transitions() {
        let mut session = new_session();
        session.state = SessionState::Completed;
        let event = update_session_state(&mut session, SessionState::Running, None, true);
        assert!(event.is_none());
        assert_eq!(session.state, SessionState::Completed);
    }

    #[test]
    fn same_state_is_a_no_op() {
        let mut session = new_session();
        session.state = SessionState::Running;
        let event = update_session_state(&mut session, SessionState::Running, None, false);
        assert!(event.is_none());
    }

    #[test]
    fn waking_from_waiting_requires_explicit_flag() {
        let mut session = new_session();
        session.state = SessionState::WaitingForInput;

        let dropped = update_session_state(&mut session, SessionState::Running, None, false);
        assert!(dropped.is_none());
        assert_eq!(session.state, SessionState::WaitingForInput);

        let applied = update_session_state(&mut session, SessionState::Running, None, true);
        assert!(applied.is_some());
        assert_eq!(session.state, SessionState::Running);
    }

    #[test]
    fn legal_transition_emits_event_with_snapshot_fields() {
        let mut session = new_session();
        session.review_status = Some("pending".to_string());
        session.workflow_step_id = Some(StepId::from("step-1"));

        let event = update_session_state(
            &mut session,
            SessionState::Failed,
            Some("boom".to_string()),
            false,
        )
        .unwrap();

        assert_eq!(event.old_state, SessionState::Created);
        assert_eq!(event.new_state, SessionState::Failed);
        assert_eq!(event.error_message.as_deref(), Some("boom"));
        assert_eq!(event.review_status.as_deref(), Some("pending"));
        assert_eq!(event.workflow_step_id, Some(StepId::from("step-1")));
    }

    #[test]
    fn once_terminal_no_further_event_ever_fires() {
        let mut session = new_session();
        update_session_state(&mut session, SessionState::Cancelled, None, false);
        assert!(session.state.is_terminal());

        for target in [
            SessionState::Running,
            SessionState::WaitingForInput,
            SessionState::Failed,
            SessionState::Completed,
        ] {
            assert!(update_session_state(&mut session, target, None, true).is_none());
        }
    }
}
