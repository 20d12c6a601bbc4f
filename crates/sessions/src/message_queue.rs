//! At-most-one queued follow-up prompt per session.
//!
//! A single `parking_lot::Mutex`-guarded `HashMap`, not a store
//! round-trip, matching the other small in-memory locks guarding shared
//! state elsewhere in the orchestrator (queue heap, `ExecutorRunning`
//! cache).

use std::collections::HashMap;

use parking_lot::Mutex;

use ao_domain::model::{QueuedMessage, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueued;

impl std::fmt::Display for MessageQueued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a message is already queued for this session")
    }
}

impl std::error::Error for MessageQueued {}

#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub is_queued: bool,
    pub message: Option<QueuedMessage>,
}

/// Tracks queued messages across all sessions. Not durable — the store
/// is the source of truth across restarts; this is the fast path the
/// `on_agent_ready` drain consults first.
#[derive(Default)]
pub struct SessionMessageQueue {
    queued: Mutex<HashMap<SessionId, QueuedMessage>>,
}

impl SessionMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects if a message is already queued for the session.
    pub fn queue_message(&self, message: QueuedMessage) -> Result<(), MessageQueued> {
        let mut queued = self.queued.lock();
        if queued.contains_key(&message.session_id) {
            return Err(MessageQueued);
        }
        queued.insert(message.session_id.clone(), message);
        Ok(())
    }

    pub fn cancel(&self, session_id: &SessionId) -> bool {
        self.queued.lock().remove(session_id).is_some()
    }

    pub fn update_content(&self, session_id: &SessionId, content: impl Into<String>) -> bool {
        let mut queued = self.queued.lock();
        if let Some(entry) = queued.get_mut(session_id) {
            entry.content = content.into();
            true
        } else {
            false
        }
    }

    pub fn status(&self, session_id: &SessionId) -> QueueStatus {
        let message = self.queued.lock().get(session_id).cloned();
        QueueStatus {
            is_queued: message.is_some(),
            message,
        }
    }

    /// Takes the queued message for draining (removes it). The caller is
    /// expected to re-queue via `queue_message` on a transient drain
    /// failure to preserve user intent.
    pub fn take(&self, session_id: &SessionId) -> Option<QueuedMessage> {
        self.queued.lock().remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_domain::model::TaskId;

    fn msg(session: &str) -> QueuedMessage {
        QueuedMessage::new(SessionId::from(session), TaskId::from("t1"), "hello")
    }

    #[test]
    fn at_most_one_queued_message_per_session() {
        let q = SessionMessageQueue::new();
        q.queue_message(msg("s1")).unwrap();
        assert_eq!(q.queue_message(msg("s1")), Err(MessageQueued));
    }

    #[test]
    fn different_sessions_queue_independently() {
        let q = SessionMessageQueue::new();
        q.queue_message(msg("s1")).unwrap();
        q.queue_message(msg("s2")).unwrap();
        assert!(q.status(&SessionId::from("s1")).is_queued);
        assert!(q.status(&SessionId::from("s2")).is_queued);
    }

    #[test]
    fn cancel_allows_requeue() {
        let q = SessionMessageQueue::new();
        let sid = SessionId::from("s1");
        q.queue_message(msg("s1")).unwrap();
        assert!(q.cancel(&sid));
        q.queue_message(msg("s1")).unwrap();
    }

    #[test]
    fn take_removes_and_permits_requeue_on_transient_failure() {
        let q = SessionMessageQueue::new();
        let sid = SessionId::from("s1");
        q.queue_message(msg("s1")).unwrap();

        let taken = q.take(&sid).unwrap();
        assert!(!q.status(&sid).is_queued);

        // Simulate transient drain failure: re-queue to preserve intent.
        q.queue_message(taken).unwrap();
        assert!(q.status(&sid).is_queued);
    }

    #[test]
    fn update_content_on_absent_queue_returns_false() {
        let q = SessionMessageQueue::new();
        assert!(!q.update_content(&SessionId::from("ghost"), "x"));
    }
}
