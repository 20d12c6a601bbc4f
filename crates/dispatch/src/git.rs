//! Tracks which sessions have a push outstanding, so a `git_event`
//! arriving for a session nobody asked to push can be told apart from
//! one that closes the loop on a snapshot the executor just requested.
//!
//! A `parking_lot::Mutex<HashMap<SessionId, u32>>` compare-and-remove
//! map — no `DashMap`, matching the rest of this crate's concurrency
//! primitives.

use std::collections::HashMap;

use parking_lot::Mutex;

use ao_domain::model::SessionId;

#[derive(Default)]
pub struct PushTracker {
    awaiting: Mutex<HashMap<SessionId, u32>>,
}

impl PushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call before issuing a snapshot/commit that is expected to end in
    /// a push. Counts stack: a session mid-flight on two snapshots at
    /// once needs two observed pushes before it's considered caught up.
    pub fn mark_awaiting(&self, session_id: SessionId) {
        *self.awaiting.lock().entry(session_id).or_insert(0) += 1;
    }

    /// Compare-and-remove: consumes one outstanding expectation if any,
    /// returning whether this push was one the tracker was waiting for.
    pub fn observe_push(&self, session_id: &SessionId) -> bool {
        let mut awaiting = self.awaiting.lock();
        let Some(count) = awaiting.get_mut(session_id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            awaiting.remove(session_id);
        }
        true
    }

    pub fn is_awaiting(&self, session_id: &SessionId) -> bool {
        self.awaiting.lock().contains_key(session_id)
    }

    pub fn tracked_session_count(&self) -> usize {
        self.awaiting.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_push_is_not_observed() {
        let tracker = PushTracker::new();
        assert!(!tracker.observe_push(&SessionId::from("s1")));
    }

    #[test]
    fn marked_push_is_observed_once_and_then_forgotten() {
        let tracker = PushTracker::new();
        let session = SessionId::from("s1");
        tracker.mark_awaiting(session.clone());
        assert!(tracker.observe_push(&session));
        assert!(!tracker.is_awaiting(&session));
        assert!(!tracker.observe_push(&session));
    }

    #[test]
    fn stacked_marks_require_matching_observed_pushes() {
        let tracker = PushTracker::new();
        let session = SessionId::from("s1");
        tracker.mark_awaiting(session.clone());
        tracker.mark_awaiting(session.clone());
        assert!(tracker.observe_push(&session));
        assert!(tracker.is_awaiting(&session));
        assert!(tracker.observe_push(&session));
        assert!(!tracker.is_awaiting(&session));
    }

    #[test]
    fn entries_are_removed_once_fully_drained() {
        let tracker = PushTracker::new();
        tracker.mark_awaiting(SessionId::from("s1"));
        tracker.mark_awaiting(SessionId::from("s2"));
        assert_eq!(tracker.tracked_session_count(), 2);
        tracker.observe_push(&SessionId::from("s1"));
        assert_eq!(tracker.tracked_session_count(), 1);
    }
}
