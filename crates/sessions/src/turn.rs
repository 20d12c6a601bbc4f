//! Opens and closes the per-session "turn" that streamed messages are
//! grouped under.
//!
//! Per Open Question 2: the same turn-id is implicitly reused across
//! several message creations after a `complete` event closes the turn.
//! Treat the turn as closed the moment `close_active` returns and start
//! a new one lazily on the next streaming event via `current_or_open` —
//! that's exactly what the stream multiplexer does.

use ao_domain::error::Result;
use ao_domain::model::{SessionId, Turn};
use ao_store::Store;

#[derive(Default)]
pub struct TurnManager;

impl TurnManager {
    pub fn new() -> Self {
        Self
    }

    /// Opens a new turn for the session. Self-heals the turn-singleton
    /// invariant (§8 invariant 6) by closing any existing active turn
    /// first — callers are expected to close before opening, but a
    /// crash or a missed `complete` event can leave one dangling.
    pub async fn open_turn(&self, store: &dyn Store, session_id: SessionId) -> Result<Turn> {
        if let Some(existing) = store.active_turn(&session_id).await? {
            store.close_turn(&existing.id).await?;
        }
        let turn = Turn::open(session_id);
        store.open_turn(turn.clone()).await?;
        Ok(turn)
    }

    pub async fn close_active(&self, store: &dyn Store, session_id: &SessionId) -> Result<()> {
        if let Some(active) = store.active_turn(session_id).await? {
            store.close_turn(&active.id).await?;
        }
        Ok(())
    }

    /// Returns the session's active turn, lazily opening one if none is
    /// active — used by the stream multiplexer on the first streaming
    /// event after a prior `complete` closed the turn.
    pub async fn current_or_open(&self, store: &dyn Store, session_id: SessionId) -> Result<Turn> {
        if let Some(active) = store.active_turn(&session_id).await? {
            return Ok(active);
        }
        self.open_turn(store, session_id).await
    }
}
