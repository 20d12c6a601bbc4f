//! Session lifecycle: the state machine, the per-session message
//! queue, and the turn manager.

pub mod lifecycle;
pub mod message_queue;
pub mod turn;

pub use lifecycle::{update_session_state, SessionStateChanged};
pub use message_queue::{MessageQueued, QueueStatus, SessionMessageQueue};
pub use turn::TurnManager;
