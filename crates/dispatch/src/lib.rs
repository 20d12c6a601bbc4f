//! Fans bus-drained events out to named callback slots (`dispatcher`),
//! dispatches agent stream events by type into store writes and bus
//! publishes (`stream`), and hosts the pub/sub collaborator (`bus`)
//! plus the push-detection tracker (`git`) the git-event handlers rely
//! on.

pub mod bus;
pub mod dispatcher;
pub mod git;
pub mod stream;

pub use bus::{Bus, InMemoryBus};
pub use dispatcher::{
    AcpSessionCreated, AgentCompleted, AgentFailed, AgentReady, AgentStreamEvent, BoxFuture,
    ContextWindowUpdated, EventDispatcher, GitEvent, NewReviewPr, PermissionRequest, PrFeedback,
    TaskMoved, TaskStateChanged,
};
pub use git::PushTracker;
pub use stream::{StreamEvent, StreamEventData, StreamMultiplexer};
