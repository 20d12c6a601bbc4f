//! The workflow engine: compiles a [`WorkflowStep`]'s four action lists
//! and evaluates them against a session on lifecycle events.
//!
//! Per the cyclic-collaborator note in the design: the engine never
//! imports the concrete Service or Executor. It takes narrow capability
//! traits ([`AgentManagerClient`], [`WorkflowStepGetter`],
//! [`TransitionStore`], [`PromptEnqueuer`], [`PromptIssuer`]) bundled
//! into a [`Collaborators`] struct supplied by the caller at each
//! evaluation — breaking the Executor/workflow/Service cycle without a
//! generic pub/sub layer.

pub mod action;
pub mod collaborators;
pub mod engine;

pub use action::EvalOutcome;
pub use collaborators::{
    AgentManagerClient, Collaborators, PromptEnqueuer, PromptIssuer, TransitionStore,
    WorkflowStepGetter,
};
pub use engine::Engine;
