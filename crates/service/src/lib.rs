//! Owns one queue, one scheduler, one executor, one dispatcher, and one
//! workflow engine, and exposes the single `LaunchSession` entry point
//! (plus its pass-through siblings) that every adapter — WS façade,
//! HTTP handler, the demo CLI — actually calls.

pub mod intent;
pub mod service;

pub use intent::{LaunchIntent, LaunchSessionRequest, LaunchSessionResponse};
pub use service::{ReconcileReport, Service};
