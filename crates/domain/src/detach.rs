//! Cancellation-independent context for background work that must
//! outlive the caller that triggered it (a client disconnect must not
//! abort a running agent prompt).
//!
//! `Ctx` carries a value bag plus a [`CancelToken`]-style stop signal.
//! `detach` produces a new `Ctx` that keeps the values but replaces the
//! stop signal with a fresh one — the detached context is unaffected by
//! the original caller's cancellation, but can still be stopped
//! explicitly (e.g. a later `StopSession`/`StopTask` call).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Clone, Default)]
pub struct Ctx {
    values: Arc<HashMap<String, serde_json::Value>>,
    stop: CancelToken,
}

impl Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value);
        self
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn stop_token(&self) -> &CancelToken {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop this specific context (and anything downstream of it holding
    /// the same token). Does not affect contexts it was detached from.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Inherits values, drops the inherited cancellation. The returned
    /// context must still respect an explicit `stop()` of its own.
    pub fn detach(&self) -> Self {
        Self {
            values: self.values.clone(),
            stop: CancelToken::new(),
        }
    }
}
