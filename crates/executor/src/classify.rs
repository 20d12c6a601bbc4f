//! Pattern-matched classification of agent-manager error text: transient
//! prompt failures and resume failures are recovered from; everything
//! else is fatal.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// `agent stream disconnected` / `use of closed network connection`
    /// (case-insensitive): restore the session's prior state and
    /// re-queue the prompt if it was drained from the message queue.
    Transient,
    /// `no conversation found` (case-insensitive): the agent side has
    /// forgotten the session; mark it failed and clear `ExecutorRunning`.
    ResumeFailure,
    /// Anything else: session -> FAILED with the message persisted.
    Fatal,
}

const TRANSIENT_PATTERNS: &[&str] = ["agent stream disconnected", "use of closed network connection"].as_slice();
const RESUME_FAILURE_PATTERNS: &[&str] = ["no conversation found"].as_slice();

pub fn classify_prompt_error(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if RESUME_FAILURE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureClass::ResumeFailure;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureClass::Transient;
    }
    FailureClass::Fatal
}
