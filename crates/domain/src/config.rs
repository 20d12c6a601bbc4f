//! Runtime configuration, loaded from TOML by `ao-cli` and validated
//! before anything else starts. Every field has a default so a missing
//! config file still produces a usable `Config`.

use serde::{Deserialize, Serialize};

fn d_max_concurrent() -> usize {
    4
}

fn d_queue_max_size() -> usize {
    0
}

fn d_retry_max_attempts() -> u32 {
    3
}

fn d_retry_base_delay_ms() -> u64 {
    500
}

fn d_retry_max_delay_ms() -> u64 {
    30_000
}

fn d_git_fetch_timeout_sec() -> u64 {
    8
}

fn d_git_pull_timeout_sec() -> u64 {
    8
}

fn d_log_level() -> String {
    "info".to_string()
}

fn d_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Scheduler-facing knobs: how many tasks may execute at once and how
/// big the pending queue is allowed to grow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "d_queue_max_size")]
    pub queue_max_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: d_max_concurrent(),
            queue_max_size: d_queue_max_size(),
        }
    }
}

/// Bounded retry/backoff policy applied by the scheduler when a task
/// fails and is eligible for another attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "d_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "d_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "d_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: d_retry_max_attempts(),
            base_delay_ms: d_retry_base_delay_ms(),
            max_delay_ms: d_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff, capped at `max_delay_ms`. `attempt` is
    /// 1-indexed (the first retry passes `1`).
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << shift);
        scaled.min(self.max_delay_ms)
    }
}

/// Context-timeout budget for the git operations a worktree setup runs
/// before an agent can start (spec default: 8s each).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitTimeoutConfig {
    #[serde(default = "d_git_fetch_timeout_sec")]
    pub fetch_timeout_sec: u64,

    #[serde(default = "d_git_pull_timeout_sec")]
    pub pull_timeout_sec: u64,
}

impl Default for GitTimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_sec: d_git_fetch_timeout_sec(),
            pull_timeout_sec: d_git_pull_timeout_sec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservabilityConfig {
    #[serde(default = "d_log_level")]
    pub log_level: String,

    #[serde(default = "d_log_format")]
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: d_log_level(),
            log_format: d_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub git_timeouts: GitTimeoutConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Warning => "warning",
            ConfigSeverity::Error => "error",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> crate::error::Result<Self> {
        toml::from_str(s).map_err(|e| crate::error::Error::Config(e.to_string()))
    }

    /// Checks internal consistency. Errors mean the config must not be
    /// used to start the service; warnings are logged and ignored.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        if self.scheduler.max_concurrent == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "scheduler.max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.scheduler.max_concurrent > 256 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "scheduler.max_concurrent".to_string(),
                message: "unusually high concurrency cap".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "retry.max_attempts".to_string(),
                message: "tasks will never be retried".to_string(),
            });
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "retry.base_delay_ms".to_string(),
                message: "base_delay_ms must not exceed max_delay_ms".to_string(),
            });
        }

        if self.git_timeouts.fetch_timeout_sec == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "git_timeouts.fetch_timeout_sec".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.git_timeouts.pull_timeout_sec == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "git_timeouts.pull_timeout_sec".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigError]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(!Config::has_errors(&issues));
    }

    #[test]
    fn zero_concurrency_is_an_error() {
        let mut cfg = Config::default();
        cfg.scheduler.max_concurrent = 0;
        let issues = cfg.validate();
        assert!(Config::has_errors(&issues));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(retry.backoff_for_attempt(1), 100);
        assert_eq!(retry.backoff_for_attempt(2), 200);
        assert_eq!(retry.backoff_for_attempt(3), 400);
        assert_eq!(retry.backoff_for_attempt(10), 1000);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = Config::from_toml_str("[scheduler]\nmax_concurrent = 8\n").unwrap();
        assert_eq!(cfg.scheduler.max_concurrent, 8);
        assert_eq!(cfg.scheduler.queue_max_size, 0);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn base_delay_above_max_is_an_error() {
        let mut cfg = Config::default();
        cfg.retry.base_delay_ms = 5000;
        cfg.retry.max_delay_ms = 1000;
        assert!(Config::has_errors(&cfg.validate()));
    }
}
