//! Error types for script-jobs.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job-related errors.
///
/// `LaunchFailed`, `ProcessFailed`, `TimedOut` and `ResultExtraction` are
/// produced inside a worker after `submit_job` has returned; their rendered
/// message is what ends up in the job record's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {state}, cannot {action}")]
    InvalidState {
        id: Uuid,
        state: String,
        action: String,
    },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Failed to launch {program}: {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("Process {}: {tail}", describe_exit(.code, .signal))]
    ProcessFailed {
        code: Option<i32>,
        signal: Option<i32>,
        tail: String,
    },

    #[error("Process timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Result extraction failed: {reason}")]
    ResultExtraction { reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "terminated abnormally".to_string(),
    }
}
