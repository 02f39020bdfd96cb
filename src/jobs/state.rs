//! Job state machine.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is registered but its process has not been spawned.
    Pending,
    /// Process is alive and being supervised.
    Running,
    /// Process exited with code 0 and a result was recorded.
    Completed,
    /// Launch failed, or the process exited non-zero or by signal.
    Failed,
    /// Job was cancelled before start or its process was terminated on request.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending (Failed = launch failure)
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(JobError::InvalidRequest(format!(
                "unknown job status `{other}` (expected pending, running, completed, failed or cancelled)"
            ))),
        }
    }
}

/// Ordered `--key value` pairs handed to the script. An empty value is a boolean flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptArgs(Vec<(String, String)>);

impl ScriptArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flag with a value.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// Append a boolean flag.
    pub fn flag(self, key: impl Into<String>) -> Self {
        self.arg(key, "")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K, V> FromIterator<(K, V)> for ScriptArgs
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous status.
    pub from: JobStatus,
    /// New status.
    pub to: JobStatus,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}

/// One tracked invocation of an external script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID.
    pub id: Uuid,
    /// Optional human label.
    pub name: Option<String>,
    /// Executable or script to launch.
    pub script_path: PathBuf,
    /// Arguments, rendered as `--key value` flags.
    pub args: ScriptArgs,
    /// Current status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the process was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Exit code, on `failed`/`cancelled` when the process exited normally.
    pub exit_code: Option<i32>,
    /// Failure or cancellation message.
    pub error: Option<String>,
    /// Extracted result, on `completed` only.
    pub result: Option<serde_json::Value>,
    /// A cancel was accepted while the process was running.
    pub cancel_requested: bool,
    /// State transition history.
    pub transitions: Vec<StateTransition>,
}

impl JobRecord {
    /// Create a new pending job.
    pub fn new(script_path: impl Into<PathBuf>, args: ScriptArgs, name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            script_path: script_path.into(),
            args,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error: None,
            result: None,
            cancel_requested: false,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new status, stamping `started_at`/`completed_at`.
    pub fn transition_to(
        &mut self,
        new_status: JobStatus,
        reason: Option<String>,
    ) -> Result<(), JobError> {
        if !self.status.can_transition_to(new_status) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        // Wall-clock steps backwards must not break submitted <= started <= completed.
        let floor = self.completed_at.or(self.started_at).unwrap_or(self.submitted_at);
        let now = Utc::now().max(floor);

        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: now,
            reason,
        });
        self.status = new_status;

        match new_status {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Pending => {}
        }

        Ok(())
    }

    /// Finish as `completed` with a result.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), JobError> {
        self.transition_to(JobStatus::Completed, None)?;
        self.result = Some(result);
        Ok(())
    }

    /// Finish as `failed`.
    pub fn fail(&mut self, exit_code: Option<i32>, error: impl Into<String>) -> Result<(), JobError> {
        let error = error.into();
        self.transition_to(JobStatus::Failed, Some(error.clone()))?;
        self.exit_code = exit_code;
        self.error = Some(error);
        Ok(())
    }

    /// Finish as `cancelled`.
    pub fn cancel(&mut self, exit_code: Option<i32>, reason: impl Into<String>) -> Result<(), JobError> {
        let reason = reason.into();
        self.transition_to(JobStatus::Cancelled, Some(reason.clone()))?;
        self.exit_code = exit_code;
        self.error = Some(reason);
        Ok(())
    }

    /// Label used in logs: the name if any, else the script file name.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.script_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.script_path.display().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new("/bin/true", ScriptArgs::new(), Some("test".to_string()))
    }

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for target in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Pending.is_active());
    }

    #[test]
    fn record_lifecycle_stamps_timestamps() {
        let mut job = record();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        job.transition_to(JobStatus::Running, None).unwrap();
        let started = job.started_at.unwrap();
        assert!(job.submitted_at <= started);

        job.complete(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(started <= job.completed_at.unwrap());
        assert!(job.exit_code.is_none());
        assert!(job.error.is_none());
        assert_eq!(job.transitions.len(), 2);
    }

    #[test]
    fn terminal_record_rejects_further_transitions() {
        let mut job = record();
        job.cancel(None, "Cancelled before start").unwrap();
        assert!(job.started_at.is_none());
        assert_eq!(job.error.as_deref(), Some("Cancelled before start"));

        let err = job.cancel(None, "again").unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn fail_records_exit_code() {
        let mut job = record();
        job.transition_to(JobStatus::Running, None).unwrap();
        job.fail(Some(2), "Process exited with code 2: nope").unwrap();
        assert_eq!(job.exit_code, Some(2));
        assert!(job.result.is_none());
    }

    #[test]
    fn status_parse_and_display() {
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(serde_json::to_string(&JobStatus::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn script_args_preserve_order() {
        let args = ScriptArgs::new()
            .arg("input", "a.txt")
            .flag("normalize")
            .arg("window-size", "12");
        let pairs: Vec<_> = args.iter().collect();
        assert_eq!(
            pairs,
            vec![("input", "a.txt"), ("normalize", ""), ("window-size", "12")]
        );
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn display_name_falls_back_to_file_name() {
        let job = JobRecord::new("/opt/scripts/search.py", ScriptArgs::new(), None);
        assert_eq!(job.display_name(), "search.py");
    }
}
