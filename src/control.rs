//! JSON control surface over a [`JobManager`].
//!
//! Each operation returns a serializable payload. Errors are never raised to
//! the caller; they become `{"status": "error", "kind": ..., "error": ...}`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::manager::{CancelOutcome, JobManager, JobResult};
use crate::jobs::state::{JobRecord, JobStatus, ScriptArgs};

/// Log lines returned when the caller gives no tail.
pub const DEFAULT_LOG_TAIL: usize = 50;

/// Payload of an operation: its success shape or a structured error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Ok(T),
    Err(ErrorReply),
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Reply::Ok(value) => Some(value),
            Reply::Err(_) => None,
        }
    }

    pub fn err(self) -> Option<ErrorReply> {
        match self {
            Reply::Ok(_) => None,
            Reply::Err(e) => Some(e),
        }
    }
}

impl<T> From<Result<T, JobError>> for Reply<T> {
    fn from(result: Result<T, JobError>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Err(ErrorReply::from(&e)),
        }
    }
}

/// Coarse error category exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidRequest,
    ProcessLaunchFailure,
    ProcessRuntimeFailure,
    InternalError,
}

impl From<&JobError> for ErrorKind {
    fn from(err: &JobError) -> Self {
        match err {
            JobError::NotFound { .. } => ErrorKind::NotFound,
            JobError::InvalidState { .. } | JobError::InvalidTransition { .. } => {
                ErrorKind::InvalidState
            }
            JobError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            JobError::LaunchFailed { .. } => ErrorKind::ProcessLaunchFailure,
            JobError::ProcessFailed { .. }
            | JobError::TimedOut { .. }
            | JobError::ResultExtraction { .. } => ErrorKind::ProcessRuntimeFailure,
            JobError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub status: &'static str,
    pub kind: ErrorKind,
    pub error: String,
}

impl From<&JobError> for ErrorReply {
    fn from(err: &JobError) -> Self {
        Self {
            status: "error",
            kind: ErrorKind::from(err),
            error: err.to_string(),
        }
    }
}

/// Submission as it arrives from a tool call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub script_path: PathBuf,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub job_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReply {
    pub status: &'static str,
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusReply {
    pub job_id: Uuid,
    pub name: Option<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobRecord> for JobStatusReply {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            status: job.status,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            exit_code: job.exit_code,
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResultReply {
    Completed {
        job_id: Uuid,
        result: Value,
    },
    NotReady {
        job_id: Uuid,
        current_status: JobStatus,
        message: String,
    },
    Failed {
        job_id: Uuid,
        current_status: JobStatus,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLogReply {
    pub job_id: Uuid,
    pub lines: Vec<String>,
    pub total_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelReply {
    pub status: &'static str,
    pub job_id: Uuid,
    pub message: String,
}

/// One row of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummaryView {
    pub job_id: Uuid,
    pub name: Option<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobSummaryView {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            status: job.status,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListReply {
    pub jobs: Vec<JobSummaryView>,
    pub total: usize,
}

/// One operation, as a JSON object tagged by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SubmitJob(SubmitRequest),
    GetJobStatus {
        job_id: String,
    },
    GetJobResult {
        job_id: String,
    },
    GetJobLog {
        job_id: String,
        #[serde(default)]
        tail: Option<usize>,
    },
    CancelJob {
        job_id: String,
    },
    ListJobs {
        #[serde(default)]
        status: Option<String>,
    },
}

/// Tool-facing wrapper around a shared manager.
#[derive(Clone)]
pub struct JobControl {
    manager: Arc<JobManager>,
}

impl JobControl {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub async fn submit_job(&self, request: SubmitRequest) -> Reply<SubmitReply> {
        self.try_submit_job(request).await.into()
    }

    pub async fn get_job_status(&self, job_id: &str) -> Reply<JobStatusReply> {
        self.try_get_job_status(job_id).await.into()
    }

    pub async fn get_job_result(&self, job_id: &str) -> Reply<JobResultReply> {
        self.try_get_job_result(job_id).await.into()
    }

    /// Last `tail` lines of the log; [`DEFAULT_LOG_TAIL`] when `None`, everything when 0.
    pub async fn get_job_log(&self, job_id: &str, tail: Option<usize>) -> Reply<JobLogReply> {
        self.try_get_job_log(job_id, tail).await.into()
    }

    pub async fn cancel_job(&self, job_id: &str) -> Reply<CancelReply> {
        self.try_cancel_job(job_id).await.into()
    }

    /// List jobs, optionally filtered by a status name.
    pub async fn list_jobs(&self, status: Option<&str>) -> Reply<ListReply> {
        self.try_list_jobs(status).await.into()
    }

    /// Run one JSON request and return the JSON reply.
    pub async fn dispatch(&self, raw: &str) -> Value {
        let request: Request = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                let err = JobError::InvalidRequest(format!("malformed request: {e}"));
                return to_json(Reply::<()>::from(Err(err)));
            }
        };

        match request {
            Request::SubmitJob(request) => to_json(self.submit_job(request).await),
            Request::GetJobStatus { job_id } => to_json(self.get_job_status(&job_id).await),
            Request::GetJobResult { job_id } => to_json(self.get_job_result(&job_id).await),
            Request::GetJobLog { job_id, tail } => to_json(self.get_job_log(&job_id, tail).await),
            Request::CancelJob { job_id } => to_json(self.cancel_job(&job_id).await),
            Request::ListJobs { status } => to_json(self.list_jobs(status.as_deref()).await),
        }
    }

    async fn try_submit_job(&self, request: SubmitRequest) -> Result<SubmitReply, JobError> {
        let args = script_args(&request.args)?;
        let job_id = self
            .manager
            .submit_job(request.script_path, args, request.job_name)
            .await?;
        Ok(SubmitReply {
            status: "submitted",
            job_id,
            message: format!("Job {job_id} submitted. Use get_job_status to check progress."),
        })
    }

    async fn try_get_job_status(&self, job_id: &str) -> Result<JobStatusReply, JobError> {
        let job = self.manager.get_job_status(parse_job_id(job_id)?).await?;
        Ok(JobStatusReply::from(&job))
    }

    async fn try_get_job_result(&self, job_id: &str) -> Result<JobResultReply, JobError> {
        let id = parse_job_id(job_id)?;
        Ok(match self.manager.get_job_result(id).await? {
            JobResult::Completed(result) => JobResultReply::Completed { job_id: id, result },
            JobResult::NotReady(status) => JobResultReply::NotReady {
                job_id: id,
                current_status: status,
                message: format!("Job is {status}. Results are available once it completes."),
            },
            JobResult::Failed { status, error } => JobResultReply::Failed {
                job_id: id,
                current_status: status,
                error,
            },
        })
    }

    async fn try_get_job_log(
        &self,
        job_id: &str,
        tail: Option<usize>,
    ) -> Result<JobLogReply, JobError> {
        let id = parse_job_id(job_id)?;
        let tail = self
            .manager
            .get_job_log(id, tail.unwrap_or(DEFAULT_LOG_TAIL))
            .await?;
        Ok(JobLogReply {
            job_id: id,
            lines: tail.lines,
            total_lines: tail.total_lines,
        })
    }

    async fn try_cancel_job(&self, job_id: &str) -> Result<CancelReply, JobError> {
        let id = parse_job_id(job_id)?;
        let message = match self.manager.cancel_job(id).await? {
            CancelOutcome::CancelledBeforeStart => format!("Job {id} cancelled before start"),
            CancelOutcome::TerminationRequested => format!("Job {id} is being terminated"),
        };
        Ok(CancelReply {
            status: "success",
            job_id: id,
            message,
        })
    }

    async fn try_list_jobs(&self, status: Option<&str>) -> Result<ListReply, JobError> {
        let filter = status.map(str::parse::<JobStatus>).transpose()?;
        let jobs: Vec<JobSummaryView> = self
            .manager
            .list_jobs(filter)
            .await
            .iter()
            .map(JobSummaryView::from)
            .collect();
        Ok(ListReply {
            total: jobs.len(),
            jobs,
        })
    }
}

fn to_json<T: Serialize>(reply: Reply<T>) -> Value {
    serde_json::to_value(reply).unwrap_or_else(|e| {
        json!({
            "status": "error",
            "kind": ErrorKind::InternalError,
            "error": format!("failed to encode reply: {e}"),
        })
    })
}

fn parse_job_id(raw: &str) -> Result<Uuid, JobError> {
    raw.trim()
        .parse()
        .map_err(|_| JobError::InvalidRequest(format!("`{raw}` is not a valid job id")))
}

/// Convert a loose JSON argument map into script flags.
///
/// Strings pass through, numbers are stringified, `true` is a bare flag,
/// `false` and `null` drop the flag. Arrays of scalars are comma-joined.
pub fn script_args(args: &Map<String, Value>) -> Result<ScriptArgs, JobError> {
    let mut out = ScriptArgs::new();
    for (key, value) in args {
        out = match value {
            Value::Null | Value::Bool(false) => out,
            Value::Bool(true) => out.flag(key),
            Value::String(s) => out.arg(key, s),
            Value::Number(n) => out.arg(key, n.to_string()),
            Value::Array(items) => {
                let parts = items
                    .iter()
                    .map(|item| scalar(key, item))
                    .collect::<Result<Vec<_>, _>>()?;
                out.arg(key, parts.join(","))
            }
            Value::Object(_) => {
                return Err(JobError::InvalidRequest(format!(
                    "argument `{key}` must be a string, number, boolean or list"
                )));
            }
        };
    }
    Ok(out)
}

fn scalar(key: &str, value: &Value) -> Result<String, JobError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(JobError::InvalidRequest(format!(
            "argument `{key}` may only list strings, numbers or booleans"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn control() -> JobControl {
        JobControl::new(Arc::new(JobManager::default()))
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn loose_arguments_are_normalized() {
        let args = script_args(&map(json!({
            "input": "q.txt",
            "window": 12,
            "threshold": 0.5,
            "normalize": true,
            "dry_run": false,
            "label": null,
            "ids": [1, "b", true],
        })))
        .unwrap();

        let pairs: Vec<_> = args.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("ids", "1,b,true"),
                ("input", "q.txt"),
                ("normalize", ""),
                ("threshold", "0.5"),
                ("window", "12"),
            ]
        );
    }

    #[test]
    fn nested_argument_values_are_rejected() {
        let err = script_args(&map(json!({"opts": {"a": 1}}))).unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));

        let err = script_args(&map(json!({"opts": [[1]]}))).unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));
    }

    #[test]
    fn error_reply_shape() {
        let err = JobError::NotFound { id: Uuid::nil() };
        let value = serde_json::to_value(Reply::<SubmitReply>::from(Err(err))).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["kind"], "not_found");
        assert!(value["error"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn error_kinds() {
        let launch = JobError::LaunchFailed {
            program: "x".into(),
            reason: "y".into(),
        };
        assert_eq!(ErrorKind::from(&launch), ErrorKind::ProcessLaunchFailure);
        let runtime = JobError::TimedOut {
            timeout: Duration::from_secs(1),
        };
        assert_eq!(ErrorKind::from(&runtime), ErrorKind::ProcessRuntimeFailure);
        let internal = JobError::Internal("x".into());
        assert_eq!(ErrorKind::from(&internal), ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn lookups_report_structured_errors() {
        let control = control();

        let missing = Uuid::new_v4().to_string();
        let err = control.get_job_status(&missing).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let err = control.cancel_job(&missing).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = control.get_job_log("not-a-uuid", None).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let err = control.list_jobs(Some("finished")).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn empty_list() {
        let listed = control().list_jobs(None).await.ok().unwrap();
        assert_eq!(listed.total, 0);
        assert_eq!(
            serde_json::to_value(&listed).unwrap(),
            json!({"jobs": [], "total": 0})
        );
    }

    #[tokio::test]
    async fn dispatch_routes_by_op() {
        let control = control();

        let reply = control.dispatch(r#"{"op": "list_jobs"}"#).await;
        assert_eq!(reply, json!({"jobs": [], "total": 0}));

        let reply = control
            .dispatch(r#"{"op": "get_job_log", "job_id": "00000000-0000-0000-0000-000000000001"}"#)
            .await;
        assert_eq!(reply["kind"], "not_found");

        let reply = control.dispatch(r#"{"op": "reboot"}"#).await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["kind"], "invalid_request");

        let reply = control.dispatch("not json").await;
        assert_eq!(reply["kind"], "invalid_request");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn submit_and_collect_echo_result() {
        let control = control();
        let request: SubmitRequest = serde_json::from_value(json!({
            "script_path": "/bin/echo",
            "args": {"n": 3},
            "job_name": "echo",
        }))
        .unwrap();

        let submitted = control.submit_job(request).await.ok().unwrap();
        assert_eq!(submitted.status, "submitted");
        let id = submitted.job_id.to_string();

        let reply = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match control.get_job_result(&id).await.ok().unwrap() {
                    JobResultReply::NotReady { .. } => {
                        tokio::time::sleep(Duration::from_millis(20)).await
                    }
                    done => break done,
                }
            }
        })
        .await
        .unwrap();

        match reply {
            JobResultReply::Completed { result, .. } => {
                assert_eq!(result["output"], json!(["--n 3"]));
            }
            other => panic!("unexpected result {other:?}"),
        }

        let log = control.get_job_log(&id, None).await.ok().unwrap();
        assert_eq!(log.lines, vec!["--n 3"]);
        assert_eq!(log.total_lines, 1);

        let status = serde_json::to_value(control.get_job_status(&id).await).unwrap();
        assert_eq!(status["status"], "completed");
        assert_eq!(status["name"], "echo");
        assert!(status.get("exit_code").is_none());

        let err = control.cancel_job(&id).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }
}
