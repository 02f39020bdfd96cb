//! Per-job worker: launch, supervise, capture output, commit the terminal state.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::JobError;
use crate::jobs::journal::JobJournal;
use crate::jobs::launcher::{LaunchRequest, ScriptLauncher};
use crate::jobs::log::{capture_lines, JobLog};
use crate::jobs::registry::JobRegistry;
use crate::jobs::result::{ExtractContext, ResultExtractor};
use crate::jobs::state::JobStatus;

/// Everything a worker needs. Cheap to clone; one clone moves into each worker task.
#[derive(Clone)]
pub struct Executor {
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) launcher: Arc<dyn ScriptLauncher>,
    pub(crate) extractor: Arc<dyn ResultExtractor>,
    pub(crate) journal: Option<JobJournal>,
    pub(crate) config: ManagerConfig,
}

/// Coordination between one job's worker and `cancel_job`.
#[derive(Debug, Default)]
pub struct JobSignals {
    /// Wakes the worker to terminate a running process.
    pub cancel: Notify,
    /// Held by the worker while it launches, and by a cancel while it decides
    /// between `pending` and `running`.
    pub launch: Mutex<()>,
}

/// How supervision of a live process ended.
enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled(std::io::Result<ExitStatus>),
    TimedOut(Duration, std::io::Result<ExitStatus>),
}

/// Terminal state computed outside the registry lock.
enum Finish {
    Complete(Value),
    Fail { exit_code: Option<i32>, error: String },
    Cancel { exit_code: Option<i32> },
}

impl Finish {
    fn exit_code(&self) -> Option<i32> {
        match self {
            Finish::Complete(_) => Some(0),
            Finish::Fail { exit_code, .. } | Finish::Cancel { exit_code } => *exit_code,
        }
    }
}

impl Executor {
    pub fn new(
        registry: Arc<JobRegistry>,
        launcher: Arc<dyn ScriptLauncher>,
        extractor: Arc<dyn ResultExtractor>,
        config: ManagerConfig,
    ) -> Self {
        let journal = config.jobs_dir.clone().map(JobJournal::new);
        Self {
            registry,
            launcher,
            extractor,
            journal,
            config,
        }
    }

    /// Start the worker for a registered job.
    pub fn spawn(&self, job_id: Uuid, log: Arc<JobLog>, signals: Arc<JobSignals>) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move { executor.run(job_id, log, signals).await })
    }

    async fn run(self, job_id: Uuid, log: Arc<JobLog>, signals: Arc<JobSignals>) {
        let record = match self.registry.get(job_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id = %job_id, "Worker started for unknown job: {}", e);
                return;
            }
        };

        if record.status != JobStatus::Pending {
            debug!(job_id = %job_id, status = %record.status, "Job left pending before launch");
            self.persist(job_id, &log).await;
            return;
        }

        let program = record.script_path.display().to_string();
        let job_dir = match &self.journal {
            Some(journal) => match journal.create_job_dir(job_id).await {
                Ok(dir) => {
                    if let Err(e) = journal.write_metadata(&record).await {
                        warn!(job_id = %job_id, "Failed to write job metadata: {}", e);
                    }
                    Some(dir)
                }
                Err(e) => {
                    let err = JobError::LaunchFailed {
                        program,
                        reason: format!("cannot create job directory: {e}"),
                    };
                    self.fail_launch(job_id, err, &log).await;
                    return;
                }
            },
            None => None,
        };

        let spec = match self.launcher.prepare(&LaunchRequest {
            job_id,
            script_path: &record.script_path,
            args: &record.args,
            job_dir: job_dir.as_deref(),
        }) {
            Ok(spec) => spec,
            Err(e) => {
                self.fail_launch(job_id, e, &log).await;
                return;
            }
        };

        // Launch under this job's guard: a concurrent cancel either sees
        // `pending` and wins, or waits and then sees `running`. The registry
        // lock is not held while the process is forked.
        let guard = signals.launch.lock().await;
        match self.registry.get(job_id).await {
            Ok(job) if job.status == JobStatus::Pending => {}
            Ok(_) => {
                drop(guard);
                debug!(job_id = %job_id, "Job cancelled before launch");
                self.persist(job_id, &log).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, "Job vanished before launch: {}", e);
                return;
            }
        }

        let child = match spec.to_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = JobError::LaunchFailed {
                    program: spec.program.display().to_string(),
                    reason: e.to_string(),
                };
                self.fail_launch(job_id, err, &log).await;
                return;
            }
        };

        let started = self
            .registry
            .update(job_id, |job| {
                job.transition_to(JobStatus::Running, Some(spec.display()))
            })
            .await;
        drop(guard);

        if let Ok(Err(e)) | Err(e) = started {
            // Dropping the child kills it.
            warn!(job_id = %job_id, "Failed to record job start: {}", e);
            self.persist(job_id, &log).await;
            return;
        }

        info!(
            job_id = %job_id,
            pid = child.id(),
            launcher = self.launcher.name(),
            command = %spec.display(),
            "Job started"
        );

        self.supervise(job_id, child, log, signals, job_dir).await;
    }

    async fn supervise(
        &self,
        job_id: Uuid,
        mut child: Child,
        log: Arc<JobLog>,
        signals: Arc<JobSignals>,
        job_dir: Option<PathBuf>,
    ) {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let log = Arc::clone(&log);
            readers.push(tokio::spawn(async move { capture_lines(stdout, &log).await }));
        }
        if let Some(stderr) = child.stderr.take() {
            let log = Arc::clone(&log);
            readers.push(tokio::spawn(async move { capture_lines(stderr, &log).await }));
        }

        let grace = self.config.termination_grace;
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = signals.cancel.notified() => {
                debug!(job_id = %job_id, "Terminating process on cancel request");
                Outcome::Cancelled(terminate(&mut child, grace).await)
            }
            _ = deadline(self.config.job_timeout) => {
                let timeout = self.config.job_timeout.unwrap_or_default();
                warn!(job_id = %job_id, ?timeout, "Job exceeded its time limit");
                Outcome::TimedOut(timeout, terminate(&mut child, grace).await)
            }
        };

        self.drain(job_id, &mut readers).await;

        let lines = log.snapshot().await;
        let finish = self.finish(job_id, outcome, &lines, job_dir.as_deref()).await;

        let committed = self
            .registry
            .update(job_id, |job| {
                // A cancel accepted while running wins over however the process ended.
                let committed = if job.cancel_requested {
                    job.cancel(finish.exit_code(), "Cancelled by request")
                } else {
                    match finish {
                        Finish::Complete(result) => job.complete(result),
                        Finish::Fail { exit_code, error } => job.fail(exit_code, error),
                        Finish::Cancel { exit_code } => job.cancel(exit_code, "Cancelled by request"),
                    }
                };
                committed.map(|_| job.status)
            })
            .await;

        match committed {
            Ok(Ok(status)) => info!(
                job_id = %job_id,
                status = %status,
                log_lines = lines.len(),
                "Job finished"
            ),
            Ok(Err(e)) | Err(e) => warn!(job_id = %job_id, "Failed to commit terminal state: {}", e),
        }

        self.persist(job_id, &log).await;
    }

    /// Wait for the output readers; give up after the drain timeout.
    async fn drain(&self, job_id: Uuid, readers: &mut [JoinHandle<std::io::Result<usize>>]) {
        let drained = tokio::time::timeout(self.config.log_drain_timeout, async {
            for reader in readers.iter_mut() {
                match reader.await {
                    Ok(Ok(lines)) => debug!(job_id = %job_id, lines, "Output stream closed"),
                    Ok(Err(e)) => warn!(job_id = %job_id, "Failed to read job output: {}", e),
                    Err(e) => warn!(job_id = %job_id, "Output reader task failed: {}", e),
                }
            }
        })
        .await;

        if drained.is_err() {
            // A descendant still holds the pipe open.
            warn!(job_id = %job_id, "Output still open after process exit, detaching readers");
            for reader in readers.iter() {
                reader.abort();
            }
        }
    }

    async fn finish(
        &self,
        job_id: Uuid,
        outcome: Outcome,
        lines: &[String],
        job_dir: Option<&std::path::Path>,
    ) -> Finish {
        match outcome {
            Outcome::Exited(Ok(status)) if status.success() => {
                let ctx = ExtractContext {
                    job_id,
                    log: lines,
                    job_dir,
                };
                match self.extractor.extract(ctx).await {
                    Ok(result) => Finish::Complete(result),
                    Err(e) => {
                        warn!(
                            job_id = %job_id,
                            extractor = self.extractor.name(),
                            "No result for successful process: {}",
                            e
                        );
                        Finish::Fail {
                            exit_code: Some(0),
                            error: e.to_string(),
                        }
                    }
                }
            }
            Outcome::Exited(Ok(status)) => Finish::Fail {
                exit_code: status.code(),
                error: JobError::ProcessFailed {
                    code: status.code(),
                    signal: exit_signal(&status),
                    tail: self.error_tail(lines),
                }
                .to_string(),
            },
            Outcome::Exited(Err(e)) => Finish::Fail {
                exit_code: None,
                error: JobError::Internal(format!("failed to wait for process: {e}")).to_string(),
            },
            Outcome::Cancelled(status) => Finish::Cancel {
                exit_code: status.ok().and_then(|s| s.code()),
            },
            Outcome::TimedOut(timeout, status) => Finish::Fail {
                exit_code: status.ok().and_then(|s| s.code()),
                error: JobError::TimedOut { timeout }.to_string(),
            },
        }
    }

    fn error_tail(&self, lines: &[String]) -> String {
        let start = lines.len().saturating_sub(self.config.error_tail_lines);
        lines[start..].join("\n")
    }

    async fn fail_launch(&self, job_id: Uuid, err: JobError, log: &JobLog) {
        warn!(job_id = %job_id, "Job failed to launch: {}", err);
        let failed = self
            .registry
            .update(job_id, |job| {
                if job.status == JobStatus::Pending {
                    job.fail(None, err.to_string())
                } else {
                    Ok(())
                }
            })
            .await;
        if let Ok(Err(e)) | Err(e) = failed {
            warn!(job_id = %job_id, "Failed to record launch failure: {}", e);
        }
        self.persist(job_id, log).await;
    }

    /// Mirror the record and log into the job directory, if any.
    async fn persist(&self, job_id: Uuid, log: &JobLog) {
        let Some(journal) = &self.journal else {
            return;
        };
        let Ok(record) = self.registry.get(job_id).await else {
            return;
        };

        if let Err(e) = journal.write_metadata(&record).await {
            warn!(job_id = %job_id, "Failed to write job metadata: {}", e);
        }
        if let Err(e) = journal.write_log(job_id, &log.snapshot().await).await {
            warn!(job_id = %job_id, "Failed to write job log: {}", e);
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Terminate a child and wait for it to exit.
///
/// On Unix the whole process group gets SIGTERM, then SIGKILL once `grace`
/// has passed.
#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);

        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    // Fails if the child was already reaped; wait() then returns the cached status.
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::launcher::DirectLauncher;
    use crate::jobs::result::LogTailExtractor;
    use crate::jobs::state::{JobRecord, ScriptArgs};

    fn executor(config: ManagerConfig) -> Executor {
        Executor::new(
            Arc::new(JobRegistry::new()),
            Arc::new(DirectLauncher::new()),
            Arc::new(LogTailExtractor::default()),
            config,
        )
    }

    #[tokio::test]
    async fn worker_skips_job_cancelled_before_start() {
        let executor = executor(ManagerConfig::default());
        let mut record = JobRecord::new("/bin/echo", ScriptArgs::new(), None);
        record.cancel(None, "Cancelled before start").unwrap();
        let id = record.id;
        let log = executor.registry.insert(record).await.unwrap();

        executor
            .spawn(id, log, Arc::new(JobSignals::default()))
            .await
            .unwrap();

        let job = executor.registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn worker_records_launch_failure() {
        let executor = executor(ManagerConfig::default());
        let record = JobRecord::new("/definitely/not/here", ScriptArgs::new(), None);
        let id = record.id;
        let log = executor.registry.insert(record).await.unwrap();

        executor
            .spawn(id, log, Arc::new(JobSignals::default()))
            .await
            .unwrap();

        let job = executor.registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
        assert!(job.error.unwrap().starts_with("Failed to launch /definitely/not/here"));
        assert_eq!(job.transitions.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_completes_echo() {
        let executor = executor(ManagerConfig::default());
        let record = JobRecord::new("/bin/echo", ScriptArgs::new().arg("greeting", "hi"), None);
        let id = record.id;
        let log = executor.registry.insert(record).await.unwrap();

        executor
            .spawn(id, Arc::clone(&log), Arc::new(JobSignals::default()))
            .await
            .unwrap();

        let job = executor.registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(log.snapshot().await, vec!["--greeting hi"]);
        assert!(job.result.is_some());
        assert!(job.exit_code.is_none());
    }

    #[tokio::test]
    async fn held_launch_guard_lets_cancel_win() {
        let executor = executor(ManagerConfig::default());
        let record = JobRecord::new("/bin/echo", ScriptArgs::new(), None);
        let id = record.id;
        let log = executor.registry.insert(record).await.unwrap();
        let signals = Arc::new(JobSignals::default());

        let guard = signals.launch.lock().await;
        let handle = executor.spawn(id, log, Arc::clone(&signals));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The registry stays usable while a launch is held up.
        assert_eq!(executor.registry.get(id).await.unwrap().status, JobStatus::Pending);
        executor
            .registry
            .update(id, |job| job.cancel(None, "Cancelled before start"))
            .await
            .unwrap()
            .unwrap();
        drop(guard);

        handle.await.unwrap();
        let job = executor.registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert_eq!(job.transitions.len(), 1);
    }

    #[test]
    fn error_tail_keeps_last_lines() {
        let executor = executor(ManagerConfig {
            error_tail_lines: 2,
            ..Default::default()
        });
        let lines: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(executor.error_tail(&lines), "b\nc");
    }
}
