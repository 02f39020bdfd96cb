//! Job manager: the control operations over the registry and executor.
//!
//! Every operation returns after a brief registry lock; none waits for a job
//! to finish. Process lifecycle is owned by the per-job workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::JobError;
use crate::jobs::executor::{Executor, JobSignals};
use crate::jobs::launcher::{self, ScriptLauncher};
use crate::jobs::log::LogTail;
use crate::jobs::registry::{JobEvent, JobRegistry, RegistrySummary};
use crate::jobs::result::{self, ResultExtractor};
use crate::jobs::state::{JobRecord, JobStatus, ScriptArgs};

/// Tracked worker handle.
struct TrackedJob {
    handle: JoinHandle<()>,
    signals: Arc<JobSignals>,
}

/// What `get_job_result` found.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Completed(Value),
    /// Still `pending` or `running`.
    NotReady(JobStatus),
    /// `failed` or `cancelled`.
    Failed { status: JobStatus, error: String },
}

/// What a successful `cancel_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled; no process was spawned.
    CancelledBeforeStart,
    /// The process is being terminated; the job turns `cancelled` once it has exited.
    TerminationRequested,
}

/// Owns the registry and launches one worker per submitted job.
pub struct JobManager {
    registry: Arc<JobRegistry>,
    executor: Executor,
    /// Workers that may still be running (for cancellation and shutdown).
    workers: RwLock<HashMap<Uuid, TrackedJob>>,
    closed: AtomicBool,
}

impl JobManager {
    /// Create a manager with the launcher and result strategy described by `config`.
    pub fn new(config: ManagerConfig) -> Self {
        let launcher: Arc<dyn ScriptLauncher> = Arc::from(launcher::from_config(&config));
        let extractor: Arc<dyn ResultExtractor> = Arc::from(result::from_config(&config));
        let registry = Arc::new(JobRegistry::new());

        Self {
            executor: Executor::new(Arc::clone(&registry), launcher, extractor, config),
            registry,
            workers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the launcher.
    pub fn with_launcher(mut self, launcher: Arc<dyn ScriptLauncher>) -> Self {
        self.executor.launcher = launcher;
        self
    }

    /// Replace the result extraction strategy.
    pub fn with_extractor(mut self, extractor: Arc<dyn ResultExtractor>) -> Self {
        self.executor.extractor = extractor;
        self
    }

    /// Register a job and start its worker. Returns as soon as the job is `pending`.
    pub async fn submit_job(
        &self,
        script_path: impl Into<PathBuf>,
        args: ScriptArgs,
        job_name: Option<String>,
    ) -> Result<Uuid, JobError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JobError::InvalidRequest(
                "job manager is shutting down".to_string(),
            ));
        }

        let script_path = script_path.into();
        validate(&script_path, &args)?;

        let record = JobRecord::new(script_path, args, job_name);
        let job_id = record.id;
        let name = record.display_name();
        let script = record.script_path.display().to_string();

        // Register and spawn under the workers lock, so any job a cancel can
        // see already has its worker tracked.
        {
            let mut workers = self.workers.write().await;
            workers.retain(|_, tracked| !tracked.handle.is_finished());

            let log = self.registry.insert(record).await?;
            let signals = Arc::new(JobSignals::default());
            let handle = self.executor.spawn(job_id, log, Arc::clone(&signals));
            workers.insert(job_id, TrackedJob { handle, signals });
        }

        info!(job_id = %job_id, name = %name, script = %script, "Job submitted");
        Ok(job_id)
    }

    /// Current snapshot of a job.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        self.registry.get(job_id).await
    }

    /// Result of a completed job, or why there is none.
    pub async fn get_job_result(&self, job_id: Uuid) -> Result<JobResult, JobError> {
        let job = self.registry.get(job_id).await?;
        Ok(match job.status {
            JobStatus::Completed => match job.result {
                Some(result) => JobResult::Completed(result),
                None => {
                    return Err(JobError::Internal(format!(
                        "job {job_id} completed without a result"
                    )));
                }
            },
            JobStatus::Pending | JobStatus::Running => JobResult::NotReady(job.status),
            JobStatus::Failed | JobStatus::Cancelled => JobResult::Failed {
                status: job.status,
                error: job
                    .error
                    .unwrap_or_else(|| format!("Job {}", job.status)),
            },
        })
    }

    /// Last `tail` log lines (all when 0) and the total line count.
    pub async fn get_job_log(&self, job_id: Uuid, tail: usize) -> Result<LogTail, JobError> {
        Ok(self.registry.log(job_id).await?.tail(tail).await)
    }

    /// Cancel a pending or running job.
    ///
    /// Terminal jobs, and running jobs whose cancel was already accepted,
    /// are rejected with `InvalidState`.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelOutcome, JobError> {
        let signals = self
            .workers
            .read()
            .await
            .get(&job_id)
            .map(|tracked| Arc::clone(&tracked.signals));

        // Wait out a launch in progress so `pending` vs `running` is settled.
        let _launch = match &signals {
            Some(signals) => Some(signals.launch.lock().await),
            None => None,
        };

        let outcome = self
            .registry
            .update(job_id, |job| match job.status {
                JobStatus::Pending => job
                    .cancel(None, "Cancelled before start")
                    .map(|_| CancelOutcome::CancelledBeforeStart),
                JobStatus::Running if job.cancel_requested => Err(JobError::InvalidState {
                    id: job_id,
                    state: "running with a cancel already in progress".to_string(),
                    action: "cancel".to_string(),
                }),
                // Nothing could deliver the request; leave the record untouched.
                JobStatus::Running if signals.is_none() => Err(JobError::Internal(format!(
                    "running job {job_id} has no worker"
                ))),
                JobStatus::Running => {
                    job.cancel_requested = true;
                    Ok(CancelOutcome::TerminationRequested)
                }
                status => Err(JobError::InvalidState {
                    id: job_id,
                    state: status.to_string(),
                    action: "cancel".to_string(),
                }),
            })
            .await?;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %job_id, "Cancel rejected: {}", e);
                return Err(e);
            }
        };

        if let (CancelOutcome::TerminationRequested, Some(signals)) = (outcome, &signals) {
            // notify_one keeps a permit if the worker is not waiting yet.
            signals.cancel.notify_one();
        }

        info!(job_id = %job_id, outcome = ?outcome, "Job cancel accepted");
        Ok(outcome)
    }

    /// All jobs, or those with exactly `status`, in submission order.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Vec<JobRecord> {
        self.registry.list(status).await
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    /// Job counts per status.
    pub async fn summary(&self) -> RegistrySummary {
        self.registry.summary().await
    }

    /// Refuse new jobs, cancel every active job and wait for all workers.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        for job in self.registry.list(None).await {
            if job.status.is_active()
                && let Err(e) = self.cancel_job(job.id).await
            {
                warn!(job_id = %job.id, "Cancel during shutdown failed: {}", e);
            }
        }

        let workers: Vec<(Uuid, TrackedJob)> = self.workers.write().await.drain().collect();
        for (job_id, tracked) in workers {
            if let Err(e) = tracked.handle.await {
                warn!(job_id = %job_id, "Worker task failed: {}", e);
            }
        }

        info!("Job manager shut down");
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

fn validate(script_path: &std::path::Path, args: &ScriptArgs) -> Result<(), JobError> {
    if script_path.as_os_str().is_empty() {
        return Err(JobError::InvalidRequest("script path is empty".to_string()));
    }
    for (key, _) in args.iter() {
        if key.is_empty() || key.starts_with('-') || key.chars().any(char::is_whitespace) {
            return Err(JobError::InvalidRequest(format!(
                "invalid argument name `{key}`"
            )));
        }
    }
    Ok(())
}
