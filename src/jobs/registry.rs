//! Registry of every job submitted to a manager.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::log::JobLog;
use crate::jobs::state::{JobRecord, JobStatus};

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A committed status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

struct JobEntry {
    record: JobRecord,
    log: Arc<JobLog>,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<Uuid, JobEntry>,
    /// Ids in submission order.
    order: Vec<Uuid>,
}

/// Shared table of job records keyed by id.
///
/// Readers always receive cloned snapshots; every mutation runs under the
/// write lock, so a record is never observed half-updated.
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    /// Subscribe to status changes committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Register a new job and return its log buffer.
    pub async fn insert(&self, record: JobRecord) -> Result<Arc<JobLog>, JobError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&record.id) {
            return Err(JobError::Internal(format!(
                "job id {} registered twice",
                record.id
            )));
        }

        let id = record.id;
        let log = Arc::new(JobLog::new());
        inner.jobs.insert(
            id,
            JobEntry {
                record,
                log: Arc::clone(&log),
            },
        );
        inner.order.push(id);
        Ok(log)
    }

    /// Get a snapshot of a job record.
    pub async fn get(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        self.inner
            .read()
            .await
            .jobs
            .get(&job_id)
            .map(|entry| entry.record.clone())
            .ok_or(JobError::NotFound { id: job_id })
    }

    /// Get the log buffer of a job.
    pub async fn log(&self, job_id: Uuid) -> Result<Arc<JobLog>, JobError> {
        self.inner
            .read()
            .await
            .jobs
            .get(&job_id)
            .map(|entry| Arc::clone(&entry.log))
            .ok_or(JobError::NotFound { id: job_id })
    }

    /// Snapshots of all jobs, optionally restricted to one status, in submission order.
    pub async fn list(&self, filter: Option<JobStatus>) -> Vec<JobRecord> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|entry| filter.is_none_or(|status| entry.record.status == status))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Mutate a record atomically.
    ///
    /// A status change made by `f` is broadcast before the lock is released,
    /// so subscribers see transitions in commit order.
    pub async fn update<F, R>(&self, job_id: Uuid, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut JobRecord) -> R,
    {
        let mut inner = self.inner.write().await;
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobError::NotFound { id: job_id })?;

        let before = entry.record.status;
        let out = f(&mut entry.record);
        let after = entry.record.status;

        if before != after {
            // Ok if nobody is subscribed.
            let _ = self.events.send(JobEvent {
                job_id,
                from: before,
                to: after,
            });
        }

        Ok(out)
    }

    /// Number of registered jobs.
    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Count jobs per status.
    pub async fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read().await;

        let mut summary = RegistrySummary::default();
        for entry in inner.jobs.values() {
            match entry.record.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Running => summary.running += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
        }

        summary.total = inner.jobs.len();
        summary
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Job counts per status.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::state::ScriptArgs;

    fn record(name: &str) -> JobRecord {
        JobRecord::new("/bin/true", ScriptArgs::new(), Some(name.to_string()))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let registry = JobRegistry::new();
        let job = record("one");
        let id = job.id;
        registry.insert(job).await.unwrap();

        let fetched = registry.get(id).await.unwrap();
        assert_eq!(fetched.name.as_deref(), Some("one"));
        assert_eq!(fetched.status, JobStatus::Pending);
        assert!(registry.log(id).await.unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_insert_is_internal_error() {
        let registry = JobRegistry::new();
        let job = record("dup");
        registry.insert(job.clone()).await.unwrap();
        let err = registry.insert(job).await.unwrap_err();
        assert!(matches!(err, JobError::Internal(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.get(id).await,
            Err(JobError::NotFound { id: missing }) if missing == id
        ));
        assert!(registry.log(id).await.is_err());
        assert!(registry.update(id, |_| ()).await.is_err());
    }

    #[tokio::test]
    async fn list_keeps_submission_order_and_filters() {
        let registry = JobRegistry::new();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let job = record(name);
            ids.push(job.id);
            registry.insert(job).await.unwrap();
        }

        registry
            .update(ids[1], |job| job.transition_to(JobStatus::Running, None))
            .await
            .unwrap()
            .unwrap();

        let all: Vec<Uuid> = registry.list(None).await.iter().map(|j| j.id).collect();
        assert_eq!(all, ids);

        let running = registry.list(Some(JobStatus::Running)).await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, ids[1]);

        let pending: Vec<Uuid> = registry
            .list(Some(JobStatus::Pending))
            .await
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(pending, vec![ids[0], ids[2]]);
    }

    #[tokio::test]
    async fn snapshots_are_detached() {
        let registry = JobRegistry::new();
        let job = record("snap");
        let id = job.id;
        registry.insert(job).await.unwrap();

        let before = registry.get(id).await.unwrap();
        registry
            .update(id, |job| job.transition_to(JobStatus::Running, None))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(before.status, JobStatus::Pending);
        assert_eq!(registry.get(id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn update_broadcasts_status_changes_only() {
        let registry = JobRegistry::new();
        let job = record("events");
        let id = job.id;
        registry.insert(job).await.unwrap();
        let mut rx = registry.subscribe();

        registry.update(id, |job| job.name = None).await.unwrap();
        registry
            .update(id, |job| job.transition_to(JobStatus::Running, None))
            .await
            .unwrap()
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            JobEvent {
                job_id: id,
                from: JobStatus::Pending,
                to: JobStatus::Running,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn summary_counts() {
        let registry = JobRegistry::new();
        registry.insert(record("a")).await.unwrap();
        let job = record("b");
        let id = job.id;
        registry.insert(job).await.unwrap();
        registry
            .update(id, |job| job.cancel(None, "stop"))
            .await
            .unwrap()
            .unwrap();

        let summary = registry.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.cancelled, 1);
    }
}
