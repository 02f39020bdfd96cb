//! On-disk job directories: `<root>/<job_id>/{metadata.json, job.log}`.
//!
//! The journal mirrors the registry for operators and for scripts that write
//! their output next to the job. It is never read back by the manager.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::jobs::state::JobRecord;

const METADATA_FILE: &str = "metadata.json";
const LOG_FILE: &str = "job.log";

/// Writer for per-job directories under a root.
#[derive(Debug, Clone)]
pub struct JobJournal {
    root: PathBuf,
}

impl JobJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of one job.
    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create the job directory.
    pub async fn create_job_dir(&self, job_id: Uuid) -> std::io::Result<PathBuf> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Write the record as pretty JSON, replacing the previous snapshot.
    pub async fn write_metadata(&self, record: &JobRecord) -> std::io::Result<()> {
        let dir = self.create_job_dir(record.id).await?;
        let json = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;

        // Write-then-rename so a reader never sees a truncated snapshot.
        let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, dir.join(METADATA_FILE)).await
    }

    /// Write the complete log, one line per entry.
    pub async fn write_log(&self, job_id: Uuid, lines: &[String]) -> std::io::Result<()> {
        let dir = self.create_job_dir(job_id).await?;
        let mut file = tokio::fs::File::create(dir.join(LOG_FILE)).await?;
        for line in lines {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await
    }
}
