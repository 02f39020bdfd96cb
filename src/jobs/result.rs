//! Result extraction for jobs whose process exited successfully.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{ManagerConfig, ResultMode};
use crate::error::JobError;
use crate::jobs::launcher::OUTPUT_FILE_NAME;

/// Everything known about a finished process when its result is extracted.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub job_id: Uuid,
    pub log: &'a [String],
    pub job_dir: Option<&'a Path>,
}

/// Strategy producing the result of a completed job.
#[async_trait]
pub trait ResultExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, ctx: ExtractContext<'_>) -> Result<Value, JobError>;
}

/// Uses the last log line that parses as a JSON object or array; otherwise
/// summarizes the tail of the log. Never fails.
#[derive(Debug, Clone)]
pub struct LogTailExtractor {
    tail_lines: usize,
}

impl LogTailExtractor {
    pub fn new(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl Default for LogTailExtractor {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl ResultExtractor for LogTailExtractor {
    fn name(&self) -> &str {
        "log_tail"
    }

    async fn extract(&self, ctx: ExtractContext<'_>) -> Result<Value, JobError> {
        let structured = ctx
            .log
            .iter()
            .rev()
            .map(|line| line.trim())
            .filter(|line| line.starts_with('{') || line.starts_with('['))
            .find_map(|line| serde_json::from_str::<Value>(line).ok());

        if let Some(value) = structured {
            return Ok(value);
        }

        let start = ctx.log.len().saturating_sub(self.tail_lines);
        Ok(json!({
            "output": &ctx.log[start..],
            "total_lines": ctx.log.len(),
        }))
    }
}

/// Reads a JSON file the script wrote into its job directory.
#[derive(Debug, Clone)]
pub struct OutputFileExtractor {
    file_name: String,
}

impl OutputFileExtractor {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

impl Default for OutputFileExtractor {
    fn default() -> Self {
        Self::new(OUTPUT_FILE_NAME)
    }
}

#[async_trait]
impl ResultExtractor for OutputFileExtractor {
    fn name(&self) -> &str {
        "output_file"
    }

    async fn extract(&self, ctx: ExtractContext<'_>) -> Result<Value, JobError> {
        let job_dir = ctx.job_dir.ok_or_else(|| JobError::ResultExtraction {
            reason: "no job directory configured".to_string(),
        })?;
        let path = job_dir.join(&self.file_name);

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| JobError::ResultExtraction {
                reason: format!("cannot read {}: {e}", path.display()),
            })?;

        serde_json::from_str(&raw).map_err(|e| JobError::ResultExtraction {
            reason: format!("{} is not valid JSON: {e}", path.display()),
        })
    }
}

/// Pick the extractor described by `config`.
pub fn from_config(config: &ManagerConfig) -> Box<dyn ResultExtractor> {
    match config.result_mode {
        ResultMode::Log => Box::new(LogTailExtractor::new(config.result_tail_lines)),
        ResultMode::OutputFile => Box::new(OutputFileExtractor::default()),
    }
}
