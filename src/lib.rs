//! Script Jobs: background execution of external scripts with status, logs and results.

pub mod config;
pub mod control;
pub mod error;
pub mod jobs;

pub use config::{ManagerConfig, ResultMode};
pub use control::JobControl;
pub use error::{ConfigError, JobError};
pub use jobs::{JobManager, JobRecord, JobStatus, ScriptArgs};
