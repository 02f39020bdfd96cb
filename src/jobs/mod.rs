//! Background execution of external scripts.
//!
//! - [`JobManager`] is the entry point: submit, inspect, cancel, list.
//! - [`JobRegistry`] owns every [`JobRecord`] and its [`JobLog`].
//! - [`Executor`] runs one worker task per job.
//! - [`ScriptLauncher`] builds the command line; [`ResultExtractor`] turns a
//!   finished job into its result.
//! - [`JobJournal`] mirrors jobs into per-job directories.

pub mod executor;
pub mod journal;
pub mod launcher;
pub mod log;
pub mod manager;
pub mod registry;
pub mod result;
pub mod state;

pub use executor::{Executor, JobSignals};
pub use journal::JobJournal;
pub use launcher::{DirectLauncher, InterpreterLauncher, LaunchRequest, LaunchSpec, ScriptLauncher};
pub use log::{JobLog, LogTail};
pub use manager::{CancelOutcome, JobManager, JobResult};
pub use registry::{JobEvent, JobRegistry, RegistrySummary};
pub use result::{ExtractContext, LogTailExtractor, OutputFileExtractor, ResultExtractor};
pub use state::{JobRecord, JobStatus, ScriptArgs, StateTransition};
