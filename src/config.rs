//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How the result of a successful job is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    /// Last JSON line of the log, or a summary of the log tail.
    Log,
    /// JSON file written by the script into its job directory.
    OutputFile,
}

impl FromStr for ResultMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "output_file" | "output-file" => Ok(Self::OutputFile),
            other => Err(format!("expected `log` or `output_file`, got `{other}`")),
        }
    }
}

/// Job manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the per-job directories (`<jobs_dir>/<job_id>/`). No journal when unset.
    pub jobs_dir: Option<PathBuf>,
    /// Working directory for launched processes (if None, inherits cwd).
    pub working_dir: Option<PathBuf>,
    /// Interpreter used to run scripts, e.g. `python3`. Scripts are executed directly when unset.
    pub interpreter: Option<PathBuf>,
    /// Flag name under which the job's output file path is passed to the script.
    pub output_arg: Option<String>,
    /// Result extraction strategy.
    pub result_mode: ResultMode,
    /// Time between SIGTERM and SIGKILL when terminating a process.
    pub termination_grace: Duration,
    /// How long to wait for the output readers after the process exited.
    pub log_drain_timeout: Duration,
    /// Maximum run time per job. Unlimited when unset.
    pub job_timeout: Option<Duration>,
    /// Number of trailing log lines quoted in a failure error.
    pub error_tail_lines: usize,
    /// Number of trailing log lines kept in a log-derived result.
    pub result_tail_lines: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            jobs_dir: None,
            working_dir: None,
            interpreter: None,
            output_arg: None,
            result_mode: ResultMode::Log,
            termination_grace: Duration::from_secs(2),
            log_drain_timeout: Duration::from_secs(5),
            job_timeout: None,
            error_tail_lines: 10,
            result_tail_lines: 20,
        }
    }
}

impl ManagerConfig {
    /// Build config from `SCRIPT_JOBS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset or empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let termination_grace = parse::<u64>(&get, "SCRIPT_JOBS_TERM_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.termination_grace);

        let log_drain_timeout = parse::<u64>(&get, "SCRIPT_JOBS_DRAIN_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.log_drain_timeout);

        let job_timeout = match parse::<u64>(&get, "SCRIPT_JOBS_TIMEOUT_SECS")? {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            jobs_dir: get("SCRIPT_JOBS_DIR").map(PathBuf::from),
            working_dir: get("SCRIPT_JOBS_WORKDIR").map(PathBuf::from),
            interpreter: get("SCRIPT_JOBS_INTERPRETER").map(PathBuf::from),
            output_arg: get("SCRIPT_JOBS_OUTPUT_ARG"),
            result_mode: parse(&get, "SCRIPT_JOBS_RESULT_MODE")?
                .unwrap_or(defaults.result_mode),
            termination_grace,
            log_drain_timeout,
            job_timeout,
            error_tail_lines: parse(&get, "SCRIPT_JOBS_ERROR_TAIL_LINES")?
                .unwrap_or(defaults.error_tail_lines),
            result_tail_lines: parse(&get, "SCRIPT_JOBS_RESULT_TAIL_LINES")?
                .unwrap_or(defaults.result_tail_lines),
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}
