//! Turning a job's script path and arguments into a launchable process.
//!
//! The executor only depends on [`ScriptLauncher`]; how a script is invoked
//! (directly, through an interpreter, with an extra output flag) is decided
//! by the implementation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::JobError;
use crate::jobs::state::ScriptArgs;

/// File name of the output file inside a job directory.
pub const OUTPUT_FILE_NAME: &str = "output.json";

/// What the launcher gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub job_id: Uuid,
    pub script_path: &'a Path,
    pub args: &'a ScriptArgs,
    /// Per-job directory, when a journal is configured.
    pub job_dir: Option<&'a Path>,
}

/// A fully described process, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Build the command: no stdin, piped stdout/stderr, own process group, killed on drop.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        // Own process group so termination reaches the script's children too.
        #[cfg(unix)]
        command.process_group(0);

        command
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Capability: given a script and a parameter bag, produce a launchable process.
pub trait ScriptLauncher: Send + Sync {
    fn name(&self) -> &str;

    fn prepare(&self, request: &LaunchRequest<'_>) -> Result<LaunchSpec, JobError>;
}

/// Render `args` as `--key value` flags; an empty value yields a bare `--key`.
pub fn flag_args(args: &ScriptArgs) -> Vec<OsString> {
    let mut out = Vec::with_capacity(args.len() * 2);
    for (key, value) in args.iter() {
        out.push(format!("--{key}").into());
        if !value.is_empty() {
            out.push(value.into());
        }
    }
    out
}

/// Shared launcher options.
#[derive(Debug, Clone, Default)]
struct LaunchOptions {
    working_dir: Option<PathBuf>,
    output_arg: Option<String>,
}

impl LaunchOptions {
    fn finish(&self, mut spec: LaunchSpec, request: &LaunchRequest<'_>) -> Result<LaunchSpec, JobError> {
        spec.args.extend(flag_args(request.args));

        if let Some(flag) = &self.output_arg {
            let job_dir = request.job_dir.ok_or_else(|| JobError::LaunchFailed {
                program: request.script_path.display().to_string(),
                reason: format!("--{flag} requires a jobs directory to be configured"),
            })?;
            spec.args.push(format!("--{flag}").into());
            spec.args.push(job_dir.join(OUTPUT_FILE_NAME).into_os_string());
        }

        spec.working_dir = self.working_dir.clone();
        spec.env.push(("SCRIPT_JOBS_JOB_ID".to_string(), request.job_id.to_string()));
        Ok(spec)
    }
}

/// Executes the script itself; it must be executable.
#[derive(Debug, Clone, Default)]
pub struct DirectLauncher {
    options: LaunchOptions,
}

impl DirectLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.options.working_dir = Some(dir);
        self
    }

    /// Append `--<flag> <job_dir>/output.json` to every command line.
    pub fn with_output_arg(mut self, flag: impl Into<String>) -> Self {
        self.options.output_arg = Some(flag.into());
        self
    }
}

impl ScriptLauncher for DirectLauncher {
    fn name(&self) -> &str {
        "direct"
    }

    fn prepare(&self, request: &LaunchRequest<'_>) -> Result<LaunchSpec, JobError> {
        self.options
            .finish(LaunchSpec::new(request.script_path), request)
    }
}

/// Runs the script through an interpreter: `<interpreter> [interpreter args] <script> --k v ...`.
#[derive(Debug, Clone)]
pub struct InterpreterLauncher {
    interpreter: PathBuf,
    interpreter_args: Vec<OsString>,
    options: LaunchOptions,
}

impl InterpreterLauncher {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: Vec::new(),
            options: LaunchOptions::default(),
        }
    }

    /// Arguments placed between the interpreter and the script, e.g. `-u`.
    pub fn with_interpreter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.interpreter_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.options.working_dir = Some(dir);
        self
    }

    /// Append `--<flag> <job_dir>/output.json` to every command line.
    pub fn with_output_arg(mut self, flag: impl Into<String>) -> Self {
        self.options.output_arg = Some(flag.into());
        self
    }
}

impl ScriptLauncher for InterpreterLauncher {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn prepare(&self, request: &LaunchRequest<'_>) -> Result<LaunchSpec, JobError> {
        let mut spec = LaunchSpec::new(&self.interpreter);
        spec.args.extend(self.interpreter_args.iter().cloned());
        spec.args.push(request.script_path.as_os_str().to_owned());
        self.options.finish(spec, request)
    }
}

/// Pick the launcher described by `config`.
pub fn from_config(config: &ManagerConfig) -> Box<dyn ScriptLauncher> {
    match &config.interpreter {
        Some(interpreter) => {
            let mut launcher = InterpreterLauncher::new(interpreter);
            if let Some(dir) = &config.working_dir {
                launcher = launcher.with_working_dir(dir.clone());
            }
            if let Some(flag) = &config.output_arg {
                launcher = launcher.with_output_arg(flag.clone());
            }
            Box::new(launcher)
        }
        None => {
            let mut launcher = DirectLauncher::new();
            if let Some(dir) = &config.working_dir {
                launcher = launcher.with_working_dir(dir.clone());
            }
            if let Some(flag) = &config.output_arg {
                launcher = launcher.with_output_arg(flag.clone());
            }
            Box::new(launcher)
        }
    }
}
