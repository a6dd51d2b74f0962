//! Stage invocation: one external run per (stage, date).
//!
//! The invoker is the only seam between the driver and the outside world. It
//! builds an isolated containerized run scoped to a single report date and
//! returns the process's exit status unchanged. No retries happen here.

use crate::errors::BackfillError;
use crate::stage::Stage;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Path the credential file is bound to inside the container.
const CONTAINER_CREDS_PATH: &str = "/tmp/keys/creds.json";

/// Inputs shared by every run of a backfill operation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Path to the `.env` file passed through to the runner.
    pub env_file: PathBuf,
    /// Path to the application-default-credentials file, mounted read-only.
    pub credentials: PathBuf,
    /// Image tag version.
    pub version: String,
    /// Series identifier, forwarded to the ingestors stage only.
    pub series_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            env_file: PathBuf::from(".env"),
            credentials: default_credentials_path(),
            version: "latest".to_string(),
            series_id: None,
        }
    }
}

/// Returns the conventional gcloud application-default-credentials path.
#[must_use]
pub fn default_credentials_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("~"), PathBuf::from);
    home.join(".config/gcloud/application_default_credentials.json")
}

/// One unit of work: a single stage run scoped to a single date.
///
/// Constructed per date by the driver, consumed once by the invoker.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The stage to run.
    pub stage: Stage,
    /// The report date the run is scoped to.
    pub date: NaiveDate,
    /// Shared run inputs.
    pub options: RunOptions,
    /// Whether the run is attached to the invoking terminal.
    ///
    /// True only in sequential mode; concurrent workers cannot share one
    /// terminal, so pooled runs are always detached.
    pub interactive: bool,
}

/// The outcome of one external run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// The stage that ran.
    pub stage: Stage,
    /// The report date the run was scoped to.
    pub date: NaiveDate,
    /// The external process's exit code, unchanged. -1 if killed by a signal.
    pub exit_code: i32,
}

impl RunResult {
    /// Returns true if the run exited zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes one external run for a (stage, date) pair.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Spawns the run and awaits its completion.
    ///
    /// # Errors
    ///
    /// Returns [`BackfillError::Spawn`] if the runner process could not be
    /// launched at all. A nonzero exit is not an error here; it is reported
    /// through the [`RunResult`].
    async fn invoke(&self, request: RunRequest) -> Result<RunResult, BackfillError>;
}

#[async_trait]
impl<I: StageInvoker + ?Sized> StageInvoker for std::sync::Arc<I> {
    async fn invoke(&self, request: RunRequest) -> Result<RunResult, BackfillError> {
        (**self).invoke(request).await
    }
}

/// Invoker that launches stage containers via `docker run`.
#[derive(Debug, Clone)]
pub struct DockerInvoker {
    program: String,
}

impl DockerInvoker {
    /// Creates an invoker using the `docker` binary on PATH.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    /// Overrides the launcher binary (for tests).
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Builds the full `docker run` argument list for a request.
    ///
    /// The report date rides along twice: as the `REPORT_DATE` environment
    /// variable and as the `--report-date` runner argument. The series id is
    /// appended only for stages that accept one.
    #[must_use]
    pub fn build_args(request: &RunRequest) -> Vec<String> {
        let date = request.date.format("%Y-%m-%d").to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--env-file".to_string(),
            path_arg(&request.options.env_file),
            "-v".to_string(),
            format!(
                "{}:{CONTAINER_CREDS_PATH}:ro",
                path_arg(&request.options.credentials)
            ),
            "-e".to_string(),
            format!("GOOGLE_APPLICATION_CREDENTIALS={CONTAINER_CREDS_PATH}"),
            "-e".to_string(),
            format!("REPORT_DATE={date}"),
        ];
        if request.interactive {
            args.push("-it".to_string());
        }
        args.push(format!(
            "{}:{}",
            request.stage.image_tag(),
            request.options.version
        ));
        args.extend(request.stage.command().iter().map(ToString::to_string));
        args.push("--report-date".to_string());
        args.push(date);
        if request.stage.accepts_series_id() {
            if let Some(series_id) = &request.options.series_id {
                args.push("--series-id".to_string());
                args.push(series_id.clone());
            }
        }
        args
    }
}

impl Default for DockerInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageInvoker for DockerInvoker {
    async fn invoke(&self, request: RunRequest) -> Result<RunResult, BackfillError> {
        let args = Self::build_args(&request);
        debug!(stage = %request.stage, date = %request.date, ?args, "launching stage runner");

        let mut command = Command::new(&self.program);
        command.args(&args);
        if !request.interactive {
            // Detached runs must not compete for the invoking terminal.
            command.stdin(Stdio::null());
        }

        let status = command.status().await?;
        Ok(RunResult {
            stage: request.stage,
            date: request.date,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
