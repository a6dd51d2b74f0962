//! `backfill` - re-run a medallion pipeline stage across a date range.

use chrono::NaiveDate;
use clap::Parser;
use medallion_backfill::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "backfill",
    version,
    about = "Backfill a pipeline stage by running one containerized stage run per report date."
)]
struct Cli {
    /// Pipeline stage to backfill.
    #[arg(long, value_parser = parse_stage)]
    stage: Stage,

    /// First report date (YYYY-MM-DD), inclusive.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last report date boundary (YYYY-MM-DD), exclusive.
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Run for the single date `today - N` instead of a range.
    #[arg(long, conflicts_with_all = ["start", "end"])]
    days_ago: Option<u64>,

    /// Env file passed through to each stage run.
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Credentials file mounted read-only into each run.
    /// Defaults to the gcloud application-default-credentials path.
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Series identifier, forwarded to the ingestors stage only.
    #[arg(long, env = "SERIES_ID")]
    series_id: Option<String>,

    /// Image tag version to run.
    #[arg(long, default_value = "latest")]
    image_version: String,

    /// Record failed dates and keep going (the default).
    #[arg(long, conflicts_with = "fail_fast")]
    continue_on_error: bool,

    /// Abort on the first failed date, propagating its exit status.
    #[arg(long)]
    fail_fast: bool,

    /// Number of dates to run in parallel. 1 runs sequentially with runs
    /// attached to the terminal.
    #[arg(long, default_value_t = 3)]
    workers: usize,
}

impl Cli {
    fn policy(&self) -> FailurePolicy {
        if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::ContinueOnError
        }
    }

    fn run_options(self) -> RunOptions {
        RunOptions {
            env_file: self.env_file,
            credentials: self.credentials.unwrap_or_else(default_credentials_path),
            version: self.image_version,
            series_id: self.series_id,
        }
    }
}

fn parse_stage(value: &str) -> Result<Stage, String> {
    value.parse()
}

/// Days-ago mode targets a single date and runs it attached to the terminal,
/// so it forces sequential scheduling regardless of `--workers`.
fn effective_workers(selection: &DateSelection, requested: usize) -> usize {
    match selection {
        DateSelection::DaysAgo(_) => 1,
        DateSelection::Range { .. } => requested,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            match err {
                BackfillError::Interrupted => info!("interrupted, exiting"),
                other => error!("{other}"),
            }
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<(), BackfillError> {
    let selection = DateSelection::from_options(cli.start, cli.end, cli.days_ago)?;
    let dates = selection.report_dates();

    let stage = cli.stage;
    let settings = DriverSettings {
        workers: effective_workers(&selection, cli.workers),
        policy: cli.policy(),
    };
    let options = cli.run_options();

    let token = Arc::new(CancellationToken::new());
    let interrupt = Arc::clone(&token);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel("interrupt received");
        }
    });

    let driver = BackfillDriver::new(DockerInvoker::new(), options, settings);
    let outcome = driver.run(stage, dates, token).await?;
    info!(
        total = outcome.total,
        completed = outcome.completed,
        skipped = outcome.failed_dates.len(),
        "backfill finished"
    );
    Ok(())
}
