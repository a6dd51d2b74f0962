//! The backfill driver: dispatches one stage run per date.
//!
//! The driver owns the control flow the rest of the pipeline lacks:
//! - sequential or bounded-pool scheduling, sized by `workers`
//! - the continue-on-error / fail-fast policy for partial failures
//! - cooperative cancellation with best-effort shutdown
//!
//! Dates are fully independent units of work, so no ordering is required
//! across completions; the only shared state is the failure collection.

use crate::cancellation::CancellationToken;
use crate::errors::BackfillError;
use crate::invoker::{RunOptions, RunRequest, RunResult, StageInvoker};
use crate::stage::Stage;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How to handle a date whose run exits nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record the date as failed and keep going. Failed dates are often
    /// expected noise (weekends, market holidays).
    #[default]
    ContinueOnError,
    /// Abort on the first failure, surfacing its exit status.
    FailFast,
}

impl FailurePolicy {
    /// Returns true if a failed date should be skipped rather than aborted on.
    #[must_use]
    pub fn continues(self) -> bool {
        matches!(self, Self::ContinueOnError)
    }
}

/// Scheduling settings for one backfill operation.
#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    /// Number of dates to run in parallel. `<= 1` means strict sequential
    /// order with runs attached to the terminal.
    pub workers: usize,
    /// The partial-failure policy.
    pub policy: FailurePolicy,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            policy: FailurePolicy::default(),
        }
    }
}

/// Aggregated result of a backfill operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillOutcome {
    /// Number of dates submitted.
    pub total: usize,
    /// Number of dates whose run exited zero.
    pub completed: usize,
    /// Dates recorded as failed and skipped.
    pub failed_dates: Vec<NaiveDate>,
}

impl BackfillOutcome {
    /// Creates an empty outcome for the given number of dates.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            failed_dates: Vec::new(),
        }
    }

    /// Records one successful date.
    pub fn record_success(&mut self) {
        self.completed += 1;
    }

    /// Records one failed, skipped date.
    pub fn record_failure(&mut self, date: NaiveDate) {
        self.failed_dates.push(date);
    }

    /// Returns true if no date failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_dates.is_empty()
    }
}

/// Drives a backfill across a date sequence.
///
/// Each date goes through `pending -> running -> succeeded | failed`; a
/// failed date is terminal, the driver never retries.
pub struct BackfillDriver<I> {
    invoker: Arc<I>,
    options: RunOptions,
    settings: DriverSettings,
}

impl<I: StageInvoker + 'static> BackfillDriver<I> {
    /// Creates a driver around an invoker.
    pub fn new(invoker: I, options: RunOptions, settings: DriverSettings) -> Self {
        Self {
            invoker: Arc::new(invoker),
            options,
            settings,
        }
    }

    /// Runs the stage once for every date.
    ///
    /// Results are consumed in completion order. On interrupt or fail-fast
    /// abort the driver stops dispatching and returns without waiting for
    /// in-flight runs; the external processes themselves are not killed.
    ///
    /// # Errors
    ///
    /// - [`BackfillError::Interrupted`] when the cancellation token is set.
    /// - [`BackfillError::StageFailed`] on the first failure under
    ///   [`FailurePolicy::FailFast`].
    /// - [`BackfillError::Spawn`] under fail-fast when a runner could not be
    ///   launched.
    pub async fn run(
        &self,
        stage: Stage,
        dates: Vec<NaiveDate>,
        token: Arc<CancellationToken>,
    ) -> Result<BackfillOutcome, BackfillError> {
        let outcome = if self.settings.workers <= 1 {
            self.run_sequential(stage, dates, &token).await?
        } else {
            self.run_pooled(stage, dates, &token).await?
        };

        if !outcome.is_clean() {
            info!(
                stage = %stage,
                skipped = outcome.failed_dates.len(),
                "completed with skipped dates (e.g. weekends/holidays)"
            );
        }
        Ok(outcome)
    }

    /// Processes dates strictly in ascending submission order, one at a time.
    /// Runs are attached to the invoking terminal.
    async fn run_sequential(
        &self,
        stage: Stage,
        dates: Vec<NaiveDate>,
        token: &CancellationToken,
    ) -> Result<BackfillOutcome, BackfillError> {
        let mut outcome = BackfillOutcome::new(dates.len());
        for date in dates {
            if token.is_cancelled() {
                return Err(BackfillError::Interrupted);
            }
            info!(stage = %stage, %date, "running stage for date");
            let request = self.request(stage, date, true);
            let invoked = tokio::select! {
                () = token.cancelled() => return Err(BackfillError::Interrupted),
                invoked = self.invoker.invoke(request) => invoked,
            };
            self.settle(stage, date, invoked, &mut outcome)?;
        }
        Ok(outcome)
    }

    /// Submits all dates to a pool of exactly `workers` concurrent workers.
    /// Runs are detached: concurrent processes cannot share one terminal.
    async fn run_pooled(
        &self,
        stage: Stage,
        dates: Vec<NaiveDate>,
        token: &Arc<CancellationToken>,
    ) -> Result<BackfillOutcome, BackfillError> {
        let total = dates.len();
        info!(
            stage = %stage,
            dates = total,
            workers = self.settings.workers,
            "running dates with bounded worker pool"
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(dates)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..self.settings.workers {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let invoker = Arc::clone(&self.invoker);
            let token = Arc::clone(token);
            let options = self.options.clone();
            tokio::spawn(async move {
                loop {
                    // Checked before every pop: a cancelled pool stops
                    // dispatching, it does not preempt in-flight runs.
                    if token.is_cancelled() {
                        break;
                    }
                    let Some(date) = queue.lock().pop_front() else {
                        break;
                    };
                    info!(stage = %stage, %date, "running stage for date");
                    let request = RunRequest {
                        stage,
                        date,
                        options: options.clone(),
                        interactive: false,
                    };
                    let invoked = invoker.invoke(request).await;
                    if tx.send((date, invoked)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut outcome = BackfillOutcome::new(total);
        loop {
            let received = tokio::select! {
                () = token.cancelled() => {
                    info!(stage = %stage, "interrupted, abandoning in-flight runs");
                    return Err(BackfillError::Interrupted);
                }
                received = rx.recv() => received,
            };
            let Some((date, invoked)) = received else {
                break;
            };
            if let Err(err) = self.settle(stage, date, invoked, &mut outcome) {
                // Shutdown without join: stop handing out dates and return;
                // workers observe the token before their next pop.
                token.cancel("stage failure during fail-fast backfill");
                return Err(err);
            }
        }
        Ok(outcome)
    }

    /// Applies the failure policy to one completed run.
    fn settle(
        &self,
        stage: Stage,
        date: NaiveDate,
        invoked: Result<RunResult, BackfillError>,
        outcome: &mut BackfillOutcome,
    ) -> Result<(), BackfillError> {
        match invoked {
            Ok(result) if result.is_success() => {
                outcome.record_success();
                Ok(())
            }
            Ok(result) => {
                if self.settings.policy.continues() {
                    warn!(
                        stage = %stage,
                        %date,
                        exit_code = result.exit_code,
                        "skipping date (failed, continuing)"
                    );
                    outcome.record_failure(date);
                    Ok(())
                } else {
                    Err(BackfillError::StageFailed {
                        stage,
                        date,
                        code: result.exit_code,
                    })
                }
            }
            Err(err) => {
                if self.settings.policy.continues() {
                    warn!(stage = %stage, %date, error = %err, "skipping date (runner not launched)");
                    outcome.record_failure(date);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn request(&self, stage: Stage, date: NaiveDate, interactive: bool) -> RunRequest {
        RunRequest {
            stage,
            date,
            options: self.options.clone(),
            interactive,
        }
    }
}

impl<I> std::fmt::Debug for BackfillDriver<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::date_range;
    use crate::testing::ScriptedInvoker;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::time::Duration;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn sequential(policy: FailurePolicy) -> DriverSettings {
        DriverSettings { workers: 1, policy }
    }

    fn pooled(workers: usize, policy: FailurePolicy) -> DriverSettings {
        DriverSettings { workers, policy }
    }

    fn driver(invoker: ScriptedInvoker, settings: DriverSettings) -> BackfillDriver<ScriptedInvoker> {
        BackfillDriver::new(invoker, RunOptions::default(), settings)
    }

    #[tokio::test]
    async fn test_sequential_all_success() {
        let driver = driver(
            ScriptedInvoker::succeeding(),
            sequential(FailurePolicy::ContinueOnError),
        );
        let dates = date_range(date(1), date(6));
        let token = Arc::new(CancellationToken::new());

        let outcome = driver
            .run(Stage::Processors, dates.clone(), token)
            .await
            .unwrap();

        assert_eq!(outcome.total, 5);
        assert_eq!(outcome.completed, 5);
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn test_empty_date_sequence_is_a_no_op() {
        let driver = driver(
            ScriptedInvoker::succeeding(),
            sequential(FailurePolicy::ContinueOnError),
        );
        let token = Arc::new(CancellationToken::new());

        let outcome = driver.run(Stage::Ingestors, Vec::new(), token).await.unwrap();

        assert_eq!(outcome.total, 0);
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn test_continue_on_error_collects_failed_dates() {
        let invoker = ScriptedInvoker::failing_on([date(2), date(4)]);
        let driver = driver(invoker, sequential(FailurePolicy::ContinueOnError));
        let dates = date_range(date(1), date(6));
        let token = Arc::new(CancellationToken::new());

        let outcome = driver.run(Stage::Indicators, dates, token).await.unwrap();

        assert_eq!(outcome.failed_dates, vec![date(2), date(4)]);
        assert_eq!(outcome.completed, 3);
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_fail_fast_sequential_stops_at_first_failure() {
        let invoker = ScriptedInvoker::failing_on([date(3)]).with_exit_code(7);
        let driver = driver(invoker, sequential(FailurePolicy::FailFast));
        let dates = date_range(date(1), date(6));
        let token = Arc::new(CancellationToken::new());

        let err = driver
            .run(Stage::Publishers, dates, token)
            .await
            .unwrap_err();

        match err {
            BackfillError::StageFailed { stage, date: d, code } => {
                assert_eq!(stage, Stage::Publishers);
                assert_eq!(d, date(3));
                assert_eq!(code, 7);
            }
            other => panic!("expected StageFailed, got {other:?}"),
        }
        // Nothing after the failing position was ever dispatched.
        assert_eq!(
            driver.invoker.invoked_dates(),
            vec![date(1), date(2), date(3)]
        );
    }

    #[tokio::test]
    async fn test_pooled_collects_all_results_regardless_of_order() {
        let invoker = ScriptedInvoker::succeeding().with_delay(Duration::from_millis(2));
        let driver = driver(invoker, pooled(5, FailurePolicy::ContinueOnError));
        let dates = date_range(date(1), date(21));
        let token = Arc::new(CancellationToken::new());

        let outcome = driver
            .run(Stage::Ingestors, dates.clone(), token)
            .await
            .unwrap();

        assert_eq!(outcome.completed, 20);
        assert!(outcome.is_clean());

        let invoked: HashSet<_> = driver.invoker.invoked_dates().into_iter().collect();
        let expected: HashSet<_> = dates.into_iter().collect();
        assert_eq!(invoked, expected);
    }

    #[tokio::test]
    async fn test_pooled_continue_on_error_records_failures() {
        let invoker = ScriptedInvoker::failing_on([date(2), date(4)]);
        let driver = driver(invoker, pooled(3, FailurePolicy::ContinueOnError));
        let dates = date_range(date(1), date(6));
        let token = Arc::new(CancellationToken::new());

        let outcome = driver.run(Stage::Processors, dates, token).await.unwrap();

        let failed: HashSet<_> = outcome.failed_dates.iter().copied().collect();
        assert_eq!(failed, HashSet::from([date(2), date(4)]));
        assert_eq!(outcome.completed, 3);
    }

    #[tokio::test]
    async fn test_pooled_fail_fast_stops_dispatching_new_dates() {
        let invoker = ScriptedInvoker::failing_on([date(1)])
            .with_exit_code(9)
            .with_delay(Duration::from_millis(20));
        let driver = driver(invoker, pooled(2, FailurePolicy::FailFast));
        let dates = date_range(date(1), date(13));
        let token = Arc::new(CancellationToken::new());

        let err = driver
            .run(Stage::Processors, dates, token.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BackfillError::StageFailed { code: 9, .. }));
        assert!(token.is_cancelled());
        // With two workers the pool can have started at most a handful of
        // runs before the abort; the rest were never dispatched.
        assert!(driver.invoker.invoked_dates().len() < 12);
    }

    #[tokio::test]
    async fn test_sequential_runs_are_interactive() {
        let invoker = ScriptedInvoker::succeeding();
        let driver = driver(invoker, sequential(FailurePolicy::ContinueOnError));
        let token = Arc::new(CancellationToken::new());
        driver
            .run(Stage::Ingestors, date_range(date(1), date(4)), token)
            .await
            .unwrap();
        assert!(driver
            .invoker
            .invocations()
            .iter()
            .all(|request| request.interactive));
    }

    #[tokio::test]
    async fn test_pooled_runs_are_detached() {
        let invoker = ScriptedInvoker::succeeding();
        let driver = driver(invoker, pooled(4, FailurePolicy::ContinueOnError));
        let token = Arc::new(CancellationToken::new());
        driver
            .run(Stage::Ingestors, date_range(date(1), date(4)), token)
            .await
            .unwrap();
        assert!(driver
            .invoker
            .invocations()
            .iter()
            .all(|request| !request.interactive));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_dispatches_nothing() {
        let invoker = ScriptedInvoker::succeeding();
        let driver = driver(invoker, sequential(FailurePolicy::ContinueOnError));
        let token = Arc::new(CancellationToken::new());
        token.cancel("interrupt received");

        let err = driver
            .run(Stage::Publishers, date_range(date(1), date(6)), token)
            .await
            .unwrap_err();

        assert!(matches!(err, BackfillError::Interrupted));
        assert!(driver.invoker.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_during_pooled_run_escalates() {
        let invoker = ScriptedInvoker::succeeding().with_delay(Duration::from_millis(50));
        let driver = driver(invoker, pooled(2, FailurePolicy::ContinueOnError));
        let token = Arc::new(CancellationToken::new());

        let interrupter = Arc::clone(&token);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            interrupter.cancel("interrupt received");
        });

        let err = driver
            .run(Stage::Indicators, date_range(date(1), date(13)), token)
            .await
            .unwrap_err();

        assert!(matches!(err, BackfillError::Interrupted));
        // Interrupt always wins, even under continue-on-error.
    }

    #[tokio::test]
    async fn test_interrupt_during_sequential_run_escalates() {
        let invoker = ScriptedInvoker::succeeding().with_delay(Duration::from_millis(50));
        let driver = driver(invoker, sequential(FailurePolicy::ContinueOnError));
        let token = Arc::new(CancellationToken::new());

        let interrupter = Arc::clone(&token);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            interrupter.cancel("interrupt received");
        });

        let err = driver
            .run(Stage::Indicators, date_range(date(1), date(6)), token)
            .await
            .unwrap_err();

        assert!(matches!(err, BackfillError::Interrupted));
    }

    #[tokio::test]
    async fn test_series_id_rides_along_on_requests() {
        let invoker = ScriptedInvoker::succeeding();
        let options = RunOptions {
            series_id: Some("us_stocks_sip".to_string()),
            ..RunOptions::default()
        };
        let driver = BackfillDriver::new(
            invoker,
            options,
            sequential(FailurePolicy::ContinueOnError),
        );
        let token = Arc::new(CancellationToken::new());

        driver
            .run(Stage::Ingestors, vec![date(1)], token)
            .await
            .unwrap();

        let invocations = driver.invoker.invocations();
        assert_eq!(
            invocations[0].options.series_id.as_deref(),
            Some("us_stocks_sip")
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = DriverSettings::default();
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.policy, FailurePolicy::ContinueOnError);
    }

    #[test]
    fn test_outcome_serializes() {
        let mut outcome = BackfillOutcome::new(3);
        outcome.record_success();
        outcome.record_failure(date(2));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["completed"], 1);
        assert_eq!(json["failed_dates"][0], "2024-01-02");
    }
}
