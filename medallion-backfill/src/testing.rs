//! Test doubles for exercising the driver without launching containers.

use crate::errors::BackfillError;
use crate::invoker::{RunRequest, RunResult, StageInvoker};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

/// An invoker that answers from a script instead of running anything.
///
/// Every request is recorded at dispatch time, before any configured delay,
/// so recorded order reflects dispatch order.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    fail_dates: HashSet<NaiveDate>,
    failure_exit_code: i32,
    delay: Option<Duration>,
    invocations: Mutex<Vec<RunRequest>>,
}

impl ScriptedInvoker {
    /// An invoker where every run exits zero.
    #[must_use]
    pub fn succeeding() -> Self {
        Self {
            failure_exit_code: 1,
            ..Self::default()
        }
    }

    /// An invoker that fails runs for the given dates (exit code 1).
    pub fn failing_on(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            fail_dates: dates.into_iter().collect(),
            ..Self::succeeding()
        }
    }

    /// Sets the exit code reported for failing dates.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.failure_exit_code = code;
        self
    }

    /// Makes every run take the given amount of time.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns every request dispatched so far, in dispatch order.
    #[must_use]
    pub fn invocations(&self) -> Vec<RunRequest> {
        self.invocations.lock().clone()
    }

    /// Returns the dates dispatched so far, in dispatch order.
    #[must_use]
    pub fn invoked_dates(&self) -> Vec<NaiveDate> {
        self.invocations.lock().iter().map(|r| r.date).collect()
    }
}

#[async_trait]
impl StageInvoker for ScriptedInvoker {
    async fn invoke(&self, request: RunRequest) -> Result<RunResult, BackfillError> {
        self.invocations.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let exit_code = if self.fail_dates.contains(&request.date) {
            self.failure_exit_code
        } else {
            0
        };
        Ok(RunResult {
            stage: request.stage,
            date: request.date,
            exit_code,
        })
    }
}
