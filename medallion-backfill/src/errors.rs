//! Error types for the backfill driver.
//!
//! The taxonomy mirrors how failures propagate: usage errors abort before any
//! dispatch, a stage failure is local to one date unless fail-fast is
//! selected, and an interrupt always terminates the whole operation.

use crate::stage::Stage;
use chrono::NaiveDate;
use thiserror::Error;

/// Exit code reported when the operation was interrupted.
pub const INTERRUPT_EXIT_CODE: u8 = 130;

/// The main error type for backfill operations.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// Required date-range inputs were missing or ambiguous.
    ///
    /// Raised before any work is dispatched.
    #[error("{0}")]
    Usage(String),

    /// One date's external run exited nonzero and fail-fast is in effect.
    #[error("stage '{stage}' failed for {date} with exit code {code}")]
    StageFailed {
        /// The stage that was running.
        stage: Stage,
        /// The report date of the failing run.
        date: NaiveDate,
        /// The external process's exit code, unchanged.
        code: i32,
    },

    /// The operation was cancelled by an external interrupt.
    #[error("interrupted")]
    Interrupted,

    /// The stage runner could not be launched at all.
    #[error("failed to launch stage runner: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BackfillError {
    /// Maps the error to the process exit code.
    ///
    /// A fail-fast abort propagates the failing run's own exit status.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::StageFailed { code, .. } => u8::try_from(*code).unwrap_or(1),
            Self::Interrupted => INTERRUPT_EXIT_CODE,
            Self::Spawn(_) => 1,
        }
    }
}
