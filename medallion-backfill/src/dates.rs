//! Report-date selection for backfill runs.
//!
//! A backfill request names its dates in one of two ways: a single relative
//! offset from today, or an explicit half-open `[start, end)` range stepped by
//! one calendar day. Selection is resolved up front, before anything is
//! dispatched.

use crate::errors::BackfillError;
use chrono::{Days, Local, NaiveDate};

/// How the dates of a backfill run were requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSelection {
    /// Exactly one date: today minus the given number of days.
    DaysAgo(u64),
    /// Every date `d` with `start <= d < end`, ascending. `end` is excluded.
    Range {
        /// First date to process (inclusive).
        start: NaiveDate,
        /// First date *not* to process (exclusive).
        end: NaiveDate,
    },
}

impl DateSelection {
    /// Builds a selection from the optional CLI inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackfillError::Usage`] when neither mode is fully specified:
    /// no offset, and start/end missing or only one of them given.
    pub fn from_options(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        days_ago: Option<u64>,
    ) -> Result<Self, BackfillError> {
        match (days_ago, start, end) {
            (Some(offset), None, None) => Ok(Self::DaysAgo(offset)),
            (None, Some(start), Some(end)) => Ok(Self::Range { start, end }),
            _ => Err(BackfillError::Usage(
                "provide --start and --end, or --days-ago".to_string(),
            )),
        }
    }

    /// Resolves the selection against the given notion of "today".
    #[must_use]
    pub fn resolve(&self, today: NaiveDate) -> Vec<NaiveDate> {
        match *self {
            Self::DaysAgo(offset) => vec![today - Days::new(offset)],
            Self::Range { start, end } => date_range(start, end),
        }
    }

    /// Resolves the selection against the local calendar date.
    #[must_use]
    pub fn report_dates(&self) -> Vec<NaiveDate> {
        self.resolve(Local::now().date_naive())
    }
}

/// Returns every date in the half-open interval `[start, end)`, ascending.
///
/// Empty whenever `start >= end`.
#[must_use]
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d < end).collect()
}
