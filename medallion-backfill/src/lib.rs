//! # Medallion Backfill
//!
//! A backfill driver for the medallion pipeline: it re-runs a pipeline stage
//! once per report date across a date range, with support for:
//!
//! - **Date selection**: a half-open `[start, end)` range or a single
//!   relative offset from today
//! - **Bounded concurrency**: a fixed worker pool, or strict sequential
//!   order with terminal-attached runs
//! - **Failure policy**: skip-and-record (weekends and holidays are expected
//!   noise) or fail-fast with the failing run's exit status
//! - **Cooperative cancellation**: an interrupt stops dispatching and
//!   abandons in-flight runs without killing them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use medallion_backfill::prelude::*;
//!
//! let driver = BackfillDriver::new(
//!     DockerInvoker::new(),
//!     RunOptions::default(),
//!     DriverSettings::default(),
//! );
//!
//! let dates = date_range(start, end);
//! let outcome = driver.run(Stage::Processors, dates, token).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod dates;
pub mod driver;
pub mod errors;
pub mod invoker;
pub mod stage;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::dates::{date_range, DateSelection};
    pub use crate::driver::{BackfillDriver, BackfillOutcome, DriverSettings, FailurePolicy};
    pub use crate::errors::{BackfillError, INTERRUPT_EXIT_CODE};
    pub use crate::invoker::{
        default_credentials_path, DockerInvoker, RunOptions, RunRequest, RunResult, StageInvoker,
    };
    pub use crate::stage::Stage;
}
