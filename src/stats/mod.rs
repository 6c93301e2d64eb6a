//! Statistics collection
//!
//! Each job keeps plain counters that only its own execution context touches,
//! so nothing here is atomic. Rates are derived when a statistics walk visits
//! the job:
//!
//! - **CMA** (cumulative moving average): `completed * 1e6 / io_time_usec`,
//!   used for the final report and for live reports without `-P`.
//! - **EMA** (exponential moving average): one sample per report period,
//!   `ema += (instant - ema) * 2 / (n + 1)`.
//!
//! # Example
//!
//! ```
//! use bdevperf::stats::JobCounters;
//!
//! let mut counters = JobCounters::default();
//! counters.io_completed = 5_000;
//! assert_eq!(counters.cma_io_per_second(2_000_000), 2_500.0);
//! ```

pub mod aggregator;

use crate::util::time::{mib_per_second, per_second};
use serde::{Deserialize, Serialize};

/// Per-job completion counters
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JobCounters {
    pub io_completed: u64,
    pub io_failed: u64,
    pub io_timeout: u64,
    prev_io_completed: u64,
    ema_io_per_second: f64,
}

impl JobCounters {
    /// Average rate over the whole run
    pub fn cma_io_per_second(&self, io_time_usec: u64) -> f64 {
        per_second(self.io_completed, io_time_usec)
    }

    /// Take one EMA sample covering the last `period_usec` microseconds
    ///
    /// Every call consumes the completions since the previous call.
    pub fn ema_io_per_second(&mut self, period_usec: u64, ema_period: u64) -> f64 {
        let delta = self.io_completed - self.prev_io_completed;
        self.prev_io_completed = self.io_completed;

        let io_per_second = per_second(delta, period_usec);
        self.ema_io_per_second +=
            (io_per_second - self.ema_io_per_second) * 2.0 / (ema_period as f64 + 1.0);
        self.ema_io_per_second
    }

    /// Compute this job's report row for a walk
    pub fn report(&mut self, job: JobIdentity, io_size: usize, sample: &SampleWindow) -> JobReport {
        let io_per_second = if sample.ema_period == 0 {
            self.cma_io_per_second(sample.io_time_usec)
        } else {
            self.ema_io_per_second(sample.period_usec, sample.ema_period)
        };

        JobReport {
            name: job.name,
            core: job.core,
            io_per_second,
            mb_per_second: mib_per_second(io_per_second, io_size),
            failed_per_second: per_second(self.io_failed, sample.io_time_usec),
            timeout_per_second: per_second(self.io_timeout, sample.io_time_usec),
        }
    }
}

/// Name and execution context of a job, as printed in reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    pub name: String,
    pub core: usize,
}

/// Time base a statistics walk samples against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindow {
    /// Time the cumulative rates are averaged over
    pub io_time_usec: u64,
    /// EMA window, 0 for cumulative averages
    pub ema_period: u64,
    /// Length of one live-report period
    pub period_usec: u64,
}

/// One job's line in a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    pub core: usize,
    pub io_per_second: f64,
    pub mb_per_second: f64,
    pub failed_per_second: f64,
    pub timeout_per_second: f64,
}
