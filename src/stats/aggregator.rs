//! Statistics aggregation
//!
//! A report is gathered by a [`StatsWalk`]: a snapshot that travels from one
//! job's execution context to the next. Each job adds its own row while the
//! walk is in its hands, so counters are never read from outside the context
//! that owns them. When the route is exhausted the walk is posted back to the
//! controller, which prints it.
//!
//! # Example
//!
//! ```
//! use bdevperf::stats::{JobReport, SampleWindow};
//! use bdevperf::stats::aggregator::AggregateStats;
//!
//! let window = SampleWindow { io_time_usec: 1_000_000, ema_period: 0, period_usec: 0 };
//! let mut stats = AggregateStats::new(window);
//! stats.accumulate(JobReport {
//!     name: "Malloc0".into(),
//!     core: 0,
//!     io_per_second: 1000.0,
//!     mb_per_second: 3.9,
//!     failed_per_second: 0.0,
//!     timeout_per_second: 0.0,
//! });
//! assert_eq!(stats.total_io_per_second, 1000.0);
//! ```

use super::{JobReport, SampleWindow};
use crate::coordinator::ControlEvent;
use crate::worker::context::JobHandle;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Running totals of one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub window: SampleWindow,
    pub total_io_per_second: f64,
    pub total_mb_per_second: f64,
    pub total_failed_per_second: f64,
    pub total_timeout_per_second: f64,
    /// Rows in visiting order
    pub jobs: Vec<JobReport>,
}

impl AggregateStats {
    pub fn new(window: SampleWindow) -> Self {
        AggregateStats {
            window,
            total_io_per_second: 0.0,
            total_mb_per_second: 0.0,
            total_failed_per_second: 0.0,
            total_timeout_per_second: 0.0,
            jobs: Vec::new(),
        }
    }

    /// Add one job's row to the totals
    pub fn accumulate(&mut self, report: JobReport) {
        self.total_io_per_second += report.io_per_second;
        self.total_mb_per_second += report.mb_per_second;
        self.total_failed_per_second += report.failed_per_second;
        self.total_timeout_per_second += report.timeout_per_second;
        self.jobs.push(report);
    }
}

/// What a walk is collecting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkKind {
    /// Live report; jobs keep running
    Periodic,
    /// End-of-run report; each job tears down after it is visited
    Final,
}

/// A report in transit between job contexts
#[derive(Debug)]
pub struct StatsWalk {
    pub kind: WalkKind,
    pub stats: AggregateStats,
    route: VecDeque<JobHandle>,
    done: UnboundedSender<ControlEvent>,
}

impl StatsWalk {
    /// Prepare a walk visiting `route` in order and reporting to `done`
    pub fn new(
        kind: WalkKind,
        window: SampleWindow,
        route: impl IntoIterator<Item = JobHandle>,
        done: UnboundedSender<ControlEvent>,
    ) -> Box<Self> {
        Box::new(StatsWalk {
            kind,
            stats: AggregateStats::new(window),
            route: route.into_iter().collect(),
            done,
        })
    }

    /// Jobs still to be visited
    pub fn remaining(&self) -> usize {
        self.route.len()
    }

    /// Hand the walk to the next job, or back to the controller once every
    /// job has been visited
    ///
    /// A job whose context is gone is skipped.
    pub fn forward(mut self: Box<Self>) {
        while let Some(next) = self.route.pop_front() {
            match next.visit(self) {
                Ok(()) => return,
                Err(walk) => {
                    debug!(job = %next.name, "job is gone, skipping it in the report");
                    self = walk;
                }
            }
        }
        let done = self.done.clone();
        // The controller only disappears while the process is exiting.
        let _ = done.send(ControlEvent::DumpDone(self));
    }
}
