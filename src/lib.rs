//! bdevperf - block device I/O load generator and data-integrity harness
//!
//! Jobs drive a configurable workload (sequential or random reads and writes,
//! mixed read/write, verify, reset, unmap, write-zeroes, flush) against block
//! devices at a fixed queue depth, and report throughput while they run.
//!
//! # Architecture
//!
//! - **Backend contract** ([`bdev`]): devices, descriptors and I/O channels;
//!   completions arrive as events on the job's own queue
//! - **Jobs** ([`worker`]): one dispatcher state machine per device range,
//!   each running as a task on a single execution context
//! - **Execution contexts** ([`worker::reactor`]): one thread per core with a
//!   current-thread tokio runtime
//! - **Statistics** ([`stats`]): CMA/EMA rates collected by a walk that hops
//!   from job to job
//! - **Controller** ([`coordinator`]): construct, run, drain, report

pub mod bdev;
pub mod config;
pub mod coordinator;
pub mod distribution;
pub mod error;
pub mod output;
pub mod stats;
pub mod util;
pub mod worker;

pub use config::Config;
pub use error::{FailureCode, PerfError};

/// Result type used for setup paths
pub type Result<T> = anyhow::Result<T>;
