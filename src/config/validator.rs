//! Configuration validation
//!
//! Turns a user [`Config`] into a [`RunConfig`], rejecting invalid flag
//! combinations before any device is touched.

use super::{Config, JobOptions, RunConfig};
use crate::error::{PerfError, PerfResult};
use std::time::Duration;
use tracing::{info, warn};

/// Largest I/O the backend serves from its large-buffer pool
///
/// Verify and reset workloads cannot exceed it, and zero-copy is only used
/// up to this size.
pub const LARGE_BUF_MAX_SIZE: usize = 64 * 1024;

fn invalid(msg: impl Into<String>) -> PerfError {
    PerfError::Config(msg.into())
}

/// Validate a configuration and resolve per-job options
///
/// # Errors
///
/// Returns [`PerfError::Config`] describing the first rule violated.
pub fn validate_config(config: &Config) -> PerfResult<RunConfig> {
    let workload = &config.workload;
    let runtime = &config.runtime;

    let workload_type = workload
        .workload_type
        .ok_or_else(|| invalid("workload type (-w) must be specified"))?;
    if workload.queue_depth == 0 {
        return Err(invalid("queue depth (-q) must be greater than 0"));
    }
    if workload.io_size == 0 {
        return Err(invalid("io size (-o) must be greater than 0"));
    }
    if workload.time_in_sec == 0 {
        return Err(invalid("run time (-t) must be greater than 0"));
    }

    let show_period = match runtime.show_period_sec {
        Some(0) => return Err(invalid("real-time report period (-S) must be greater than 0")),
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };
    if runtime.ema_period > 0 && show_period.is_none() {
        return Err(invalid("-P option must be specified with -S option"));
    }

    let mut job = JobOptions::new(workload_type, workload.io_size, workload.queue_depth);
    job.continue_on_failure = workload.continue_on_failure;
    job.abort = workload.abort_on_timeout;
    job.zcopy = workload.zcopy;
    job.timeout = (workload.timeout_in_sec > 0).then(|| Duration::from_secs(workload.timeout_in_sec));

    if job.verify && workload.io_size > LARGE_BUF_MAX_SIZE {
        return Err(invalid(format!(
            "Unable to exceed max I/O size of {} for verify. ({} provided)",
            LARGE_BUF_MAX_SIZE, workload.io_size
        )));
    }

    if workload_type.is_mixed() {
        match workload.rw_percentage {
            Some(pct) if pct <= 100 => job.rw_percentage = pct as u8,
            Some(pct) => {
                return Err(invalid(format!(
                    "-M must be specified with a value from 0 to 100 for rw or randrw, got {}",
                    pct
                )))
            }
            None => {
                return Err(invalid(
                    "-M must be specified with a value from 0 to 100 for rw or randrw",
                ))
            }
        }
    } else if workload.rw_percentage.is_some() {
        warn!(
            workload = %workload_type,
            "Ignoring -M option, it is only used with rw and randrw"
        );
    }

    if job.zcopy && workload.io_size > LARGE_BUF_MAX_SIZE {
        info!(
            io_size = workload.io_size,
            threshold = LARGE_BUF_MAX_SIZE,
            "I/O size is greater than zero copy threshold, zero copy will not be used"
        );
        job.zcopy = false;
    }

    Ok(RunConfig {
        job,
        run_time: Duration::from_secs(workload.time_in_sec),
        show_period,
        ema_period: runtime.ema_period,
        target: runtime.target.clone(),
        multithread: runtime.multithread,
        wait_for_tests: runtime.wait_for_tests,
        seed: runtime.seed,
    })
}
