//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//! [`Config`] is what the user wrote; [`RunConfig`] is the validated form the
//! controller and jobs consume.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::error::PerfError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// I/O pattern driven by every job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    Read,
    Write,
    RandRead,
    RandWrite,
    Rw,
    RandRw,
    /// Write a pattern, read it back and compare
    Verify,
    /// Verify plus a device reset every 10 seconds
    Reset,
    Unmap,
    #[serde(rename = "write_zeroes")]
    WriteZeroes,
    Flush,
}

impl WorkloadType {
    pub const ALL: [WorkloadType; 11] = [
        WorkloadType::Read,
        WorkloadType::Write,
        WorkloadType::RandRead,
        WorkloadType::RandWrite,
        WorkloadType::Rw,
        WorkloadType::RandRw,
        WorkloadType::Verify,
        WorkloadType::Reset,
        WorkloadType::Unmap,
        WorkloadType::WriteZeroes,
        WorkloadType::Flush,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Read => "read",
            WorkloadType::Write => "write",
            WorkloadType::RandRead => "randread",
            WorkloadType::RandWrite => "randwrite",
            WorkloadType::Rw => "rw",
            WorkloadType::RandRw => "randrw",
            WorkloadType::Verify => "verify",
            WorkloadType::Reset => "reset",
            WorkloadType::Unmap => "unmap",
            WorkloadType::WriteZeroes => "write_zeroes",
            WorkloadType::Flush => "flush",
        }
    }

    /// Offsets are drawn at random rather than walked sequentially
    pub fn is_random(&self) -> bool {
        matches!(
            self,
            WorkloadType::RandRead | WorkloadType::RandWrite | WorkloadType::RandRw | WorkloadType::Flush
        )
    }

    /// Mixed read/write workloads take their ratio from the user
    pub fn is_mixed(&self) -> bool {
        matches!(self, WorkloadType::Rw | WorkloadType::RandRw)
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadType {
    type Err = PerfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkloadType::ALL
            .iter()
            .copied()
            .find(|w| w.as_str() == s)
            .ok_or_else(|| {
                PerfError::Config(format!(
                    "io pattern type must be one of (read, write, randread, randwrite, rw, \
                     randrw, verify, reset, unmap, write_zeroes, flush), got '{}'",
                    s
                ))
            })
    }
}

/// Complete test configuration as written by the user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// In-memory devices to create
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Per-job workload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// I/O pattern (required)
    pub workload_type: Option<WorkloadType>,
    /// Bytes per I/O (required)
    #[serde(default)]
    pub io_size: usize,
    /// Outstanding I/O per job (required)
    #[serde(default)]
    pub queue_depth: usize,
    /// Run duration in seconds (required)
    #[serde(default)]
    pub time_in_sec: u64,
    /// Per-I/O timeout in seconds, 0 disables timeout detection
    #[serde(default)]
    pub timeout_in_sec: u64,
    /// Read percentage for rw/randrw
    pub rw_percentage: Option<u32>,
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Use backend zero-copy buffers for reads and writes
    #[serde(default = "default_zcopy")]
    pub zcopy: bool,
    /// Abort I/O reported as timed out
    #[serde(default)]
    pub abort_on_timeout: bool,
}

fn default_zcopy() -> bool {
    true
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workload_type: None,
            io_size: 0,
            queue_depth: 0,
            time_in_sec: 0,
            timeout_in_sec: 0,
            rw_percentage: None,
            continue_on_failure: false,
            zcopy: default_zcopy(),
            abort_on_timeout: false,
        }
    }
}

/// Run-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Print live statistics every N seconds
    pub show_period_sec: Option<u64>,
    /// EMA smoothing window for live statistics, 0 for cumulative averages
    #[serde(default)]
    pub ema_period: u64,
    /// Only run against this device
    pub target: Option<String>,
    /// One job per device per execution context
    #[serde(default)]
    pub multithread: bool,
    /// Start idle and wait for a control request
    #[serde(default)]
    pub wait_for_tests: bool,
    /// Execution contexts, e.g. "0-3"
    pub cores: Option<String>,
    /// Pin each execution context to its CPU
    #[serde(default)]
    pub pin_cores: bool,
    /// Base seed for per-job generators
    pub seed: Option<u64>,
}

/// An in-memory device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Data capacity in bytes
    pub size: u64,
    /// Data bytes per block
    #[serde(default = "default_device_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub md_size: u32,
    #[serde(default)]
    pub md_interleaved: bool,
}

fn default_device_block_size() -> u32 {
    512
}

impl DeviceConfig {
    pub fn num_blocks(&self) -> u64 {
        self.size / self.block_size as u64
    }
}

/// Validated settings shared by every job of a run
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub workload_type: WorkloadType,
    pub io_size: usize,
    pub queue_depth: usize,
    /// Percentage of reads among fresh requests
    pub rw_percentage: u8,
    pub random: bool,
    pub verify: bool,
    pub reset: bool,
    pub unmap: bool,
    pub write_zeroes: bool,
    pub flush: bool,
    pub continue_on_failure: bool,
    pub abort: bool,
    pub zcopy: bool,
    pub timeout: Option<Duration>,
}

impl JobOptions {
    /// Options for a workload with defaults for everything else
    pub fn new(workload_type: WorkloadType, io_size: usize, queue_depth: usize) -> Self {
        let mut options = JobOptions {
            workload_type,
            io_size,
            queue_depth,
            rw_percentage: 0,
            random: workload_type.is_random(),
            verify: false,
            reset: false,
            unmap: false,
            write_zeroes: false,
            flush: false,
            continue_on_failure: false,
            abort: false,
            zcopy: false,
            timeout: None,
        };
        match workload_type {
            WorkloadType::Read | WorkloadType::RandRead => options.rw_percentage = 100,
            WorkloadType::Verify => {
                options.rw_percentage = 50;
                options.verify = true;
            }
            WorkloadType::Reset => {
                options.rw_percentage = 50;
                options.verify = true;
                options.reset = true;
            }
            WorkloadType::Unmap => options.unmap = true,
            WorkloadType::WriteZeroes => options.write_zeroes = true,
            WorkloadType::Flush => options.flush = true,
            _ => {}
        }
        options
    }
}

/// Validated configuration of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub job: JobOptions,
    pub run_time: Duration,
    pub show_period: Option<Duration>,
    pub ema_period: u64,
    pub target: Option<String>,
    pub multithread: bool,
    pub wait_for_tests: bool,
    pub seed: Option<u64>,
}

impl RunConfig {
    pub fn new(job: JobOptions, run_time: Duration) -> Self {
        RunConfig {
            job,
            run_time,
            show_period: None,
            ema_period: 0,
            target: None,
            multithread: false,
            wait_for_tests: false,
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_type_round_trip_names() {
        for w in WorkloadType::ALL {
            assert_eq!(w.as_str().parse::<WorkloadType>().unwrap(), w);
        }
        assert!("randomwrite".parse::<WorkloadType>().is_err());
    }

    #[test]
    fn test_random_workloads() {
        assert!(WorkloadType::RandRw.is_random());
        assert!(WorkloadType::Flush.is_random());
        assert!(!WorkloadType::Verify.is_random());
        assert!(!WorkloadType::Unmap.is_random());
    }

    #[test]
    fn test_job_options_flags() {
        let reset = JobOptions::new(WorkloadType::Reset, 4096, 8);
        assert!(reset.verify && reset.reset);
        assert_eq!(reset.rw_percentage, 50);

        let read = JobOptions::new(WorkloadType::RandRead, 4096, 8);
        assert_eq!(read.rw_percentage, 100);
        assert!(read.random);

        let zeroes = JobOptions::new(WorkloadType::WriteZeroes, 4096, 8);
        assert!(zeroes.write_zeroes && !zeroes.verify);
    }

    #[test]
    fn test_serde_names() {
        let w: WorkloadType = ::toml::Value::String("write_zeroes".into()).try_into().unwrap();
        assert_eq!(w, WorkloadType::WriteZeroes);
        let w: WorkloadType = ::toml::Value::String("randrw".into()).try_into().unwrap();
        assert_eq!(w, WorkloadType::RandRw);
    }

    #[test]
    fn test_device_num_blocks() {
        let dev = DeviceConfig {
            name: "Malloc0".into(),
            size: 64 << 20,
            block_size: 4096,
            md_size: 0,
            md_interleaved: false,
        };
        assert_eq!(dev.num_blocks(), 16384);
    }
}
