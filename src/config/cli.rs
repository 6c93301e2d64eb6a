//! CLI argument parsing using clap
//!
//! Short flags follow the classic bdevperf letters so existing invocations
//! keep working, e.g. `bdevperf -q 128 -o 4096 -w randread -t 10`.

use super::{Config, DeviceConfig, RuntimeConfig, WorkloadConfig, WorkloadType};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

/// bdevperf - block device I/O load generator and data integrity harness
#[derive(Parser, Debug)]
#[command(name = "bdevperf")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML job file; command line values override it
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// I/O queue depth per job
    #[arg(short = 'q', long)]
    pub queue_depth: Option<usize>,

    /// I/O size (e.g. 4096, 4k, 64k)
    #[arg(short = 'o', long)]
    pub io_size: Option<String>,

    /// I/O pattern: read, write, randread, randwrite, rw, randrw, verify,
    /// reset, unmap, write_zeroes, flush
    #[arg(short = 'w', long, value_parser = WorkloadType::from_str)]
    pub workload: Option<WorkloadType>,

    /// Run time in seconds
    #[arg(short = 't', long)]
    pub time: Option<u64>,

    /// Timeout in seconds to detect starved I/O (0 disables)
    #[arg(short = 'k', long)]
    pub timeout: Option<u64>,

    /// Read percentage for rw/randrw (100 for reads, 0 for writes)
    #[arg(short = 'M', long = "rwmixread")]
    pub rw_mix_read: Option<u32>,

    /// Moving average window for live results: EMA[i+1] = IO/s * M + (1 - M) * EMA[i],
    /// M = 2 / (n + 1) (requires -S)
    #[arg(short = 'P', long)]
    pub ema_period: Option<u64>,

    /// Show live results every <period> seconds
    #[arg(short = 'S', long)]
    pub show_period: Option<u64>,

    /// Device to run against (default: all devices)
    #[arg(short = 'T', long)]
    pub target: Option<String>,

    /// Continue processing I/O after failures
    #[arg(short = 'f', long)]
    pub continue_on_failure: bool,

    /// Do not use zero-copy buffers for reads and writes
    #[arg(short = 'x', long)]
    pub no_zcopy: bool,

    /// Start idle and wait for a perform_tests request on stdin
    #[arg(short = 'z', long)]
    pub wait_for_tests: bool,

    /// Abort I/O that timed out
    #[arg(short = 'A', long)]
    pub abort_on_timeout: bool,

    /// Every execution context sends I/O to each device
    #[arg(short = 'C', long)]
    pub multithread: bool,

    /// In-memory device NAME:SIZE:BLOCK_SIZE[:MD_SIZE[:interleaved]], repeatable
    #[arg(long = "malloc", value_name = "DEVICE")]
    pub malloc: Vec<String>,

    /// CPU list for execution contexts (e.g. "0-3", "0,2")
    #[arg(short = 'm', long)]
    pub cores: Option<String>,

    /// Pin each execution context to its CPU
    #[arg(long)]
    pub pin: bool,

    /// Base seed for reproducible offsets and data patterns
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log filter (e.g. info, debug, bdevperf=trace)
    #[arg(long, env = "BDEVPERF_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build a configuration from the command line alone
    pub fn to_config(&self) -> Result<Config> {
        let mut config = Config {
            workload: WorkloadConfig::default(),
            runtime: RuntimeConfig::default(),
            devices: Vec::new(),
        };
        self.apply(&mut config)?;
        Ok(config)
    }

    /// Overlay every value given on the command line onto `config`
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        let workload = &mut config.workload;
        if let Some(w) = self.workload {
            workload.workload_type = Some(w);
        }
        if let Some(qd) = self.queue_depth {
            workload.queue_depth = qd;
        }
        if let Some(size) = &self.io_size {
            workload.io_size = usize::try_from(parse_size(size)?)
                .with_context(|| format!("I/O size too large: {}", size))?;
        }
        if let Some(t) = self.time {
            workload.time_in_sec = t;
        }
        if let Some(k) = self.timeout {
            workload.timeout_in_sec = k;
        }
        if let Some(m) = self.rw_mix_read {
            workload.rw_percentage = Some(m);
        }
        if self.continue_on_failure {
            workload.continue_on_failure = true;
        }
        if self.no_zcopy {
            workload.zcopy = false;
        }
        if self.abort_on_timeout {
            workload.abort_on_timeout = true;
        }

        let runtime = &mut config.runtime;
        if let Some(s) = self.show_period {
            runtime.show_period_sec = Some(s);
        }
        if let Some(p) = self.ema_period {
            runtime.ema_period = p;
        }
        if let Some(t) = &self.target {
            runtime.target = Some(t.clone());
        }
        if self.multithread {
            runtime.multithread = true;
        }
        if self.wait_for_tests {
            runtime.wait_for_tests = true;
        }
        if let Some(c) = &self.cores {
            runtime.cores = Some(c.clone());
        }
        if self.pin {
            runtime.pin_cores = true;
        }
        if let Some(seed) = self.seed {
            runtime.seed = Some(seed);
        }

        for spec in &self.malloc {
            config.devices.push(parse_malloc(spec)?);
        }
        Ok(())
    }
}

/// Parse a size string (e.g., "1G", "100M", "4k") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with('k') || s.ends_with("kb") {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with('m') || s.ends_with("mb") {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with('g') || s.ends_with("gb") {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size out of range: {}", s))
}

/// Parse an in-memory device description `NAME:SIZE:BLOCK_SIZE[:MD_SIZE[:interleaved]]`
pub fn parse_malloc(spec: &str) -> Result<DeviceConfig> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts.len() > 5 || parts[0].is_empty() {
        anyhow::bail!(
            "Invalid device '{}', expected NAME:SIZE:BLOCK_SIZE[:MD_SIZE[:interleaved]]",
            spec
        );
    }

    let size = parse_size(parts[1])?;
    let block_size: u32 = parts[2]
        .parse()
        .with_context(|| format!("Invalid block size in device '{}'", spec))?;
    if block_size == 0 || size < block_size as u64 {
        anyhow::bail!("Device '{}' must hold at least one block", spec);
    }
    let md_size: u32 = match parts.get(3) {
        Some(md) => md
            .parse()
            .with_context(|| format!("Invalid metadata size in device '{}'", spec))?,
        None => 0,
    };
    let md_interleaved = match parts.get(4) {
        Some(&"interleaved") => true,
        Some(&"separate") | None => false,
        Some(other) => anyhow::bail!("Unknown metadata layout '{}' in device '{}'", other, spec),
    };

    Ok(DeviceConfig {
        name: parts[0].to_string(),
        size,
        block_size,
        md_size,
        md_interleaved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("1gb").unwrap(), 1 << 30);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_parse_malloc() {
        let dev = parse_malloc("Malloc0:64M:512").unwrap();
        assert_eq!(dev.name, "Malloc0");
        assert_eq!(dev.size, 64 << 20);
        assert_eq!(dev.block_size, 512);
        assert_eq!(dev.md_size, 0);

        let dev = parse_malloc("Malloc1:1M:512:8:interleaved").unwrap();
        assert_eq!(dev.md_size, 8);
        assert!(dev.md_interleaved);

        assert!(parse_malloc("Malloc2:1M").is_err());
        assert!(parse_malloc("Malloc2:1M:512:8:sideways").is_err());
        assert!(parse_malloc("Malloc2:256:512").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "bdevperf", "-q", "32", "-o", "4k", "-w", "randrw", "-M", "70", "-t", "5", "-S", "1",
            "-P", "4", "-T", "Malloc0", "-f", "-x", "-A", "-C", "--malloc", "Malloc0:8M:512",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.workload.queue_depth, 32);
        assert_eq!(config.workload.io_size, 4096);
        assert_eq!(config.workload.workload_type, Some(WorkloadType::RandRw));
        assert_eq!(config.workload.rw_percentage, Some(70));
        assert_eq!(config.workload.time_in_sec, 5);
        assert!(config.workload.continue_on_failure);
        assert!(!config.workload.zcopy);
        assert!(config.workload.abort_on_timeout);
        assert_eq!(config.runtime.show_period_sec, Some(1));
        assert_eq!(config.runtime.ema_period, 4);
        assert_eq!(config.runtime.target.as_deref(), Some("Malloc0"));
        assert!(config.runtime.multithread);
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn test_cli_rejects_unknown_workload() {
        assert!(Cli::try_parse_from(["bdevperf", "-w", "trim"]).is_err());
    }
}
