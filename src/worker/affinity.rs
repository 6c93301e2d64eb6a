//! CPU placement of execution contexts
//!
//! The `-m` core list names the CPUs that get an execution context (one
//! reactor thread per entry). With pinning enabled each reactor binds itself
//! to its CPU before it starts running jobs.
//!
//! # Example
//!
//! ```
//! use bdevperf::worker::affinity::parse_core_list;
//!
//! assert_eq!(parse_core_list("0,2-4").unwrap(), vec![0, 2, 3, 4]);
//! assert_eq!(parse_core_list("0x5").unwrap(), vec![0, 2]);
//! ```

use crate::Result;
use anyhow::Context;
use tracing::warn;

/// Highest CPU id a `cpu_set_t` can name
const MAX_CORE: usize = 1023;

/// Bind the calling thread to a single CPU
///
/// # Errors
///
/// Fails when the CPU id is out of range or the kernel refuses the mask.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    if core > MAX_CORE {
        anyhow::bail!("CPU core ID {} is too large (max {})", core, MAX_CORE);
    }

    // SAFETY: cpu_set_t is plain data; the mask is fully initialized before
    // it is handed to the kernel.
    let result = unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut cpu_set);
        CPU_SET(core, &mut cpu_set);
        sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &cpu_set)
    };
    if result != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to pin reactor to core {}", core));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_core: usize) -> Result<()> {
    anyhow::bail!("CPU pinning is only supported on Linux")
}

/// Parse a core list: `0,2-4,7` or a hex mask such as `0x3`
///
/// The result is sorted and free of duplicates.
pub fn parse_core_list(spec: &str) -> Result<Vec<usize>> {
    let spec = spec.trim().trim_start_matches('[').trim_end_matches(']');
    let mut cores = Vec::new();

    if let Some(hex) = spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
        let mask = u128::from_str_radix(hex, 16).with_context(|| format!("Invalid core mask: {}", spec))?;
        cores.extend((0..128).filter(|bit| mask & (1u128 << bit) != 0));
    } else {
        for part in spec.split(',').map(str::trim) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: usize = start
                        .parse()
                        .with_context(|| format!("Invalid CPU core number: {}", start))?;
                    let end: usize = end
                        .parse()
                        .with_context(|| format!("Invalid CPU core number: {}", end))?;
                    if start > end {
                        anyhow::bail!("Invalid CPU range: start ({}) > end ({})", start, end);
                    }
                    cores.extend(start..=end);
                }
                None => cores.push(
                    part.parse()
                        .with_context(|| format!("Invalid CPU core number: {}", part))?,
                ),
            }
        }
    }

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }
    if let Some(&core) = cores.iter().find(|&&core| core > MAX_CORE) {
        anyhow::bail!("CPU core ID {} is too large (max {})", core, MAX_CORE);
    }
    cores.sort_unstable();
    cores.dedup();
    Ok(cores)
}

/// Warn when more reactors are requested than the machine has CPUs
pub fn warn_if_oversubscribed(reactors: usize) -> bool {
    let cpus = num_cpus::get();
    if reactors > cpus {
        warn!(reactors, cpus, "more execution contexts than CPUs; reactors will share cores");
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_core_list() {
        assert_eq!(parse_core_list("0").unwrap(), vec![0]);
        assert_eq!(parse_core_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_core_list("3, 1,2-2,1").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_core_list("[0,2]").unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_parse_core_mask() {
        assert_eq!(parse_core_list("0x1").unwrap(), vec![0]);
        assert_eq!(parse_core_list("0xF0").unwrap(), vec![4, 5, 6, 7]);
        assert!(parse_core_list("0x0").is_err());
        assert!(parse_core_list("0xZZ").is_err());
    }

    #[test]
    fn test_parse_core_list_invalid() {
        assert!(parse_core_list("").is_err());
        assert!(parse_core_list("0,abc").is_err());
        assert!(parse_core_list("5-2").is_err());
        assert!(parse_core_list("0-2-4").is_err());
        assert!(parse_core_list("4096").is_err());
    }

    #[test]
    fn test_oversubscription() {
        let cpus = num_cpus::get();
        assert!(!warn_if_oversubscribed(cpus));
        assert!(warn_if_oversubscribed(cpus + 1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_out_of_range() {
        assert!(pin_current_thread(MAX_CORE + 1).is_err());
    }
}
