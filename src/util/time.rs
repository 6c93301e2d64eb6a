//! Timing and rate helpers
//!
//! All throughput figures are computed from microsecond time bases, matching
//! how run durations and report periods are configured.

use std::time::Duration;

/// Bytes per MiB, used when converting IOPS to data rate
pub const MIB: f64 = (1u64 << 20) as f64;

/// Convert a duration to whole microseconds, saturating at `u64::MAX`
#[inline]
pub fn as_usec(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Events per second given a count over `usec` microseconds
///
/// Returns 0.0 when no time has elapsed.
///
/// # Examples
///
/// ```
/// use bdevperf::util::time::per_second;
///
/// assert_eq!(per_second(500, 1_000_000), 500.0);
/// assert_eq!(per_second(3, 0), 0.0);
/// ```
#[inline]
pub fn per_second(count: u64, usec: u64) -> f64 {
    if usec == 0 {
        return 0.0;
    }
    count as f64 * 1_000_000.0 / usec as f64
}

/// Data rate in MiB/s for an I/O rate at a fixed I/O size
#[inline]
pub fn mib_per_second(io_per_second: f64, io_size: usize) -> f64 {
    io_per_second * io_size as f64 / MIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_usec() {
        assert_eq!(as_usec(Duration::from_secs(3)), 3_000_000);
        assert_eq!(as_usec(Duration::from_nanos(999)), 0);
    }

    #[test]
    fn test_per_second_exact() {
        // 12345 completions over 2.5 seconds
        assert_eq!(per_second(12_345, 2_500_000), 4938.0);
    }

    #[test]
    fn test_mib_per_second() {
        assert_eq!(mib_per_second(256.0, 4096), 1.0);
        assert_eq!(mib_per_second(0.0, 4096), 0.0);
    }
}
