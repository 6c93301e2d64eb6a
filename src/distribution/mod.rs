//! Slot selection for a job's I/O
//!
//! A job divides its address range into `size_in_ios` slots of one I/O each.
//! Distributions pick the next slot index in `[0, size_in_ios)`; the job turns
//! it into a block offset with `(slot + ios_base) * io_size_blocks`.
//!
//! - **Uniform**: independent uniform draws (random workloads)
//! - **Sequential**: a rotating cursor that wraps at the end of the range
//!
//! Every job owns its own instance, so there is no shared generator state.
//!
//! # Example
//!
//! ```
//! use bdevperf::distribution::{Distribution, uniform::UniformDistribution};
//!
//! let mut dist = UniformDistribution::with_seed(7);
//! let slot = dist.next_slot(1024);
//! assert!(slot < 1024);
//! ```

pub mod sequential;
pub mod uniform;

/// Picks the next slot for a fresh request
pub trait Distribution: Send + std::fmt::Debug {
    /// Next slot in `[0, size_in_ios)`
    ///
    /// Returns 0 when `size_in_ios` is 0.
    fn next_slot(&mut self, size_in_ios: u64) -> u64;
}

/// Build the distribution for a job
///
/// `seed` makes random draws reproducible; `None` seeds from entropy.
pub fn for_job(random: bool, seed: Option<u64>) -> Box<dyn Distribution> {
    if random {
        match seed {
            Some(seed) => Box::new(uniform::UniformDistribution::with_seed(seed)),
            None => Box::new(uniform::UniformDistribution::new()),
        }
    } else {
        Box::new(sequential::SequentialDistribution::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_job_sequential() {
        let mut dist = for_job(false, Some(1));
        assert_eq!(dist.next_slot(10), 0);
        assert_eq!(dist.next_slot(10), 1);
    }

    #[test]
    fn test_for_job_random_is_reproducible() {
        let mut a = for_job(true, Some(99));
        let mut b = for_job(true, Some(99));
        for _ in 0..32 {
            assert_eq!(a.next_slot(1000), b.next_slot(1000));
        }
    }
}
