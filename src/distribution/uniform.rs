//! Uniform random slot selection
//!
//! Uses xoshiro256++, which is cheap enough to call once per I/O.

use super::Distribution;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Uniform random distribution over a job's slots
#[derive(Debug)]
pub struct UniformDistribution {
    rng: Xoshiro256PlusPlus,
}

impl UniformDistribution {
    /// Create a distribution seeded from entropy
    pub fn new() -> Self {
        Self {
            rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    /// Create a distribution with a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Default for UniformDistribution {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution for UniformDistribution {
    #[inline(always)]
    fn next_slot(&mut self, size_in_ios: u64) -> u64 {
        if size_in_ios == 0 {
            return 0;
        }
        self.rng.gen_range(0..size_in_ios)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range() {
        let mut dist = UniformDistribution::with_seed(42);
        for _ in 0..10_000 {
            assert!(dist.next_slot(100) < 100);
        }
    }

    #[test]
    fn test_uniform_empty_range() {
        let mut dist = UniformDistribution::with_seed(42);
        assert_eq!(dist.next_slot(0), 0);
    }

    #[test]
    fn test_uniform_covers_range() {
        let mut dist = UniformDistribution::with_seed(3);
        let mut seen = [false; 16];
        for _ in 0..2_000 {
            seen[dist.next_slot(16) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = UniformDistribution::with_seed(1);
        let mut b = UniformDistribution::with_seed(2);
        let xs: Vec<u64> = (0..16).map(|_| a.next_slot(1 << 40)).collect();
        let ys: Vec<u64> = (0..16).map(|_| b.next_slot(1 << 40)).collect();
        assert_ne!(xs, ys);
    }
}
