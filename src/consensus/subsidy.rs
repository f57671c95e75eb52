//! Block subsidy schedule
//!
//! Pure halving schedule: 50 units at genesis, halved every 210,000 heights,
//! zero after 64 halvings. Arbitrary precision so callers never overflow.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::constants::{HALVING_BLOCKS, INITIAL_SUBSIDY, MAX_HALVINGS};

/// Coinbase subsidy at the given height
pub fn subsidy(height: u64) -> BigUint {
    let halvings = height / HALVING_BLOCKS;
    if halvings >= MAX_HALVINGS {
        return BigUint::zero();
    }
    BigUint::from(INITIAL_SUBSIDY) >> (halvings as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_subsidy() {
        assert_eq!(subsidy(0), BigUint::from(INITIAL_SUBSIDY));
    }

    #[test]
    fn test_first_halving() {
        assert_eq!(subsidy(HALVING_BLOCKS), BigUint::from(INITIAL_SUBSIDY / 2));
        assert_eq!(
            subsidy(HALVING_BLOCKS - 1),
            BigUint::from(INITIAL_SUBSIDY)
        );
    }

    #[test]
    fn test_second_halving() {
        assert_eq!(
            subsidy(HALVING_BLOCKS * 2),
            BigUint::from(INITIAL_SUBSIDY / 4)
        );
    }

    #[test]
    fn test_subsidy_exhausts() {
        // 50 >> 6 == 0, well before the 64-halving cutoff
        assert_eq!(subsidy(HALVING_BLOCKS * 6), BigUint::zero());
        assert_eq!(subsidy(HALVING_BLOCKS * MAX_HALVINGS), BigUint::zero());
        assert_eq!(subsidy(u64::MAX), BigUint::zero());
    }

    #[test]
    fn test_subsidy_monotone() {
        let mut prev = subsidy(0);
        for halving in 1..10u64 {
            let cur = subsidy(halving * HALVING_BLOCKS);
            assert!(cur <= prev);
            prev = cur;
        }
    }
}
