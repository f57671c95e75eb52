//! Difficulty retarget engine
//!
//! Targets are signed arbitrary-precision integers: a block is valid when its
//! derived loss is at or below the target, so more negative means harder.
//! Every `retarget_interval` heights the target is rescaled by the ratio of
//! measured to expected timespan, clamped to 4x in either direction.

use num_bigint::BigInt;
use thiserror::Error;

use crate::consensus::Header;
use crate::ChainConfig;

/// Read-only view of the chain needed for retargeting
pub trait ChainReader {
    /// Canonical header at the given height, if present
    fn header_at(&self, height: u64) -> Option<Header>;
    /// Current tip height
    fn height(&self) -> u64;
}

#[derive(Debug, Error)]
pub enum DifficultyError {
    /// Historical header missing inside the retarget window. Recoverable:
    /// callers keep the tip's bits unchanged.
    #[error("missing header at height {0} in retarget window")]
    MissingHeader(u64),
}

/// Compute the target for the block following `tip`.
///
/// Below `retarget_interval` heights of history the target passes through
/// unchanged. Otherwise the previous target is scaled by the clamped ratio of
/// actual to expected window span (integer division toward zero) and
/// saturated into [-2^63, -1].
pub fn adjust(
    chain: &dyn ChainReader,
    tip: &Header,
    config: &ChainConfig,
) -> Result<BigInt, DifficultyError> {
    let interval = config.retarget_interval;
    if tip.height < interval {
        // Not enough history yet
        return Ok(tip.bits.clone());
    }

    let first_height = tip.height - interval + 1;
    let first = chain
        .header_at(first_height)
        .ok_or(DifficultyError::MissingHeader(first_height))?;

    let expected = interval as i64 * config.target_spacing_secs;
    let mut actual = tip.timestamp - first.timestamp;

    // Clamp to [expected/factor, expected*factor]
    let min_span = expected / config.max_adjustment_factor;
    let max_span = expected * config.max_adjustment_factor;
    if actual < min_span {
        actual = min_span;
    } else if actual > max_span {
        actual = max_span;
    }

    // new = old * actual / expected, truncating toward zero
    let mut new_bits = &tip.bits * BigInt::from(actual) / BigInt::from(expected.max(1));

    // Saturate: targets live in [-2^63, -1]; -1 is the easiest valid target,
    // -2^63 the hardest.
    let easiest = BigInt::from(-1i64);
    let hardest = BigInt::from(i64::MIN);
    if new_bits > easiest {
        new_bits = easiest;
    } else if new_bits < hardest {
        new_bits = hardest;
    }

    Ok(new_bits)
}

/// True when a block at this height recomputes its target
pub fn is_retarget_boundary(height: u64, config: &ChainConfig) -> bool {
    height > 0 && height % config.retarget_interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use std::collections::HashMap;

    struct MockChain {
        headers: HashMap<u64, Header>,
        height: u64,
    }

    impl ChainReader for MockChain {
        fn header_at(&self, height: u64) -> Option<Header> {
            self.headers.get(&height).cloned()
        }
        fn height(&self) -> u64 {
            self.height
        }
    }

    fn synthetic_chain(count: u64, spacing_secs: i64, bits: i64) -> MockChain {
        let mut headers = HashMap::new();
        for h in 0..=count {
            headers.insert(
                h,
                Header {
                    height: h,
                    parent_hash: Hash::zero(),
                    loss_claim: 0,
                    bits: BigInt::from(bits),
                    timestamp: h as i64 * spacing_secs,
                    state_root: Hash::zero(),
                    nonce: 0,
                },
            );
        }
        MockChain {
            headers,
            height: count,
        }
    }

    #[test]
    fn test_insufficient_history_passes_through() {
        let config = ChainConfig::default();
        let chain = synthetic_chain(1000, 600, 1000);
        let tip = chain.headers[&1000].clone();
        let bits = adjust(&chain, &tip, &config).unwrap();
        assert_eq!(bits, BigInt::from(1000));
    }

    #[test]
    fn test_on_schedule_spacing_keeps_target() {
        let config = ChainConfig::default();
        let chain = synthetic_chain(2016, 600, -1_000_000);
        let tip = chain.headers[&2016].clone();
        let bits = adjust(&chain, &tip, &config).unwrap();
        // window spans interval-1 blocks, so the scaled value shifts by at
        // most one part in the interval
        let old = BigInt::from(-1_000_000i64);
        let delta = (&bits - &old).magnitude().clone();
        assert!(delta <= (1_000_000u64 / 2016 + 1).into());
    }

    #[test]
    fn test_fast_blocks_harden_the_target() {
        let config = ChainConfig::default();
        // one-second spacing: measured span clamps to expected/4
        let chain = synthetic_chain(2016, 1, 1000);
        let tip = chain.headers[&2016].clone();
        let bits = adjust(&chain, &tip, &config).unwrap();
        // at least 4x harder than the inherited target, and inside the
        // saturation band
        assert!(bits <= BigInt::from(250));
        assert!(bits >= BigInt::from(i64::MIN));
        assert_eq!(bits, BigInt::from(-1i64));
    }

    #[test]
    fn test_slow_blocks_scale_a_negative_target_up() {
        let config = ChainConfig::default();
        // 40-minute spacing clamps to expected*4: the magnitude quadruples
        let chain = synthetic_chain(2016, 2400, -1_000_000);
        let tip = chain.headers[&2016].clone();
        let bits = adjust(&chain, &tip, &config).unwrap();
        assert_eq!(bits, BigInt::from(-4_000_000i64));
    }

    #[test]
    fn test_fast_blocks_scale_a_negative_target_down() {
        let config = ChainConfig::default();
        // one-second spacing clamps to expected/4: the magnitude quarters
        let chain = synthetic_chain(2016, 1, -1_000_000);
        let tip = chain.headers[&2016].clone();
        let bits = adjust(&chain, &tip, &config).unwrap();
        assert_eq!(bits, BigInt::from(-250_000i64));
    }

    #[test]
    fn test_missing_window_header_is_recoverable() {
        let config = ChainConfig::default();
        let mut chain = synthetic_chain(2016, 600, -1000);
        chain.headers.remove(&1);
        let tip = chain.headers[&2016].clone();
        match adjust(&chain, &tip, &config) {
            Err(DifficultyError::MissingHeader(1)) => {}
            other => panic!("expected MissingHeader(1), got {other:?}"),
        }
    }

    #[test]
    fn test_saturation_floor() {
        let config = ChainConfig::default();
        // a slow window would push -2^62 to -2^64; saturation holds at -2^63
        let chain = synthetic_chain(2016, 2400, i64::MIN / 2);
        let tip = chain.headers[&2016].clone();
        let bits = adjust(&chain, &tip, &config).unwrap();
        assert_eq!(bits, BigInt::from(i64::MIN));
    }

    #[test]
    fn test_retarget_boundary_predicate() {
        let config = ChainConfig::default();
        assert!(!is_retarget_boundary(0, &config));
        assert!(!is_retarget_boundary(1, &config));
        assert!(is_retarget_boundary(2016, &config));
        assert!(is_retarget_boundary(4032, &config));
        assert!(!is_retarget_boundary(2017, &config));
    }
}
