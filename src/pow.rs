//! Proof-of-work arithmetic: targets, compact encoding, and chainwork.
//!
//! Targets are 256-bit big-endian scalars; a proof hash meets a target when
//! its scalar interpretation is not greater than the target. Block headers
//! carry targets in the 4-byte compact form (exponent + 3-byte mantissa).

use primitive_types::U256;

use crate::Hash;

/// The easiest allowed block target. Retargeting never loosens past this.
pub fn max_target() -> U256 {
    U256::MAX >> 4
}

/// Interpret a hash as a big-endian 256-bit scalar.
pub fn hash_to_scalar(h: &Hash) -> U256 {
    U256::from_big_endian(h)
}

/// True when the proof hash satisfies the target.
pub fn meets_target(proof: &Hash, target: &U256) -> bool {
    hash_to_scalar(proof) <= *target
}

/// Encode a target in compact form.
///
/// Same layout as the classic nBits encoding: the high byte is the size of
/// the big-endian magnitude in bytes, the low three bytes are the leading
/// mantissa. The sign bit of the mantissa is kept clear.
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact: u32 = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u32()
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Decode a compact-form target. The inverse of [`target_to_compact`] up to
/// mantissa truncation.
pub fn compact_to_target(compact: u32) -> U256 {
    let size = (compact >> 24) as usize;
    let word = compact & 0x007f_ffff;
    if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3))
    }
}

/// Expected work of one solve at the given target: `~target / (target+1) + 1`.
pub fn block_work(target: U256) -> U256 {
    if target == U256::MAX {
        return U256::one();
    }
    if target.is_zero() {
        return U256::MAX;
    }
    (!target / (target + U256::one())) + U256::one()
}

/// Retarget the block difficulty for the next milestone interval.
///
/// Scales the previous target by observed/expected spacing, with the observed
/// interval clamped to [expected/4, expected*4] so a single wild timestamp
/// cannot swing the schedule.
pub fn next_block_target(prev: U256, observed_secs: u64, expected_secs: u64) -> U256 {
    let expected = expected_secs.max(1);
    let observed = observed_secs.clamp(expected / 4, expected * 4).max(1);
    let next = prev
        .checked_mul(U256::from(observed))
        .map(|scaled| scaled / U256::from(expected))
        .unwrap_or_else(max_target);
    next.min(max_target()).max(U256::one())
}

/// Milestone target derived from the block target.
pub fn milestone_target(block_target: U256, shift: usize) -> U256 {
    (block_target >> shift).max(U256::one())
}

/// Estimate the network hash rate from one sealed level-set.
///
/// Observed rate = level-set work over the inter-milestone interval, smoothed
/// 3:1 toward the previous estimate to damp single-interval noise.
pub fn estimate_hash_rate(
    prev_rate: u64,
    level_set_size: usize,
    block_target: U256,
    interval_secs: u64,
) -> u64 {
    let dt = interval_secs.max(1);
    let observed = block_work(block_target).saturating_mul(U256::from(level_set_size)) / U256::from(dt);
    let observed = if observed > U256::from(u64::MAX) {
        u64::MAX
    } else {
        observed.low_u64()
    };
    if prev_rate == 0 {
        observed
    } else {
        (prev_rate / 4).saturating_mul(3).saturating_add(observed / 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        for target in [
            U256::from(1u64),
            U256::from(0xffffu64),
            max_target(),
            U256::one() << 200,
        ] {
            let compact = target_to_compact(target);
            let back = compact_to_target(compact);
            // Mantissa truncation loses at most the low bits below the top 3 bytes.
            assert!(back <= target);
            assert!(target_to_compact(back) == compact);
        }
    }

    #[test]
    fn harder_target_means_more_work() {
        let easy = max_target();
        let hard = max_target() >> 16;
        assert!(block_work(hard) > block_work(easy));
    }

    #[test]
    fn meets_target_boundary() {
        let target = U256::from(0xff) << 240;
        let mut just_under = [0u8; 32];
        just_under[0] = 0xfe;
        let mut over = [0u8; 32];
        over[0] = 0xff;
        over[2] = 0x01;
        assert!(meets_target(&just_under, &target));
        assert!(!meets_target(&over, &target));
    }

    #[test]
    fn retarget_clamps_to_quadruple() {
        let prev = U256::one() << 100;
        let slow = next_block_target(prev, 1_000_000, 10);
        assert_eq!(slow, prev * 4);
        let fast = next_block_target(prev, 0, 10);
        // clamped observed = 2s (10/4)
        assert_eq!(fast, prev * U256::from(2u64) / U256::from(10u64));
    }

    #[test]
    fn retarget_never_exceeds_max() {
        let next = next_block_target(max_target(), 1_000_000, 10);
        assert_eq!(next, max_target());
    }

    #[test]
    fn hash_rate_smooths_toward_previous() {
        let target = max_target();
        let fresh = estimate_hash_rate(0, 10, target, 10);
        let smoothed = estimate_hash_rate(1_000_000, 10, target, 10);
        assert!(smoothed >= 750_000);
        assert!(fresh > 0);
    }
}
