//! Quality Scoring - Single Source of Truth
//!
//! The quality score is the primary component of the version resolution key,
//! so the formula below must match bit-for-bit across every writer:
//!
//! ```text
//! score = (volume > 0       ? 100 : 0)
//!       + (high >= low      ?  10 : 0)
//!       + (low <= open <= high  ? 5 : 0)
//!       + (low <= close <= high ? 5 : 0)
//!       + tier_value                      (0..=5)
//! ```
//!
//! # Dominance Guarantee
//!
//! Any candle with positive volume scores >= 100; any candle with zero
//! volume scores <= 25, for every tier. The tier contributes at most 5, so a
//! positive-volume version always outranks a zero-volume version of the same
//! key. Deduplication correctness leans on this bound.

use crate::candle::{RawCandle, SourceTier};

/// Points for positive traded volume.
pub const VOLUME_POINTS: u8 = 100;

/// Points for a coherent high/low range.
pub const RANGE_POINTS: u8 = 10;

/// Points for an open inside the high/low range.
pub const OPEN_IN_RANGE_POINTS: u8 = 5;

/// Points for a close inside the high/low range.
pub const CLOSE_IN_RANGE_POINTS: u8 = 5;

/// Maximum tier contribution (`SourceTier::Canonical`).
pub const MAX_TIER_POINTS: u8 = 5;

/// Maximum possible score: 100 + 10 + 5 + 5 + 5.
pub const MAX_SCORE: u8 =
    VOLUME_POINTS + RANGE_POINTS + OPEN_IN_RANGE_POINTS + CLOSE_IN_RANGE_POINTS + MAX_TIER_POINTS;

/// Every positive-volume candle scores at least this much.
pub const MIN_POSITIVE_VOLUME_SCORE: u8 = VOLUME_POINTS;

/// No zero-volume candle can score more than this.
pub const MAX_ZERO_VOLUME_SCORE: u8 =
    RANGE_POINTS + OPEN_IN_RANGE_POINTS + CLOSE_IN_RANGE_POINTS + MAX_TIER_POINTS;

/// Score one candle. Pure and total: any f64 inputs produce a score in
/// `0..=125`; corruption gating happens in `validation`, not here.
#[inline]
pub fn score(candle: &RawCandle, tier: SourceTier) -> u8 {
    let mut score = 0u8;
    if candle.volume > 0.0 {
        score += VOLUME_POINTS;
    }
    if candle.high >= candle.low {
        score += RANGE_POINTS;
    }
    if candle.open >= candle.low && candle.open <= candle.high {
        score += OPEN_IN_RANGE_POINTS;
    }
    if candle.close >= candle.low && candle.close <= candle.high {
        score += CLOSE_IN_RANGE_POINTS;
    }
    score + tier.value()
}
