//! Core Data Model for the Versioned Candle Store
//!
//! # Logical vs Physical
//!
//! A `LogicalKey` identifies "the candle that should exist" for one
//! (entity, chain, timestamp, interval) slot. It is never mutated and never
//! deleted. A `CandleVersion` is one physical write attempt for a
//! `LogicalKey`: many versions may share a key, and the store retains every
//! version ever written.
//!
//! # Resolution Order
//!
//! The single authoritative version per key (the "logical view") is the
//! non-superseded version maximal under the 3-level total order:
//! 1. **Primary**: `quality_score` (higher wins)
//! 2. **Secondary**: `ingested_at_ns` (later wins)
//! 3. **Tertiary**: `run_id` (lexicographic byte order, last resort)
//!
//! All three components exist purely to guarantee a single deterministic
//! winner regardless of write order. See `dedup` for the resolution logic.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Candle timestamps: unix epoch milliseconds (bar open time).
pub type TimestampMs = i64;

/// Ingestion timestamps: unix epoch nanoseconds.
pub type Nanos = i64;

/// Capture the current wall clock as unix nanoseconds.
///
/// Used for `ingested_at_ns` at append time. A clock before the unix epoch
/// maps to 0 rather than panicking.
#[inline]
pub fn wall_clock_nanos() -> Nanos {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// =============================================================================
// INTERVAL
// =============================================================================

/// Candle bar interval. Closed set: anything not listed here is not a valid
/// persisted interval.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Interval {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Interval {
    /// Canonical string form used for persistence and wire formats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// Bar duration in seconds.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 5 * 60,
            Self::M15 => 15 * 60,
            Self::H1 => 60 * 60,
            Self::H4 => 4 * 60 * 60,
            Self::D1 => 24 * 60 * 60,
        }
    }

    /// All intervals.
    pub fn all() -> &'static [Interval] {
        &[Self::M1, Self::M5, Self::M15, Self::H1, Self::H4, Self::D1]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SOURCE TIER
// =============================================================================

/// Ordered classification of data-provider trustworthiness.
///
/// The score contribution is the explicit `value()` mapping below, NOT the
/// declaration order, so the quality scorer's tier component is stable even
/// if variants are ever reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTier {
    Unknown,
    Backfill,
    Aggregator,
    LiveFeed,
    Exchange,
    Canonical,
}

impl SourceTier {
    /// Explicit ordinal used by the quality scorer. Range 0..=5.
    pub fn value(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Backfill => 1,
            Self::Aggregator => 2,
            Self::LiveFeed => 3,
            Self::Exchange => 4,
            Self::Canonical => 5,
        }
    }

    /// Canonical string form used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Backfill => "backfill",
            Self::Aggregator => "aggregator",
            Self::LiveFeed => "live_feed",
            Self::Exchange => "exchange",
            Self::Canonical => "canonical",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "backfill" => Some(Self::Backfill),
            "aggregator" => Some(Self::Aggregator),
            "live_feed" => Some(Self::LiveFeed),
            "exchange" => Some(Self::Exchange),
            "canonical" => Some(Self::Canonical),
            _ => None,
        }
    }

    /// All tiers, in ascending trust order.
    pub fn all() -> &'static [SourceTier] {
        &[
            Self::Unknown,
            Self::Backfill,
            Self::Aggregator,
            Self::LiveFeed,
            Self::Exchange,
            Self::Canonical,
        ]
    }
}

impl PartialOrd for SourceTier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SourceTier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// LOGICAL KEY
// =============================================================================

/// Identifies one conceptual candle: (entity, chain, interval, timestamp).
///
/// Ordered so that grouped scan output is deterministic.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogicalKey {
    pub entity_id: String,
    pub chain: String,
    pub interval: Interval,
    pub ts_ms: TimestampMs,
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.chain, self.entity_id, self.interval, self.ts_ms
        )
    }
}

// =============================================================================
// RAW CANDLE
// =============================================================================

/// One raw OHLCV tuple as delivered by an upstream fetch client, before
/// validation and scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandle {
    pub entity_id: String,
    pub chain: String,
    pub interval: Interval,
    pub ts_ms: TimestampMs,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl RawCandle {
    /// The logical key this candle targets.
    pub fn key(&self) -> LogicalKey {
        LogicalKey {
            entity_id: self.entity_id.clone(),
            chain: self.chain.clone(),
            interval: self.interval,
            ts_ms: self.ts_ms,
        }
    }
}

// =============================================================================
// CANDLE VERSION
// =============================================================================

/// One physical write attempt for a `LogicalKey`.
///
/// Versions are append-only. The only mutation the store ever performs on an
/// existing row is flipping `superseded` for a rolled-back run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleVersion {
    /// Store rowid. 0 until the version has been persisted.
    pub version_id: i64,
    pub key: LogicalKey,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Computed at validation time, 0..=125. Immutable once written.
    pub quality_score: u8,
    pub source_tier: SourceTier,
    /// The ingestion run that produced this version. Immutable.
    pub run_id: String,
    /// Wall clock at append time. Immutable.
    pub ingested_at_ns: Nanos,
    /// Tombstone flag, settable only by rollback.
    pub superseded: bool,
}

impl CandleVersion {
    /// Build an unpersisted version from a validated raw candle.
    pub fn from_raw(
        raw: &RawCandle,
        quality_score: u8,
        source_tier: SourceTier,
        run_id: &str,
        ingested_at_ns: Nanos,
    ) -> Self {
        Self {
            version_id: 0,
            key: raw.key(),
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            quality_score,
            source_tier,
            run_id: run_id.to_string(),
            ingested_at_ns,
            superseded: false,
        }
    }

    /// The 3-level resolution key: `(quality_score, ingested_at_ns, run_id)`.
    ///
    /// Maximal value wins. Tuple comparison gives the total order described
    /// in the module docs.
    #[inline]
    pub fn resolution_key(&self) -> (u8, Nanos, &str) {
        (self.quality_score, self.ingested_at_ns, self.run_id.as_str())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_string_forms_round_trip() {
        for iv in Interval::all() {
            assert_eq!(Interval::parse(iv.as_str()), Some(*iv));
        }
        assert_eq!(Interval::parse("7m"), None);
    }

    #[test]
    fn tier_values_are_explicit_and_ascending() {
        let expected: &[(SourceTier, u8)] = &[
            (SourceTier::Unknown, 0),
            (SourceTier::Backfill, 1),
            (SourceTier::Aggregator, 2),
            (SourceTier::LiveFeed, 3),
            (SourceTier::Exchange, 4),
            (SourceTier::Canonical, 5),
        ];
        for (tier, value) in expected {
            assert_eq!(tier.value(), *value);
        }
        for pair in SourceTier::all().windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn tier_string_forms_round_trip() {
        for tier in SourceTier::all() {
            assert_eq!(SourceTier::parse(tier.as_str()), Some(*tier));
        }
    }

    #[test]
    fn logical_key_ordering_is_total() {
        let a = LogicalKey {
            entity_id: "tokenA".into(),
            chain: "ethereum".into(),
            interval: Interval::M5,
            ts_ms: 1_000,
        };
        let mut b = a.clone();
        b.ts_ms = 2_000;
        assert!(a < b);
        assert_eq!(a.cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn resolution_key_orders_by_score_then_time_then_run() {
        let raw = RawCandle {
            entity_id: "tokenA".into(),
            chain: "ethereum".into(),
            interval: Interval::M5,
            ts_ms: 1_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        let low_score = CandleVersion::from_raw(&raw, 21, SourceTier::Backfill, "r2", 200);
        let high_score = CandleVersion::from_raw(&raw, 125, SourceTier::Canonical, "r1", 100);
        assert!(high_score.resolution_key() > low_score.resolution_key());

        let earlier = CandleVersion::from_raw(&raw, 125, SourceTier::Canonical, "r1", 100);
        let later = CandleVersion::from_raw(&raw, 125, SourceTier::Canonical, "r1", 300);
        assert!(later.resolution_key() > earlier.resolution_key());

        let run_a = CandleVersion::from_raw(&raw, 125, SourceTier::Canonical, "ra", 100);
        let run_b = CandleVersion::from_raw(&raw, 125, SourceTier::Canonical, "rb", 100);
        assert!(run_b.resolution_key() > run_a.resolution_key());
    }
}
