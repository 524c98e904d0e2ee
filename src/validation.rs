//! Candle Validation - Corruption Gate and Quality Policy
//!
//! Two independent checks, always both evaluated:
//!
//! 1. **Corruption check** (always fatal, not configurable): a corrupt
//!    candle is never written, under any policy.
//! 2. **Quality check** (policy-gated): low-confidence candles are rejected
//!    under `Strict` and written with an honestly-low score under `Lenient`.
//!    The scoring formula guarantees a warned candle loses resolution to any
//!    better version of the same key, so lenient writes never poison the
//!    logical view.
//!
//! Validation never performs I/O. Outcomes are folded into run statistics by
//! the ingestion path.

use crate::candle::{RawCandle, SourceTier};
use crate::quality;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// POLICY
// =============================================================================

/// Controls whether quality defects reject or merely warn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationPolicy {
    /// Quality defects are rejected alongside corruption.
    Strict,
    /// Quality defects are persisted, counted as warnings.
    Lenient,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::Lenient
    }
}

// =============================================================================
// FAILURE REASONS
// =============================================================================

/// Malformed OHLC invariants. Always fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionReason {
    HighBelowLow { high: f64, low: f64 },
    NegativeOpen(f64),
    NegativeClose(f64),
    NegativeVolume(f64),
    NonFinite { field: &'static str },
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighBelowLow { high, low } => {
                write!(f, "high {} below low {}", high, low)
            }
            Self::NegativeOpen(v) => write!(f, "negative open {}", v),
            Self::NegativeClose(v) => write!(f, "negative close {}", v),
            Self::NegativeVolume(v) => write!(f, "negative volume {}", v),
            Self::NonFinite { field } => write!(f, "non-finite {}", field),
        }
    }
}

/// Low-confidence data. Rejected under Strict, warned under Lenient.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityDefect {
    ZeroVolume,
    OpenOutOfRange { open: f64, low: f64, high: f64 },
    CloseOutOfRange { close: f64, low: f64, high: f64 },
}

impl fmt::Display for QualityDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroVolume => write!(f, "zero volume"),
            Self::OpenOutOfRange { open, low, high } => {
                write!(f, "open {} outside [{}, {}]", open, low, high)
            }
            Self::CloseOutOfRange { close, low, high } => {
                write!(f, "close {} outside [{}, {}]", close, low, high)
            }
        }
    }
}

/// Why a candle was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    Corrupt(CorruptionReason),
    Quality(Vec<QualityDefect>),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(reason) => write!(f, "corrupt candle: {}", reason),
            Self::Quality(defects) => {
                write!(f, "quality defects:")?;
                for d in defects {
                    write!(f, " {};", d)?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result of validating one candle.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// Clean candle; write with this score.
    Accepted { score: u8 },
    /// Defective but writable (Lenient); write with this score.
    Warned { score: u8, defects: Vec<QualityDefect> },
    /// Never written.
    Rejected { reason: RejectReason },
}

impl ValidationOutcome {
    /// Whether the candle may be persisted.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

// =============================================================================
// CHECKS
// =============================================================================

fn corruption_check(candle: &RawCandle) -> Option<CorruptionReason> {
    let fields: &[(&'static str, f64)] = &[
        ("open", candle.open),
        ("high", candle.high),
        ("low", candle.low),
        ("close", candle.close),
        ("volume", candle.volume),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Some(CorruptionReason::NonFinite { field: name });
        }
    }
    if candle.high < candle.low {
        return Some(CorruptionReason::HighBelowLow {
            high: candle.high,
            low: candle.low,
        });
    }
    if candle.open < 0.0 {
        return Some(CorruptionReason::NegativeOpen(candle.open));
    }
    if candle.close < 0.0 {
        return Some(CorruptionReason::NegativeClose(candle.close));
    }
    if candle.volume < 0.0 {
        return Some(CorruptionReason::NegativeVolume(candle.volume));
    }
    None
}

fn quality_defects(candle: &RawCandle) -> Vec<QualityDefect> {
    let mut defects = Vec::new();
    if candle.volume == 0.0 {
        defects.push(QualityDefect::ZeroVolume);
    }
    if candle.open < candle.low || candle.open > candle.high {
        defects.push(QualityDefect::OpenOutOfRange {
            open: candle.open,
            low: candle.low,
            high: candle.high,
        });
    }
    if candle.close < candle.low || candle.close > candle.high {
        defects.push(QualityDefect::CloseOutOfRange {
            close: candle.close,
            low: candle.low,
            high: candle.high,
        });
    }
    defects
}

/// Validate one candle against the corruption gate and the quality policy.
///
/// The returned score, when present, is exactly `quality::score` for the
/// candle and tier, so the resolution order and the validation outcome can
/// never disagree.
pub fn validate(
    candle: &RawCandle,
    tier: SourceTier,
    policy: ValidationPolicy,
) -> ValidationOutcome {
    if let Some(reason) = corruption_check(candle) {
        return ValidationOutcome::Rejected {
            reason: RejectReason::Corrupt(reason),
        };
    }

    let defects = quality_defects(candle);
    let score = quality::score(candle, tier);
    if defects.is_empty() {
        ValidationOutcome::Accepted { score }
    } else {
        match policy {
            ValidationPolicy::Strict => ValidationOutcome::Rejected {
                reason: RejectReason::Quality(defects),
            },
            ValidationPolicy::Lenient => ValidationOutcome::Warned { score, defects },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Interval;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> RawCandle {
        RawCandle {
            entity_id: "tokenX".into(),
            chain: "ethereum".into(),
            interval: Interval::M5,
            ts_ms: 1_000,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn clean_candle_accepted_with_score() {
        let c = candle(1.0, 2.0, 0.5, 1.5, 1000.0);
        let outcome = validate(&c, SourceTier::Canonical, ValidationPolicy::Strict);
        assert_eq!(outcome, ValidationOutcome::Accepted { score: 125 });
    }

    #[test]
    fn corruption_rejected_under_both_policies() {
        // high=1, low=2 is rejected everywhere.
        let c = candle(1.0, 1.0, 2.0, 1.5, 1000.0);
        for policy in [ValidationPolicy::Strict, ValidationPolicy::Lenient] {
            let outcome = validate(&c, SourceTier::Canonical, policy);
            assert!(
                matches!(
                    outcome,
                    ValidationOutcome::Rejected {
                        reason: RejectReason::Corrupt(CorruptionReason::HighBelowLow { .. })
                    }
                ),
                "policy {:?} must reject corrupt candle, got {:?}",
                policy,
                outcome
            );
        }
    }

    #[test]
    fn negative_fields_are_corrupt() {
        let cases = [
            candle(-1.0, 2.0, 0.5, 1.5, 10.0),
            candle(1.0, 2.0, 0.5, -1.5, 10.0),
            candle(1.0, 2.0, 0.5, 1.5, -10.0),
        ];
        for c in &cases {
            let outcome = validate(c, SourceTier::Canonical, ValidationPolicy::Lenient);
            assert!(!outcome.is_writable(), "expected rejection for {:?}", c);
        }
    }

    #[test]
    fn non_finite_fields_are_corrupt() {
        let mut c = candle(1.0, 2.0, 0.5, 1.5, 10.0);
        c.high = f64::NAN;
        assert!(!validate(&c, SourceTier::Canonical, ValidationPolicy::Lenient).is_writable());

        let mut c = candle(1.0, 2.0, 0.5, 1.5, 10.0);
        c.volume = f64::INFINITY;
        assert!(!validate(&c, SourceTier::Canonical, ValidationPolicy::Lenient).is_writable());
    }

    #[test]
    fn zero_volume_warned_lenient_rejected_strict() {
        let c = candle(1.0, 2.0, 0.5, 1.5, 0.0);

        let lenient = validate(&c, SourceTier::Backfill, ValidationPolicy::Lenient);
        match lenient {
            ValidationOutcome::Warned { score, defects } => {
                assert_eq!(score, 21);
                assert_eq!(defects, vec![QualityDefect::ZeroVolume]);
            }
            other => panic!("expected warning, got {:?}", other),
        }

        let strict = validate(&c, SourceTier::Backfill, ValidationPolicy::Strict);
        assert!(matches!(
            strict,
            ValidationOutcome::Rejected {
                reason: RejectReason::Quality(_)
            }
        ));
    }

    #[test]
    fn out_of_range_open_close_are_quality_defects() {
        let c = candle(3.0, 2.0, 0.5, 2.5, 10.0);
        let outcome = validate(&c, SourceTier::LiveFeed, ValidationPolicy::Lenient);
        match outcome {
            ValidationOutcome::Warned { score, defects } => {
                // 100 + 10 + 0 + 0 + 3
                assert_eq!(score, 113);
                assert_eq!(defects.len(), 2);
            }
            other => panic!("expected warning, got {:?}", other),
        }
    }

    #[test]
    fn corruption_takes_precedence_over_quality() {
        // Inverted range AND zero volume: reported as corruption.
        let c = candle(1.0, 1.0, 2.0, 1.5, 0.0);
        let outcome = validate(&c, SourceTier::Unknown, ValidationPolicy::Lenient);
        assert!(matches!(
            outcome,
            ValidationOutcome::Rejected {
                reason: RejectReason::Corrupt(_)
            }
        ));
    }
}
