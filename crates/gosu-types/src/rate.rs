//! Timer rates: `count / period` pairs used for retry limiting.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::timespan;

/// A rate expressed as a maximum count per period, e.g. `10/30s`.
///
/// The period also defines the tick granularity for bucketed counting:
/// `ticks()` is the current wall-clock time divided by the period, truncated
/// to `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rate {
    pub count: u32,
    pub period: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RateParseError {
    #[error("rate must look like count/period, e.g. 10/30s")]
    Malformed,
    #[error("invalid count: {0}")]
    Count(#[from] std::num::ParseIntError),
    #[error("invalid period: {0}")]
    Period(#[from] humantime::DurationError),
    #[error("rate period must be at least one millisecond")]
    PeriodTooSmall,
}

impl Rate {
    pub const fn new(count: u32, period: Duration) -> Rate {
        Rate { count, period }
    }

    pub fn is_zero(&self) -> bool {
        self.period.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.count > 0 && !self.period.is_zero()
    }

    /// Bucket index of `t`: nanoseconds since the epoch divided by the
    /// period, truncated to u32.
    pub fn ticks_at(&self, t: SystemTime) -> u32 {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        let period = self.period.as_nanos().max(1);
        (nanos / period) as u32
    }

    pub fn ticks(&self) -> u32 {
        self.ticks_at(SystemTime::now())
    }

    /// Re-express this rate over a different period, scaling the count by
    /// the millisecond ratio. Sub-millisecond periods are rejected upstream
    /// at parse time; a zero-millisecond period here yields a zero count.
    pub fn rescale(&self, period: Duration) -> Rate {
        let own_ms = self.period.as_millis() as f64;
        let new_ms = period.as_millis() as f64;
        let count = if new_ms > 0.0 {
            (self.count as f64 * own_ms / new_ms) as u32
        } else {
            0
        };
        Rate { count, period }
    }

    /// Clamp the count between two rates, both re-expressed over this rate's
    /// period.
    pub fn clamp(&self, min: Rate, max: Rate) -> Rate {
        let lo = min.rescale(self.period).count;
        let hi = max.rescale(self.period).count;
        Rate {
            count: self.count.min(hi).max(lo),
            period: self.period,
        }
    }

    pub fn clamp_period(&self, min: Duration, max: Duration) -> Rate {
        Rate {
            count: self.count,
            period: self.period.min(max).max(min),
        }
    }

    pub fn parse(text: &str) -> Result<Rate, RateParseError> {
        let (count, period) = text.split_once('/').ok_or(RateParseError::Malformed)?;
        let count: u32 = count.trim().parse()?;
        let period = timespan::parse(period.trim())?;
        if period.as_millis() == 0 {
            return Err(RateParseError::PeriodTooSmall);
        }
        Ok(Rate { count, period })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, timespan::format(self.period))
    }
}

impl std::str::FromStr for Rate {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rate::parse(s)
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_zero() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        match text {
            None => Ok(Rate::default()),
            Some(text) if text.is_empty() => Ok(Rate::default()),
            Some(text) => Rate::parse(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let r = Rate::parse("10/30s").unwrap();
        assert_eq!(r.count, 10);
        assert_eq!(r.period, Duration::from_secs(30));
        assert_eq!(r.to_string(), "10/30s");
    }

    #[test]
    fn rejects_sub_millisecond_periods() {
        assert!(Rate::parse("5/100us").is_err());
        assert!(Rate::parse("garbage").is_err());
    }

    #[test]
    fn ticks_advance_with_period() {
        let r = Rate::new(3, Duration::from_secs(10));
        let t0 = UNIX_EPOCH + Duration::from_secs(1000);
        let t1 = UNIX_EPOCH + Duration::from_secs(1009);
        let t2 = UNIX_EPOCH + Duration::from_secs(1010);
        assert_eq!(r.ticks_at(t0), r.ticks_at(t1));
        assert_ne!(r.ticks_at(t0), r.ticks_at(t2));
    }

    #[test]
    fn rescale_uses_ms_ratio() {
        let r = Rate::new(10, Duration::from_secs(30));
        let scaled = r.rescale(Duration::from_secs(60));
        assert_eq!(scaled.count, 5);
        assert_eq!(scaled.period, Duration::from_secs(60));
    }

    #[test]
    fn clamp_rescales_bounds() {
        // The bound 10/30s re-expressed over a minute caps the count at 5.
        let r = Rate::new(100, Duration::from_secs(60));
        let clamped = r.clamp(Rate::default(), Rate::new(10, Duration::from_secs(30)));
        assert_eq!(clamped.count, 5);
        assert_eq!(clamped.period, Duration::from_secs(60));
    }

    #[test]
    fn serde_round_trip() {
        let r = Rate::parse("3/10s").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"3/10s\"");
        let back: Rate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn null_is_zero_rate() {
        let r: Rate = serde_json::from_str("null").unwrap();
        assert!(r.is_zero());
    }
}
