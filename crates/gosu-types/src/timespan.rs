//! Serde adapter for humantime-style durations.
//!
//! Manifest fields accept `"500ms"` / `"30s"` / `"1h30m"` strings, bare
//! numbers (milliseconds), or `null` (zero). Zero durations serialize as
//! `null` so normalized defaults stay out of persisted manifests.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;

pub fn parse(text: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(text)
}

pub fn format(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

pub fn is_zero(d: &Duration) -> bool {
    d.is_zero()
}

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    if d.is_zero() {
        serializer.serialize_none()
    } else {
        serializer.serialize_str(&format(*d))
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    deserializer.deserialize_any(SpanVisitor)
}

struct SpanVisitor;

impl<'de> Visitor<'de> for SpanVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration string, a number of milliseconds, or null")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
        parse(v).map_err(de::Error::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
        if v < 0.0 {
            return Err(de::Error::custom("negative duration"));
        }
        Ok(Duration::from_secs_f64(v / 1000.0))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_millis(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
        if v < 0 {
            return Err(de::Error::custom("negative duration"));
        }
        Ok(Duration::from_millis(v as u64))
    }

    fn visit_none<E: de::Error>(self) -> Result<Duration, E> {
        Ok(Duration::ZERO)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Duration, E> {
        Ok(Duration::ZERO)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(SpanVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Default)]
    struct Probe {
        #[serde(with = "super", default, skip_serializing_if = "is_zero")]
        t: Duration,
    }

    #[test]
    fn parses_strings() {
        let p: Probe = serde_json::from_str(r#"{"t":"1h30m"}"#).unwrap();
        assert_eq!(p.t, Duration::from_secs(5400));
        let p: Probe = serde_json::from_str(r#"{"t":"250ms"}"#).unwrap();
        assert_eq!(p.t, Duration::from_millis(250));
    }

    #[test]
    fn parses_numbers_as_millis() {
        let p: Probe = serde_json::from_str(r#"{"t":1500}"#).unwrap();
        assert_eq!(p.t, Duration::from_millis(1500));
        let p: Probe = serde_json::from_str(r#"{"t":0.5}"#).unwrap();
        assert_eq!(p.t, Duration::from_micros(500));
    }

    #[test]
    fn null_and_missing_are_zero() {
        let p: Probe = serde_json::from_str(r#"{"t":null}"#).unwrap();
        assert!(p.t.is_zero());
        let p: Probe = serde_json::from_str(r#"{}"#).unwrap();
        assert!(p.t.is_zero());
    }

    #[test]
    fn zero_is_omitted() {
        let json = serde_json::to_string(&Probe::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
