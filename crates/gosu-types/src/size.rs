//! Parsable byte sizes (`"512mb"`, `"2gib"`, `"10%"`).

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A byte count parsed from human-friendly text.
///
/// Binary single-letter units (`k`, `m`, `g`) are powers of 1024; the
/// `kb`/`mb`/`gb` spellings are powers of 1000 and the `kib`/`mib`/`gib`
/// spellings powers of 1024. A percentage is taken of available system
/// memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteSize(pub u64);

fn unit_multiplier(unit: &str) -> Option<f64> {
    Some(match unit {
        "b" | "byte" => 1.0,
        "k" | "kib" | "kibibyte" => 1024.0,
        "kb" | "kilobyte" => 1e3,
        "m" | "mib" | "mebibyte" => 1024.0 * 1024.0,
        "mb" | "megabyte" => 1e6,
        "g" | "gib" | "gibibyte" => 1024.0 * 1024.0 * 1024.0,
        "gb" | "gigabyte" => 1e9,
        _ => return None,
    })
}

/// Available system memory, for percentage sizes. Falls back to 16 GiB when
/// the platform gives no answer.
fn available_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(text) = std::fs::read_to_string("/proc/meminfo") {
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    16 * 1024 * 1024 * 1024
}

impl ByteSize {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn parse(text: &str) -> Result<ByteSize, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
            .unwrap_or(text.len());
        let (num, unit) = text.split_at(split);
        let value: f64 = num
            .trim()
            .parse()
            .map_err(|e| format!("invalid size number: {e}"))?;
        if value < 0.0 {
            return Err("size cannot be negative".into());
        }

        let mut unit = unit.trim().to_ascii_lowercase();
        if let Some(stripped) = unit.strip_suffix('s') {
            unit = stripped.to_string();
        }
        if unit.is_empty() {
            unit = "b".into();
        }
        if unit == "%" || unit == "percent" {
            return Ok(ByteSize((value * available_memory() as f64 / 100.0) as u64));
        }
        let mult = unit_multiplier(&unit)
            .or_else(|| unit.get(..1).and_then(unit_multiplier))
            .ok_or_else(|| format!("invalid size unit: {unit}"))?;
        Ok(ByteSize((value * mult) as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut v = self.0;
        for unit in ["b", "kb", "mb"] {
            if v <= 1024 {
                return write!(f, "{v}{unit}");
            }
            v >>= 10;
        }
        write!(f, "{v}gb")
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0 == 0 {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(f64),
            None,
        }
        match Option::<Raw>::deserialize(deserializer)? {
            None | Some(Raw::None) => Ok(ByteSize(0)),
            Some(Raw::Number(n)) => Ok(ByteSize(n.max(0.0) as u64)),
            Some(Raw::Text(text)) if text.is_empty() => Ok(ByteSize(0)),
            Some(Raw::Text(text)) => ByteSize::parse(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(ByteSize::parse("512").unwrap().0, 512);
        assert_eq!(ByteSize::parse("1k").unwrap().0, 1024);
        assert_eq!(ByteSize::parse("1kb").unwrap().0, 1000);
        assert_eq!(ByteSize::parse("2mib").unwrap().0, 2 * 1024 * 1024);
        assert_eq!(ByteSize::parse("1.5gb").unwrap().0, 1_500_000_000);
    }

    #[test]
    fn plural_and_case() {
        assert_eq!(ByteSize::parse("4 Megabytes").unwrap().0, 4_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ByteSize::parse("twelve").is_err());
        assert!(ByteSize::parse("5 parsecs").is_err());
    }

    #[test]
    fn serde_number_and_string() {
        let s: ByteSize = serde_json::from_str("1048576").unwrap();
        assert_eq!(s.0, 1 << 20);
        let s: ByteSize = serde_json::from_str("\"1mib\"").unwrap();
        assert_eq!(s.0, 1 << 20);
        let s: ByteSize = serde_json::from_str("null").unwrap();
        assert!(s.is_zero());
    }
}
