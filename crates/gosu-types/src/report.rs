//! Process-tree resource reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A snapshot of the process tree under one task: every pid in the tree,
/// aggregate CPU percentage, aggregate resident memory in bytes, the owning
/// user, and the root process creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub pid: Vec<i32>,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default, rename = "usr", skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
}

impl Report {
    pub fn is_zero(&self) -> bool {
        self.pid.is_empty()
    }

    /// Uptime relative to now, when the creation time is known.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.create_time.map(|t| Utc::now() - t)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("[Not running]");
        }
        let up = self
            .uptime()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "?".into());
        write!(
            f,
            "[{}-{:?} | CPU: {:.2}% MEM: {:.2}MB, UP: {}]",
            self.username,
            self.pid,
            self.cpu,
            self.mem / 1024.0 / 1024.0,
            up,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_report() {
        let r = Report::default();
        assert!(r.is_zero());
        assert_eq!(r.to_string(), "[Not running]");
    }

    #[test]
    fn serde_shape() {
        let r = Report {
            pid: vec![10, 11],
            cpu: 12.5,
            mem: 4096.0,
            username: "svc".into(),
            create_time: None,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["pid"], serde_json::json!([10, 11]));
        assert_eq!(v["usr"], "svc");
        let back: Report = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }
}
