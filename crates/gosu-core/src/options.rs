//! Per-task policy options, normalized with defaults.

use std::time::Duration;

use gosu_types::{timespan, ByteSize, Rate};
use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !v
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// Retry, timeout, and resource policy for one task.
///
/// All fields are optional in manifests; [`Options::with_defaults`] fills in
/// and clamps values before a worker is built around them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// If set, the task runs once with no retry supervisor.
    #[serde(skip_serializing_if = "is_false")]
    pub retry_disabled: bool,
    /// Base wait between retries.
    #[serde(with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub retry_backoff: Duration,
    /// Scale factor applied to the retry backoff curve.
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub retry_backoff_scale: f64,
    /// If set, the task is re-run even after a successful exit.
    #[serde(skip_serializing_if = "is_false")]
    pub retry_success: bool,
    /// Maximum retries within a period before the task is considered errored.
    #[serde(skip_serializing_if = "Rate::is_zero")]
    pub retry_limit: Rate,
    /// Maximum memory for the process tree; zero means unlimited.
    #[serde(skip_serializing_if = "ByteSize::is_zero")]
    pub max_memory: ByteSize,
    /// Minimum uptime before the task counts as started; zero means immediate.
    #[serde(with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub min_uptime: Duration,
    /// Maximum execution time; zero means unbounded.
    #[serde(with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub exec_timeout: Duration,
    /// Maximum launch time; zero means unbounded.
    #[serde(with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub start_timeout: Duration,
    /// Grace period between a stop request and forced termination.
    #[serde(with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub stop_timeout: Duration,
}

impl Options {
    pub const RETRY_LIMIT_DEFAULT: Rate = Rate::new(10, Duration::from_secs(30));

    /// Normalize: fill defaults and clamp everything into its legal range.
    pub fn with_defaults(&mut self) {
        if self.retry_limit.is_zero() {
            self.retry_limit = Self::RETRY_LIMIT_DEFAULT;
        } else {
            self.retry_limit = self
                .retry_limit
                .clamp_period(Duration::from_secs(30), Duration::from_secs(3600))
                .clamp(Rate::default(), Self::RETRY_LIMIT_DEFAULT);
        }

        if self.retry_backoff_scale <= 0.0 {
            self.retry_backoff_scale = 2.0;
        }
        self.retry_backoff = self.retry_backoff.max(Duration::from_millis(500));

        if self.stop_timeout.is_zero() {
            self.stop_timeout = Duration::from_secs(5);
        } else {
            self.stop_timeout = self
                .stop_timeout
                .clamp(Duration::from_millis(250), Duration::from_secs(30));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let mut o = Options::default();
        o.with_defaults();
        assert_eq!(o.retry_limit, Options::RETRY_LIMIT_DEFAULT);
        assert_eq!(o.retry_backoff, Duration::from_millis(500));
        assert_eq!(o.retry_backoff_scale, 2.0);
        assert_eq!(o.stop_timeout, Duration::from_secs(5));
        assert!(o.min_uptime.is_zero());
        assert!(o.exec_timeout.is_zero());
        assert!(o.start_timeout.is_zero());
    }

    #[test]
    fn retry_limit_is_clamped() {
        let mut o = Options {
            retry_limit: Rate::new(100, Duration::from_secs(5)),
            ..Default::default()
        };
        o.with_defaults();
        // Period floored to 30s, count capped at the default rate.
        assert_eq!(o.retry_limit.period, Duration::from_secs(30));
        assert_eq!(o.retry_limit.count, 10);

        let mut o = Options {
            retry_limit: Rate::new(3, Duration::from_secs(60)),
            ..Default::default()
        };
        o.with_defaults();
        // 10/30s re-expressed over 60s caps the count at 5.
        assert_eq!(o.retry_limit.period, Duration::from_secs(60));
        assert_eq!(o.retry_limit.count, 3);
    }

    #[test]
    fn stop_timeout_clamped_when_positive() {
        let mut o = Options {
            stop_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        o.with_defaults();
        assert_eq!(o.stop_timeout, Duration::from_millis(250));

        let mut o = Options {
            stop_timeout: Duration::from_secs(300),
            ..Default::default()
        };
        o.with_defaults();
        assert_eq!(o.stop_timeout, Duration::from_secs(30));
    }

    #[test]
    fn backoff_floor() {
        let mut o = Options {
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        o.with_defaults();
        assert_eq!(o.retry_backoff, Duration::from_millis(500));
    }

    #[test]
    fn manifest_json_round_trip() {
        let parsed: Options = serde_json::from_str(
            r#"{"retry_limit":"3/10s","retry_backoff":"100ms","retry_backoff_scale":1.0}"#,
        )
        .unwrap();
        assert_eq!(parsed.retry_limit, Rate::new(3, Duration::from_secs(10)));
        assert_eq!(parsed.retry_backoff, Duration::from_millis(100));

        let json = serde_json::to_value(&parsed).unwrap();
        let back: Options = serde_json::from_value(json).unwrap();
        assert_eq!(back, parsed);
    }
}
