//! The `wait` task: sleep for a duration, honoring cancellation.

use std::sync::Arc;
use std::time::Duration;

use gosu_types::timespan;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{exit_now, inline_args, overlay, TaskExit};
use crate::worker::MustWorker;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitTask {
    #[serde(with = "timespan", skip_serializing_if = "timespan::is_zero")]
    pub duration: Duration,
}

impl WaitTask {
    pub(crate) fn from_parts(inline: &str, payload: Map<String, Value>) -> Result<WaitTask, String> {
        let base = if inline.is_empty() {
            Map::new()
        } else if let Ok(duration) = timespan::parse(inline) {
            let mut map = Map::new();
            map.insert("duration".into(), Value::String(timespan::format(duration)));
            map
        } else {
            inline_args(inline)?
        };
        serde_json::from_value(Value::Object(overlay(base, payload))).map_err(|e| e.to_string())
    }

    pub(crate) fn launch(&self, ctl: Arc<MustWorker>) -> TaskExit {
        if self.duration.is_zero() {
            return exit_now(Ok(()));
        }
        let duration = self.duration;
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = ctl.scope().done() => ctl.scope().result(),
                _ = tokio::time::sleep(duration) => Ok(()),
            };
            let _ = tx.send(result);
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_duration() {
        let task = WaitTask::from_parts("2s", Map::new()).unwrap();
        assert_eq!(task.duration, Duration::from_secs(2));
    }

    #[test]
    fn payload_wins_over_inline() {
        let mut payload = Map::new();
        payload.insert("duration".into(), Value::String("5s".into()));
        let task = WaitTask::from_parts("1s", payload).unwrap();
        assert_eq!(task.duration, Duration::from_secs(5));
    }

    #[test]
    fn bad_inline_is_rejected() {
        assert!(WaitTask::from_parts("= nope", Map::new()).is_err());
    }
}
