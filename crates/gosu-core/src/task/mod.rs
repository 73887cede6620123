//! Tasks: static, declarative descriptions of work.
//!
//! A task is a tagged union addressed by `kind[:id]`. In manifests a task
//! appears as a bare string (`"run:web node server.js"`), an object keyed
//! by its tag (`{ "run:web": { "exec": "node" } }`), or a bare array which
//! desugars to a parallel pipeline. A leading `@path` loads the task body
//! from a file through the bridge unmarshaler table. Tasks are value
//! objects: immutable once parsed.

mod fetch;
mod pipe;
mod run;
mod simple;

pub use fetch::FetchTask;
pub use pipe::{PipeMode, PipeTask};
pub use run::{InstanceTask, RunTask};
pub use simple::WaitTask;

use std::sync::Arc;

use gosu_types::TaskResult;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::bridge;
use crate::tag::{self, Tag};
use crate::worker::MustWorker;

/// Channel carrying a task's exit result.
pub type TaskExit = oneshot::Receiver<TaskResult>;

/// An already-resolved exit.
pub(crate) fn exit_now(result: TaskResult) -> TaskExit {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

#[derive(Debug, Clone)]
pub struct Task {
    pub kind: String,
    pub id: String,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Run(RunTask),
    Fetch(FetchTask),
    Wait(WaitTask),
    Noop,
    Pipe(PipeTask),
    /// One member of a clustered `run` task. Built at runtime, never parsed
    /// from a manifest.
    Instance(run::InstanceTask),
}

impl Task {
    pub fn noop() -> Task {
        Task {
            kind: "noop".into(),
            id: String::new(),
            payload: Payload::Noop,
        }
    }

    /// The display label: the instance id when set, else the kind.
    pub fn label(&self) -> &str {
        if self.id.is_empty() {
            &self.kind
        } else {
            &self.id
        }
    }

    /// Parse the string form (`"kind:id inline…"` or `"@path"`).
    pub fn parse(text: &str) -> Result<Task, String> {
        Task::from_value(Value::String(text.to_string()))
    }

    /// Begin execution under a controller; resolves to the exit channel
    /// once the task has launched (for subprocesses: once liveness is
    /// established).
    pub(crate) async fn launch(&self, ctl: Arc<MustWorker>) -> TaskExit {
        match &self.payload {
            Payload::Run(task) => task.launch(ctl).await,
            Payload::Instance(task) => task.launch(ctl).await,
            Payload::Fetch(task) => task.launch(ctl),
            Payload::Wait(task) => task.launch(ctl),
            Payload::Noop => exit_now(Ok(())),
            Payload::Pipe(task) => task.launch(ctl),
        }
    }

    pub fn from_value(value: Value) -> Result<Task, String> {
        match value {
            Value::String(text) => {
                if let Some(path) = text.strip_prefix('@') {
                    let loaded = bridge::load_value(path).map_err(|e| e.to_string())?;
                    return Task::from_value(loaded);
                }
                Task::from_tag(Tag::parse(&text), Value::Object(Map::new()))
            }
            Value::Array(items) => {
                if items.is_empty() {
                    return Ok(Task::noop());
                }
                let mut subtasks = items
                    .into_iter()
                    .map(Task::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                // A leading empty pipeline acts as a mode marker.
                let mut mode = PipeMode::Parallel;
                if let Payload::Pipe(pipe) = &subtasks[0].payload {
                    if pipe.subtasks.is_empty() {
                        mode = pipe.mode;
                        subtasks.remove(0);
                    }
                }
                if subtasks.is_empty() {
                    return Ok(Task::noop());
                }
                Ok(Task {
                    kind: mode.name().to_string(),
                    id: String::new(),
                    payload: Payload::Pipe(PipeTask { mode, subtasks }),
                })
            }
            Value::Object(map) => {
                let (key, payload) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| "empty task object".to_string())?;
                Task::from_tag(Tag::parse(&key), payload)
            }
            other => Err(format!("cannot parse task from {other}")),
        }
    }

    fn from_tag(tag: Tag, payload: Value) -> Result<Task, String> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(format!("task payload must be an object, got {other}")),
        };

        let payload_kind = match tag.kind.as_str() {
            "run" => Payload::Run(RunTask::from_parts(None, &tag.inline, payload)?),
            "fetch" => Payload::Fetch(FetchTask::from_parts(&tag.inline, payload)?),
            "wait" => Payload::Wait(WaitTask::from_parts(&tag.inline, payload)?),
            "noop" => Payload::Noop,
            "pipe" | "ordered" | "parallel" | "race" | "any" => {
                let mode = PipeMode::from_name(&tag.kind).unwrap_or(PipeMode::Parallel);
                Payload::Pipe(PipeTask::from_payload(mode, payload)?)
            }
            kind if bridge::language(kind).is_some() => {
                Payload::Run(RunTask::from_parts(Some(kind), &tag.inline, payload)?)
            }
            other => return Err(format!("unknown task kind: {other}")),
        };
        Ok(Task {
            kind: tag.kind,
            id: tag.id,
            payload: payload_kind,
        })
    }
}

/// Overlay `payload` object fields on top of an inline-derived base; the
/// explicit payload wins.
pub(crate) fn overlay(mut base: Map<String, Value>, payload: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in payload {
        base.insert(key, value);
    }
    base
}

/// Interpret inline text as `key=value` pairs when a variant's shorthand
/// does not apply.
pub(crate) fn inline_args(inline: &str) -> Result<Map<String, Value>, String> {
    tag::scan_args(inline)
}

impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let header = if self.id.is_empty() {
            self.kind.clone()
        } else {
            format!("{}:{}", self.kind, self.id)
        };
        let payload = match &self.payload {
            Payload::Run(task) => serde_json::to_value(task),
            Payload::Instance(task) => serde_json::to_value(task.config()),
            Payload::Fetch(task) => serde_json::to_value(task),
            Payload::Wait(task) => serde_json::to_value(task),
            Payload::Noop => Ok(Value::Object(Map::new())),
            Payload::Pipe(task) => serde_json::to_value(task),
        }
        .map_err(serde::ser::Error::custom)?;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&header, &payload)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Task::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_forms() {
        let task = Task::parse("noop").unwrap();
        assert!(matches!(task.payload, Payload::Noop));

        let task = Task::parse("run:web node server.js --port 80").unwrap();
        assert_eq!(task.id, "web");
        assert_eq!(task.label(), "web");
        match &task.payload {
            Payload::Run(run) => {
                assert_eq!(run.exec, "node");
                assert_eq!(run.args, vec!["server.js", "--port", "80"]);
            }
            other => panic!("expected run task, got {other:?}"),
        }

        let task = Task::parse("wait 150ms").unwrap();
        match &task.payload {
            Payload::Wait(wait) => {
                assert_eq!(wait.duration, std::time::Duration::from_millis(150))
            }
            other => panic!("expected wait task, got {other:?}"),
        }
    }

    #[test]
    fn parses_object_form_with_payload() {
        let task: Task = serde_json::from_str(
            r#"{ "run:svc": { "exec": "python3", "args": ["app.py"], "env": {"PORT": "8080"} } }"#,
        )
        .unwrap();
        match &task.payload {
            Payload::Run(run) => {
                assert_eq!(run.exec, "python3");
                assert_eq!(run.env.get("PORT").map(String::as_str), Some("8080"));
            }
            other => panic!("expected run task, got {other:?}"),
        }
    }

    #[test]
    fn inline_and_payload_merge() {
        // The explicit payload overrides inline-derived fields.
        let task: Task =
            serde_json::from_str(r#"{ "run:svc node old.js": { "args": ["new.js"] } }"#).unwrap();
        match &task.payload {
            Payload::Run(run) => {
                assert_eq!(run.exec, "node");
                assert_eq!(run.args, vec!["new.js"]);
            }
            other => panic!("expected run task, got {other:?}"),
        }
    }

    #[test]
    fn empty_array_is_noop() {
        let task: Task = serde_json::from_str("[]").unwrap();
        assert!(matches!(task.payload, Payload::Noop));
    }

    #[test]
    fn array_desugars_to_parallel() {
        let task: Task = serde_json::from_str(r#"["noop", "wait 1s"]"#).unwrap();
        assert_eq!(task.kind, "parallel");
        match &task.payload {
            Payload::Pipe(pipe) => {
                assert_eq!(pipe.mode, PipeMode::Parallel);
                assert_eq!(pipe.subtasks.len(), 2);
            }
            other => panic!("expected pipe, got {other:?}"),
        }
    }

    #[test]
    fn leading_mode_marker() {
        let task: Task = serde_json::from_str(r#"["ordered", "noop", "wait 1s"]"#).unwrap();
        match &task.payload {
            Payload::Pipe(pipe) => {
                assert_eq!(pipe.mode, PipeMode::Ordered);
                assert_eq!(pipe.subtasks.len(), 2);
            }
            other => panic!("expected pipe, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_errors() {
        assert!(Task::parse("teleport").is_err());
    }

    #[test]
    fn serialize_round_trip() {
        let task: Task = serde_json::from_str(
            r#"{ "run:web": { "exec": "node", "args": ["server.js"], "cwd": "/srv" } }"#,
        )
        .unwrap();
        let json = serde_json::to_value(&task).unwrap();
        let back: Task = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
    }

    #[test]
    fn fetch_inline_method_validation() {
        let task = Task::parse("fetch GET https://example.com/health").unwrap();
        match &task.payload {
            Payload::Fetch(fetch) => {
                assert_eq!(fetch.method, "GET");
                assert_eq!(fetch.url, "https://example.com/health");
            }
            other => panic!("expected fetch task, got {other:?}"),
        }
        assert!(Task::parse("fetch TELEPORT https://example.com").is_err());
    }
}
