//! Pipelines: composite tasks running subtasks under a shared scope.
//!
//! Four composition modes exist. `ordered` launches subtasks strictly in
//! index order, waiting for each to finish; the other three launch
//! everything together. The mode decides which subtask termination cancels
//! the shared scope:
//!
//! | mode     | cancels on                    |
//! |----------|-------------------------------|
//! | ordered  | first error                   |
//! | parallel | first error                   |
//! | race     | first completion (any result) |
//! | any      | first success                 |
//!
//! When every subtask has finished without triggering the mode's policy,
//! the scope is cancelled with success. Failures from the concurrent modes
//! are marked non-retriable so an enclosing retry supervisor does not
//! re-run an already-composed failure.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use gosu_types::{Cause, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{exit_now, Task, TaskExit};
use crate::scope::Scope;
use crate::worker::MustWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeMode {
    Ordered,
    Parallel,
    Race,
    Any,
}

impl PipeMode {
    pub fn name(self) -> &'static str {
        match self {
            PipeMode::Ordered => "ordered",
            PipeMode::Parallel => "parallel",
            PipeMode::Race => "race",
            PipeMode::Any => "any",
        }
    }

    pub fn from_name(name: &str) -> Option<PipeMode> {
        Some(match name {
            "ordered" => PipeMode::Ordered,
            "parallel" | "pipe" => PipeMode::Parallel,
            "race" => PipeMode::Race,
            "any" => PipeMode::Any,
            _ => return None,
        })
    }

    fn serializes(self) -> bool {
        self == PipeMode::Ordered
    }

    /// Apply the termination policy for one finished subtask.
    fn on_end(self, result: &TaskResult, scope: &Scope) {
        match self {
            PipeMode::Ordered | PipeMode::Parallel => {
                if let Err(cause) = result {
                    scope.cancel(cause.clone());
                }
            }
            PipeMode::Race => {
                scope.cancel(match result {
                    Ok(()) => Cause::complete(),
                    Err(cause) => cause.clone(),
                });
            }
            PipeMode::Any => {
                if result.is_ok() {
                    scope.cancel(Cause::complete());
                }
            }
        }
    }

    fn wraps_non_retriable(self) -> bool {
        self != PipeMode::Ordered
    }
}

#[derive(Debug, Clone)]
pub struct PipeTask {
    pub mode: PipeMode,
    pub subtasks: Vec<Task>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct PipePayload {
    sub: Vec<Task>,
}

impl PipeTask {
    pub(crate) fn from_payload(mode: PipeMode, payload: Map<String, Value>) -> Result<PipeTask, String> {
        let payload: PipePayload =
            serde_json::from_value(Value::Object(payload)).map_err(|e| e.to_string())?;
        Ok(PipeTask {
            mode,
            subtasks: payload.sub,
        })
    }

    pub(crate) fn launch(&self, ctl: Arc<MustWorker>) -> TaskExit {
        let count = self.subtasks.len();
        if count == 0 {
            return exit_now(Ok(()));
        }

        let mode = self.mode;
        let subtasks = self.subtasks.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let scope = ctl.scope().child();
            let left = Arc::new(AtomicI32::new(count as i32));
            let mut waits: Vec<tokio::task::JoinHandle<()>> = Vec::new();

            for subtask in subtasks {
                if mode.serializes() {
                    for wait in waits.drain(..) {
                        let _ = wait.await;
                    }
                }
                if scope.is_cancelled() {
                    break;
                }

                let exit = ctl.clone().launch_child(&scope, subtask, None);
                let scope = scope.clone();
                let left = left.clone();
                waits.push(tokio::spawn(async move {
                    tokio::select! {
                        _ = scope.done() => {}
                        result = exit => {
                            let result = result
                                .unwrap_or_else(|_| Err(Cause::errored("task exited without a result")));
                            mode.on_end(&result, &scope);
                            if left.fetch_sub(1, Ordering::SeqCst) - 1 == 0 {
                                scope.cancel(Cause::complete());
                            }
                        }
                    }
                }));
            }

            scope.done().await;
            let mut result = scope.result();
            if mode.wraps_non_retriable() {
                if let Err(cause) = result {
                    result = Err(cause.non_retriable());
                }
            }
            let _ = tx.send(result);
        });
        rx
    }
}

impl Serialize for PipeTask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PipePayload {
            sub: self.subtasks.clone(),
        }
        .serialize(serializer)
    }
}
