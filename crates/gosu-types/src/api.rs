//! RPC payload shapes shared between the daemon services and clients.

use serde::{Deserialize, Serialize};

use crate::report::Report;
use crate::status::Cause;

/// Status of a worker as presented over RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusInfo {
    pub icon: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl From<&Cause> for StatusInfo {
    fn from(cause: &Cause) -> StatusInfo {
        let status = cause.status();
        StatusInfo {
            icon: status.icon().to_string(),
            code: status.name().to_string(),
            error: if status.is_error() {
                cause.error_text()
            } else {
                String::new()
            },
        }
    }
}

/// One worker in the task tree: its namespace, status, latest report, and
/// the same view of each child worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInfo {
    pub namespace: String,
    pub status: StatusInfo,
    #[serde(default, skip_serializing_if = "Report::is_zero")]
    pub report: Report,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub main: TaskInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobList {
    #[serde(default)]
    pub jobs: Vec<JobInfo>,
}

/// Whiteboard addressing: a job pattern plus a key within each matched
/// job's whiteboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhiteboardKey {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhiteboardEntry {
    #[serde(flatten)]
    pub key: WhiteboardKey,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

/// One formatted log line relayed by the `/logs` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub kind: String,
    pub line: String,
}
