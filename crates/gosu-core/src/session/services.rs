//! The typed RPC services exposed by a session.
//!
//! Method names are `service.Method`; parameters arrive as the first
//! element of a JSON-RPC params array. Everything here is transport
//! agnostic; the HTTP/WebSocket endpoint lives in [`crate::rpc`].

use std::sync::Arc;
use std::time::Duration;

use gosu_types::{JobInfo, JobList, StatusInfo, TaskInfo, WhiteboardEntry, WhiteboardKey};
use serde_json::Value;

use super::Session;
use crate::events;
use crate::job::{Job, Manifest};
use crate::worker::Worker;

/// Dispatch one RPC call against the session.
pub async fn dispatch(session: &Arc<Session>, method: &str, param: Value) -> Result<Value, String> {
    match method {
        "daemon.Ping" => Ok(param),
        "daemon.Shutdown" => {
            let session = session.clone();
            tokio::spawn(async move {
                session.stop_all(Duration::from_secs(5)).await;
                session.close(None);
            });
            Ok(Value::Null)
        }

        "job.List" => {
            let pattern = string_param(&param);
            let jobs = session.matched_jobs(&pattern).map_err(stringify)?;
            let mut list = JobList::default();
            for job in jobs {
                list.jobs.push(job_info(&job).await);
            }
            to_value(&list)
        }
        "job.Launch" => {
            let manifest: Manifest = from_param(param)?;
            let job = manifest.spawn().map_err(stringify)?;
            session.update_job(job.clone()).await.map_err(stringify)?;
            job.start().await;
            to_value(&job_info(&job).await)
        }
        "job.Update" => {
            let manifest: Manifest = from_param(param)?;
            let job = manifest.spawn().map_err(stringify)?;
            session.update_job(job.clone()).await.map_err(stringify)?;
            to_value(&job_info(&job).await)
        }
        "job.Delete" => {
            let pattern = string_param(&param);
            let jobs = session.matched_jobs(&pattern).map_err(stringify)?;
            let mut ids = Vec::new();
            for job in jobs {
                session.delete_job(&job.id).await.map_err(stringify)?;
                ids.push(job.id.clone());
            }
            to_value(&ids)
        }
        "job.Start" => {
            for_each(session, &param, |job| async move {
                job.start().await;
            })
            .await
        }
        "job.Stop" => {
            for_each(session, &param, |job| async move {
                job.stop().await;
            })
            .await
        }
        "job.Restart" => {
            for_each(session, &param, |job| async move {
                job.restart().await;
            })
            .await
        }
        "job.Kill" => {
            for_each(session, &param, |job| async move {
                job.kill().await;
            })
            .await
        }

        "event.Signal" => {
            events::signal(&string_param(&param));
            Ok(Value::Null)
        }

        "whiteboard.Get" => {
            let key: WhiteboardKey = from_param(param)?;
            let jobs = session.matched_jobs(&key.job).map_err(stringify)?;
            let mut out = Vec::new();
            for job in jobs {
                if let Some(board) = job.whiteboard() {
                    if let Some(value) = board.get(&key.key) {
                        out.push(WhiteboardEntry {
                            key: WhiteboardKey {
                                job: job.id.clone(),
                                key: key.key.clone(),
                            },
                            value,
                        });
                    }
                }
            }
            to_value(&out)
        }
        "whiteboard.Put" => {
            let entry: WhiteboardEntry = from_param(param)?;
            let jobs = session.matched_jobs(&entry.key.job).map_err(stringify)?;
            let mut count = 0usize;
            for job in jobs {
                if let Some(board) = job.whiteboard() {
                    board.set_value(&entry.key.key, entry.value.clone());
                    count += 1;
                }
            }
            to_value(&count)
        }

        other => Err(format!("unknown method: {other}")),
    }
}

async fn for_each<F, Fut>(
    session: &Arc<Session>,
    param: &Value,
    action: F,
) -> Result<Value, String>
where
    F: Fn(Arc<Job>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let pattern = string_param(param);
    let jobs = session.matched_jobs(&pattern).map_err(stringify)?;
    let mut ids = Vec::new();
    for job in jobs {
        action(job.clone()).await;
        ids.push(job.id.clone());
    }
    to_value(&ids)
}

/// The RPC view of one worker subtree.
pub fn task_info(worker: &Arc<dyn Worker>) -> TaskInfo {
    let mut info = TaskInfo {
        namespace: worker.namespace(),
        status: StatusInfo::from(&worker.status()),
        report: worker.inspect(),
        children: Vec::new(),
    };
    worker.traverse(&mut |child| {
        info.children.push(task_info(child));
        true
    });
    info
}

pub async fn job_info(job: &Arc<Job>) -> JobInfo {
    JobInfo {
        id: job.id.clone(),
        main: match job.worker().await {
            Some(worker) => task_info(&worker),
            None => TaskInfo {
                status: StatusInfo::from(&job.status().await),
                ..TaskInfo::default()
            },
        },
    }
}

fn string_param(param: &Value) -> String {
    match param {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn from_param<T: serde::de::DeserializeOwned>(param: Value) -> Result<T, String> {
    serde_json::from_value(param).map_err(stringify)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(stringify)
}

fn stringify(err: impl std::fmt::Display) -> String {
    err.to_string()
}
