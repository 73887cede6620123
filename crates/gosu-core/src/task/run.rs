//! The `run` task: spawn and supervise a child process.
//!
//! Children inherit the daemon environment plus `GOSU_NS` (the worker
//! namespace), `GOSU_CID` (the cluster index), `GOSU_LOCAL` (the local RPC
//! address), and, when fronted by a load balancer, `GOSU_SERVE`, the IPC
//! address the child must serve HTTP on. With `n > 1` the task fans out
//! into `n` sibling instance workers under an internal parallel pipeline,
//! all sharing one load balancer.
//!
//! Stdout and stderr stream into the job logger line by line. A sampler
//! publishes a process-tree report every second. Stop sends the platform
//! interrupt and lets the stop timeout enforce the rest.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gosu_types::{Cause, Report};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::time::sleep;

use super::{exit_now, Payload, Task, TaskExit};
use crate::bridge;
use crate::inspect;
use crate::ipc;
use crate::logging::Stream;
use crate::proxy::{LoadBalancer, ProxyOptions, Upstream};
use crate::settings;
use crate::worker::{MustWorker, Worker};

const INSPECT_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTask {
    /// Foreign-language kind, when this task came from a bridge tag.
    #[serde(skip)]
    pub foreign: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exec: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Number of instances; above one runs as a cluster.
    #[serde(rename = "n", skip_serializing_if = "is_zero_usize")]
    pub instances: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyOptions>,
}

impl RunTask {
    pub(crate) fn from_parts(
        foreign: Option<&str>,
        inline: &str,
        payload: Map<String, Value>,
    ) -> Result<RunTask, String> {
        let mut base = Map::new();
        if !inline.is_empty() {
            let mut words = inline.split_whitespace();
            if let Some(exec) = words.next() {
                base.insert("exec".into(), Value::String(exec.into()));
            }
            let args: Vec<Value> = words.map(|w| Value::String(w.into())).collect();
            if !args.is_empty() {
                base.insert("args".into(), Value::Array(args));
            }
        }
        let mut task: RunTask =
            serde_json::from_value(Value::Object(super::overlay(base, payload)))
                .map_err(|e| e.to_string())?;
        task.foreign = foreign.unwrap_or_default().to_string();
        if task.cwd.is_empty() {
            task.cwd = std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(task)
    }

    pub(crate) async fn launch(&self, ctl: Arc<MustWorker>) -> TaskExit {
        // The balancer outlives the instances and closes when the task ends.
        let lb = match &self.proxy {
            Some(options) => {
                ctl.logger().line("Starting proxy.");
                let lb = LoadBalancer::new(options.clone());
                let listener = lb.clone();
                let watchdog = ctl.clone();
                tokio::spawn(async move {
                    if let Err(err) = listener.listen().await {
                        if !watchdog.scope().is_cancelled() {
                            watchdog.logger().line(format!("Proxy error: {err}"));
                            watchdog.kill();
                        }
                    }
                });
                Some(lb)
            }
            None => None,
        };

        if self.instances <= 1 {
            let instance = InstanceTask::new(self.clone(), lb.clone(), 0);
            let exit = instance.launch(ctl.clone()).await;
            match lb {
                None => exit,
                Some(lb) => {
                    let logger = ctl.logger().clone();
                    let (tx, rx) = oneshot::channel();
                    tokio::spawn(async move {
                        let result = match exit.await {
                            Ok(result) => result,
                            Err(_) => Err(Cause::errored("task exited without a result")),
                        };
                        logger.line("Stopping proxy.");
                        lb.close();
                        let _ = tx.send(result);
                    });
                    rx
                }
            }
        } else {
            self.launch_cluster(ctl, lb).await
        }
    }

    /// Fan out `n` instance workers under a shared scope; the first failure
    /// cancels the rest, completion of all cancels with success.
    async fn launch_cluster(&self, ctl: Arc<MustWorker>, lb: Option<Arc<LoadBalancer>>) -> TaskExit {
        let count = self.instances;
        let config = self.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let scope = ctl.scope().child();
            let left = Arc::new(AtomicI32::new(count as i32));

            for index in 0..count {
                if scope.is_cancelled() {
                    break;
                }
                let task = Task {
                    kind: "run".into(),
                    id: index.to_string(),
                    payload: Payload::Instance(InstanceTask::new(
                        config.clone(),
                        lb.clone(),
                        index,
                    )),
                };
                let exit = ctl.clone().launch_child(&scope, task, None);
                let scope = scope.clone();
                let left = left.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = scope.done() => {}
                        result = exit => {
                            let result = result
                                .unwrap_or_else(|_| Err(Cause::errored("task exited without a result")));
                            match result {
                                Err(cause) => { scope.cancel(cause); }
                                Ok(()) => {
                                    if left.fetch_sub(1, Ordering::SeqCst) - 1 == 0 {
                                        scope.cancel(Cause::complete());
                                    }
                                }
                            }
                        }
                    }
                });
            }

            scope.done().await;
            let result = match scope.result() {
                Ok(()) => Ok(()),
                Err(cause) => Err(cause.non_retriable()),
            };
            if let Some(lb) = lb {
                ctl.logger().line("Stopping proxy.");
                lb.close();
            }
            let _ = tx.send(result);
        });
        rx
    }
}

/// One cluster member: a concrete subprocess behind an optional balancer.
#[derive(Clone)]
pub struct InstanceTask {
    config: RunTask,
    lb: Option<Arc<LoadBalancer>>,
    index: usize,
}

impl std::fmt::Debug for InstanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceTask")
            .field("exec", &self.config.exec)
            .field("index", &self.index)
            .finish()
    }
}

impl InstanceTask {
    fn new(mut config: RunTask, lb: Option<Arc<LoadBalancer>>, index: usize) -> InstanceTask {
        config.proxy = None;
        InstanceTask { config, lb, index }
    }

    pub(crate) fn config(&self) -> &RunTask {
        &self.config
    }

    pub(crate) async fn launch(&self, ctl: Arc<MustWorker>) -> TaskExit {
        let config = &self.config;

        let mut cmd = if config.foreign.is_empty() || config.foreign == "run" {
            let mut cmd = tokio::process::Command::new(&config.exec);
            cmd.args(&config.args);
            cmd
        } else {
            match bridge::run(&config.foreign, &config.exec, &config.args) {
                Ok(cmd) => cmd,
                Err(err) => return exit_now(Err(Cause::errored(err).non_retriable())),
            }
        };

        if !config.cwd.is_empty() {
            cmd.current_dir(&config.cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("GOSU_NS", ctl.namespace());
        cmd.env("GOSU_CID", self.index.to_string());
        cmd.env("GOSU_LOCAL", settings::RPC.get().local_address.clone());

        let serve_addr = if self.lb.is_some() {
            let addr = ipc::new_address("");
            cmd.env("GOSU_SERVE", &addr);
            Some(addr)
        } else {
            None
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // Spawn failures surface through the exit channel; no report.
            Err(err) => return exit_now(Err(Cause::errored(err).non_retriable())),
        };
        let pid = child.id().map(|p| p as i32).unwrap_or(0);

        if let Some(stdout) = child.stdout.take() {
            let logger = ctl.logger().clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logger.write_line(Stream::Stdout, &line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logger = ctl.logger().clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logger.write_line(Stream::Stderr, &line);
                }
            });
        }

        let exited = Arc::new(AtomicBool::new(false));

        // Resource sampler: publish a tree report every second, and a zero
        // report once the process is gone.
        {
            let ctl = ctl.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                while !exited.load(Ordering::SeqCst) {
                    ctl.set_report(inspect::inspect_process(pid));
                    sleep(INSPECT_INTERVAL).await;
                }
                ctl.set_report(Report::default());
            });
        }

        // Graceful shutdown: forward the stop request as an interrupt.
        {
            let stopping = ctl.stopping();
            let exited = exited.clone();
            tokio::spawn(async move {
                stopping.cancelled().await;
                if !exited.load(Ordering::SeqCst) {
                    #[cfg(unix)]
                    crate::procs::interrupt(pid);
                    #[cfg(not(unix))]
                    crate::procs::kill(pid);
                }
            });
        }

        let (tx, rx) = oneshot::channel();
        {
            let scope = ctl.scope().clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) if status.success() => Ok(()),
                        Ok(status) => Err(Cause::errored(format!("exit status: {status}"))),
                        Err(err) => Err(Cause::errored(err)),
                    },
                    _ = scope.done() => {
                        child.start_kill().ok();
                        let _ = child.wait().await;
                        scope.result()
                    }
                };
                exited.store(true, Ordering::SeqCst);
                let _ = tx.send(result);
            });
        }

        // With a balancer in front, launch completes only once the child
        // answers HTTP on its IPC address; the upstream is registered then
        // and removed again when the task starts stopping.
        if let (Some(lb), Some(addr)) = (&self.lb, &serve_addr) {
            ctl.logger().line("Waiting for server to start...");
            while !exited.load(Ordering::SeqCst) {
                if ctl.scope().is_cancelled() {
                    return exit_now(ctl.scope().result());
                }
                if lifecheck(addr).await {
                    ctl.logger().line("Server started.");
                    let upstream = Upstream::over_ipc(ctl.namespace(), addr.clone());
                    ctl.logger().line(format!("Adding upstream {}", upstream.name()));
                    lb.add_upstream(upstream.clone());

                    let lb = lb.clone();
                    let logger = ctl.logger().clone();
                    let stopping = ctl.stopping();
                    tokio::spawn(async move {
                        stopping.cancelled().await;
                        logger.line(format!("Removing upstream {}", upstream.name()));
                        lb.remove_upstream(&upstream);
                    });
                    break;
                }
                tokio::select! {
                    _ = ctl.scope().done() => return exit_now(ctl.scope().result()),
                    _ = sleep(PROBE_INTERVAL) => {}
                }
            }
        }

        rx
    }
}

/// Probe an IPC address for an HTTP server: send a bare GET and look for
/// an HTTP/1.1 status line in the first kilobyte.
async fn lifecheck(address: &str) -> bool {
    let Ok(mut conn) = ipc::dial_timeout(address, PROBE_DIAL_TIMEOUT).await else {
        return false;
    };
    if conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.is_err() {
        return false;
    }
    let mut buf = [0u8; 1024];
    let n = match tokio::time::timeout(PROBE_DIAL_TIMEOUT, async {
        use tokio::io::AsyncReadExt;
        conn.read(&mut buf).await
    })
    .await
    {
        Ok(Ok(n)) => n,
        _ => return false,
    };
    String::from_utf8_lossy(&buf[..n]).contains("HTTP/1.1")
}
