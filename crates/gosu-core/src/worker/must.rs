//! The single-attempt worker state machine.
//!
//! Drives one task through Starting → Running → terminal, enforcing the
//! start, execution, and stop timeouts plus the memory limit. The first
//! cause installed into the scope is definitive; every other observer
//! loses the race and reports it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use gosu_types::{Cause, Report, Status, TaskResult};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{new_worker, Worker, WorkerEnv, WorkerSeed};
use crate::options::Options;
use crate::scope::Scope;
use crate::task::{Task, TaskExit};
use crate::whiteboard::Whiteboard;

const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct MustWorker {
    seed: WorkerSeed,
    scope: Scope,
    stopping: CancellationToken,
    stop_used: AtomicBool,
    live: AtomicU8,
    report: RwLock<Report>,
    children: Mutex<HashMap<u64, Arc<dyn Worker>>>,
    child_seq: AtomicU64,
}

impl MustWorker {
    pub(crate) fn create(seed: WorkerSeed) -> Arc<MustWorker> {
        let scope = seed.parent.child();
        let worker = Arc::new(MustWorker {
            seed,
            scope,
            stopping: CancellationToken::new(),
            stop_used: AtomicBool::new(false),
            live: AtomicU8::new(Status::Idle as u8),
            report: RwLock::new(Report::default()),
            children: Mutex::new(HashMap::new()),
            child_seq: AtomicU64::new(1),
        });

        // Whatever ends the scope also raises the stopping signal, so task
        // implementations always observe a shutdown request.
        let watch = worker.clone();
        tokio::spawn(async move {
            watch.scope.done().await;
            watch.signal_stop(false).await;
        });

        worker
    }

    pub(crate) fn scope(&self) -> &Scope {
        &self.scope
    }

    /// One-shot signal observed by task implementations to begin graceful
    /// shutdown.
    pub(crate) fn stopping(&self) -> CancellationToken {
        self.stopping.clone()
    }

    pub(crate) fn logger(&self) -> &crate::logging::JobLogger {
        &self.seed.logger
    }

    pub(crate) fn board(&self) -> &Whiteboard {
        &self.seed.whiteboard
    }

    pub(crate) fn set_report(&self, report: Report) {
        *self.report.write().unwrap() = report;
    }

    pub(crate) fn live_status(&self) -> Status {
        Status::from_byte(self.live.load(Ordering::SeqCst))
    }

    fn set_live(&self, status: Status) {
        self.live.store(status as u8, Ordering::SeqCst);
    }

    /// Spawn a child worker for a subtask, tracked in the child set until
    /// its run returns. The child inherits this worker's options, modified
    /// by `modify`, and is stopped when this worker starts stopping.
    pub(crate) fn launch_child(
        self: Arc<Self>,
        scope: &Scope,
        subtask: Task,
        modify: Option<Box<dyn FnOnce(&mut Options) + Send>>,
    ) -> oneshot::Receiver<TaskResult> {
        let mut options = self.seed.options.clone();
        if let Some(modify) = modify {
            modify(&mut options);
        }
        let child = new_worker(
            WorkerEnv {
                scope: scope.clone(),
                logger: self.seed.logger.clone(),
                whiteboard: self.seed.whiteboard.clone(),
            },
            subtask,
            options,
        );

        // Propagate stop requests down the tree.
        {
            let child = child.clone();
            let stopping = self.stopping.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stopping.cancelled() => child.stop().await,
                    _ = child.done() => {}
                }
            });
        }

        let id = self.child_seq.fetch_add(1, Ordering::Relaxed);
        self.children.lock().unwrap().insert(id, child.clone());

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let result = child.run().await;
            this.children.lock().unwrap().remove(&id);
            let _ = tx.send(result);
        });
        rx
    }

    async fn signal_stop(&self, wait: bool) {
        self.set_live(Status::Stopping);
        if self.stop_used.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopping.cancel();

        let stop_timeout = self.seed.options.stop_timeout;
        if stop_timeout.is_zero() {
            self.scope.cancel(Cause::of(Status::Cancelled));
        } else if wait {
            self.enforce_stop(stop_timeout).await;
        } else {
            let scope = self.scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(stop_timeout) => { scope.cancel(Cause::of(Status::TimeoutStop)); }
                    _ = scope.done() => {}
                }
            });
        }
    }

    async fn enforce_stop(&self, stop_timeout: Duration) {
        tokio::select! {
            _ = sleep(stop_timeout) => { self.scope.cancel(Cause::of(Status::TimeoutStop)); }
            _ = self.scope.done() => {}
        }
    }

    fn wrap_exit(result: Result<TaskResult, oneshot::error::RecvError>) -> TaskResult {
        match result {
            Ok(result) => result,
            Err(_) => Err(Cause::errored("task exited without a result")),
        }
    }

    fn finish(&self, result: TaskResult) -> TaskResult {
        let cause = match &result {
            Ok(()) => Cause::complete(),
            Err(cause) => cause.clone(),
        };
        self.scope.cancel(cause);
        result
    }
}

#[async_trait]
impl Worker for MustWorker {
    fn task(&self) -> &Task {
        &self.seed.task
    }

    fn options(&self) -> &Options {
        &self.seed.options
    }

    fn namespace(&self) -> String {
        self.seed.logger.namespace().to_string()
    }

    fn whiteboard(&self) -> Whiteboard {
        self.seed.whiteboard.clone()
    }

    fn status(&self) -> Cause {
        if self.scope.is_cancelled() {
            self.scope.cause()
        } else {
            let live = self.live_status();
            if live.is_alive() {
                Cause::of(live)
            } else {
                Cause::of(Status::Idle)
            }
        }
    }

    fn inspect(&self) -> Report {
        self.report.read().unwrap().clone()
    }

    async fn run(self: Arc<Self>) -> TaskResult {
        let options = self.seed.options.clone();

        // Watchdog: launch must reach Running before the start timeout.
        let started = CancellationToken::new();
        if !options.start_timeout.is_zero() {
            let scope = self.scope.clone();
            let started = started.clone();
            let start_timeout = options.start_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(start_timeout) => { scope.cancel(Cause::of(Status::TimeoutStart)); }
                    _ = scope.done() => {}
                    _ = started.cancelled() => {}
                }
            });
        }

        // Watchdog: poll the reported memory footprint against the limit.
        if options.max_memory.is_positive() {
            let this = self.clone();
            let limit = options.max_memory.0 as f64;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.scope.done() => return,
                        _ = sleep(MEMORY_CHECK_INTERVAL) => {
                            if this.inspect().mem > limit {
                                this.scope.cancel(Cause::errored("memory limit exceeded"));
                                return;
                            }
                        }
                    }
                }
            });
        }

        self.set_live(Status::Starting);
        let mut exit: TaskExit = self.seed.task.launch(self.clone()).await;

        // Starting: either survive min_uptime or classify the early exit.
        if !options.min_uptime.is_zero() {
            tokio::select! {
                _ = self.scope.done() => { started.cancel(); return self.scope.result(); }
                _ = sleep(options.min_uptime) => {}
                result = &mut exit => {
                    started.cancel();
                    let result = match Self::wrap_exit(result) {
                        Ok(()) => Err(Cause::errored("quit too early")),
                        Err(cause) => Err(cause),
                    };
                    return self.finish(result);
                }
            }
        }
        self.set_live(Status::Running);
        started.cancel();

        if options.exec_timeout.is_zero() {
            tokio::select! {
                _ = self.scope.done() => self.scope.result(),
                result = exit => self.finish(Self::wrap_exit(result)),
            }
        } else {
            tokio::select! {
                _ = self.scope.done() => self.scope.result(),
                _ = sleep(options.exec_timeout) => {
                    let cause = Cause::of(Status::TimeoutExec);
                    self.scope.cancel(cause.clone());
                    Err(cause)
                }
                result = exit => self.finish(Self::wrap_exit(result)),
            }
        }
    }

    async fn stop(&self) {
        if self.scope.is_cancelled() {
            return;
        }
        self.signal_stop(true).await;
    }

    fn kill(&self) {
        self.scope.cancel(Cause::of(Status::Cancelled));
    }

    async fn done(&self) {
        self.scope.done().await;
    }

    fn traverse(&self, f: &mut dyn FnMut(&Arc<dyn Worker>) -> bool) {
        let children: Vec<Arc<dyn Worker>> =
            self.children.lock().unwrap().values().cloned().collect();
        for child in &children {
            if !f(child) {
                break;
            }
        }
    }
}
