//! Workers: runtime execution of tasks.
//!
//! A worker owns one task attempt (or a chain of retried attempts), a
//! cancellation scope, a logger slice, and a whiteboard slice. Workers form
//! a tree matching the task tree; exactly one worker owns a task at a time.

mod must;
mod retry;

pub(crate) use must::MustWorker;
pub(crate) use retry::RetryWorker;

use std::sync::Arc;

use async_trait::async_trait;
use gosu_types::{Cause, Report, TaskResult};

use crate::logging::JobLogger;
use crate::options::Options;
use crate::scope::Scope;
use crate::task::Task;
use crate::whiteboard::Whiteboard;

/// The runtime face of one task: lifecycle control plus inspection.
#[async_trait]
pub trait Worker: Send + Sync {
    fn task(&self) -> &Task;
    fn options(&self) -> &Options;
    /// The logger namespace identifying this worker in the tree.
    fn namespace(&self) -> String;
    fn whiteboard(&self) -> Whiteboard;
    /// Live state while running; the terminal cause once finished.
    fn status(&self) -> Cause;
    /// The most recent resource report published by the task.
    fn inspect(&self) -> Report;
    /// Drive the task to termination. Blocks until terminal.
    async fn run(self: Arc<Self>) -> TaskResult;
    /// Request graceful shutdown, honoring the stop timeout.
    async fn stop(&self);
    /// Cancel immediately with `Cancelled`.
    fn kill(&self);
    /// Resolves when the worker reaches a terminal state.
    async fn done(&self);
    /// Visit child workers; return false from the callback to stop.
    fn traverse(&self, f: &mut dyn FnMut(&Arc<dyn Worker>) -> bool);
}

/// Everything a worker inherits from its surroundings.
#[derive(Clone)]
pub struct WorkerEnv {
    pub scope: Scope,
    pub logger: JobLogger,
    pub whiteboard: Whiteboard,
}

#[derive(Clone)]
pub(crate) struct WorkerSeed {
    pub task: Task,
    pub options: Options,
    pub logger: JobLogger,
    pub whiteboard: Whiteboard,
    pub parent: Scope,
}

/// Build a worker around a task: normalize options, slice the logger and
/// whiteboard by the task label, and wrap in a retry supervisor unless
/// retries are disabled.
pub fn new_worker(env: WorkerEnv, task: Task, mut options: Options) -> Arc<dyn Worker> {
    options.with_defaults();

    let mut label = task.label().to_string();
    if label == env.logger.namespace() {
        label.clear();
    }
    let logger = env.logger.fork(&label);
    let whiteboard = if label.is_empty() {
        env.whiteboard
    } else {
        env.whiteboard.fork(&label)
    };

    let seed = WorkerSeed {
        task,
        options,
        logger,
        whiteboard,
        parent: env.scope,
    };
    if seed.options.retry_disabled {
        MustWorker::create(seed) as Arc<dyn Worker>
    } else {
        RetryWorker::create(seed) as Arc<dyn Worker>
    }
}
