//! Jobs: persisted manifests wrapped around a running worker tree.

use std::sync::{Arc, Mutex, RwLock};

use gosu_types::{Cause, Status};
use serde::{Deserialize, Serialize};

use crate::logging::{JobLogger, LogOptions};
use crate::options::Options;
use crate::scope::Scope;
use crate::settings;
use crate::task::Task;
use crate::trigger::{Trigger, TriggerFn, TriggerGuard};
use crate::whiteboard::Whiteboard;
use crate::worker::{new_worker, Worker, WorkerEnv};

/// The persisted description of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub main: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<Trigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<Trigger>,
    #[serde(flatten)]
    pub options: Options,
    #[serde(flatten)]
    pub logger: LogOptions,
}

impl Manifest {
    /// Materialize the manifest into a job: resolve logger paths, propagate
    /// the job id into the main task, and wire up the triggers.
    pub fn spawn(&self) -> anyhow::Result<Arc<Job>> {
        let mut log_opts = self.logger.clone();
        if log_opts.log_name.is_empty() {
            log_opts.log_name = self.id.clone();
        }
        if log_opts.output.is_empty() {
            log_opts.output = settings::log_dir()
                .join(format!("{}.log", self.id))
                .to_string_lossy()
                .into_owned();
        }
        if log_opts.error.is_empty() {
            log_opts.error = settings::log_dir()
                .join(format!("{}.err", self.id))
                .to_string_lossy()
                .into_owned();
        }
        let logger = JobLogger::new(None, &log_opts)?;

        let mut main = self.main.clone();
        if main.id.is_empty() {
            main.id = self.id.clone();
        }

        Ok(Arc::new(Job {
            id: self.id.clone(),
            manifest: self.clone(),
            main,
            options: self.options.clone(),
            logger,
            launch: self.launch.clone(),
            drop: self.drop.clone(),
            scope: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
            board: RwLock::new(None),
            guards: Mutex::new(Vec::new()),
        }))
    }
}

/// A named, persisted unit of work: exactly one live worker at a time.
pub struct Job {
    pub id: String,
    pub manifest: Manifest,
    pub main: Task,
    pub options: Options,
    pub logger: JobLogger,
    launch: Option<Trigger>,
    drop: Option<Trigger>,
    scope: Mutex<Option<Scope>>,
    worker: tokio::sync::Mutex<Option<Arc<dyn Worker>>>,
    board: RwLock<Option<Whiteboard>>,
    guards: Mutex<Vec<TriggerGuard>>,
}

impl Job {
    fn job_scope(&self) -> Scope {
        self.scope
            .lock()
            .unwrap()
            .get_or_insert_with(Scope::new)
            .clone()
    }

    /// Attach trigger listeners under `parent`; they detach when the job's
    /// scope ends.
    pub fn ready(self: Arc<Self>, parent: &Scope) {
        let scope = parent.child();
        *self.scope.lock().unwrap() = Some(scope.clone());

        let mut guards = self.guards.lock().unwrap();
        if let Some(trigger) = &self.launch {
            let job = self.clone();
            let start_or_join: TriggerFn = Arc::new(move || {
                let job = job.clone();
                Box::pin(async move {
                    let (worker, _) = job.start().await;
                    let scope = job.job_scope();
                    tokio::select! {
                        _ = worker.done() => {}
                        _ = scope.done() => {}
                    }
                })
            });
            guards.push(trigger.listen(start_or_join));
        }
        if let Some(trigger) = &self.drop {
            let job = self.clone();
            let stop: TriggerFn = Arc::new(move || {
                let job = job.clone();
                Box::pin(async move { job.stop().await })
            });
            guards.push(trigger.listen(stop));
        }
        drop(guards);

        let job = self.clone();
        scope.on_done(move || {
            job.guards.lock().unwrap().clear();
        });
    }

    /// Idempotent start: returns the running worker and whether this call
    /// created it.
    pub async fn start(&self) -> (Arc<dyn Worker>, bool) {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_ref() {
            return (worker.clone(), false);
        }
        tracing::info!(job = self.id, "starting job");

        let board = Whiteboard::new();
        let worker = new_worker(
            WorkerEnv {
                scope: self.job_scope(),
                logger: self.logger.clone(),
                whiteboard: board.clone(),
            },
            self.main.clone(),
            self.options.clone(),
        );
        *self.board.write().unwrap() = Some(board);
        *slot = Some(worker.clone());

        let running = worker.clone();
        tokio::spawn(async move { running.run().await });
        (worker, true)
    }

    /// Graceful stop: request shutdown and wait for the worker to finish.
    pub async fn stop(&self) {
        let mut slot = self.worker.lock().await;
        let Some(worker) = slot.take() else { return };
        tracing::info!(job = self.id, "stopping job");
        worker.stop().await;
        worker.done().await;
    }

    pub async fn restart(&self) {
        tracing::info!(job = self.id, "restarting job");
        self.stop().await;
        self.start().await;
    }

    pub async fn kill(&self) {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.take() {
            tracing::info!(job = self.id, "killing job");
            worker.kill();
        }
    }

    pub async fn worker(&self) -> Option<Arc<dyn Worker>> {
        self.worker.lock().await.clone()
    }

    pub async fn status(&self) -> Cause {
        match self.worker().await {
            Some(worker) => worker.status(),
            None => Cause::of(Status::Idle),
        }
    }

    pub fn whiteboard(&self) -> Option<Whiteboard> {
        self.board.read().unwrap().clone()
    }

    /// Wait for the current worker to finish, bounded by `bound`.
    pub async fn join(&self, bound: &Scope) {
        let Some(worker) = self.worker().await else {
            return;
        };
        tokio::select! {
            _ = bound.done() => {}
            _ = worker.done() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json(id: &str) -> String {
        format!(
            r#"{{"id":"{id}","main":"noop","launch":"never","stdout":"null","stderr":"null"}}"#
        )
    }

    #[tokio::test]
    async fn manifest_round_trip_is_json_equal() {
        let manifest: Manifest = serde_json::from_str(&manifest_json("echo")).unwrap();
        let json = serde_json::to_value(&manifest).unwrap();
        let back: Manifest = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
    }

    #[tokio::test]
    async fn main_task_inherits_job_id() {
        let manifest: Manifest = serde_json::from_str(&manifest_json("svc")).unwrap();
        let job = manifest.spawn().unwrap();
        assert_eq!(job.main.id, "svc");
        // The manifest itself keeps the task id unset.
        assert!(job.manifest.main.id.is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let manifest: Manifest = serde_json::from_str(&manifest_json("idem")).unwrap();
        let job = manifest.spawn().unwrap();
        job.clone().ready(&Scope::new());

        let (first, started) = job.start().await;
        assert!(started);
        let (second, started_again) = job.start().await;
        assert!(!started_again);
        assert!(Arc::ptr_eq(&first, &second));
        job.stop().await;
    }

    #[tokio::test]
    async fn status_is_idle_before_start() {
        let manifest: Manifest = serde_json::from_str(&manifest_json("idle")).unwrap();
        let job = manifest.spawn().unwrap();
        assert_eq!(job.status().await.status(), Status::Idle);
    }

    #[tokio::test]
    async fn stop_joins_to_done() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"id":"stopper","main":"wait 10s","stop_timeout":"300ms","stdout":"null","stderr":"null"}"#,
        )
        .unwrap();
        let job = manifest.spawn().unwrap();
        job.clone().ready(&Scope::new());
        let (worker, _) = job.start().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        job.stop().await;
        // After stop returns the worker must be terminal.
        assert!(worker.status().status().is_dead());
    }
}
