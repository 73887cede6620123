//! The daemon session: the job registry, its persistence, and the RPC
//! surface.

pub mod services;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use gosu_types::Cause;
use regex::Regex;
use thiserror::Error;

use crate::job::{Job, Manifest};
use crate::procs;
use crate::rpc::RpcServer;
use crate::scope::Scope;
use crate::settings;
use crate::store::{Collection, Store, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("job already exists")]
    AlreadyExists,
    #[error("job not found")]
    NotFound,
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A running daemon: every job's manifest is mirrored between the in-memory
/// map and the `jobs:` collection under the same key.
pub struct Session {
    store: Arc<Store>,
    manifests: Collection<Manifest>,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    scope: Scope,
    rpc: Mutex<Option<RpcServer>>,
}

impl Session {
    /// Open the daemon session: open the store, kill orphans from previous
    /// sessions, revive persisted jobs, and bring up the RPC endpoint.
    /// Store or listen failures are fatal.
    pub async fn open() -> anyhow::Result<Arc<Session>> {
        let store = if settings::SERVICE.get().ephemeral {
            Store::open_in_memory()?
        } else {
            Store::open(&settings::data_dir().join("gosu.db"))?
        };

        let session = Session::with_store(Arc::new(store));
        procs::kill_orphans();
        session.revive_jobs().await;

        let addresses = settings::RPC.get().addresses();
        let server = crate::rpc::serve(session.clone(), &addresses).await?;
        session.install_rpc(server);
        Ok(session)
    }

    /// A session over an explicit store, with no RPC endpoint. Used by the
    /// RPC layer's own bootstrap and by tests.
    pub fn with_store(store: Arc<Store>) -> Arc<Session> {
        Arc::new(Session {
            manifests: Collection::open(store.clone(), "jobs"),
            store,
            jobs: RwLock::new(HashMap::new()),
            scope: Scope::new(),
            rpc: Mutex::new(None),
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Adopt an RPC server handle so session teardown closes it.
    pub fn install_rpc(&self, server: RpcServer) {
        *self.rpc.lock().unwrap() = Some(server);
    }

    /// Register a new job; duplicate ids are rejected.
    pub fn insert_job(&self, job: Arc<Job>) -> Result<(), SessionError> {
        {
            let mut jobs = self.jobs.write().unwrap();
            if jobs.contains_key(&job.id) {
                return Err(SessionError::AlreadyExists);
            }
            jobs.insert(job.id.clone(), job.clone());
        }
        self.manifests.replace(&job.id, &job.manifest)?;
        job.ready(&self.scope);
        Ok(())
    }

    /// Install a job, replacing any previous one under the same id. The
    /// previous worker is stopped before the replacement becomes ready.
    pub async fn update_job(&self, job: Arc<Job>) -> Result<(), SessionError> {
        let previous = self
            .jobs
            .write()
            .unwrap()
            .insert(job.id.clone(), job.clone());
        if let Some(previous) = previous {
            previous.stop().await;
        }
        self.manifests.replace(&job.id, &job.manifest)?;
        job.ready(&self.scope);
        Ok(())
    }

    /// Remove a job from the registry and the store, stopping its worker.
    pub async fn delete_job(&self, id: &str) -> Result<(), SessionError> {
        self.manifests.delete(id)?;
        let removed = self.jobs.write().unwrap().remove(id);
        match removed {
            Some(job) => {
                job.stop().await;
                Ok(())
            }
            None => Err(SessionError::NotFound),
        }
    }

    pub fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// The persisted manifest collection backing this session.
    pub fn manifests(&self) -> &Collection<Manifest> {
        &self.manifests
    }

    /// Jobs whose id matches `pattern` (case-insensitive regex); an empty
    /// pattern, `*`, `all`, and `.*` match everything.
    pub fn matched_jobs(&self, pattern: &str) -> Result<Vec<Arc<Job>>, SessionError> {
        let regex = match pattern {
            "" | "*" | "all" | ".*" => None,
            pattern => Some(Regex::new(&format!("(?i){pattern}"))?),
        };
        let jobs = self.jobs.read().unwrap();
        let mut matched: Vec<Arc<Job>> = jobs
            .iter()
            .filter(|(id, _)| regex.as_ref().map(|r| r.is_match(id)).unwrap_or(true))
            .map(|(_, job)| job.clone())
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    /// Revive every persisted manifest, in unspecified order.
    pub async fn revive_jobs(&self) {
        let mut manifests = Vec::new();
        if let Err(err) = self.manifests.range(|id, manifest| {
            manifests.push((id, manifest));
            true
        }) {
            tracing::error!(error = %err, "failed to scan persisted jobs");
            return;
        }
        for (id, manifest) in manifests {
            tracing::info!(job = id, "reviving job");
            match manifest.spawn() {
                Ok(job) => {
                    self.jobs.write().unwrap().insert(id, job.clone());
                    job.ready(&self.scope);
                }
                Err(err) => tracing::error!(job = id, error = %err, "failed to revive job"),
            }
        }
    }

    /// Stop every job and wait for the joins, bounded by `timeout`.
    pub async fn stop_all(&self, timeout: Duration) {
        let jobs: Vec<Arc<Job>> = self.jobs.read().unwrap().values().cloned().collect();
        let stops = jobs.iter().map(|job| job.stop());
        let _ = tokio::time::timeout(timeout, futures::future::join_all(stops)).await;
    }

    /// Tear the session down: close the RPC endpoint, then the database,
    /// then cancel the root scope with `cause`.
    pub fn close(&self, cause: Option<Cause>) {
        if self.scope.is_cancelled() {
            return;
        }
        if let Some(server) = self.rpc.lock().unwrap().take() {
            server.close();
        }
        self.store.close();
        match cause {
            Some(cause) => self.scope.cancel(cause),
            None => self.scope.cancel_ok(),
        };
    }

    /// Block until shutdown is requested (signal or internal close), then
    /// stop everything.
    pub async fn wait(&self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = self.scope.done() => {}
        }
        self.stop_all(Duration::from_secs(2)).await;
        self.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str) -> Arc<Job> {
        let manifest: Manifest = serde_json::from_str(&format!(
            r#"{{"id":"{id}","main":"noop","launch":"never","stdout":"null","stderr":"null"}}"#
        ))
        .unwrap();
        manifest.spawn().unwrap()
    }

    fn session() -> Arc<Session> {
        Session::with_store(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let session = session();
        session.insert_job(manifest("a")).unwrap();
        let err = session.insert_job(manifest("a")).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists));
    }

    #[tokio::test]
    async fn insert_mirrors_into_store() {
        let session = session();
        session.insert_job(manifest("mirrored")).unwrap();
        assert!(session.manifests().get("mirrored").unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_both_sides() {
        let session = session();
        session.insert_job(manifest("gone")).unwrap();
        session.delete_job("gone").await.unwrap();
        assert!(session.job("gone").is_none());
        assert!(session.manifests().get("gone").unwrap().is_none());
        assert!(matches!(
            session.delete_job("gone").await.unwrap_err(),
            SessionError::NotFound
        ));
    }

    #[tokio::test]
    async fn update_replaces_previous_job() {
        let session = session();
        let first = manifest("swap");
        session.insert_job(first.clone()).unwrap();
        let (worker, _) = first.start().await;

        let second = manifest("swap");
        session.update_job(second.clone()).await.unwrap();

        // The previous worker was stopped synchronously.
        assert!(worker.status().status().is_dead());
        assert!(Arc::ptr_eq(&session.job("swap").unwrap(), &second));
    }

    #[tokio::test]
    async fn close_shuts_the_store() {
        let session = session();
        session.insert_job(manifest("late")).unwrap();
        session.close(None);
        assert!(session.scope().is_cancelled());
        assert!(matches!(
            session.manifests().get("late"),
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn pattern_matching() {
        let session = session();
        for id in ["web-1", "web-2", "db"] {
            session.insert_job(manifest(id)).unwrap();
        }
        let ids = |pattern: &str| -> Vec<String> {
            session
                .matched_jobs(pattern)
                .unwrap()
                .iter()
                .map(|j| j.id.clone())
                .collect()
        };
        assert_eq!(ids("*").len(), 3);
        assert_eq!(ids(""), vec!["db", "web-1", "web-2"]);
        assert_eq!(ids("WEB"), vec!["web-1", "web-2"]);
        assert_eq!(ids("^db$"), vec!["db"]);
        assert!(session.matched_jobs("(").is_err());
    }
}
