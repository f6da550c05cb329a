use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, info, warn};

/// Handles of job tasks currently running in this process.
///
/// At most one task per job id; a task removes its own entry when it
/// finishes.
#[derive(Clone, Default)]
pub struct JobRegistry {
    tasks: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` for `job_id`. Returns false without spawning if a task
    /// for that job is still registered.
    pub async fn spawn<F>(&self, job_id: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The write guard is held across the spawn so the task's own removal
        // cannot run before its handle is inserted.
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(job_id) {
            debug!(job_id, "job task already running");
            return false;
        }

        let registry = self.clone();
        let id = job_id.to_string();
        let handle = tokio::spawn(async move {
            task.await;
            registry.tasks.write().await.remove(&id);
        });
        tasks.insert(job_id.to_string(), handle);
        true
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(job_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Waits up to `grace` for running tasks, then aborts the rest.
    /// Returns the number of aborted tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut handles: Vec<(String, JoinHandle<()>)> =
            self.tasks.write().await.drain().collect();
        if handles.is_empty() {
            return 0;
        }

        info!(jobs = handles.len(), grace_secs = grace.as_secs(), "waiting for running jobs");
        let waited = tokio::time::timeout(
            grace,
            join_all(handles.iter_mut().map(|(_, handle)| handle)),
        )
        .await;
        if waited.is_ok() {
            return 0;
        }

        let mut aborted = 0;
        for (job_id, handle) in &handles {
            if !handle.is_finished() {
                warn!(job_id = %job_id, "aborting job after shutdown grace period");
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}
