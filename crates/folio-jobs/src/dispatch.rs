use std::sync::Arc;

use async_trait::async_trait;
use folio_common::{FolioError, Result};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{queue::WorkQueue, registry::JobRegistry, runner::JobRunner, store::JobStore};

/// Hands a queued job to something that will eventually call
/// [`JobRunner::run`] for it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue(&self, job_id: &str) -> Result<()>;
}

/// Runs jobs as tasks of the current process.
#[derive(Clone)]
pub struct InProcessDispatcher {
    runner: Arc<JobRunner>,
    registry: JobRegistry,
}

impl InProcessDispatcher {
    pub fn new(runner: Arc<JobRunner>, registry: JobRegistry) -> Self {
        Self { runner, registry }
    }
}

#[async_trait]
impl Dispatcher for InProcessDispatcher {
    async fn enqueue(&self, job_id: &str) -> Result<()> {
        let runner = self.runner.clone();
        let id = job_id.to_string();
        let spawned = self
            .registry
            .spawn(job_id, async move { runner.run(&id).await })
            .await;

        if !spawned {
            return Err(FolioError::Dispatch(format!("job {job_id} is already running")));
        }
        debug!(job_id, "job dispatched in process");
        Ok(())
    }
}

/// Appends jobs to the durable [`WorkQueue`]; see [`start_queue_workers`].
#[derive(Clone)]
pub struct QueueDispatcher {
    queue: Arc<WorkQueue>,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn enqueue(&self, job_id: &str) -> Result<()> {
        self.queue.enqueue(job_id).await
    }
}

/// Tries `primary` and falls back to `fallback` when it cannot take the job,
/// e.g. a full work queue.
#[derive(Clone)]
pub struct FallbackDispatcher {
    primary: Arc<dyn Dispatcher>,
    fallback: Arc<dyn Dispatcher>,
}

impl FallbackDispatcher {
    pub fn new(primary: Arc<dyn Dispatcher>, fallback: Arc<dyn Dispatcher>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Dispatcher for FallbackDispatcher {
    async fn enqueue(&self, job_id: &str) -> Result<()> {
        match self.primary.enqueue(job_id).await {
            Err(FolioError::Dispatch(reason)) => {
                warn!(job_id, reason = %reason, "primary dispatch failed, running job in process");
                self.fallback.enqueue(job_id).await
            }
            other => other,
        }
    }
}

/// Spawns `workers` consumers of `queue`. Each worker runs one job at a time
/// through the registry and acknowledges the entry only once the run has
/// returned; runs aborted at shutdown stay queued for the next start.
pub fn start_queue_workers(
    queue: Arc<WorkQueue>,
    runner: Arc<JobRunner>,
    registry: JobRegistry,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let queue = queue.clone();
            let runner = runner.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                debug!(worker, "queue worker started");
                while let Some(entry) = queue.dequeue().await {
                    let job_id = entry.job_id;
                    let (done_tx, done_rx) = oneshot::channel();
                    let run_runner = runner.clone();
                    let run_id = job_id.clone();
                    let spawned = registry
                        .spawn(&job_id, async move {
                            run_runner.run(&run_id).await;
                            let _ = done_tx.send(());
                        })
                        .await;

                    if !spawned {
                        debug!(worker, job_id = %job_id, "job already running, dropping duplicate entry");
                    } else if done_rx.await.is_err() {
                        warn!(worker, job_id = %job_id, "job run interrupted, leaving entry for redelivery");
                        continue;
                    }

                    if let Err(err) = queue.ack(&job_id).await {
                        error!(worker, job_id = %job_id, error = %err, "failed to acknowledge job");
                    }
                }
                debug!(worker, "queue worker stopped");
            })
        })
        .collect()
}

/// Finishes as ERROR every job whose queue entry was dropped on load.
pub async fn fail_exhausted(queue: &WorkQueue, runner: &JobRunner) -> usize {
    let exhausted = queue.take_exhausted().await;
    for job_id in &exhausted {
        runner
            .abandon(job_id, "job was delivered too many times without finishing")
            .await;
    }
    if !exhausted.is_empty() {
        warn!(jobs = exhausted.len(), "abandoned exhausted queue entries");
    }
    exhausted.len()
}

/// Re-dispatches every job that is not yet terminal. Used at startup when
/// jobs were queued or running in a process that went away.
pub async fn recover_unfinished(store: &JobStore, dispatcher: &dyn Dispatcher) -> Result<usize> {
    let mut recovered = 0;
    for job in store.list().await? {
        if job.is_terminal() {
            continue;
        }
        match dispatcher.enqueue(&job.id).await {
            Ok(()) => recovered += 1,
            Err(err) => warn!(job_id = %job.id, error = %err, "failed to recover job"),
        }
    }
    if recovered > 0 {
        info!(jobs = recovered, "recovered unfinished jobs");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use folio_common::{FolioError, JobStatus};

    use super::{
        Dispatcher, FallbackDispatcher, InProcessDispatcher, QueueDispatcher, fail_exhausted,
        recover_unfinished, start_queue_workers,
    };
    use crate::{
        backend::MemoryBackend,
        config::RunnerConfig,
        events::EventStreamManager,
        processor::{PageProcessor, RetryPolicy},
        queue::WorkQueue,
        registry::JobRegistry,
        runner::JobRunner,
        store::JobStore,
        testing::{ScriptedTranscriber, StaticSource, temp_dir},
    };

    fn runner(pages: u32) -> Arc<JobRunner> {
        let config = RunnerConfig {
            retry: RetryPolicy::new(1, Duration::ZERO),
            ..RunnerConfig::default()
        };
        Arc::new(JobRunner::new(
            JobStore::new(Arc::new(MemoryBackend::new())),
            Arc::new(StaticSource::with_pages(pages)),
            PageProcessor::new(Arc::new(ScriptedTranscriber::succeeding()), config.retry),
            EventStreamManager::new(),
            config,
        ))
    }

    async fn wait_for_status(store: &JobStore, job_id: &str, status: JobStatus) {
        for _ in 0..200 {
            if store.require(job_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    #[tokio::test]
    async fn in_process_dispatch_runs_job() {
        let runner = runner(3);
        let registry = JobRegistry::new();
        let dispatcher = InProcessDispatcher::new(runner.clone(), registry.clone());

        let job = runner.store().create("doc-1").await.unwrap();
        dispatcher.enqueue(&job.id).await.unwrap();
        assert!(matches!(
            dispatcher.enqueue(&job.id).await,
            Err(FolioError::Dispatch(_))
        ));

        wait_for_status(runner.store(), &job.id, JobStatus::Completed).await;
        assert_eq!(registry.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn queue_workers_run_and_ack_jobs() {
        let runner = runner(2);
        let registry = JobRegistry::new();
        let queue = Arc::new(WorkQueue::load_or_new(temp_dir("dispatch-queue"), 16, 0).await.unwrap());
        let workers = start_queue_workers(queue.clone(), runner.clone(), registry.clone(), 2);
        let dispatcher = QueueDispatcher::new(queue.clone());

        let first = runner.store().create("doc-1").await.unwrap();
        let second = runner.store().create("doc-2").await.unwrap();
        dispatcher.enqueue(&first.id).await.unwrap();
        dispatcher.enqueue(&second.id).await.unwrap();

        wait_for_status(runner.store(), &first.id, JobStatus::Completed).await;
        wait_for_status(runner.store(), &second.id, JobStatus::Completed).await;
        for _ in 0..100 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty().await);

        for worker in workers {
            worker.abort();
        }
    }

    #[tokio::test]
    async fn recovers_only_unfinished_jobs() {
        let runner = runner(1);
        let store = runner.store();
        let queued = store.create("doc-1").await.unwrap();
        let running = store.create("doc-2").await.unwrap();
        store.start(&running.id).await.unwrap();
        let done = store.create("doc-3").await.unwrap();
        store
            .finish(&done.id, JobStatus::Completed, "done")
            .await
            .unwrap();

        let queue = Arc::new(WorkQueue::load_or_new(temp_dir("dispatch-recover"), 16, 0).await.unwrap());
        let dispatcher = QueueDispatcher::new(queue.clone());

        assert_eq!(recover_unfinished(store, &dispatcher).await.unwrap(), 2);
        let mut ids = vec![
            queue.dequeue().await.unwrap().job_id,
            queue.dequeue().await.unwrap().job_id,
        ];
        ids.sort();
        let mut expected = vec![queued.id, running.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn full_queue_falls_back_to_in_process() {
        let runner = runner(1);
        let registry = JobRegistry::new();
        let queue = Arc::new(WorkQueue::load_or_new(temp_dir("dispatch-fallback"), 1, 0).await.unwrap());
        let dispatcher = FallbackDispatcher::new(
            Arc::new(QueueDispatcher::new(queue.clone())),
            Arc::new(InProcessDispatcher::new(runner.clone(), registry.clone())),
        );

        let queued = runner.store().create("doc-1").await.unwrap();
        let overflow = runner.store().create("doc-2").await.unwrap();
        dispatcher.enqueue(&queued.id).await.unwrap();
        dispatcher.enqueue(&overflow.id).await.unwrap();

        assert_eq!(queue.len().await, 1);
        wait_for_status(runner.store(), &overflow.id, JobStatus::Completed).await;
        assert_eq!(
            runner.store().require(&queued.id).await.unwrap().status,
            JobStatus::Queued
        );
        assert_eq!(registry.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn exhausted_entries_fail_their_jobs() {
        let runner = runner(1);
        let dir = temp_dir("dispatch-exhausted");
        let job = runner.store().create("doc-1").await.unwrap();
        runner.store().start(&job.id).await.unwrap();

        let queue = WorkQueue::load_or_new(&dir, 16, 1).await.unwrap();
        queue.enqueue(&job.id).await.unwrap();
        queue.dequeue().await.unwrap();
        drop(queue);

        let queue = WorkQueue::load_or_new(&dir, 16, 1).await.unwrap();
        assert!(queue.is_empty().await);
        assert_eq!(fail_exhausted(&queue, &runner).await, 1);

        let failed = runner.store().require(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.message.contains("delivered too many times"));
        assert_eq!(fail_exhausted(&queue, &runner).await, 0);
    }
}
