use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;
use folio_common::{DocumentRef, DocumentStatus, FolioError, JobStatus, Result};
use tracing::{debug, error, info, warn};

use crate::{
    config::RunnerConfig,
    events::{EventStreamManager, JobEvent},
    processor::PageProcessor,
    scheduler::{BatchScheduler, Window, WindowHandler, window_progress},
    source::DocumentPageSource,
    store::JobStore,
};

/// Drives one job from `queued` to a terminal status. [`JobRunner::run`] is
/// safe to call again for a job that was interrupted mid-run.
#[derive(Clone)]
pub struct JobRunner {
    store: JobStore,
    source: Arc<dyn DocumentPageSource>,
    processor: PageProcessor,
    events: EventStreamManager,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(
        store: JobStore,
        source: Arc<dyn DocumentPageSource>,
        processor: PageProcessor,
        events: EventStreamManager,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            source,
            processor,
            events,
            config,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn events(&self) -> &EventStreamManager {
        &self.events
    }

    pub async fn run(&self, job_id: &str) {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "job not found, nothing to run");
                return;
            }
            Err(err) => {
                self.fail(job_id, None, err).await;
                return;
            }
        };

        if job.is_terminal() {
            debug!(job_id, status = %job.status, "job already finished, skipping");
            return;
        }

        info!(job_id, document_id = %job.document_id, "job started");
        if let Err(err) = self.execute(job_id, &job.document_id).await {
            self.fail(job_id, Some(&job.document_id), err).await;
        }
    }

    /// Ends a job that will never be run as ERROR with `reason`.
    pub async fn abandon(&self, job_id: &str, reason: &str) {
        match self.store.get(job_id).await {
            Ok(Some(job)) if !job.is_terminal() => {
                let err = FolioError::Dispatch(reason.to_string());
                self.fail(job_id, Some(&job.document_id), err).await;
            }
            Ok(_) => debug!(job_id, "nothing to abandon"),
            Err(err) => self.fail(job_id, None, err).await,
        }
    }

    async fn execute(&self, job_id: &str, document_id: &str) -> Result<()> {
        let document = self
            .source
            .get_document(document_id)
            .await?
            .ok_or_else(|| FolioError::DocumentNotFound(document_id.to_string()))?;

        let started = self.store.start(job_id).await?;
        self.store
            .set_document_status(document_id, DocumentStatus::Processing)
            .await?;

        let total = match self.source.get_page_count(&document).await {
            Ok(0) => {
                return Err(FolioError::Precondition(
                    "Document has no pages".to_string(),
                ));
            }
            Ok(count) => count,
            Err(err) => {
                warn!(job_id, document_id, error = %err, "page count unavailable, assuming 1");
                1
            }
        };

        self.events.publish(
            job_id,
            JobEvent::Start {
                document_id: document_id.to_string(),
                total_pages: total,
            },
        );

        let handler = PageJob {
            runner: self,
            job_id,
            document: &document,
            last_progress: AtomicU8::new(started.progress),
        };
        let outcomes = BatchScheduler::new(self.config.window_size)
            .run(total, &handler)
            .await?;

        let successful = outcomes.values().filter(|success| **success).count() as u32;
        let failed = total - successful;

        self.store
            .set_document_status(document_id, DocumentStatus::Beautified)
            .await?;
        self.store
            .finish(job_id, JobStatus::Completed, "Beautification complete")
            .await?;
        self.events.publish(
            job_id,
            JobEvent::Complete {
                total_pages: total,
                successful,
                failed,
            },
        );

        info!(job_id, document_id, total, successful, failed, "job completed");
        Ok(())
    }

    async fn fail(&self, job_id: &str, document_id: Option<&str>, err: FolioError) {
        let message = match &err {
            FolioError::DocumentNotFound(_) => "Document not found".to_string(),
            other => other.to_string(),
        };
        error!(job_id, document_id, error = %err, "job failed");

        if let Some(document_id) = document_id {
            if !matches!(err, FolioError::DocumentNotFound(_)) {
                if let Err(status_err) = self
                    .store
                    .set_document_status(document_id, DocumentStatus::Error)
                    .await
                {
                    warn!(job_id, document_id, error = %status_err, "failed to mark document as errored");
                }
            }
        }

        if let Err(finish_err) = self.store.finish(job_id, JobStatus::Error, &message).await {
            error!(job_id, error = %finish_err, "failed to record job error");
        }

        self.events.publish(job_id, JobEvent::Error { message });
    }
}

/// Window callbacks for a single run.
struct PageJob<'a> {
    runner: &'a JobRunner,
    job_id: &'a str,
    document: &'a DocumentRef,
    last_progress: AtomicU8,
}

#[async_trait]
impl WindowHandler for PageJob<'_> {
    type Output = bool;

    async fn on_window(&self, window: Window, total: u32) -> Result<()> {
        let config = &self.runner.config;
        let computed = window_progress(
            window.start,
            total,
            config.progress_start,
            config.progress_end,
        );
        let progress = self
            .last_progress
            .fetch_max(computed, Ordering::SeqCst)
            .max(computed);

        let message = if window.len() == 1 {
            format!("Processing page {} of {total}...", window.start)
        } else {
            format!(
                "Processing pages {}-{} of {total}...",
                window.start, window.end
            )
        };

        self.runner
            .store
            .update(self.job_id, progress, &message)
            .await?;
        self.runner.events.publish(
            self.job_id,
            JobEvent::Progress {
                page: window.start,
                total,
                progress,
                message,
            },
        );
        Ok(())
    }

    async fn process_page(&self, page_number: u32, total: u32) -> Result<bool> {
        let outcome = self
            .runner
            .processor
            .process(self.document, page_number)
            .await;
        let success = outcome.is_success();
        let content = outcome.into_content();

        self.runner
            .store
            .upsert_page(&self.document.id, page_number, &content, success)
            .await?;
        self.runner.events.publish(
            self.job_id,
            JobEvent::PageDone {
                page: page_number,
                total,
                success,
                text: content,
            },
        );
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use folio_common::{DocumentStatus, FolioError, Job, JobStatus, PageRecord, Result};
    use futures::StreamExt;
    use serde_json::Value;

    use super::JobRunner;
    use crate::{
        backend::{MemoryBackend, Persistence},
        config::RunnerConfig,
        events::{EventStreamManager, KEEP_ALIVE},
        processor::{PageProcessor, RetryPolicy},
        source::DocumentPageSource,
        store::JobStore,
        testing::{ScriptedTranscriber, StaticSource},
        transcriber::PageTranscriber,
    };

    fn runner_with(
        backend: Arc<dyn Persistence>,
        source: impl DocumentPageSource + 'static,
        transcriber: Arc<dyn PageTranscriber>,
        window_size: u32,
    ) -> JobRunner {
        let config = RunnerConfig {
            window_size,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..RunnerConfig::default()
        };
        JobRunner::new(
            JobStore::new(backend),
            Arc::new(source),
            PageProcessor::new(transcriber, config.retry),
            EventStreamManager::new(),
            config,
        )
    }

    fn runner(
        source: impl DocumentPageSource + 'static,
        transcriber: Arc<dyn PageTranscriber>,
        window_size: u32,
    ) -> JobRunner {
        runner_with(Arc::new(MemoryBackend::new()), source, transcriber, window_size)
    }

    /// Runs a fresh job to completion and returns it with its event payloads.
    async fn run_job(runner: &JobRunner, document_id: &str) -> (Job, Vec<Value>) {
        let job = runner.store().create(document_id).await.unwrap();
        runner.run(&job.id).await;

        let frames: Vec<String> = runner
            .events()
            .stream(&job.id, Duration::from_millis(50))
            .collect()
            .await;
        let events = frames
            .iter()
            .filter(|frame| frame.as_str() != KEEP_ALIVE)
            .map(|frame| serde_json::from_str(&frame["data: ".len()..]).unwrap())
            .collect();
        (runner.store().require(&job.id).await.unwrap(), events)
    }

    fn of_type<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
        events.iter().filter(|event| event["type"] == kind).collect()
    }

    #[tokio::test]
    async fn processes_pages_in_windows() {
        let transcriber = Arc::new(ScriptedTranscriber::succeeding());
        let runner = runner(StaticSource::with_pages(5), transcriber.clone(), 2);

        let (job, events) = run_job(&runner, "doc-1").await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.message, "Beautification complete");
        assert!(transcriber.max_in_flight() <= 2);

        assert_eq!(events.first().unwrap()["type"], "start");
        assert_eq!(events.first().unwrap()["data"]["total_pages"], 5);
        let progress = of_type(&events, "progress");
        let pages: Vec<_> = progress.iter().map(|e| e["data"]["page"].clone()).collect();
        assert_eq!(pages, vec![1, 3, 5]);
        assert_eq!(of_type(&events, "page_done").len(), 5);

        let last = events.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["data"]["successful"], 5);
        assert_eq!(last["data"]["failed"], 0);

        let stored = runner.store().pages("doc-1").await.unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[2].content, "text for page 3");
        assert_eq!(
            runner.store().document_status("doc-1").await.unwrap(),
            Some(DocumentStatus::Beautified)
        );
    }

    #[tokio::test]
    async fn emits_one_progress_event_per_window() {
        for (pages, window, expected) in [(7, 3, 3), (3, 3, 1), (1, 4, 1), (8, 1, 8)] {
            let runner = runner(
                StaticSource::with_pages(pages),
                Arc::new(ScriptedTranscriber::succeeding()),
                window,
            );
            let (_, events) = run_job(&runner, "doc-1").await;

            let progress = of_type(&events, "progress");
            assert_eq!(progress.len(), expected, "{pages} pages, window {window}");

            let values: Vec<u64> = progress
                .iter()
                .map(|e| e["data"]["progress"].as_u64().unwrap())
                .collect();
            assert!(values.windows(2).all(|pair| pair[0] <= pair[1]));
            assert!(values.iter().all(|value| (5..=90).contains(value)));
        }
    }

    #[tokio::test]
    async fn failed_page_is_stored_as_marker() {
        let transcriber = Arc::new(ScriptedTranscriber::failing());
        let runner = runner(StaticSource::with_pages(1), transcriber.clone(), 3);

        let (job, events) = run_job(&runner, "doc-1").await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(transcriber.attempts(1), 3);

        let done = of_type(&events, "page_done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["data"]["success"], false);

        let last = events.last().unwrap();
        assert_eq!(last["data"]["successful"], 0);
        assert_eq!(last["data"]["failed"], 1);

        let stored = runner.store().pages("doc-1").await.unwrap();
        assert!(stored[0].content.starts_with("[Error: "));
        assert!(!stored[0].success);
    }

    #[tokio::test]
    async fn missing_document_fails_job() {
        let transcriber = Arc::new(ScriptedTranscriber::succeeding());
        let runner = runner(StaticSource::missing(), transcriber.clone(), 3);

        let (job, events) = run_job(&runner, "gone").await;

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.progress, 0);
        assert_eq!(job.message, "Document not found");
        assert!(of_type(&events, "page_done").is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(transcriber.attempts(1), 0);
        assert_eq!(runner.store().document_status("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn document_without_pages_fails_job() {
        let runner = runner(
            StaticSource::with_pages(0),
            Arc::new(ScriptedTranscriber::succeeding()),
            3,
        );

        let (job, events) = run_job(&runner, "doc-1").await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.contains("Document has no pages"));
        assert_eq!(events.last().unwrap()["type"], "error");
        assert_eq!(
            runner.store().document_status("doc-1").await.unwrap(),
            Some(DocumentStatus::Error)
        );
    }

    #[tokio::test]
    async fn unknown_page_count_defaults_to_one() {
        let transcriber = Arc::new(ScriptedTranscriber::succeeding());
        let runner = runner(StaticSource::failing_count(), transcriber.clone(), 3);

        let (job, events) = run_job(&runner, "doc-1").await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(transcriber.attempts(1), 1);
        assert_eq!(events.last().unwrap()["data"]["total_pages"], 1);
    }

    #[tokio::test]
    async fn finished_jobs_are_not_rerun() {
        let transcriber = Arc::new(ScriptedTranscriber::succeeding());
        let runner = runner(StaticSource::with_pages(2), transcriber.clone(), 2);

        let (job, _) = run_job(&runner, "doc-1").await;
        runner.run(&job.id).await;

        assert_eq!(transcriber.attempts(1), 1);
        assert!(!runner.events().has_stream(&job.id));
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        PageWrites,
        JobReads,
    }

    struct Faulty(MemoryBackend, Fault);

    #[async_trait]
    impl Persistence for Faulty {
        async fn insert_job(&self, job: &Job) -> Result<()> {
            self.0.insert_job(job).await
        }

        async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
            if self.1 == Fault::JobReads {
                return Err(FolioError::Persistence("store unreadable".to_string()));
            }
            self.0.get_job(job_id).await
        }

        async fn save_job(&self, job: &Job) -> Result<()> {
            self.0.save_job(job).await
        }

        async fn list_jobs(&self) -> Result<Vec<Job>> {
            self.0.list_jobs().await
        }

        async fn upsert_page(&self, page: &PageRecord) -> Result<()> {
            if self.1 == Fault::PageWrites {
                return Err(FolioError::Persistence("disk full".to_string()));
            }
            self.0.upsert_page(page).await
        }

        async fn list_pages(&self, document_id: &str) -> Result<Vec<PageRecord>> {
            self.0.list_pages(document_id).await
        }

        async fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
            self.0.set_document_status(document_id, status).await
        }

        async fn document_status(&self, document_id: &str) -> Result<Option<DocumentStatus>> {
            self.0.document_status(document_id).await
        }
    }

    #[tokio::test]
    async fn persistence_failure_fails_job() {
        let runner = runner_with(
            Arc::new(Faulty(MemoryBackend::new(), Fault::PageWrites)),
            StaticSource::with_pages(4),
            Arc::new(ScriptedTranscriber::succeeding()),
            2,
        );

        let (job, events) = run_job(&runner, "doc-1").await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.contains("disk full"));
        assert!(of_type(&events, "page_done").is_empty());
        assert_eq!(of_type(&events, "progress").len(), 1);
        assert_eq!(events.last().unwrap()["type"], "error");
    }

    #[tokio::test]
    async fn unreadable_job_still_reports_error() {
        let runner = runner_with(
            Arc::new(Faulty(MemoryBackend::new(), Fault::JobReads)),
            StaticSource::with_pages(1),
            Arc::new(ScriptedTranscriber::succeeding()),
            1,
        );
        let job = runner.store().create("doc-1").await.unwrap();
        runner.run(&job.id).await;

        let frames: Vec<String> = runner
            .events()
            .stream(&job.id, Duration::from_millis(50))
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        let event: Value = serde_json::from_str(&frames[0]["data: ".len()..]).unwrap();
        assert_eq!(event["type"], "error");
        assert!(
            event["data"]["message"]
                .as_str()
                .unwrap()
                .contains("store unreadable")
        );
    }

    #[tokio::test]
    async fn abandoned_job_ends_as_error() {
        let transcriber = Arc::new(ScriptedTranscriber::succeeding());
        let runner = runner(StaticSource::with_pages(2), transcriber.clone(), 2);
        let job = runner.store().create("doc-1").await.unwrap();

        runner.abandon(&job.id, "work queue is full").await;

        let stored = runner.store().require(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.message.contains("work queue is full"));
        assert_eq!(transcriber.attempts(1), 0);

        let frames: Vec<String> = runner
            .events()
            .stream(&job.id, Duration::from_millis(50))
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"type\":\"error\""));

        runner.abandon(&job.id, "again").await;
        let unchanged = runner.store().require(&job.id).await.unwrap();
        assert!(unchanged.message.contains("work queue is full"));
    }

    #[tokio::test]
    async fn unwatched_jobs_release_event_queues() {
        let config = RunnerConfig {
            retry: RetryPolicy::new(1, Duration::ZERO),
            ..RunnerConfig::default()
        };
        let runner = JobRunner::new(
            JobStore::new(Arc::new(MemoryBackend::new())),
            Arc::new(StaticSource::with_pages(2)),
            PageProcessor::new(Arc::new(ScriptedTranscriber::succeeding()), config.retry),
            EventStreamManager::with_retention(Duration::from_millis(10)),
            config,
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = runner.store().create("doc-1").await.unwrap();
            runner.run(&job.id).await;
            ids.push(job.id);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ids.iter().all(|id| !runner.events().has_stream(id)));
    }
}
