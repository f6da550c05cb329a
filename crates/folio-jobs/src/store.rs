use std::sync::Arc;

use chrono::Utc;
use folio_common::{DocumentStatus, FolioError, Job, JobStatus, PageRecord, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::Persistence;

pub const INITIAL_PROGRESS: u8 = 5;

/// Job state machine over a [`Persistence`] backend. Terminal records are
/// never rewritten.
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn Persistence>,
    write_lock: Arc<Mutex<()>>,
}

impl JobStore {
    pub fn new(backend: Arc<dyn Persistence>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn create(&self, document_id: &str) -> Result<Job> {
        if document_id.trim().is_empty() {
            return Err(FolioError::InvalidArgument(
                "document id is required".to_string(),
            ));
        }

        let job = Job::new(document_id);
        self.backend.insert_job(&job).await?;
        debug!(job_id = %job.id, document_id, "job created");
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        self.backend.get_job(job_id).await
    }

    pub async fn require(&self, job_id: &str) -> Result<Job> {
        self.get(job_id)
            .await?
            .ok_or_else(|| FolioError::JobNotFound(job_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = self.backend.list_jobs().await?;
        jobs.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(jobs)
    }

    // A running job is resumed in place with its progress kept.
    pub async fn start(&self, job_id: &str) -> Result<Job> {
        let _guard = self.write_lock.lock().await;
        let mut job = self.require(job_id).await?;

        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                job.progress = INITIAL_PROGRESS;
                job.message = "Starting".to_string();
            }
            JobStatus::Running => {
                job.started_at.get_or_insert_with(Utc::now);
                job.progress = job.progress.max(INITIAL_PROGRESS);
                job.message = "Resuming".to_string();
            }
            JobStatus::Completed | JobStatus::Error => {
                return Err(FolioError::InvalidTransition {
                    job_id: job.id,
                    from: job.status,
                    to: JobStatus::Running,
                });
            }
        }

        self.backend.save_job(&job).await?;
        Ok(job)
    }

    // Updates to a terminal job are dropped.
    pub async fn update(&self, job_id: &str, progress: u8, message: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut job = self.require(job_id).await?;
        if job.is_terminal() {
            debug!(job_id, status = %job.status, "ignoring progress update for terminal job");
            return Ok(());
        }

        job.progress = progress.min(100);
        job.message = message.to_string();
        self.backend.save_job(&job).await
    }

    pub async fn finish(&self, job_id: &str, status: JobStatus, message: &str) -> Result<Job> {
        if !status.is_terminal() {
            return Err(FolioError::InvalidArgument(format!(
                "finish requires a terminal status, got {status}"
            )));
        }

        let _guard = self.write_lock.lock().await;
        let mut job = self.require(job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }

        job.status = status;
        job.message = message.to_string();
        job.finished_at = Some(Utc::now());
        job.progress = if status == JobStatus::Completed { 100 } else { 0 };
        self.backend.save_job(&job).await?;
        Ok(job)
    }

    pub async fn upsert_page(
        &self,
        document_id: &str,
        page_number: u32,
        content: &str,
        success: bool,
    ) -> Result<()> {
        self.backend
            .upsert_page(&PageRecord {
                document_id: document_id.to_string(),
                page_number,
                content: content.to_string(),
                success,
                updated_at: Utc::now(),
            })
            .await
    }

    pub async fn pages(&self, document_id: &str) -> Result<Vec<PageRecord>> {
        self.backend.list_pages(document_id).await
    }

    pub async fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        self.backend.set_document_status(document_id, status).await
    }

    pub async fn document_status(&self, document_id: &str) -> Result<Option<DocumentStatus>> {
        self.backend.document_status(document_id).await
    }
}
