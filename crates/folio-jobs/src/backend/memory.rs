use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use folio_common::{DocumentStatus, FolioError, Job, PageRecord, Result};
use tokio::sync::RwLock;

use super::Persistence;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    jobs: RwLock<HashMap<String, Job>>,
    pages: RwLock<HashMap<String, BTreeMap<u32, PageRecord>>>,
    documents: RwLock<HashMap<String, DocumentStatus>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryBackend {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(FolioError::Persistence(format!(
                "job already exists: {}",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(&job.id) else {
            return Err(FolioError::JobNotFound(job.id.clone()));
        };
        *stored = job.clone();
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn upsert_page(&self, page: &PageRecord) -> Result<()> {
        self.pages
            .write()
            .await
            .entry(page.document_id.clone())
            .or_default()
            .insert(page.page_number, page.clone());
        Ok(())
    }

    async fn list_pages(&self, document_id: &str) -> Result<Vec<PageRecord>> {
        Ok(self
            .pages
            .read()
            .await
            .get(document_id)
            .map(|pages| pages.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        self.documents
            .write()
            .await
            .insert(document_id.to_string(), status);
        Ok(())
    }

    async fn document_status(&self, document_id: &str) -> Result<Option<DocumentStatus>> {
        Ok(self.documents.read().await.get(document_id).copied())
    }
}
