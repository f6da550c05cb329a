pub mod file;
pub mod memory;

use async_trait::async_trait;
use folio_common::{DocumentStatus, Job, PageRecord, Result};

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Durable storage for job records, page results and document status.
///
/// Implementations only store what they are given; state-machine rules live
/// in [`crate::store::JobStore`].
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Inserts or overwrites the result for `(document_id, page_number)`.
    async fn upsert_page(&self, page: &PageRecord) -> Result<()>;

    /// Returns stored pages ordered by page number.
    async fn list_pages(&self, document_id: &str) -> Result<Vec<PageRecord>>;

    async fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> Result<()>;

    async fn document_status(&self, document_id: &str) -> Result<Option<DocumentStatus>>;
}
