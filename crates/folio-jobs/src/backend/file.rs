use std::path::{Path, PathBuf};

use async_trait::async_trait;
use folio_common::{DocumentStatus, FolioError, Job, PageRecord, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::fs;

use super::Persistence;

const JOBS_DIR: &str = "jobs";
const PAGES_DIR: &str = "pages";
const DOCUMENTS_DIR: &str = "documents";

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    status: DocumentStatus,
}

/// JSON-file persistence rooted at a data directory.
///
/// Layout: `jobs/<job_id>.json`, `pages/<document_id>/<page>.json` and
/// `documents/<document_id>.json`. Every write goes through a temporary file
/// and a rename so readers never observe a partial record.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [JOBS_DIR, PAGES_DIR, DOCUMENTS_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    fn job_path(&self, job_id: &str) -> Result<PathBuf> {
        validate_component(job_id)?;
        Ok(self.root.join(JOBS_DIR).join(format!("{job_id}.json")))
    }

    fn pages_dir(&self, document_id: &str) -> Result<PathBuf> {
        validate_component(document_id)?;
        Ok(self.root.join(PAGES_DIR).join(document_id))
    }

    fn document_path(&self, document_id: &str) -> Result<PathBuf> {
        validate_component(document_id)?;
        Ok(self
            .root
            .join(DOCUMENTS_DIR)
            .join(format!("{document_id}.json")))
    }
}

#[async_trait]
impl Persistence for FileBackend {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let path = self.job_path(&job.id)?;
        if fs::try_exists(&path).await? {
            return Err(FolioError::Persistence(format!(
                "job already exists: {}",
                job.id
            )));
        }
        write_json(&path, job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        read_json(&self.job_path(job_id)?).await
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let path = self.job_path(&job.id)?;
        if !fs::try_exists(&path).await? {
            return Err(FolioError::JobNotFound(job.id.clone()));
        }
        write_json(&path, job).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(self.root.join(JOBS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(job) = read_json::<Job>(&path).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn upsert_page(&self, page: &PageRecord) -> Result<()> {
        let dir = self.pages_dir(&page.document_id)?;
        fs::create_dir_all(&dir).await?;
        write_json(&dir.join(format!("{:06}.json", page.page_number)), page).await
    }

    async fn list_pages(&self, document_id: &str) -> Result<Vec<PageRecord>> {
        let dir = self.pages_dir(document_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(FolioError::Io(err)),
        };

        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(page) = read_json::<PageRecord>(&path).await? {
                pages.push(page);
            }
        }
        pages.sort_by_key(|page| page.page_number);
        Ok(pages)
    }

    async fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        write_json(
            &self.document_path(document_id)?,
            &DocumentRecord { status },
        )
        .await
    }

    async fn document_status(&self, document_id: &str) -> Result<Option<DocumentStatus>> {
        Ok(read_json::<DocumentRecord>(&self.document_path(document_id)?)
            .await?
            .map(|record| record.status))
    }
}

fn validate_component(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(FolioError::InvalidArgument(format!(
            "invalid storage identifier: {id:?}"
        )))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            FolioError::Persistence(format!("failed to parse {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FolioError::Io(err)),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| {
        FolioError::Persistence(format!("failed to serialize {}: {err}", path.display()))
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, bytes).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
