use std::path::PathBuf;

use async_trait::async_trait;
use folio_common::{DocumentRef, FolioError, Result};
use tokio::fs;

/// Supplies documents and their pages to the runner.
#[async_trait]
pub trait DocumentPageSource: Send + Sync {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>>;

    async fn get_page_count(&self, document: &DocumentRef) -> Result<u32>;

    /// Path of a 1-indexed page, if it exists.
    async fn page_path(&self, document: &DocumentRef, page_number: u32) -> Result<Option<PathBuf>>;
}

/// Documents laid out as directories: `<root>/<document_id>/` holds one file
/// per page and pages are ordered by file name.
#[derive(Debug, Clone)]
pub struct FsPageSource {
    root: PathBuf,
}

impl FsPageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn page_files(&self, document: &DocumentRef) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&document.path).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.metadata().await?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl DocumentPageSource for FsPageSource {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>> {
        if document_id.is_empty() || document_id.contains(['/', '\\']) || document_id.starts_with('.')
        {
            return Err(FolioError::InvalidArgument(format!(
                "invalid document id: {document_id:?}"
            )));
        }

        let path = self.root.join(document_id);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => Ok(Some(DocumentRef {
                id: document_id.to_string(),
                path,
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FolioError::Io(err)),
        }
    }

    async fn get_page_count(&self, document: &DocumentRef) -> Result<u32> {
        let count = self.page_files(document).await?.len();
        u32::try_from(count).map_err(|_| {
            FolioError::InvalidArgument(format!("document {} has too many pages", document.id))
        })
    }

    async fn page_path(&self, document: &DocumentRef, page_number: u32) -> Result<Option<PathBuf>> {
        let Some(index) = page_number.checked_sub(1) else {
            return Ok(None);
        };
        Ok(self.page_files(document).await?.into_iter().nth(index as usize))
    }
}
