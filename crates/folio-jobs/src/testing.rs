use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use folio_common::{DocumentRef, FolioError, Result};
use uuid::Uuid;

use crate::{
    source::DocumentPageSource,
    transcriber::{PageTranscriber, TranscribeError},
};

pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("folio-{prefix}-{}", Uuid::new_v4()))
}

/// Page source with a fixed page count for every document except the
/// missing ones.
pub struct StaticSource {
    pages: Option<u32>,
    count_fails: bool,
}

impl StaticSource {
    pub fn with_pages(pages: u32) -> Self {
        Self {
            pages: Some(pages),
            count_fails: false,
        }
    }

    pub fn missing() -> Self {
        Self {
            pages: None,
            count_fails: false,
        }
    }

    pub fn failing_count() -> Self {
        Self {
            pages: Some(0),
            count_fails: true,
        }
    }
}

#[async_trait]
impl DocumentPageSource for StaticSource {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>> {
        Ok(self.pages.map(|_| DocumentRef {
            id: document_id.to_string(),
            path: PathBuf::from("/documents").join(document_id),
        }))
    }

    async fn get_page_count(&self, _document: &DocumentRef) -> Result<u32> {
        if self.count_fails {
            return Err(FolioError::InternalError("page count unavailable".to_string()));
        }
        Ok(self.pages.unwrap_or_default())
    }

    async fn page_path(&self, document: &DocumentRef, page_number: u32) -> Result<Option<PathBuf>> {
        Ok(Some(document.path.join(format!("page-{page_number}.png"))))
    }
}

type Script = Box<dyn Fn(u32, u32) -> std::result::Result<String, TranscribeError> + Send + Sync>;

/// Transcriber driven by a `(page, attempt) -> result` script that also
/// records call counts and peak concurrency.
pub struct ScriptedTranscriber {
    script: Script,
    delay: Duration,
    attempts: Mutex<HashMap<u32, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(
        script: impl Fn(u32, u32) -> std::result::Result<String, TranscribeError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::from_millis(5),
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|page, _| Ok(format!("text for page {page}")))
    }

    pub fn failing() -> Self {
        Self::new(|_, _| Err(TranscribeError::Failed("vision model offline".to_string())))
    }

    pub fn attempts(&self, page: u32) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&page)
            .copied()
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageTranscriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        _document: &DocumentRef,
        page_number: u32,
    ) -> std::result::Result<String, TranscribeError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(page_number).or_default();
            *counter += 1;
            *counter
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.script)(page_number, attempt)
    }
}
