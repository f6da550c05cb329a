use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use folio_common::{DocumentRef, FolioError, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::DocumentPageSource;

/// Failure of a single transcription attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscribeError {
    /// The call itself failed (transport error, bad status, bad payload).
    #[error("transcriber call failed: {0}")]
    Failed(String),
    /// The call succeeded but the transcriber reported that it could not
    /// handle the page.
    #[error("transcriber rejected page: {0}")]
    Rejected(String),
}

/// Converts one page of a document into text.
#[async_trait]
pub trait PageTranscriber: Send + Sync {
    async fn transcribe(
        &self,
        document: &DocumentRef,
        page_number: u32,
    ) -> std::result::Result<String, TranscribeError>;
}

/// Returns true for text a transcriber emits in place of a result.
pub fn is_soft_failure(text: &str) -> bool {
    let text = text.trim_start();
    text.is_empty() || text.starts_with("[Error") || text.starts_with("Error:")
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    document_id: &'a str,
    page_number: u32,
    page_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

/// Transcriber backed by an HTTP service.
///
/// Built once at startup and shared as `Arc<dyn PageTranscriber>`; the
/// underlying client keeps its connection pool for the process lifetime.
pub struct HttpTranscriber {
    endpoint: String,
    client: reqwest::Client,
    source: Arc<dyn DocumentPageSource>,
}

impl HttpTranscriber {
    pub fn new(
        endpoint: String,
        timeout: Duration,
        source: Arc<dyn DocumentPageSource>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                FolioError::InternalError(format!("failed to create transcriber client: {err}"))
            })?;

        Ok(Self {
            endpoint,
            client,
            source,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PageTranscriber for HttpTranscriber {
    async fn transcribe(
        &self,
        document: &DocumentRef,
        page_number: u32,
    ) -> std::result::Result<String, TranscribeError> {
        let page_path = self
            .source
            .page_path(document, page_number)
            .await
            .map_err(|err| TranscribeError::Failed(err.to_string()))?
            .map(|path| path.display().to_string());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TranscribeRequest {
                document_id: &document.id,
                page_number,
                page_path,
            })
            .send()
            .await
            .map_err(|err| {
                TranscribeError::Failed(format!("request to {} failed: {err}", self.endpoint))
            })?;

        if !response.status().is_success() {
            return Err(TranscribeError::Failed(format!(
                "transcriber {} returned status {}",
                self.endpoint,
                response.status()
            )));
        }

        let body: TranscribeResponse = response.json().await.map_err(|err| {
            TranscribeError::Failed(format!("invalid transcriber response: {err}"))
        })?;

        if body.text.trim().is_empty() {
            return Err(TranscribeError::Rejected(
                "transcriber returned empty response".to_string(),
            ));
        }
        if is_soft_failure(&body.text) {
            return Err(TranscribeError::Rejected(body.text));
        }

        Ok(body.text)
    }
}
