use std::{sync::Arc, time::Duration};

use folio_common::DocumentRef;
use tracing::{debug, warn};

use crate::transcriber::PageTranscriber;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1500);

/// Result of processing one page. Failure is data: it is stored and reported
/// but never aborts the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Transcribed(String),
    Failed(String),
}

impl PageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Transcribed(_))
    }

    /// Content persisted for the page; failures become an error marker.
    pub fn into_content(self) -> String {
        match self {
            Self::Transcribed(text) => text,
            Self::Failed(reason) => error_marker(&reason),
        }
    }
}

pub fn error_marker(reason: &str) -> String {
    format!("[Error: {reason}]")
}

/// Fixed attempt budget with linear backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY)
    }
}

#[derive(Clone)]
pub struct PageProcessor {
    transcriber: Arc<dyn PageTranscriber>,
    policy: RetryPolicy,
}

impl PageProcessor {
    pub fn new(transcriber: Arc<dyn PageTranscriber>, policy: RetryPolicy) -> Self {
        Self {
            transcriber,
            policy,
        }
    }

    pub async fn process(&self, document: &DocumentRef, page_number: u32) -> PageOutcome {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.transcriber.transcribe(document, page_number).await {
                Ok(text) => {
                    debug!(
                        document_id = %document.id,
                        page = page_number,
                        attempt,
                        chars = text.len(),
                        "page transcribed"
                    );
                    return PageOutcome::Transcribed(text);
                }
                Err(err) => {
                    warn!(
                        document_id = %document.id,
                        page = page_number,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "page transcription attempt failed"
                    );
                    last_error = err.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        PageOutcome::Failed(format!(
            "page {page_number} failed after {attempts} attempts: {last_error}"
        ))
    }
}
