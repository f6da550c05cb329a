use std::time::Duration;

use folio_common::{FolioError, Result};

use crate::processor::RetryPolicy;

pub const DEFAULT_WINDOW_SIZE: u32 = 3;
pub const DEFAULT_PROGRESS_START: u8 = 10;
pub const DEFAULT_PROGRESS_END: u8 = 90;
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Pages processed concurrently; also the cap on in-flight transcriber
    /// calls for one job.
    pub window_size: u32,
    pub retry: RetryPolicy,
    /// Progress range the page windows are interpolated over.
    pub progress_start: u8,
    pub progress_end: u8,
    /// Per-read wait on the event stream before a keep-alive is emitted.
    pub stream_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            retry: RetryPolicy::default(),
            progress_start: DEFAULT_PROGRESS_START,
            progress_end: DEFAULT_PROGRESS_END,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(FolioError::InvalidArgument(
                "window size must be at least 1".to_string(),
            ));
        }
        if self.progress_start > self.progress_end || self.progress_end > 100 {
            return Err(FolioError::InvalidArgument(format!(
                "invalid progress range {}..{}",
                self.progress_start, self.progress_end
            )));
        }
        if self.stream_timeout.is_zero() {
            return Err(FolioError::InvalidArgument(
                "stream timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
