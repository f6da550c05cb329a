use std::collections::BTreeMap;

use async_trait::async_trait;
use folio_common::Result;
use futures::future::join_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: u32,
    pub start: u32,
    pub end: u32,
}

impl Window {
    pub fn pages(&self) -> std::ops::RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Splits `1..=total` into windows of at most `size` pages.
pub fn partition(total: u32, size: u32) -> Vec<Window> {
    let size = size.max(1);
    let mut windows = Vec::with_capacity(total.div_ceil(size) as usize);
    let mut start = 1;
    let mut index = 0;
    while start <= total {
        let end = start.saturating_add(size - 1).min(total);
        windows.push(Window { index, start, end });
        index += 1;
        start = end + 1;
    }
    windows
}

/// Progress for the window starting at page `start`, interpolated between
/// `range_start` and `range_end`.
pub fn window_progress(start: u32, total: u32, range_start: u8, range_end: u8) -> u8 {
    if total == 0 {
        return range_start;
    }
    let span = u64::from(range_end.saturating_sub(range_start));
    let done = u64::from(start.min(total));
    let offset = done * span / u64::from(total);
    range_start.saturating_add(offset as u8)
}

/// Per-job callbacks driven by [`BatchScheduler`].
#[async_trait]
pub trait WindowHandler: Send + Sync {
    type Output: Send;

    async fn on_window(&self, window: Window, total: u32) -> Result<()>;

    async fn process_page(&self, page_number: u32, total: u32) -> Result<Self::Output>;
}

/// Runs pages in windows of `window_size`, with a barrier between windows.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    window_size: u32,
}

impl BatchScheduler {
    pub fn new(window_size: u32) -> Self {
        Self {
            window_size: window_size.max(1),
        }
    }

    // A handler error stops scheduling once the current window has finished.
    pub async fn run<H>(&self, total: u32, handler: &H) -> Result<BTreeMap<u32, H::Output>>
    where
        H: WindowHandler,
    {
        let mut outputs = BTreeMap::new();

        for window in partition(total, self.window_size) {
            handler.on_window(window, total).await?;

            let results = join_all(window.pages().map(|page| async move {
                (page, handler.process_page(page, total).await)
            }))
            .await;

            let mut first_error = None;
            for (page, result) in results {
                match result {
                    Ok(output) => {
                        outputs.insert(page, output);
                    }
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        Ok(outputs)
    }
}
