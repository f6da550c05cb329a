pub mod backend;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod transcriber;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{FileBackend, MemoryBackend, Persistence};
pub use config::RunnerConfig;
pub use dispatch::{
    Dispatcher, FallbackDispatcher, InProcessDispatcher, QueueDispatcher, fail_exhausted,
    recover_unfinished, start_queue_workers,
};
pub use events::{EventStreamManager, JobEvent};
pub use processor::{PageOutcome, PageProcessor, RetryPolicy};
pub use queue::{QueueEntry, WorkQueue};
pub use registry::JobRegistry;
pub use runner::JobRunner;
pub use scheduler::{BatchScheduler, Window, WindowHandler};
pub use source::{DocumentPageSource, FsPageSource};
pub use store::JobStore;
pub use transcriber::{HttpTranscriber, PageTranscriber, TranscribeError};
