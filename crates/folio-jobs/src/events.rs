use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use folio_common::Result;
use futures::{Stream, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const KEEP_ALIVE: &str = ": keep-alive\n\n";

/// How long events of a finished job wait for a first consumer.
pub const DEFAULT_EVENT_RETENTION: Duration = Duration::from_secs(60);

/// Serialized as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    Start {
        document_id: String,
        total_pages: u32,
    },
    Progress {
        page: u32,
        total: u32,
        progress: u8,
        message: String,
    },
    PageDone {
        page: u32,
        total: u32,
        success: bool,
        text: String,
    },
    Complete {
        total_pages: u32,
        successful: u32,
        failed: u32,
    },
    Error {
        message: String,
    },
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

pub fn format_sse(event: &JobEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

fn error_frame(message: &str) -> String {
    let event = JobEvent::Error {
        message: message.to_string(),
    };
    format_sse(&event).unwrap_or_else(|_| {
        "data: {\"type\":\"error\",\"data\":{\"message\":\"internal error\"}}\n\n".to_string()
    })
}

struct EventQueue {
    sender: mpsc::UnboundedSender<JobEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JobEvent>>>,
}

impl EventQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    fn is_unclaimed(&self) -> bool {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

type Streams = Arc<Mutex<HashMap<String, Arc<EventQueue>>>>;

fn lock(streams: &Streams) -> MutexGuard<'_, HashMap<String, Arc<EventQueue>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_queue(streams: &Streams, job_id: &str, queue: &Arc<EventQueue>) {
    let mut streams = lock(streams);
    if streams
        .get(job_id)
        .is_some_and(|current| Arc::ptr_eq(current, queue))
    {
        streams.remove(job_id);
        debug!(job_id, "event queue removed");
    }
}

/// Per-job event queues with a single consumer each.
///
/// A queue is removed when its consumer sees a terminal event or goes away.
/// A queue that finished without ever being claimed is kept for `retention`
/// so a late consumer can still read it.
#[derive(Clone)]
pub struct EventStreamManager {
    streams: Streams,
    retention: Duration,
}

impl Default for EventStreamManager {
    fn default() -> Self {
        Self::with_retention(DEFAULT_EVENT_RETENTION)
    }
}

impl EventStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            streams: Streams::default(),
            retention,
        }
    }

    fn queue(&self, job_id: &str) -> Arc<EventQueue> {
        let mut streams = lock(&self.streams);
        streams
            .entry(job_id.to_string())
            .or_insert_with(|| {
                debug!(job_id, "event queue created");
                Arc::new(EventQueue::new())
            })
            .clone()
    }

    pub fn publish(&self, job_id: &str, event: JobEvent) {
        let terminal = event.is_terminal();
        let queue = self.queue(job_id);
        if queue.sender.send(event).is_err() {
            warn!(job_id, "event queue closed, dropping event");
        }
        if terminal && queue.is_unclaimed() {
            self.evict_later(job_id, queue);
        }
    }

    fn evict_later(&self, job_id: &str, queue: Arc<EventQueue>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            remove_queue(&self.streams, job_id, &queue);
            return;
        };
        let streams = self.streams.clone();
        let retention = self.retention;
        let job_id = job_id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(retention).await;
            if queue.is_unclaimed() {
                remove_queue(&streams, &job_id, &queue);
            }
        });
    }

    pub fn has_stream(&self, job_id: &str) -> bool {
        lock(&self.streams).contains_key(job_id)
    }

    /// SSE frames for a job, with a keep-alive after each idle `timeout`.
    /// Ends after a terminal event.
    pub fn stream(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> impl Stream<Item = String> + Send + 'static {
        let queue = self.queue(job_id);
        let receiver = queue
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let state = match receiver {
            Some(receiver) => StreamState::Active(Subscription {
                job_id: job_id.to_string(),
                queue,
                receiver,
                streams: self.streams.clone(),
            }),
            None => {
                warn!(job_id, "rejecting second consumer for event stream");
                StreamState::Failed("event stream already has a consumer")
            }
        };

        stream::unfold(state, move |state| async move {
            match state {
                StreamState::Active(mut subscription) => {
                    match tokio::time::timeout(timeout, subscription.receiver.recv()).await {
                        Err(_) => Some((KEEP_ALIVE.to_string(), StreamState::Active(subscription))),
                        Ok(None) => Some((error_frame("event stream closed"), StreamState::Done)),
                        Ok(Some(event)) => match format_sse(&event) {
                            Ok(frame) if event.is_terminal() => Some((frame, StreamState::Done)),
                            Ok(frame) => Some((frame, StreamState::Active(subscription))),
                            Err(err) => {
                                warn!(job_id = %subscription.job_id, error = %err, "failed to encode event");
                                Some((error_frame(&err.to_string()), StreamState::Done))
                            }
                        },
                    }
                }
                StreamState::Failed(message) => Some((error_frame(message), StreamState::Done)),
                StreamState::Done => None,
            }
        })
    }
}

enum StreamState {
    Active(Subscription),
    Failed(&'static str),
    Done,
}

struct Subscription {
    job_id: String,
    queue: Arc<EventQueue>,
    receiver: mpsc::UnboundedReceiver<JobEvent>,
    streams: Streams,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        remove_queue(&self.streams, &self.job_id, &self.queue);
    }
}
