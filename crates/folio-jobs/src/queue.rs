use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use folio_common::{FolioError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_DELIVERY_LIMIT: u32 = 5;

const QUEUE_FILE: &str = "work-queue.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    /// Number of times the entry has been handed to a worker.
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            deliveries: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// At-least-once work queue persisted as a JSON file. An entry stays
/// persisted from `enqueue` until `ack`.
#[derive(Debug)]
pub struct WorkQueue {
    sender: mpsc::Sender<QueueEntry>,
    receiver: Mutex<mpsc::Receiver<QueueEntry>>,
    unacked: RwLock<VecDeque<QueueEntry>>,
    exhausted: Mutex<Vec<String>>,
    persistence_path: PathBuf,
}

impl WorkQueue {
    pub async fn load_or_new(
        persistence_dir: impl AsRef<Path>,
        capacity: usize,
        delivery_limit: u32,
    ) -> Result<Self> {
        let capacity = if capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            capacity
        };
        let delivery_limit = if delivery_limit == 0 {
            DEFAULT_DELIVERY_LIMIT
        } else {
            delivery_limit
        };

        let persistence_path = persistence_dir.as_ref().join(QUEUE_FILE);
        let persisted = match tokio::fs::read(&persistence_path).await {
            Ok(bytes) => serde_json::from_slice::<VecDeque<QueueEntry>>(&bytes).map_err(|err| {
                FolioError::Persistence(format!(
                    "failed to parse work queue {}: {err}",
                    persistence_path.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(err) => return Err(FolioError::Io(err)),
        };

        let (sender, receiver) = mpsc::channel(capacity);
        let mut unacked = VecDeque::new();
        let mut exhausted = Vec::new();
        for entry in persisted {
            if entry.deliveries >= delivery_limit {
                warn!(
                    job_id = %entry.job_id,
                    deliveries = entry.deliveries,
                    "dropping work queue entry after too many deliveries"
                );
                exhausted.push(entry.job_id);
                continue;
            }
            if sender.try_send(entry.clone()).is_err() {
                warn!(job_id = %entry.job_id, "work queue full while reloading, dropping entry");
                exhausted.push(entry.job_id);
                continue;
            }
            unacked.push_back(entry);
        }

        if !unacked.is_empty() {
            info!(entries = unacked.len(), "redelivering unacknowledged work queue entries");
        }

        let queue = Self {
            sender,
            receiver: Mutex::new(receiver),
            unacked: RwLock::new(unacked),
            exhausted: Mutex::new(exhausted),
            persistence_path,
        };
        queue.persist().await?;
        Ok(queue)
    }

    /// Appends a job and persists the queue before returning.
    pub async fn enqueue(&self, job_id: &str) -> Result<()> {
        let entry = QueueEntry::new(job_id);
        let mut unacked = self.unacked.write().await;
        unacked.push_back(entry.clone());

        if let Err(err) = self.sender.try_send(entry) {
            let _ = unacked.pop_back();
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "work queue is full",
                mpsc::error::TrySendError::Closed(_) => "work queue is closed",
            };
            return Err(FolioError::Dispatch(format!("{reason}; job {job_id} not queued")));
        }

        if let Err(err) = self.write_snapshot(&unacked).await {
            // The entry is already in the channel and will still run; it is
            // only lost if the process stops before the next successful write.
            warn!(job_id, error = %err, "failed to persist work queue");
        }
        debug!(job_id, "job queued");
        Ok(())
    }

    /// Waits for the next entry. The entry stays unacknowledged until
    /// [`WorkQueue::ack`] is called.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        let mut receiver = self.receiver.lock().await;
        let mut entry = receiver.recv().await?;
        drop(receiver);

        let mut unacked = self.unacked.write().await;
        if let Some(stored) = unacked.iter_mut().find(|stored| stored.job_id == entry.job_id) {
            stored.deliveries = stored.deliveries.saturating_add(1);
            entry.deliveries = stored.deliveries;
        }
        if let Err(err) = self.write_snapshot(&unacked).await {
            warn!(job_id = %entry.job_id, error = %err, "failed to persist work queue");
        }
        Some(entry)
    }

    pub async fn ack(&self, job_id: &str) -> Result<()> {
        let mut unacked = self.unacked.write().await;
        let Some(index) = unacked.iter().position(|entry| entry.job_id == job_id) else {
            return Ok(());
        };
        let _ = unacked.remove(index);
        self.write_snapshot(&unacked).await
    }

    /// Jobs whose entries were dropped while loading. Drains the list.
    pub async fn take_exhausted(&self) -> Vec<String> {
        std::mem::take(&mut *self.exhausted.lock().await)
    }

    /// Entries enqueued but not yet acknowledged.
    pub async fn len(&self) -> usize {
        self.unacked.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.unacked.read().await.is_empty()
    }

    pub async fn persist(&self) -> Result<()> {
        let unacked = self.unacked.read().await;
        self.write_snapshot(&unacked).await
    }

    async fn write_snapshot(&self, entries: &VecDeque<QueueEntry>) -> Result<()> {
        let payload = serde_json::to_vec(entries).map_err(|err| {
            FolioError::Persistence(format!("failed to serialize work queue: {err}"))
        })?;

        if let Some(parent) = self.persistence_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.persistence_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, payload).await?;
        tokio::fs::rename(&tmp_path, &self.persistence_path).await?;
        Ok(())
    }
}
