use crate::config::QueuePaths;
use crate::lock::{LockError, QueueLock};
use crate::models::Submission;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A submission waiting for its turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    #[serde(flatten)]
    pub submission: Submission,
    /// Initialized to zero; nothing increments it yet.
    #[serde(default)]
    pub retries: u32,
}

impl QueueItem {
    pub fn new(submission: Submission) -> Self {
        Self {
            submission,
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedQueueItem {
    #[serde(flatten)]
    pub item: QueueItem,
    pub error: String,
}

/// File-backed FIFO of pending submissions plus a sink for failed ones.
/// Every mutation happens while holding the queue lock.
#[derive(Clone)]
pub struct WorkQueue {
    queue_file: PathBuf,
    failed_file: PathBuf,
    lock: Arc<dyn QueueLock>,
}

impl WorkQueue {
    pub fn new(paths: &QueuePaths, lock: Arc<dyn QueueLock>) -> Self {
        Self {
            queue_file: paths.queue_file.clone(),
            failed_file: paths.failed_file.clone(),
            lock,
        }
    }

    /// Appends a submission. Failures are logged and reported as `false`.
    pub fn enqueue(&self, submission: Submission) -> bool {
        match self.try_enqueue(submission) {
            Ok(size) => {
                info!(target = "research.queue", size, "added payload to queue");
                true
            }
            Err(err) => {
                error!(target = "research.queue", error = %err, "failed to add to queue");
                false
            }
        }
    }

    fn try_enqueue(&self, submission: Submission) -> Result<usize, QueueError> {
        let _guard = self.lock.acquire()?;
        let mut items: Vec<QueueItem> = read_json_list(&self.queue_file);
        items.push(QueueItem::new(submission));
        write_json_atomic(&self.queue_file, &items)?;
        Ok(items.len())
    }

    /// Lock-free read for status reporting; may be stale.
    pub fn peek_all(&self) -> Vec<QueueItem> {
        read_json_list(&self.queue_file)
    }

    pub fn len(&self) -> usize {
        self.peek_all().len()
    }

    /// Pops the oldest item. The file is removed once the queue is empty.
    pub fn dequeue_one(&self) -> Result<Option<QueueItem>, QueueError> {
        let _guard = self.lock.acquire()?;
        let mut items: Vec<QueueItem> = read_json_list(&self.queue_file);
        if items.is_empty() {
            return Ok(None);
        }
        let head = items.remove(0);
        if items.is_empty() {
            remove_if_present(&self.queue_file)?;
        } else {
            write_json_atomic(&self.queue_file, &items)?;
        }
        Ok(Some(head))
    }

    /// Stores an item whose run failed. Never re-queued automatically.
    pub fn record_failure(&self, item: QueueItem, error: &str) -> Result<(), QueueError> {
        let _guard = self.lock.acquire()?;
        let mut failed: Vec<FailedQueueItem> = read_json_list(&self.failed_file);
        failed.push(FailedQueueItem {
            item,
            error: error.to_string(),
        });
        write_json_atomic(&self.failed_file, &failed)?;
        Ok(())
    }

    pub fn failed_items(&self) -> Vec<FailedQueueItem> {
        read_json_list(&self.failed_file)
    }

    pub fn clear(&self) -> Result<(), QueueError> {
        let _guard = self.lock.acquire()?;
        remove_if_present(&self.queue_file)?;
        info!(target = "research.queue", "queue cleared");
        Ok(())
    }
}

/// Missing or unreadable files read as an empty list.
fn read_json_list<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(target = "research.queue", path = %path.display(), error = %err, "queue file unreadable");
            return Vec::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(items) => items,
        Err(err) => {
            warn!(target = "research.queue", path = %path.display(), error = %err, "corrupt queue file treated as empty");
            Vec::new()
        }
    }
}

/// Writes to a sibling temp file, then renames over the target.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
