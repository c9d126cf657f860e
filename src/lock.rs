use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock `{path}` within {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive ownership of the queue files.
///
/// `acquire` waits at most the implementation's deadline and returns
/// [`LockError::Timeout`] afterwards. The returned guard releases the lock
/// when dropped, so every exit path of the holder gives it back.
pub trait QueueLock: Send + Sync {
    fn acquire(&self) -> Result<LockGuard, LockError>;
}

/// Held lock. Dropping it runs the release hook.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Lock backed by a marker file: the file existing means the lock is held.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            retry_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(&self) -> std::io::Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let _ = file.write_all(std::process::id().to_string().as_bytes());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl QueueLock for FileLock {
    fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        loop {
            if self.try_create()? {
                debug!(target = "research.queue", path = %self.path.display(), "lock acquired");
                let path = self.path.clone();
                return Ok(LockGuard::new(move || {
                    if let Err(err) = fs::remove_file(&path)
                        && err.kind() != ErrorKind::NotFound
                    {
                        warn!(target = "research.queue", path = %path.display(), error = %err, "lock release failed");
                    }
                }));
            }
            if started.elapsed() >= self.timeout {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(self.retry_interval);
        }
    }
}
