//! Run controller and queue drainer.
//!
//! At most one batch runs per [`Orchestrator`]. A submission that arrives
//! while a batch is running is parked in the [`WorkQueue`] and picked up by
//! the drain that follows the run.

use crate::models::{RunEnvelope, Submission};
use crate::pipeline::Pipeline;
use crate::queue::{FailedQueueItem, QueueError, QueueItem, WorkQueue};
use crate::sheets::SheetWriter;
use crate::snapshot::SnapshotStore;
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::task::JoinError;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Pipeline,
    queue: WorkQueue,
    snapshots: Arc<dyn SnapshotStore>,
    sheets: Arc<dyn SheetWriter>,
    running: AtomicBool,
    draining: AtomicBool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RunnerStatus {
    pub running: bool,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    /// Another drain (or a run that drains afterwards) already owns the queue.
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Idle runner; a background run was started.
    Started,
    /// A run is in progress; the submission waits in the queue.
    Queued { queue_length: usize },
    /// The queue lock could not be taken in time.
    QueueBusy,
}

/// Another run or drain holds the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerBusy;

struct DrainPass {
    report: DrainReport,
    /// The pass stopped on an empty queue rather than a dequeue failure.
    emptied: bool,
}

/// Clears its flag on drop, panics included.
struct FlagGuard {
    inner: Arc<Inner>,
    flag: fn(&Inner) -> &AtomicBool,
}

impl FlagGuard {
    fn claim(inner: &Arc<Inner>, flag: fn(&Inner) -> &AtomicBool) -> Option<Self> {
        flag(inner)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                inner: inner.clone(),
                flag,
            })
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        (self.flag)(&self.inner).store(false, Ordering::Release);
    }
}

fn running_flag(inner: &Inner) -> &AtomicBool {
    &inner.running
}

fn draining_flag(inner: &Inner) -> &AtomicBool {
    &inner.draining
}

impl Orchestrator {
    pub fn new(
        pipeline: Pipeline,
        queue: WorkQueue,
        snapshots: Arc<dyn SnapshotStore>,
        sheets: Arc<dyn SheetWriter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                queue,
                snapshots,
                sheets,
                running: AtomicBool::new(false),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> RunnerStatus {
        let queue_length = self.with_queue(|queue| queue.len()).await.unwrap_or(0);
        RunnerStatus {
            running: self.is_running(),
            queue_length,
        }
    }

    /// Pending items as last written to disk. May be stale.
    pub async fn pending(&self) -> Vec<QueueItem> {
        self.with_queue(|queue| queue.peek_all())
            .await
            .unwrap_or_default()
    }

    pub async fn failed(&self) -> Vec<FailedQueueItem> {
        self.with_queue(|queue| queue.failed_items())
            .await
            .unwrap_or_default()
    }

    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        match self.with_queue(|queue| queue.clear()).await {
            Ok(result) => result,
            Err(err) => Err(QueueError::Io(std::io::Error::other(err.to_string()))),
        }
    }

    /// Starts a background run when idle, otherwise parks the submission.
    /// Deciding and claiming the running flag is one atomic step.
    pub async fn submit(&self, submission: Submission) -> SubmitOutcome {
        if let Some(guard) = FlagGuard::claim(&self.inner, running_flag) {
            let this = self.clone();
            tokio::spawn(async move {
                let envelope = this.run_claimed(guard, submission, false).await;
                info!(
                    target = "research.runner",
                    success = envelope.success,
                    "background run finished"
                );
            });
            return SubmitOutcome::Started;
        }

        let enqueued = self
            .with_queue(move |queue| queue.enqueue(submission).then(|| queue.len()))
            .await
            .ok()
            .flatten();
        let Some(queue_length) = enqueued else {
            return SubmitOutcome::QueueBusy;
        };
        info!(target = "research.runner", queue_length, "runner busy; submission queued");

        // The run may have finished between the claim attempt and the enqueue.
        if !self.is_running() {
            let this = self.clone();
            tokio::spawn(async move {
                this.drain().await;
            });
        }
        SubmitOutcome::Queued { queue_length }
    }

    /// Runs one batch to completion. Runs not started by the drainer drain
    /// the queue afterwards, whether or not they succeeded. An occupied
    /// runner is reported as [`RunnerBusy`] and nothing runs.
    pub async fn run(
        &self,
        submission: Submission,
        from_queue: bool,
    ) -> Result<RunEnvelope, RunnerBusy> {
        let Some(guard) = FlagGuard::claim(&self.inner, running_flag) else {
            warn!(target = "research.runner", "run requested while another run is active");
            return Err(RunnerBusy);
        };
        Ok(self.run_claimed(guard, submission, from_queue).await)
    }

    async fn run_claimed(
        &self,
        guard: FlagGuard,
        submission: Submission,
        from_queue: bool,
    ) -> RunEnvelope {
        let envelope = self.execute(submission).await;
        drop(guard);
        if !from_queue {
            self.drain().await;
        }
        envelope
    }

    /// Batch, snapshot, spreadsheet. The caller owns the running flag.
    async fn execute(&self, submission: Submission) -> RunEnvelope {
        let run_id = Uuid::new_v4();
        self.execute_inner(submission)
            .instrument(info_span!("run", %run_id))
            .await
            .with_run_id(run_id)
    }

    async fn execute_inner(&self, submission: Submission) -> RunEnvelope {
        info!(
            target = "research.runner",
            products = submission.product_count(),
            "run started"
        );
        let pipeline = self.inner.pipeline.clone();
        let batch = tokio::spawn(
            async move { pipeline.process_submission(&submission).await }.in_current_span(),
        )
        .await;

        let tree = match batch {
            Ok(Ok(tree)) => tree,
            Ok(Err(err)) => {
                error!(target = "research.runner", error = %err, "run failed");
                return RunEnvelope::failed(err.to_string());
            }
            Err(err) => {
                error!(target = "research.runner", error = %err, "run aborted");
                return RunEnvelope::failed(join_failure(&err));
            }
        };

        let with_errors = tree
            .product_runs()
            .filter(|(_, product)| !product.result.errors.is_empty())
            .count();
        info!(
            target = "research.runner",
            products = tree.product_runs().count(),
            with_errors,
            "batch finished"
        );

        if let Err(err) = self.inner.snapshots.save(&tree) {
            error!(target = "research.runner", error = %err, "snapshot write failed");
            return RunEnvelope::failed(err.to_string());
        }

        match self.inner.sheets.write_results(&tree).await {
            Ok(rows) => info!(target = "research.runner", rows, "results written to spreadsheet"),
            Err(err) => warn!(target = "research.runner", error = %err, "spreadsheet write failed"),
        }

        info!(target = "research.runner", "run completed");
        RunEnvelope::completed(tree)
    }

    /// Processes queued submissions one at a time until the queue is empty.
    ///
    /// A submission parked while this drain still held the flags gets no
    /// drain of its own, so the queue is checked again after release.
    pub async fn drain(&self) -> DrainReport {
        let Some(mut pass) = self.drain_pass().await else {
            return DrainReport::skipped();
        };
        let mut report = DrainReport::default();
        loop {
            report.processed += pass.report.processed;
            report.failed += pass.report.failed;
            if !pass.emptied || !self.has_pending().await {
                break;
            }
            info!(target = "research.runner", "submissions arrived during drain; draining again");
            match self.drain_pass().await {
                Some(next) => pass = next,
                // Whoever holds the flags now checks the queue on release.
                None => break,
            }
        }

        info!(
            target = "research.runner",
            processed = report.processed,
            failed = report.failed,
            "queue drained"
        );
        crate::metrics::queue_drained(report.processed, report.failed);
        report
    }

    /// One pass under both flags. `None` when another drain or a run owns them.
    async fn drain_pass(&self) -> Option<DrainPass> {
        let Some(_draining) = FlagGuard::claim(&self.inner, draining_flag) else {
            info!(target = "research.runner", "drain already in progress");
            return None;
        };
        let Some(_running) = FlagGuard::claim(&self.inner, running_flag) else {
            info!(target = "research.runner", "run in progress; it drains on completion");
            return None;
        };

        let mut report = DrainReport::default();
        let emptied = loop {
            let item = match self.with_queue(|queue| queue.dequeue_one()).await {
                Ok(Ok(Some(item))) => item,
                Ok(Ok(None)) => break true,
                Ok(Err(err)) => {
                    error!(target = "research.runner", error = %err, "dequeue failed; ending drain cycle");
                    break false;
                }
                Err(err) => {
                    error!(target = "research.runner", error = %err, "dequeue worker failed");
                    break false;
                }
            };

            info!(target = "research.runner", "processing queued submission");
            let envelope = self.execute(item.submission.clone()).await;
            if envelope.success {
                report.processed += 1;
            } else {
                report.failed += 1;
                let reason = envelope.error.unwrap_or_else(|| envelope.message.clone());
                self.record_failure(item, reason).await;
            }
        };
        Some(DrainPass { report, emptied })
    }

    async fn has_pending(&self) -> bool {
        self.with_queue(|queue| !queue.peek_all().is_empty())
            .await
            .unwrap_or(false)
    }

    async fn record_failure(&self, item: QueueItem, reason: String) {
        match self
            .with_queue(move |queue| queue.record_failure(item, &reason))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(target = "research.runner", error = %err, "could not record failed submission")
            }
            Err(err) => {
                error!(target = "research.runner", error = %err, "failure recorder crashed")
            }
        }
    }

    /// Queue calls can sleep on the lock file, so they run on the blocking pool.
    async fn with_queue<T, F>(&self, f: F) -> Result<T, JoinError>
    where
        F: FnOnce(&WorkQueue) -> T + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.inner.queue.clone();
        tokio::task::spawn_blocking(move || f(&queue)).await
    }
}

fn join_failure(err: &JoinError) -> String {
    if err.is_panic() {
        "run panicked".to_string()
    } else {
        format!("run cancelled: {err}")
    }
}
