//! Bounded pool of storage mutations.
//!
//! Tasks are spawned into a `JoinSet` as soon as they are submitted and wait
//! on a semaphore permit before touching the store, so at most `workers`
//! operations run at once. Cancellation stops unstarted tasks; tasks already
//! holding a permit stay in the set until [`TaskPool::finish_running`]
//! joins them.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use pit_restore_core::VersionEntry;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{CopyRequest, ObjectStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOp {
    /// Fetch a version into a local file and stamp it with `last_modified`.
    Download {
        bucket: String,
        key: String,
        version_id: String,
        path: PathBuf,
        last_modified: DateTime<Utc>,
    },
    Copy(CopyRequest),
    /// Hide a key behind a new delete marker.
    Delete { bucket: String, key: String },
}

/// One unit of work plus the version it concerns, kept for reporting.
#[derive(Debug, Clone)]
pub struct Task {
    pub op: TaskOp,
    pub entry: VersionEntry,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Done,
    Failed(StoreError),
    /// Never started because the pool was cancelled first.
    Cancelled,
}

#[derive(Debug)]
pub struct TaskReport {
    pub task: Task,
    pub outcome: TaskOutcome,
}

/// Result of waiting on the pool.
#[derive(Debug, Default)]
pub struct Drained {
    pub reports: Vec<TaskReport>,
    /// Tasks still running when the pool shut down.
    pub running: usize,
}

pub struct TaskPool {
    store: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<TaskReport>,
}

impl TaskPool {
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize, cancel: CancellationToken) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            cancel,
            tasks: JoinSet::new(),
        }
    }

    /// Queues a task. Hands it back if the pool has been cancelled.
    pub fn submit(&mut self, task: Task) -> Result<(), Task> {
        if self.cancel.is_cancelled() {
            return Err(task);
        }
        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                p = permits.acquire_owned() => p.ok(),
            };
            let Some(_permit) = permit else {
                return TaskReport {
                    task,
                    outcome: TaskOutcome::Cancelled,
                };
            };
            let outcome = match execute(store.as_ref(), &task.op).await {
                Ok(()) => TaskOutcome::Done,
                Err(e) => TaskOutcome::Failed(e),
            };
            TaskReport { task, outcome }
        });
        Ok(())
    }

    /// Tasks submitted and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every submitted task, or until cancellation.
    pub async fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let rest = self.shutdown();
                    drained.reports.extend(rest.reports);
                    drained.running = rest.running;
                    return drained;
                }
                next = self.tasks.join_next() => match next {
                    None => return drained,
                    Some(Ok(report)) => drained.reports.push(report),
                    Some(Err(e)) => warn!("task did not complete: {e}"),
                },
            }
        }
    }

    /// Cancels the pool without waiting on running tasks.
    ///
    /// Collects whatever already finished. The rest stay in the pool.
    pub fn shutdown(&mut self) -> Drained {
        self.cancel.cancel();
        self.permits.close();

        let mut drained = Drained::default();
        while let Some(res) = self.tasks.try_join_next() {
            match res {
                Ok(report) => drained.reports.push(report),
                Err(e) => warn!("task did not complete: {e}"),
            }
        }
        drained.running = self.tasks.len();
        if drained.running > 0 {
            debug!(running = drained.running, "waiting for running tasks");
        }
        drained
    }

    /// Cancels unstarted tasks and waits for the running ones to finish.
    pub async fn finish_running(&mut self) -> Vec<TaskReport> {
        self.cancel.cancel();
        self.permits.close();

        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(report) => reports.push(report),
                Err(e) => warn!("task did not complete: {e}"),
            }
        }
        reports
    }
}

async fn execute(store: &dyn ObjectStore, op: &TaskOp) -> Result<(), StoreError> {
    match op {
        TaskOp::Download {
            bucket,
            key,
            version_id,
            path,
            last_modified,
        } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            store.download(bucket, key, version_id, path).await?;
            let mtime = FileTime::from_unix_time(
                last_modified.timestamp(),
                last_modified.timestamp_subsec_nanos(),
            );
            filetime::set_file_times(path, mtime, mtime)?;
            Ok(())
        }
        TaskOp::Copy(req) => store.copy_object(req).await,
        TaskOp::Delete { bucket, key } => store.delete_object(bucket, key, None).await,
    }
}
