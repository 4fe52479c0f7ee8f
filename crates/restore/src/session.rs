//! One restore run: pages in, storage mutations out.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use pit_restore_core::{
    needs_retrieval_status, resolve, resolve_cleanup, CleanupSet, Disposition, Entry, MergeEngine,
    MergeError, MergeEvent, PageToken, RestoreTarget, RetrievalStatus, SelectedState,
    VersionEntry,
};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RestoreConfig;
use crate::executor::{Task, TaskOp, TaskOutcome, TaskPool, TaskReport};
use crate::report::Reporter;
use crate::store::{CopyRequest, ObjectStore, RetrievalError, StoreError};

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no versions matching criteria")]
    NoMatchingVersions,
    #[error(transparent)]
    Merge(MergeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot create destination directory {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<MergeError> for RestoreError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::NoMatchingVersions => Self::NoMatchingVersions,
            other => Self::Merge(other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedObject {
    pub key: String,
    pub version_id: String,
    pub error: String,
}

/// Counts for the end-of-run summary.
///
/// In dry-run mode the restore and removal counts are what would have been
/// done.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub restored: usize,
    pub removed: usize,
    /// Keys whose state at the window end is "deleted".
    pub deleted_at_window: usize,
    pub pending_retrieval: usize,
    pub retained: usize,
    pub skipped: usize,
    pub failed: Vec<FailedObject>,
    pub cancelled: usize,
    pub interrupted: bool,
    pub dry_run: bool,
}

/// State of one run, owned by the coordinating task.
pub struct RestoreSession {
    config: RestoreConfig,
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
    pool: TaskPool,
    engine: MergeEngine,
    cleanup: CleanupSet,
    reporter: Reporter,
    summary: RunSummary,
}

impl RestoreSession {
    pub fn new(
        config: RestoreConfig,
        store: Arc<dyn ObjectStore>,
        cancel: CancellationToken,
    ) -> Self {
        let pool = TaskPool::new(Arc::clone(&store), config.max_workers, cancel.clone());
        let engine = MergeEngine::new(config.window);
        let reporter = Reporter::new(config.verbose);
        let summary = RunSummary {
            dry_run: config.dry_run,
            ..Default::default()
        };
        Self {
            config,
            store,
            cancel,
            pool,
            engine,
            cleanup: CleanupSet::new(),
            reporter,
            summary,
        }
    }

    pub async fn run(mut self) -> Result<RunSummary, RestoreError> {
        if let RestoreTarget::Local { root } = &self.config.target {
            if !self.config.dry_run {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(|source| RestoreError::Destination {
                        path: root.clone(),
                        source,
                    })?;
            }
        }

        info!(
            bucket = %self.config.source_bucket,
            prefix = %self.config.prefix,
            start = ?self.config.window.start,
            end = %self.config.window.end,
            dry_run = self.config.dry_run,
            "starting restore"
        );

        let mut token: Option<PageToken> = None;
        loop {
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                page = self.store.list_versions_page(
                    &self.config.source_bucket,
                    &self.config.prefix,
                    token.as_ref(),
                ) => page?,
            };
            let next = page.next.clone();

            for event in self.engine.process_page(page)? {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.handle_event(event).await;
            }
            self.collect().await;

            match next {
                Some(t) if !self.cancel.is_cancelled() => token = Some(t),
                _ => break,
            }
        }
        debug!(
            pages = self.engine.pages(),
            carried = self.engine.carried_markers(),
            "listing finished"
        );

        if self.config.is_in_place() && !self.cancel.is_cancelled() {
            self.cleanup_pass().await;
            self.collect().await;
        }

        self.summary.interrupted = self.cancel.is_cancelled();
        if self.summary.interrupted {
            self.finish().await;
        }
        Ok(self.summary)
    }

    async fn handle_event(&mut self, event: MergeEvent) {
        match event {
            MergeEvent::TooRecent(version) => {
                if self.config.is_in_place() {
                    self.cleanup.mark(version);
                }
            }
            MergeEvent::Selected(selected) => {
                let retrieval = match &selected.entry {
                    Entry::Version(v) if needs_retrieval_status(v, self.config.retrieval_enabled) => {
                        Some(self.retrieval_status(v).await)
                    }
                    _ => None,
                };
                let disposition = resolve(
                    &selected,
                    &self.config.target,
                    self.config.retrieval_enabled,
                    retrieval,
                );
                self.dispatch(selected, disposition).await;
            }
        }
    }

    async fn retrieval_status(&self, version: &VersionEntry) -> RetrievalStatus {
        match self
            .store
            .retrieval_status(&self.config.source_bucket, &version.key, &version.version_id)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(key = %version.key, error = %e, "retrieval status lookup failed");
                RetrievalStatus::NotRequested
            }
        }
    }

    /// The only place a disposition turns into an effect.
    async fn dispatch(&mut self, selected: SelectedState, disposition: Disposition) {
        let version = match selected.entry {
            Entry::Version(v) => v,
            Entry::DeleteMarker(marker) => {
                debug!(key = %marker.key, version_id = %marker.version_id, "deleted at window end");
                self.summary.deleted_at_window += 1;
                return;
            }
        };
        if disposition.restores() {
            self.cleanup.unmark(&version.key);
        }
        let note = disposition.annotation();

        match disposition {
            // Delete markers returned above.
            Disposition::Deleted => {}
            Disposition::NeedsRetrieval | Disposition::RetrievalInProgress => {
                self.reporter.object(&version, note.as_deref());
                self.summary.pending_retrieval += 1;
            }
            Disposition::RequestRetrieval { days } => {
                self.reporter.object(&version, note.as_deref());
                self.summary.pending_retrieval += 1;
                if !self.config.dry_run {
                    self.request_retrieval(&version, days).await;
                }
            }
            Disposition::Retained { until } => {
                info!(key = %version.key, %until, "cleanup skipped, object is retained");
                self.reporter.object(&version, note.as_deref());
                self.summary.retained += 1;
            }
            Disposition::Skipped { reason } => {
                warn!(key = %version.key, %reason, "object skipped");
                self.reporter.object(&version, note.as_deref());
                self.summary.skipped += 1;
            }
            Disposition::MakeDirectory { path } => {
                if !self.config.dry_run {
                    if let Err(e) = tokio::fs::create_dir_all(&path).await {
                        self.record_failure(&version, &StoreError::from(e));
                        return;
                    }
                }
                self.reporter.object(&version, None);
                self.summary.restored += 1;
            }
            Disposition::Download { path } => {
                let op = TaskOp::Download {
                    bucket: self.config.source_bucket.clone(),
                    key: version.key.clone(),
                    version_id: version.version_id.clone(),
                    path,
                    last_modified: version.last_modified,
                };
                self.submit(op, version);
            }
            Disposition::Copy { bucket, key } => {
                let op = TaskOp::Copy(CopyRequest {
                    source_bucket: self.config.source_bucket.clone(),
                    source_key: version.key.clone(),
                    source_version_id: version.version_id.clone(),
                    dest_bucket: bucket,
                    dest_key: key,
                    size: version.size,
                    sse: self.config.sse,
                });
                self.submit(op, version);
            }
            Disposition::DeleteAtDestination { bucket, key } => {
                self.submit(TaskOp::Delete { bucket, key }, version);
            }
        }
    }

    async fn request_retrieval(&mut self, version: &VersionEntry, days: i32) {
        let res = self
            .store
            .request_retrieval(
                &self.config.source_bucket,
                &version.key,
                &version.version_id,
                days,
            )
            .await;
        match res {
            Ok(()) => debug!(key = %version.key, days, "retrieval requested"),
            Err(RetrievalError::AlreadyInProgress) => {
                debug!(key = %version.key, "retrieval already in progress")
            }
            Err(RetrievalError::Store(e)) => self.record_failure(version, &e),
        }
    }

    fn submit(&mut self, op: TaskOp, entry: VersionEntry) {
        if self.config.dry_run {
            self.reporter.object(&entry, None);
            self.count_done(&op);
            return;
        }
        if let Err(task) = self.pool.submit(Task { op, entry }) {
            debug!(key = %task.entry.key, "not submitted, shutting down");
            self.summary.cancelled += 1;
        }
    }

    /// Waits for the pool and reports every outcome.
    ///
    /// Returns early on interrupt, leaving running tasks to [`Self::finish`].
    async fn collect(&mut self) {
        let drained = self.pool.drain().await;
        self.record(drained.reports);
    }

    /// Lets tasks that were running at the interrupt complete.
    async fn finish(&mut self) {
        let reports = self.pool.finish_running().await;
        debug!(finished = reports.len(), "pool shut down");
        self.record(reports);
    }

    fn record(&mut self, reports: Vec<TaskReport>) {
        for report in reports {
            let entry = &report.task.entry;
            match &report.outcome {
                TaskOutcome::Done => {
                    self.reporter.object(entry, None);
                    self.count_done(&report.task.op);
                }
                TaskOutcome::Failed(e) => self.record_failure(entry, e),
                TaskOutcome::Cancelled => self.summary.cancelled += 1,
            }
        }
    }

    async fn cleanup_pass(&mut self) {
        let candidates: Vec<VersionEntry> = self.cleanup.drain().collect();
        debug!(candidates = candidates.len(), "cleanup pass");
        let now = Utc::now();

        for version in candidates {
            if self.cancel.is_cancelled() {
                break;
            }
            let retain_until = match self
                .store
                .retention(&self.config.source_bucket, &version.key, &version.version_id)
                .await
            {
                Ok(until) => until,
                Err(e) => {
                    debug!(key = %version.key, error = %e, "no retention information");
                    None
                }
            };
            let disposition =
                resolve_cleanup(&version, &self.config.source_bucket, retain_until, now);
            let selected = SelectedState {
                key: version.key.clone(),
                entry: Entry::Version(version),
            };
            self.dispatch(selected, disposition).await;
        }
    }

    fn count_done(&mut self, op: &TaskOp) {
        match op {
            TaskOp::Delete { .. } => self.summary.removed += 1,
            TaskOp::Download { .. } | TaskOp::Copy(_) => self.summary.restored += 1,
        }
    }

    fn record_failure(&mut self, entry: &VersionEntry, err: &StoreError) {
        debug!(
            key = %entry.key,
            version_id = %entry.version_id,
            size = entry.size,
            storage_class = %entry.storage_class,
            error = %err,
            "object failed"
        );
        self.reporter.failure(entry, err);
        self.summary.failed.push(FailedObject {
            key: entry.key.clone(),
            version_id: entry.version_id.clone(),
            error: err.to_string(),
        });
    }
}
