//! Per-key decision: what to do with a selected entry.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Entry, RetrievalStatus, SelectedState, VersionEntry};

/// Days a retrieved archival object stays readable.
pub const RETRIEVAL_DAYS: i32 = 3;

/// Where restored objects go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreTarget {
    /// Download into a local directory tree.
    Local {
        /// Directory keys are joined under.
        root: PathBuf,
    },
    /// Server-side copy into a bucket, optionally under a key prefix.
    Bucket {
        /// Destination bucket.
        bucket: String,
        /// Prepended to every key.
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl RestoreTarget {
    /// Restoring over the source itself: same bucket, no prefix remap.
    pub fn is_in_place(&self, source_bucket: &str) -> bool {
        match self {
            Self::Bucket { bucket, prefix } => {
                bucket == source_bucket && prefix.as_deref().map_or(true, str::is_empty)
            }
            Self::Local { .. } => false,
        }
    }

    /// Destination key for a source key.
    pub fn destination_key(&self, key: &str) -> String {
        match self {
            Self::Bucket {
                prefix: Some(prefix),
                ..
            } if !prefix.is_empty() => {
                if prefix.ends_with('/') {
                    format!("{prefix}{key}")
                } else {
                    format!("{prefix}/{key}")
                }
            }
            _ => key.to_string(),
        }
    }

    /// Local path for a key, `None` if the key would escape the root.
    pub fn local_path(&self, key: &str) -> Option<PathBuf> {
        let Self::Local { root } = self else {
            return None;
        };
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(root.join(rel))
    }
}

/// Outcome of resolving one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Disposition {
    /// A delete marker is the state at the window; nothing to restore.
    Deleted,
    /// Archival tier and retrieval is not enabled.
    NeedsRetrieval,
    /// Archival tier, no retrieval requested yet.
    RequestRetrieval {
        /// How long the retrieved copy stays readable.
        days: i32,
    },
    /// Archival tier, retrieval still running.
    RetrievalInProgress,
    /// Server-side copy of the selected version.
    Copy {
        /// Destination bucket.
        bucket: String,
        /// Destination key.
        key: String,
    },
    /// Download of the selected version.
    Download {
        /// Local file written.
        path: PathBuf,
    },
    /// Keys ending in `/` become directories locally.
    MakeDirectory {
        /// Directory created.
        path: PathBuf,
    },
    /// Cleanup of a key that did not exist at the window end.
    DeleteAtDestination {
        /// Bucket holding the key.
        bucket: String,
        /// Key hidden behind a new delete marker.
        key: String,
    },
    /// Cleanup target is under retention.
    Retained {
        /// End of the retention period.
        until: DateTime<Utc>,
    },
    /// Left alone, with the reason printed.
    Skipped {
        /// Why.
        reason: String,
    },
}

impl Disposition {
    /// Status annotation printed next to the object.
    pub fn annotation(&self) -> Option<String> {
        match self {
            Self::NeedsRetrieval => Some("needs restore".into()),
            Self::RequestRetrieval { .. } => Some("requesting".into()),
            Self::RetrievalInProgress => Some("in-progress".into()),
            Self::Retained { until } => Some(format!("retained until {}", until.to_rfc3339())),
            Self::Skipped { reason } => Some(format!("skipped: {reason}")),
            _ => None,
        }
    }

    /// True for actions handed to the task pool.
    pub fn is_task(&self) -> bool {
        matches!(
            self,
            Self::Copy { .. } | Self::Download { .. } | Self::DeleteAtDestination { .. }
        )
    }

    /// True when the key ends up present at the destination.
    pub fn restores(&self) -> bool {
        matches!(
            self,
            Self::Copy { .. } | Self::Download { .. } | Self::MakeDirectory { .. }
        )
    }
}

/// Whether `resolve` needs the retrieval status of `version`.
pub fn needs_retrieval_status(version: &VersionEntry, retrieval_enabled: bool) -> bool {
    retrieval_enabled && version.storage_class.requires_retrieval()
}

/// Decides the disposition of a selected key.
///
/// `retrieval` is the archival retrieval state, looked up by the caller when
/// [`needs_retrieval_status`] says so; `None` counts as not requested.
pub fn resolve(
    selected: &SelectedState,
    target: &RestoreTarget,
    retrieval_enabled: bool,
    retrieval: Option<RetrievalStatus>,
) -> Disposition {
    let version = match &selected.entry {
        Entry::DeleteMarker(_) => return Disposition::Deleted,
        Entry::Version(v) => v,
    };

    if version.storage_class.requires_retrieval() {
        if !retrieval_enabled {
            return Disposition::NeedsRetrieval;
        }
        match retrieval.unwrap_or(RetrievalStatus::NotRequested) {
            RetrievalStatus::NotRequested => {
                return Disposition::RequestRetrieval {
                    days: RETRIEVAL_DAYS,
                }
            }
            RetrievalStatus::InProgress => return Disposition::RetrievalInProgress,
            RetrievalStatus::Complete => {}
        }
    }

    match target {
        RestoreTarget::Bucket { bucket, .. } => Disposition::Copy {
            bucket: bucket.clone(),
            key: target.destination_key(&version.key),
        },
        RestoreTarget::Local { .. } => match target.local_path(&version.key) {
            Some(path) if version.key.ends_with('/') => Disposition::MakeDirectory { path },
            Some(path) => Disposition::Download { path },
            None => Disposition::Skipped {
                reason: "key escapes destination directory".into(),
            },
        },
    }
}

/// Decides what the cleanup pass does with a too-recent version.
pub fn resolve_cleanup(
    version: &VersionEntry,
    dest_bucket: &str,
    retain_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Disposition {
    match retain_until {
        Some(until) if until > now => Disposition::Retained { until },
        _ => Disposition::DeleteAtDestination {
            bucket: dest_bucket.to_string(),
            key: version.key.clone(),
        },
    }
}
