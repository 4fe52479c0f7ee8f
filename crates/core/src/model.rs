//! History entries as listed by the storage service, and per-run state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage tier reported for an object version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StorageClass {
    /// `STANDARD`, also assumed when the listing omits the class.
    #[default]
    Standard,
    /// `REDUCED_REDUNDANCY`.
    ReducedRedundancy,
    /// `STANDARD_IA`.
    StandardIa,
    /// `ONEZONE_IA`.
    OnezoneIa,
    /// `INTELLIGENT_TIERING`.
    IntelligentTiering,
    /// `GLACIER`, needs retrieval.
    Glacier,
    /// `DEEP_ARCHIVE`, needs retrieval.
    DeepArchive,
    /// `GLACIER_IR`, readable without retrieval.
    GlacierIr,
    /// `OUTPOSTS`.
    Outposts,
    /// Any tier this tool does not know by name.
    Other(String),
}

impl StorageClass {
    /// Archival tiers need a retrieval request before the body can be read.
    pub fn requires_retrieval(&self) -> bool {
        matches!(self, Self::Glacier | Self::DeepArchive)
    }

    /// Wire name, e.g. `DEEP_ARCHIVE`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Standard => "STANDARD",
            Self::ReducedRedundancy => "REDUCED_REDUNDANCY",
            Self::StandardIa => "STANDARD_IA",
            Self::OnezoneIa => "ONEZONE_IA",
            Self::IntelligentTiering => "INTELLIGENT_TIERING",
            Self::Glacier => "GLACIER",
            Self::DeepArchive => "DEEP_ARCHIVE",
            Self::GlacierIr => "GLACIER_IR",
            Self::Outposts => "OUTPOSTS",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for StorageClass {
    fn from(s: &str) -> Self {
        match s {
            "STANDARD" => Self::Standard,
            "REDUCED_REDUNDANCY" => Self::ReducedRedundancy,
            "STANDARD_IA" => Self::StandardIa,
            "ONEZONE_IA" => Self::OnezoneIa,
            "INTELLIGENT_TIERING" => Self::IntelligentTiering,
            "GLACIER" => Self::Glacier,
            "DEEP_ARCHIVE" => Self::DeepArchive,
            "GLACIER_IR" => Self::GlacierIr,
            "OUTPOSTS" => Self::Outposts,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for StorageClass {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<StorageClass> for String {
    fn from(c: StorageClass) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One historical body of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Object key.
    pub key: String,
    /// Service-assigned version id.
    pub version_id: String,
    /// Write time.
    pub last_modified: DateTime<Utc>,
    /// Body size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Storage tier.
    #[serde(default)]
    pub storage_class: StorageClass,
    /// Current version of the key.
    #[serde(default)]
    pub is_latest: bool,
}

/// Marks a key absent from `last_modified` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMarkerEntry {
    /// Object key.
    pub key: String,
    /// Version id of the marker itself.
    pub version_id: String,
    /// Deletion time.
    pub last_modified: DateTime<Utc>,
}

/// Either kind of history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entry {
    /// A stored body.
    Version(VersionEntry),
    /// A deletion.
    DeleteMarker(DeleteMarkerEntry),
}

impl Entry {
    /// Object key.
    pub fn key(&self) -> &str {
        match self {
            Self::Version(v) => &v.key,
            Self::DeleteMarker(m) => &m.key,
        }
    }

    /// Version id of the entry.
    pub fn version_id(&self) -> &str {
        match self {
            Self::Version(v) => &v.version_id,
            Self::DeleteMarker(m) => &m.version_id,
        }
    }

    /// Write or deletion time.
    pub fn last_modified(&self) -> DateTime<Utc> {
        match self {
            Self::Version(v) => v.last_modified,
            Self::DeleteMarker(m) => m.last_modified,
        }
    }

    /// True for [`Entry::DeleteMarker`].
    pub fn is_delete_marker(&self) -> bool {
        matches!(self, Self::DeleteMarker(_))
    }
}

/// Continuation point of a version listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    /// Key the next page starts after.
    pub key_marker: String,
    /// Version of `key_marker` the next page starts after.
    #[serde(default)]
    pub version_id_marker: Option<String>,
}

/// One page of a version listing.
///
/// Both lists are sorted ascending by key and, within a key, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Versions on this page.
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
    /// Delete markers on this page.
    #[serde(default)]
    pub delete_markers: Vec<DeleteMarkerEntry>,
    /// Present when more pages follow.
    #[serde(default)]
    pub next: Option<PageToken>,
}

/// Inclusive time range the bucket is restored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitWindow {
    /// `None` means "from the beginning" and turns on cleanup tracking.
    pub start: Option<DateTime<Utc>>,
    /// Point in time restored to.
    pub end: DateTime<Utc>,
}

impl PitWindow {
    /// Missing `end` resolves to the current instant.
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end: end.unwrap_or_else(Utc::now),
        }
    }

    /// Single point in time, no lower bound.
    pub fn at(end: DateTime<Utc>) -> Self {
        Self { start: None, end }
    }

    /// Both bounds inclusive.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant <= self.end && self.start.map_or(true, |s| instant >= s)
    }

    /// True when no start was given.
    pub fn is_point_in_time(&self) -> bool {
        self.start.is_none()
    }
}

/// The decided state of one key for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedState {
    /// Object key.
    pub key: String,
    /// Newest entry inside the window.
    pub entry: Entry,
}

impl SelectedState {
    /// The key is absent at the window end.
    pub fn is_deleted(&self) -> bool {
        self.entry.is_delete_marker()
    }
}

/// Keys that exist now but did not exist at the window end.
///
/// Only populated for in-place restores. Each key keeps the newest version
/// that made it a candidate.
#[derive(Debug, Clone, Default)]
pub struct CleanupSet {
    entries: BTreeMap<String, VersionEntry>,
}

impl CleanupSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a too-recent version; the first (newest) one for a key wins.
    pub fn mark(&mut self, version: VersionEntry) {
        self.entries.entry(version.key.clone()).or_insert(version);
    }

    /// Called when the key resolves to a copy or download.
    pub fn unmark(&mut self, key: &str) -> Option<VersionEntry> {
        self.entries.remove(key)
    }

    /// Whether `key` is a candidate.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing needs cleaning.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidate keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Empties the set in key order for the final cleanup pass.
    pub fn drain(&mut self) -> impl Iterator<Item = VersionEntry> {
        std::mem::take(&mut self.entries).into_values()
    }
}

/// Retrieval state of an archival-tier object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    /// No retrieval requested, or the copy expired.
    NotRequested,
    /// Requested, not readable yet.
    InProgress,
    /// A readable copy exists.
    Complete,
}
