//! Page-by-page merge of versions and delete markers.
//!
//! The listing service returns versions and delete markers as two lists per
//! page, each sorted by key and newest-first within a key. Page boundaries
//! are drawn over the combined sequence, so a page may end with delete
//! markers whose versions only arrive on the next page. The engine keeps
//! those markers in a carry-over queue until the versions they compete with
//! have been seen.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::trace;

use crate::model::{DeleteMarkerEntry, Entry, HistoryPage, PitWindow, SelectedState, VersionEntry};

/// Listing contract violations and the empty-listing condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    /// The listing produced nothing to restore from.
    #[error("no versions matching criteria")]
    NoMatchingVersions,
    /// A page broke the key ordering contract.
    #[error("listing out of order: '{next}' after '{prev}'")]
    OutOfOrder {
        /// Key seen earlier.
        prev: String,
        /// Key that sorts before it.
        next: String,
    },
}

/// What the merge decided for an entry, in listing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEvent {
    /// Version newer than the window end while no window start was given.
    TooRecent(VersionEntry),
    /// Final state of a key for this run.
    Selected(SelectedState),
}

/// Stateful merge over successive history pages.
#[derive(Debug)]
pub struct MergeEngine {
    window: PitWindow,
    carry: VecDeque<DeleteMarkerEntry>,
    last_resolved: Option<String>,
    last_version_key: Option<String>,
    pages: usize,
}

impl MergeEngine {
    /// Engine with an empty carry-over queue.
    pub fn new(window: PitWindow) -> Self {
        Self {
            window,
            carry: VecDeque::new(),
            last_resolved: None,
            last_version_key: None,
            pages: 0,
        }
    }

    /// Window this run restores to.
    pub fn window(&self) -> &PitWindow {
        &self.window
    }

    /// Number of delete markers waiting for a later page.
    pub fn carried_markers(&self) -> usize {
        self.carry.len()
    }

    /// Pages consumed so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Consumes one page and returns the decisions it made possible.
    ///
    /// A page without versions is fatal only while no version has been seen
    /// in this run; later marker-only pages just feed the carry-over queue.
    pub fn process_page(&mut self, page: HistoryPage) -> Result<Vec<MergeEvent>, MergeError> {
        self.pages += 1;
        if page.versions.is_empty() && self.last_version_key.is_none() {
            return Err(MergeError::NoMatchingVersions);
        }

        if let Some(first) = page.delete_markers.first() {
            if let Some(tail) = self.carry.back() {
                check_order(&tail.key, &first.key)?;
            }
        }
        self.carry.extend(page.delete_markers);

        let mut events = Vec::new();
        for version in page.versions {
            if let Some(prev) = &self.last_version_key {
                check_order(prev, &version.key)?;
            }
            self.last_version_key = Some(version.key.clone());

            if self.last_resolved.as_deref() == Some(version.key.as_str()) {
                continue;
            }

            if !self.window.contains(version.last_modified) {
                if self.window.is_point_in_time() {
                    trace!(key = %version.key, version_id = %version.version_id, "newer than window end");
                    events.push(MergeEvent::TooRecent(version));
                }
                continue;
            }

            self.skip_irrelevant_markers(&version);

            let marker_wins = self.carry.front().is_some_and(|m| {
                m.key == version.key
                    && m.last_modified > version.last_modified
                    && self.window.contains(m.last_modified)
            });

            let entry = if marker_wins {
                match self.carry.pop_front() {
                    Some(marker) => Entry::DeleteMarker(marker),
                    None => Entry::Version(version),
                }
            } else {
                Entry::Version(version)
            };

            let key = entry.key().to_string();
            self.last_resolved = Some(key.clone());
            events.push(MergeEvent::Selected(SelectedState { key, entry }));
        }

        trace!(page = self.pages, carried = self.carry.len(), "page merged");
        Ok(events)
    }

    /// Drops markers that sort before `version` or postdate the window.
    ///
    /// Never looks past the current key: markers of later keys may belong to
    /// versions that are still on their way.
    fn skip_irrelevant_markers(&mut self, version: &VersionEntry) {
        while let Some(m) = self.carry.front() {
            let stale = m.key < version.key
                || (m.key == version.key && m.last_modified > self.window.end);
            if !stale {
                break;
            }
            self.carry.pop_front();
        }
    }
}

fn check_order(prev: &str, next: &str) -> Result<(), MergeError> {
    if next < prev {
        return Err(MergeError::OutOfOrder {
            prev: prev.to_string(),
            next: next.to_string(),
        });
    }
    Ok(())
}

/// Runs the merge over a complete, already-paged history.
pub fn merge_pages<I>(window: PitWindow, pages: I) -> Result<Vec<MergeEvent>, MergeError>
where
    I: IntoIterator<Item = HistoryPage>,
{
    let mut engine = MergeEngine::new(window);
    let mut events = Vec::new();
    for page in pages {
        events.extend(engine.process_page(page)?);
    }
    Ok(events)
}
