#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Point-in-time reconstruction of versioned bucket history.
//!
//! This crate holds the storage-agnostic part of the restore tool: the
//! history model, the page-by-page merge of versions and delete markers,
//! and the per-key disposition decision. Nothing here performs I/O.

pub mod disposition;
pub mod merge;
pub mod model;
pub mod time;

pub use disposition::{
    needs_retrieval_status, resolve, resolve_cleanup, Disposition, RestoreTarget, RETRIEVAL_DAYS,
};
pub use merge::{merge_pages, MergeEngine, MergeError, MergeEvent};
pub use model::*;
pub use time::{parse_timestamp, TimestampError};
