//! Object-storage primitives consumed by the restore session.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pit_restore_core::{HistoryPage, PageToken, RetrievalStatus};
use thiserror::Error;

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} failed: {message}")]
    Service { op: &'static str, message: String },
    /// Listing response missing a field the merge depends on.
    #[error("malformed listing: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn service(op: &'static str, message: impl Into<String>) -> Self {
        Self::Service {
            op,
            message: message.into(),
        }
    }
}

/// Failure of a retrieval request for an archival object.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Someone (possibly an earlier run) already asked for this object.
    #[error("retrieval already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Server-side encryption applied to copied objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerSideEncryption {
    #[value(name = "AES256")]
    Aes256,
    #[value(name = "aws:kms")]
    AwsKms,
}

impl ServerSideEncryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256 => "AES256",
            Self::AwsKms => "aws:kms",
        }
    }
}

/// Server-side copy of one historical version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_bucket: String,
    pub source_key: String,
    pub source_version_id: String,
    pub dest_bucket: String,
    pub dest_key: String,
    /// Source size, picks single-request or multipart copy.
    pub size: u64,
    pub sse: Option<ServerSideEncryption>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// One page of versions and delete markers under `prefix`.
    async fn list_versions_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&PageToken>,
    ) -> Result<HistoryPage, StoreError>;

    /// Retain-until instant of a version, `None` when unretained.
    async fn retention(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Writes the body of a version to `path`.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
        path: &Path,
    ) -> Result<(), StoreError>;

    async fn copy_object(&self, req: &CopyRequest) -> Result<(), StoreError>;

    /// Without `version_id` this hides the key behind a new delete marker.
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn request_retrieval(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
        days: i32,
    ) -> Result<(), RetrievalError>;

    async fn retrieval_status(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<RetrievalStatus, StoreError>;
}
