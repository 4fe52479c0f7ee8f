//! Restores a versioned S3 bucket, or a prefix of it, to a point in time.

pub mod config;
pub mod executor;
pub mod report;
pub mod session;
pub mod store;

pub use config::{Cli, ConfigError, RestoreConfig};
pub use session::{FailedObject, RestoreError, RestoreSession, RunSummary};
pub use store::{MemoryStore, ObjectStore, S3Store};
