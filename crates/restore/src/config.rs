use std::path::PathBuf;

use clap::Parser;
use pit_restore_core::{parse_timestamp, PitWindow, RestoreTarget, TimestampError};
use thiserror::Error;

use crate::store::ServerSideEncryption;

#[derive(Debug, Parser)]
#[command(
    name = "s3-pit-restore",
    version,
    about = "Restore a versioned S3 bucket (or prefix) to a point in time"
)]
pub struct Cli {
    /// Bucket to restore from.
    #[arg(short = 'b', long)]
    pub bucket: String,

    /// Bucket to restore into. Takes precedence over --dest.
    #[arg(short = 'B', long)]
    pub dest_bucket: Option<String>,

    /// Local directory to restore into.
    #[arg(short = 'd', long, default_value = "")]
    pub dest: String,

    /// Key prefix to restore from.
    #[arg(short = 'p', long, default_value = "")]
    pub prefix: String,

    /// Key prefix to restore under in the destination bucket.
    #[arg(short = 'P', long, default_value = "")]
    pub dest_prefix: String,

    /// Point in time to restore at. Defaults to now.
    #[arg(short = 't', long)]
    pub timestamp: Option<String>,

    /// Only consider versions written at or after this instant.
    #[arg(short = 'f', long)]
    pub from_timestamp: Option<String>,

    /// Request retrieval of GLACIER / DEEP_ARCHIVE versions.
    #[arg(short = 'e', long)]
    pub enable_glacier: bool,

    /// Print version details for every object.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Alternative endpoint for S3-compatible services.
    #[arg(short = 'u', long)]
    pub endpoint_url: Option<String>,

    /// Report what would be restored without transferring anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Debug logging, including the AWS SDK.
    #[arg(long)]
    pub debug: bool,

    /// Max number of concurrent transfers.
    #[arg(long, default_value_t = 10)]
    pub max_workers: usize,

    /// Server-side encryption for copied objects.
    #[arg(long, value_enum)]
    pub sse: Option<ServerSideEncryption>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "either provide destination bucket using (-B) or provide destination for local restore (-d)"
    )]
    MissingDestination,
    #[error("invalid {flag}: {source}")]
    Timestamp {
        flag: &'static str,
        source: TimestampError,
    },
    #[error("--max-workers must be at least 1")]
    NoWorkers,
    #[error("--from-timestamp is after --timestamp")]
    EmptyWindow,
}

/// Validated settings for one restore run.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub source_bucket: String,
    pub prefix: String,
    pub target: RestoreTarget,
    pub window: PitWindow,
    pub retrieval_enabled: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub max_workers: usize,
    pub sse: Option<ServerSideEncryption>,
}

impl RestoreConfig {
    /// Destination is the source bucket itself with keys unchanged.
    pub fn is_in_place(&self) -> bool {
        self.target.is_in_place(&self.source_bucket)
    }
}

impl Cli {
    pub fn into_config(self) -> Result<RestoreConfig, ConfigError> {
        let target = match self.dest_bucket {
            Some(bucket) => RestoreTarget::Bucket {
                bucket,
                prefix: Some(self.dest_prefix).filter(|p| !p.is_empty()),
            },
            None if !self.dest.is_empty() => RestoreTarget::Local {
                root: PathBuf::from(self.dest),
            },
            None => return Err(ConfigError::MissingDestination),
        };

        let end = parse_flag(self.timestamp.as_deref(), "--timestamp")?;
        let start = parse_flag(self.from_timestamp.as_deref(), "--from-timestamp")?;
        let window = PitWindow::new(start, end);
        if window.start.is_some_and(|s| s > window.end) {
            return Err(ConfigError::EmptyWindow);
        }

        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        Ok(RestoreConfig {
            source_bucket: self.bucket,
            prefix: self.prefix,
            target,
            window,
            retrieval_enabled: self.enable_glacier,
            dry_run: self.dry_run,
            verbose: self.verbose,
            max_workers: self.max_workers,
            sse: self.sse,
        })
    }
}

fn parse_flag(
    value: Option<&str>,
    flag: &'static str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, ConfigError> {
    value
        .map(parse_timestamp)
        .transpose()
        .map_err(|source| ConfigError::Timestamp { flag, source })
}
