//! Amazon S3 (and S3-compatible) implementation of [`ObjectStore`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::DateTime as SdkDateTime;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, RestoreRequest, ServerSideEncryption as SdkSse,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, TimeZone, Utc};
use pit_restore_core::{
    DeleteMarkerEntry, HistoryPage, PageToken, RetrievalStatus, StorageClass, VersionEntry,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{CopyRequest, ObjectStore, RetrievalError, ServerSideEncryption, StoreError};

/// Largest object `CopyObject` accepts in one request.
const SINGLE_COPY_LIMIT: u64 = 5 * 1024 * 1024 * 1024;
const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Builds a client from the default credential chain.
    ///
    /// A custom endpoint switches to path-style addressing, which is what
    /// most S3-compatible services expect.
    pub async fn connect(endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if endpoint_url.is_some() {
            builder = builder.force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn multipart_copy(&self, req: &CopyRequest, source: &str) -> Result<(), StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&req.dest_bucket)
            .key(&req.dest_key)
            .set_server_side_encryption(req.sse.map(sdk_sse))
            .send()
            .await
            .map_err(|e| service_err("create_multipart_upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::service("create_multipart_upload", "no upload id"))?
            .to_string();

        match self.copy_parts(req, source, &upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&req.dest_bucket)
                    .key(&req.dest_key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| service_err("complete_multipart_upload", e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&req.dest_bucket)
                    .key(&req.dest_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %req.dest_key, error = %DisplayErrorContext(&abort), "abort multipart copy failed");
                }
                Err(e)
            }
        }
    }

    async fn copy_parts(
        &self,
        req: &CopyRequest,
        source: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut parts = Vec::new();
        let part_size = copy_part_size(req.size);
        let mut start = 0u64;
        let mut number = 1i32;
        while start < req.size {
            let end = (start + part_size).min(req.size) - 1;
            let out = self
                .client
                .upload_part_copy()
                .bucket(&req.dest_bucket)
                .key(&req.dest_key)
                .upload_id(upload_id)
                .part_number(number)
                .copy_source(source)
                .copy_source_range(format!("bytes={start}-{end}"))
                .send()
                .await
                .map_err(|e| service_err("upload_part_copy", e))?;
            let etag = out
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .ok_or_else(|| StoreError::service("upload_part_copy", "no etag in part result"))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(number)
                    .e_tag(etag)
                    .build(),
            );
            start = end + 1;
            number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_versions_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&PageToken>,
    ) -> Result<HistoryPage, StoreError> {
        let mut req = self.client.list_object_versions().bucket(bucket).prefix(prefix);
        if let Some(t) = token {
            req = req
                .key_marker(&t.key_marker)
                .set_version_id_marker(t.version_id_marker.clone());
        }
        let out = req
            .send()
            .await
            .map_err(|e| service_err("list_object_versions", e))?;

        let mut versions = Vec::with_capacity(out.versions().len());
        for v in out.versions() {
            let key = required(v.key(), "version key")?;
            versions.push(VersionEntry {
                key: key.to_string(),
                version_id: v.version_id().unwrap_or("null").to_string(),
                last_modified: to_utc(v.last_modified(), key)?,
                size: v.size().unwrap_or(0).max(0) as u64,
                storage_class: v
                    .storage_class()
                    .map(|c| StorageClass::from(c.as_str()))
                    .unwrap_or_default(),
                is_latest: v.is_latest().unwrap_or(false),
            });
        }

        let mut delete_markers = Vec::with_capacity(out.delete_markers().len());
        for m in out.delete_markers() {
            let key = required(m.key(), "delete marker key")?;
            delete_markers.push(DeleteMarkerEntry {
                key: key.to_string(),
                version_id: m.version_id().unwrap_or("null").to_string(),
                last_modified: to_utc(m.last_modified(), key)?,
            });
        }

        let next = if out.is_truncated().unwrap_or(false) {
            let key_marker = required(out.next_key_marker(), "next key marker")?;
            Some(PageToken {
                key_marker: key_marker.to_string(),
                version_id_marker: out.next_version_id_marker().map(String::from),
            })
        } else {
            None
        };

        debug!(
            bucket,
            versions = versions.len(),
            delete_markers = delete_markers.len(),
            truncated = next.is_some(),
            "listed versions page"
        );
        Ok(HistoryPage {
            versions,
            delete_markers,
            next,
        })
    }

    async fn retention(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let out = self
            .client
            .get_object_retention()
            .bucket(bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| service_err("get_object_retention", e))?;
        match out.retention().and_then(|r| r.retain_until_date()) {
            Some(dt) => Ok(Some(to_utc(Some(dt), key)?)),
            None => Ok(None),
        }
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
        path: &Path,
    ) -> Result<(), StoreError> {
        let out = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| service_err("get_object", e))?;

        let part = part_path(path);
        let mut body = out.body;
        let written: Result<(), StoreError> = async {
            let mut file = tokio::fs::File::create(&part).await?;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| StoreError::service("get_object", e.to_string()))?
            {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        tokio::fs::rename(&part, path).await?;
        Ok(())
    }

    async fn copy_object(&self, req: &CopyRequest) -> Result<(), StoreError> {
        let source = copy_source(&req.source_bucket, &req.source_key, &req.source_version_id);
        if req.size > SINGLE_COPY_LIMIT {
            return self.multipart_copy(req, &source).await;
        }
        self.client
            .copy_object()
            .bucket(&req.dest_bucket)
            .key(&req.dest_key)
            .copy_source(source)
            .set_server_side_encryption(req.sse.map(sdk_sse))
            .send()
            .await
            .map_err(|e| service_err("copy_object", e))?;
        Ok(())
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(String::from))
            .send()
            .await
            .map_err(|e| service_err("delete_object", e))?;
        Ok(())
    }

    async fn request_retrieval(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
        days: i32,
    ) -> Result<(), RetrievalError> {
        let res = self
            .client
            .restore_object()
            .bucket(bucket)
            .key(key)
            .version_id(version_id)
            .restore_request(RestoreRequest::builder().days(days).build())
            .send()
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("RestoreAlreadyInProgress") => {
                Err(RetrievalError::AlreadyInProgress)
            }
            Err(e) => Err(service_err("restore_object", e).into()),
        }
    }

    async fn retrieval_status(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<RetrievalStatus, StoreError> {
        let out = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| service_err("head_object", e))?;
        Ok(parse_restore_header(out.restore()))
    }
}

fn service_err<E: std::error::Error>(op: &'static str, err: E) -> StoreError {
    StoreError::service(op, DisplayErrorContext(&err).to_string())
}

fn sdk_sse(sse: ServerSideEncryption) -> SdkSse {
    match sse {
        ServerSideEncryption::Aes256 => SdkSse::Aes256,
        ServerSideEncryption::AwsKms => SdkSse::AwsKms,
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, StoreError> {
    value.ok_or_else(|| StoreError::Malformed(format!("missing {what}")))
}

fn to_utc(dt: Option<&SdkDateTime>, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let dt = dt.ok_or_else(|| StoreError::Malformed(format!("missing last modified for '{key}'")))?;
    Utc.timestamp_opt(dt.secs(), dt.subsec_nanos())
        .single()
        .ok_or_else(|| StoreError::Malformed(format!("timestamp out of range for '{key}'")))
}

/// Part size keeping a multipart copy within the service's part limit.
pub(crate) fn copy_part_size(size: u64) -> u64 {
    COPY_PART_SIZE.max(size.div_ceil(MAX_PARTS))
}

/// `x-amz-restore` header: absent, `ongoing-request="true"`, or finished.
pub(crate) fn parse_restore_header(header: Option<&str>) -> RetrievalStatus {
    match header {
        None => RetrievalStatus::NotRequested,
        Some(h) if h.contains("ongoing-request=\"true\"") => RetrievalStatus::InProgress,
        Some(_) => RetrievalStatus::Complete,
    }
}

/// Sibling temp file the body is streamed into before the rename.
pub(crate) fn part_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.part", uuid::Uuid::new_v4()))
}

/// `bucket/key?versionId=...` with the key percent-encoded.
pub(crate) fn copy_source(bucket: &str, key: &str, version_id: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(b as char)
            }
            _ => encoded.push_str(&format!("%{b:02X}")),
        }
    }
    format!("{bucket}/{encoded}?versionId={version_id}")
}
