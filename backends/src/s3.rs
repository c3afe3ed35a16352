use std::path::Path;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use pgferry_core::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::backend::{object_metadata, Storage, METADATA_MODIFIED_TIME};

// Objects above this size go through the multipart path.
const MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;
const PART_SIZE: usize = 32 * 1024 * 1024;

pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Credentials come from the SDK's standard chain (environment,
    /// profiles, instance metadata); transient-failure retries are the
    /// client's job, bounded by `max_retries`.
    pub async fn new(bucket: String, region: String, max_retries: u32) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .retry_config(RetryConfig::standard().with_max_attempts(max_retries))
            .load()
            .await;

        Self {
            client: Client::new(&config),
            bucket,
        }
    }

    async fn put_multipart(&self, key: &str, local_path: &Path, mtime: i64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(object_metadata(mtime)))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("failed to start multipart upload of {}: {}", key, e)))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Storage(format!("no upload id returned for {}", key)))?
            .to_string();

        match self.upload_parts(key, local_path, &upload_id).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| {
                        Error::Storage(format!("failed to complete multipart upload of {}: {}", key, e))
                    })?;
                Ok(())
            }
            Err(err) => {
                // don't leave orphaned parts accruing storage charges
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        local_path: &Path,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut parts = Vec::new();
        let mut part_number = 1i32;

        loop {
            let part = read_part(&mut file).await?;
            if part.is_empty() {
                break;
            }
            let last = part.len() < PART_SIZE;

            debug!(key, part_number, size = part.len(), "uploading part");
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| {
                    Error::Storage(format!("failed to upload part {} of {}: {}", part_number, key, e))
                })?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            if last {
                break;
            }
        }

        Ok(parts)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(&self, key: &str, local_path: &Path, mtime: i64) -> Result<()> {
        let size = tokio::fs::metadata(local_path).await?.len();
        debug!(key, path = %local_path.display(), size, "uploading file");

        if size > MULTIPART_THRESHOLD {
            return self.put_multipart(key, local_path, mtime).await;
        }

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| Error::Storage(format!("failed to read {}: {}", local_path.display(), e)))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .set_metadata(Some(object_metadata(mtime)))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("failed to upload {}: {}", key, e)))?;

        Ok(())
    }

    async fn put_string(&self, key: &str, body: &str) -> Result<()> {
        debug!(key, "creating object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.as_bytes().to_vec()))
            .set_metadata(Some(object_metadata(chrono::Utc::now().timestamp())))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", key, e)))?;

        Ok(())
    }

    async fn get(&self, key: &str, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    return Err(Error::NotFound { key: key.to_string() });
                }
                return Err(Error::Storage(format!("failed to get {}: {}", key, err)));
            }
        };

        let mut body = resp.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| Error::Storage(format!("failed to read body of {}: {}", key, e)))?
        {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<String> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    return Err(Error::NotFound { key: key.to_string() });
                }
                return Err(Error::Storage(format!("failed to get {}: {}", key, err)));
            }
        };

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::Storage(format!("failed to read body of {}: {}", key, e)))?;

        String::from_utf8(data.into_bytes().to_vec())
            .map_err(|e| Error::Storage(format!("object {} is not valid UTF-8: {}", key, e)))
    }

    async fn get_last_modified_time(&self, key: &str) -> Result<i64> {
        let resp = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    return Err(Error::NotFound { key: key.to_string() });
                }
                return Err(Error::Storage(format!("failed to head {}: {}", key, err)));
            }
        };

        match resp.metadata().and_then(|m| m.get(METADATA_MODIFIED_TIME)) {
            Some(value) => value.parse::<i64>().map_err(|_| Error::Metadata {
                key: key.to_string(),
                value: value.clone(),
            }),
            None => Ok(0),
        }
    }

    async fn list_folder(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .delimiter("/")
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| Error::Storage(format!("failed to list {}: {}", prefix, e)))?;

            for common in resp.common_prefixes() {
                if let Some(p) = common.prefix() {
                    keys.push(p.to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
            } else {
                return Ok(keys);
            }
        }
    }

    async fn walk_folder(&self, prefix: &str, keys: async_channel::Sender<String>) -> Result<()> {
        let mut pending = vec![prefix.to_string()];

        while let Some(current) = pending.pop() {
            let mut continuation_token: Option<String> = None;

            loop {
                let resp = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .delimiter("/")
                    .prefix(&current)
                    .set_continuation_token(continuation_token.take())
                    .send()
                    .await
                    .map_err(|e| Error::Storage(format!("failed to list {}: {}", current, e)))?;

                for object in resp.contents() {
                    let Some(key) = object.key() else { continue };
                    if key == current {
                        debug!(key, "skipping folder marker");
                        continue;
                    }
                    debug!(key, "found object while traversing folder");
                    keys.send(key.to_string())
                        .await
                        .map_err(|_| Error::Other("walk channel closed".to_string()))?;
                }

                for common in resp.common_prefixes() {
                    if let Some(p) = common.prefix() {
                        debug!(prefix = p, "processing child folder");
                        pending.push(p.to_string());
                    }
                }

                if resp.is_truncated().unwrap_or(false) {
                    continuation_token = resp.next_continuation_token().map(str::to_string);
                } else {
                    debug!(prefix = %current, "done traversing folder");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("failed to delete {}: {}", key, e)))?;

        Ok(())
    }
}

/// Read up to one part's worth of data from the file.
async fn read_part(file: &mut tokio::fs::File) -> Result<Vec<u8>> {
    let mut part = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];

    while part.len() < PART_SIZE {
        let want = chunk.len().min(PART_SIZE - part.len());
        let n = file.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        part.extend_from_slice(&chunk[..n]);
    }

    Ok(part)
}
