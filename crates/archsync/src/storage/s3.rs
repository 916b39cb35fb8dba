//! S3 and S3-compatible object storage
//!
//! The SDK's own retry layer is disabled: retries, backoff and their logging
//! belong to the uploader. Each request attempt is bounded by the configured
//! attempt timeout.

use super::{
    ObjectMeta, ObjectStore, PutOutcome, StorageConfig, StoreError, StoreResult,
    SHA256_METADATA_KEY,
};
use archsync_common::checksum::{md5_base64, ContentDigests};
use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_s3::{
    config::{
        http::HttpResponse, retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion,
        Credentials, Region,
    },
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

const CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// Error codes S3 uses for conditions that clear up on their own
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
    multipart_chunk: u64,
}

impl S3Store {
    pub async fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        debug!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "Initializing S3 client"
        );

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) if config.has_static_credentials() => {
                let credentials = Credentials::new(access, secret, None, None, "archsync-config");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder
            .force_path_style(config.path_style)
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_attempt_timeout(config.attempt_timeout())
                    .build(),
            );

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "S3 client initialized");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            multipart_threshold: config.multipart_threshold_bytes,
            multipart_chunk: config.multipart_chunk_bytes,
        })
    }

    async fn put_single(
        &self,
        key: &str,
        path: &Path,
        digests: &ContentDigests,
    ) -> StoreResult<PutOutcome> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::Permanent(format!("cannot read {}: {e}", path.display())))?;

        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_length(digests.size as i64)
            .content_md5(&digests.md5_base64)
            .content_type(CONTENT_TYPE)
            .metadata(SHA256_METADATA_KEY, &digests.sha256_hex)
            .send()
            .await
            .map_err(classify)?;

        Ok(PutOutcome {
            etag: response.e_tag().map(str::to_string),
        })
    }

    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        digests: &ContentDigests,
    ) -> StoreResult<PutOutcome> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .metadata(SHA256_METADATA_KEY, &digests.sha256_hex)
            .send()
            .await
            .map_err(classify)?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Permanent("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(key, path, &upload_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let aborted = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = aborted {
                    warn!(
                        key,
                        upload_id = %upload_id,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, path: &Path, upload_id: &str) -> StoreResult<PutOutcome> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| StoreError::Permanent(format!("cannot read {}: {e}", path.display())))?;

        let mut parts = Vec::new();
        let mut part_number = 1i32;
        loop {
            let mut chunk = Vec::with_capacity(self.multipart_chunk as usize);
            (&mut file)
                .take(self.multipart_chunk)
                .read_to_end(&mut chunk)
                .await
                .map_err(|e| StoreError::Permanent(format!("cannot read {}: {e}", path.display())))?;
            if chunk.is_empty() {
                break;
            }

            debug!(key, part_number, bytes = chunk.len(), "Uploading part");
            let md5 = md5_base64(&chunk);
            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_md5(md5)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(classify)?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(response.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;
        }

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(classify)?;

        Ok(PutOutcome {
            etag: completed.e_tag().map(str::to_string),
        })
    }
}

/// Sort SDK failures into retryable and terminal
fn classify<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(message)
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default();
            if status >= 500 || status == 429 || TRANSIENT_CODES.contains(&code) {
                StoreError::Transient(message)
            } else {
                StoreError::Permanent(message)
            }
        }
        _ => StoreError::Permanent(message),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    #[instrument(skip(self, digests), fields(bytes = digests.size))]
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        digests: &ContentDigests,
    ) -> StoreResult<PutOutcome> {
        if digests.size >= self.multipart_threshold {
            self.put_multipart(key, path, digests).await
        } else {
            self.put_single(key, path, digests).await
        }
    }

    #[instrument(skip(self, data))]
    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        let md5 = md5_base64(&data);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(md5)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => return Ok(None),
            Err(e) => return Err(classify(e)),
        };

        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            sha256: response
                .metadata()
                .and_then(|m| m.get(SHA256_METADATA_KEY))
                .cloned(),
            etag: response.e_tag().map(str::to_string),
        }))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(classify)?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|k| ObjectMeta {
                    key: k.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    sha256: None,
                    etag: obj.e_tag().map(str::to_string),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn read_range(&self, key: &str, start: u64, len: u64) -> StoreResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={}-{}", start, start + len - 1))
            .send()
            .await
            .map_err(|e| match e {
                SdkError::ServiceError(ref ctx) if ctx.err().is_no_such_key() => {
                    StoreError::NotFound(key.to_string())
                }
                other => classify(other),
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("failed to read body of {key}: {e}")))?
            .into_bytes()
            .to_vec();
        Ok(data)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn check_credentials(&self) -> StoreResult<()> {
        let provider = self
            .client
            .config()
            .credentials_provider()
            .ok_or_else(|| StoreError::Permanent("no credentials provider configured".to_string()))?;
        provider
            .provide_credentials()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Permanent(format!("no usable credentials: {e}")))
    }

    #[instrument(skip(self))]
    async fn check_destination(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_stale_uploads(&self, prefix: &str, max_age: Duration) -> StoreResult<usize> {
        let cutoff = chrono::Utc::now().timestamp() - max_age.as_secs() as i64;
        let mut aborted = 0usize;
        let mut key_marker: Option<String> = None;
        let mut upload_marker: Option<String> = None;

        loop {
            let response = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_marker.take())
                .send()
                .await
                .map_err(classify)?;

            for upload in response.uploads() {
                let stale = upload.initiated().map(|t| t.secs() < cutoff).unwrap_or(false);
                if let (true, Some(key), Some(id)) = (stale, upload.key(), upload.upload_id()) {
                    self.client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(id)
                        .send()
                        .await
                        .map_err(classify)?;
                    info!(key, upload_id = id, "Aborted stale multipart upload");
                    aborted += 1;
                }
            }

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = response.next_key_marker().map(str::to_string);
            upload_marker = response.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() {
                break;
            }
        }

        Ok(aborted)
    }
}
