// S3 object store - AWS S3 or any S3-compatible service (MinIO, LocalStack)

use super::{ObjectInfo, ObjectMetadata, ObjectReader, ObjectStore, ServerSideEncryption};
use crate::config::S3Settings;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::{Result, VaultError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3-backed object store.
pub struct S3ObjectStore {
    client: Client,
    settings: S3Settings,
    part_retry: RetryExecutor,
}

impl S3ObjectStore {
    /// `retry` governs individual multipart parts; whole requests are retried by the
    /// store adapter.
    pub async fn new(settings: S3Settings, retry: RetryConfig) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        // LocalStack/MinIO
        if let Some(ref endpoint) = settings.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if settings.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let store = Self {
            client: Client::from_conf(s3_config_builder.build()),
            settings,
            part_retry: RetryExecutor::new(retry),
        };
        if store.settings.create_bucket {
            store.ensure_bucket_exists().await?;
        }
        Ok(store)
    }

    /// Ensure the bucket exists, create it if it doesn't
    pub async fn ensure_bucket_exists(&self) -> Result<()> {
        match self
            .client
            .head_bucket()
            .bucket(&self.settings.bucket)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(_) => {
                let mut create_bucket = self.client.create_bucket().bucket(&self.settings.bucket);

                if self.settings.region != "us-east-1" {
                    use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
                    let location = BucketLocationConstraint::from(self.settings.region.as_str());
                    let config = CreateBucketConfiguration::builder()
                        .location_constraint(location)
                        .build();
                    create_bucket = create_bucket.create_bucket_configuration(config);
                }

                create_bucket
                    .send()
                    .await
                    .map_err(|e| classify("create bucket", e))?;
                info!(bucket = %self.settings.bucket, "Created bucket");
                Ok(())
            }
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.settings.key_prefix, name)
    }

    fn part_size(&self) -> usize {
        ((self.settings.part_size_mb as usize) * 1024 * 1024).max(MIN_PART_SIZE)
    }

    fn part_concurrency(&self) -> usize {
        self.settings.part_concurrency.max(1)
    }

    fn multipart_threshold(&self) -> usize {
        (self.settings.multipart_threshold_mb as usize) * 1024 * 1024
    }

    async fn put_simple(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<u64> {
        let size = data.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_metadata(Some(to_map(metadata)));
        request = match sse {
            ServerSideEncryption::Aes256 => request
                .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256),
            ServerSideEncryption::Kms { key_id } => request
                .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::AwsKms)
                .set_ssekms_key_id(key_id.clone()),
        };
        request.send().await.map_err(|e| classify("put object", e))?;
        Ok(size)
    }

    /// Multipart upload; any part that fails after retries aborts the whole upload.
    async fn put_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        body: &mut ObjectReader,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<u64> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .set_metadata(Some(to_map(metadata)));
        create = match sse {
            ServerSideEncryption::Aes256 => create
                .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256),
            ServerSideEncryption::Kms { key_id } => create
                .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::AwsKms)
                .set_ssekms_key_id(key_id.clone()),
        };
        let multipart = create
            .send()
            .await
            .map_err(|e| classify("create multipart upload", e))?;
        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| VaultError::UpstreamUnreachable("no upload id returned".into()))?
            .to_string();

        info!(key = %key, upload_id = %upload_id, "Starting multipart upload");

        let outcome = match self.upload_parts(key, &upload_id, first_part, body).await {
            Ok((parts, total)) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| total)
                .map_err(|e| classify("complete multipart upload", e)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(total) => {
                info!(key = %key, bytes = total, "Multipart upload completed");
                Ok(total)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Aborting multipart upload");
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.settings.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        upload_id = %upload_id,
                        error = %DisplayErrorContext(&abort_error),
                        "Abort failed; uploaded parts stay billed until a lifecycle rule removes them"
                    );
                }
                Err(e)
            }
        }
    }

    /// Read parts in order and keep up to `part_concurrency` of them in flight.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        body: &mut ObjectReader,
    ) -> Result<(Vec<CompletedPart>, u64)> {
        let mut completed = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        let mut total = 0u64;
        let mut part_number = 1;
        let mut buffer = first_part;

        while !buffer.is_empty() {
            if in_flight.len() >= self.part_concurrency() {
                if let Some(done) = in_flight.next().await {
                    completed.push(done?);
                }
            }
            let part = Bytes::from(std::mem::take(&mut buffer));
            total += part.len() as u64;
            in_flight.push(self.upload_part(key, upload_id, part_number, part));
            part_number += 1;
            buffer = read_up_to(body, self.part_size()).await?;
        }
        while let Some(done) = in_flight.next().await {
            completed.push(done?);
        }

        completed.sort_by_key(|part| part.part_number());
        Ok((completed, total))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        part: Bytes,
    ) -> Result<CompletedPart> {
        debug!(key = %key, part = part_number, bytes = part.len(), "Uploading part");
        let output = self
            .part_retry
            .execute("upload_part", || {
                let part = part.clone();
                async move {
                    self.client
                        .upload_part()
                        .bucket(&self.settings.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(part))
                        .send()
                        .await
                        .map_err(|e| classify("upload part", e))
                }
            })
            .await?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(output.e_tag().unwrap_or_default())
            .build())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn backend_name(&self) -> &str {
        "s3"
    }

    async fn put_object(
        &self,
        name: &str,
        mut body: ObjectReader,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<u64> {
        super::validate_object_name(name)?;
        let key = self.key(name);
        let threshold = self.multipart_threshold().max(self.part_size());

        // Bodies below the threshold go up in one request
        let head = read_up_to(&mut body, threshold).await?;
        if head.len() < threshold {
            return self.put_simple(&key, head, metadata, sse).await;
        }
        self.put_multipart(&key, head, &mut body, metadata, sse).await
    }

    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<bool> {
        super::validate_object_name(name)?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(self.key(name))
            .if_none_match("*")
            .body(ByteStream::from(body))
            .set_metadata(Some(to_map(metadata)));
        request = match sse {
            ServerSideEncryption::Aes256 => request
                .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256),
            ServerSideEncryption::Kms { key_id } => request
                .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::AwsKms)
                .set_ssekms_key_id(key_id.clone()),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if matches!(status_of(&e), Some(409) | Some(412)) => Ok(false),
            Err(e) => Err(classify("conditional put", e)),
        }
    }

    async fn get_object(&self, name: &str) -> Result<ObjectReader> {
        let response = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|e| match status_of(&e) {
                Some(404) => VaultError::NotFound(name.to_string()),
                _ => classify("get object", e),
            })?;
        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.settings.bucket)
            .key(self.key(name))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if status_of(&e) == Some(404) => return Ok(None),
            Err(e) => return Err(classify("head object", e)),
        };

        Ok(Some(ObjectInfo {
            name: name.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            metadata: response
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            server_side_encryption: response
                .server_side_encryption()
                .map(|e| e.as_str().to_string()),
        }))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.settings.bucket)
                .prefix(self.key(prefix))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify("list objects", e))?;

            names.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .filter_map(|k| k.strip_prefix(self.settings.key_prefix.as_str()))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|e| classify("delete object", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.settings.bucket)
            .send()
            .await
            .map_err(|e| match classify("head bucket", e) {
                VaultError::TransientIo(msg) => VaultError::UpstreamUnreachable(msg),
                other => other,
            })?;
        Ok(())
    }
}

fn to_map(metadata: &ObjectMetadata) -> std::collections::HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

async fn read_up_to(body: &mut ObjectReader, limit: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(limit.min(MIN_PART_SIZE));
    (&mut *body)
        .take(limit as u64)
        .read_to_end(&mut buffer)
        .await?;
    Ok(buffer)
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

/// Map an SDK failure onto the vault taxonomy.
fn classify<E>(context: &str, err: SdkError<E, HttpResponse>) -> VaultError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = status_of(&err);
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            VaultError::TransientIo(message)
        }
        _ => match status {
            Some(404) => VaultError::NotFound(message),
            Some(401) | Some(403) => VaultError::Configuration(message),
            Some(429) => VaultError::TransientIo(message),
            Some(s) if s >= 500 => VaultError::TransientIo(message),
            _ => VaultError::UpstreamUnreachable(message),
        },
    }
}
