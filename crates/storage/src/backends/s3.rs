//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, MultipartUpload, ObjectMeta, ObjectStore, UploadOutcome, UploadSource,
    ensure_fresh, read_full,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::types::{
    ChecksumAlgorithm, ChecksumType, CompletedMultipartUpload, CompletedPart,
};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 rejects multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Marker included in lazy-credentials errors so they map to actionable config
/// errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "depot-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "depot-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// Constructing the chain eagerly pulls in TLS root initialization, which fails
/// on hosts without native roots even when the endpoint is plain HTTP.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

/// Map an SDK error, turning a 404 into `NotFound`.
fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
        && service_err.raw().status().as_u16() == 404
    {
        return StorageError::NotFound(key.to_string());
    }
    map_s3_operation_error(err)
}

/// Decode an S3 `x-amz-checksum-crc64nvme` value (base64 of the big-endian CRC).
pub fn crc64_from_checksum(value: &str) -> StorageResult<u64> {
    let raw = BASE64
        .decode(value)
        .map_err(|e| StorageError::Checksum(format!("invalid CRC64NVME checksum {value:?}: {e}")))?;
    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
        StorageError::Checksum(format!(
            "CRC64NVME checksum must be 8 bytes, got {}",
            raw.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Encode a CRC-64/NVME value the way S3 reports it.
pub fn crc64_to_checksum(crc64: u64) -> String {
    BASE64.encode(crc64.to_be_bytes())
}

/// Part size that keeps an upload of `declared_length` bytes within S3's part limit.
fn part_size_for(declared_length: u64) -> usize {
    let needed = declared_length.div_ceil(MAX_PARTS);
    usize::try_from(needed)
        .unwrap_or(usize::MAX)
        .max(MIN_PART_SIZE)
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` URLs instead of
    /// `bucket.endpoint/key`. MinIO needs it; AWS S3 does not.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "depot-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region));
        }

        // Bare host:port endpoints (e.g. "minio:9000") are treated as plain HTTP.
        let normalized_endpoint = endpoint.map(|endpoint_url| {
            let lower = endpoint_url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match map_sdk_error(err, key) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use futures::StreamExt;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_multipart(
        &self,
        key: &str,
        declared_length: u64,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        let full_key = self.full_key(key);

        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .checksum_algorithm(ChecksumAlgorithm::Crc64Nvme)
            .checksum_type(ChecksumType::FullObject)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Multipart {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            full_key,
            upload_id,
            declared_length,
            parts: Vec::new(),
            uploaded: 0,
            started: false,
            completed: false,
            aborted: false,
            crc64: None,
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys, so check first to report NotFound.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let marker_key = self.full_key(".depot-health-check");

        let probe = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => match map_sdk_error(e, &marker_key) {
                    StorageError::NotFound(_) => Ok(()),
                    other => Err(other),
                },
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

/// Multipart session backed by an S3 multipart upload created with a
/// full-object CRC64NVME checksum.
struct S3Multipart {
    client: Client,
    bucket: String,
    key: String,
    full_key: String,
    upload_id: String,
    declared_length: u64,
    parts: Vec<CompletedPart>,
    uploaded: u64,
    started: bool,
    completed: bool,
    aborted: bool,
    crc64: Option<u64>,
}

impl S3Multipart {
    /// Upload a single part and track it.
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let part_number = self.parts.len() as i32 + 1;
        let len = data.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .checksum_algorithm(ChecksumAlgorithm::Crc64Nvme)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .set_checksum_crc64_nvme(output.checksum_crc64_nvme().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        self.uploaded += len;
        Ok(())
    }

    async fn send_parts(&mut self, source: UploadSource<'_>) -> StorageResult<u64> {
        let part_size = part_size_for(self.declared_length);
        loop {
            let mut part = vec![0u8; part_size];
            let n = read_full(source, &mut part).await?;
            if n == 0 {
                break;
            }
            part.truncate(n);
            self.upload_part(Bytes::from(part)).await?;
        }

        // S3 multipart requires at least one non-empty part; store empty
        // objects with PutObject instead.
        if self.parts.is_empty() {
            self.abort_remote().await;
            let output = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.full_key)
                .checksum_algorithm(ChecksumAlgorithm::Crc64Nvme)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            return self.reported_crc64(output.checksum_crc64_nvme());
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        self.reported_crc64(output.checksum_crc64_nvme())
    }

    fn reported_crc64(&self, value: Option<&str>) -> StorageResult<u64> {
        let value = value.ok_or_else(|| {
            StorageError::Checksum(format!(
                "S3 did not report a CRC64NVME checksum for {}",
                self.full_key
            ))
        })?;
        crc64_from_checksum(value)
    }

    /// Best-effort abort; failures only leave orphaned parts behind.
    async fn abort_remote(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key = %self.full_key,
                upload_id = %self.upload_id,
                error = %e,
                "Failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }
}

#[async_trait]
impl MultipartUpload for S3Multipart {
    fn key(&self) -> &str {
        &self.key
    }

    fn declared_length(&self) -> u64 {
        self.declared_length
    }

    #[instrument(skip(self, source), fields(backend = "s3"))]
    async fn upload(&mut self, source: UploadSource<'_>) -> StorageResult<UploadOutcome> {
        ensure_fresh(&self.key, self.started)?;
        self.started = true;

        match self.send_parts(source).await {
            Ok(crc64) => {
                self.completed = true;
                self.crc64 = Some(crc64);
                Ok(UploadOutcome {
                    uploaded_bytes: self.uploaded,
                    crc64,
                })
            }
            Err(e) => {
                self.abort_remote().await;
                Err(e)
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.completed
    }

    fn uploaded_bytes(&self) -> u64 {
        self.uploaded
    }

    fn server_crc64(&self) -> Option<u64> {
        self.crc64
    }

    async fn abort(&mut self) -> StorageResult<()> {
        self.started = true;
        if self.completed || self.aborted {
            return Ok(());
        }
        self.aborted = true;
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}
