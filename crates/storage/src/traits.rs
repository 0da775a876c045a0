//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Byte source consumed by a multipart upload.
pub type UploadSource<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// Object store abstraction for scratch and durable artifact storage.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Open a multipart upload session for `key`, declaring the expected total length.
    ///
    /// The backend does not enforce the declared length; the caller compares it
    /// against [`MultipartUpload::uploaded_bytes`] once the upload completes.
    async fn create_multipart(
        &self,
        key: &str,
        declared_length: u64,
    ) -> StorageResult<Box<dyn MultipartUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// Result of driving a source to completion through a multipart upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Bytes the store accepted.
    pub uploaded_bytes: u64,
    /// CRC-64/NVME of the stored object as computed by the store.
    pub crc64: u64,
}

/// A remote multipart upload session.
///
/// A session accepts exactly one source. Once [`upload`](Self::upload) returns
/// `Ok`, the object is visible under [`key`](Self::key).
#[async_trait]
pub trait MultipartUpload: Send + Sync {
    /// Object key the upload writes to.
    fn key(&self) -> &str;

    /// Length declared when the session was opened.
    fn declared_length(&self) -> u64;

    /// Read `source` to end, store it, and complete the upload.
    async fn upload(&mut self, source: UploadSource<'_>) -> StorageResult<UploadOutcome>;

    /// Whether the upload completed.
    fn is_completed(&self) -> bool;

    /// Bytes accepted so far.
    fn uploaded_bytes(&self) -> u64;

    /// Store-reported CRC-64/NVME, available once completed.
    fn server_crc64(&self) -> Option<u64>;

    /// Abort an incomplete upload and release any parts held by the store.
    async fn abort(&mut self) -> StorageResult<()>;
}

/// Fill `buf` from `source` until it is full or the source is exhausted.
///
/// Returns the number of bytes read. Read failures are reported as
/// [`StorageError::Source`].
pub(crate) async fn read_full(source: UploadSource<'_>, buf: &mut [u8]) -> StorageResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source
            .read(&mut buf[filled..])
            .await
            .map_err(StorageError::Source)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reject a second `upload` call on a session.
pub(crate) fn ensure_fresh(key: &str, started: bool) -> StorageResult<()> {
    if started {
        return Err(StorageError::UploadState(format!(
            "upload session for {key} already consumed its source"
        )));
    }
    Ok(())
}
