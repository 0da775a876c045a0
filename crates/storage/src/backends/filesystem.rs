//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, MultipartUpload, ObjectMeta, ObjectStore, UploadOutcome, UploadSource,
    ensure_fresh, read_full,
};
use async_trait::async_trait;
use bytes::Bytes;
use crc64fast_nvme::Digest as Crc64Digest;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads and multipart copies (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem object store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root without blocking the runtime.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Resolve a key under the root, rejecting anything that would escape it.
    ///
    /// Existing paths are canonicalized and checked directly. For new paths the
    /// nearest existing ancestor is checked instead, so a symlinked directory
    /// cannot be used to create files outside the root.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('\\')
            || !Path::new(key)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;
        let path = root.join(key);

        let mut probe = Some(path.as_path());
        while let Some(candidate) = probe {
            match std::fs::symlink_metadata(candidate) {
                Ok(meta) => {
                    let canonical = candidate.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    probe = candidate.parent();
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(path)
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// Sibling path used while an object is being written.
/// Unique per writer so concurrent writes to one key never share a temp file.
fn staging_path(path: &Path) -> PathBuf {
    let suffix = format!(".tmp.{}", Uuid::new_v4());
    let name = path
        .file_name()
        .map(|n| format!("{}{suffix}", n.to_string_lossy()))
        .unwrap_or(suffix);
    path.with_file_name(name)
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = staging_path(&path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_multipart(
        &self,
        key: &str,
        declared_length: u64,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        Ok(Box::new(FilesystemMultipart {
            key: key.to_string(),
            final_path: path,
            declared_length,
            started: false,
            completed: false,
            uploaded: 0,
            crc64: None,
            staging: None,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Multipart session for the filesystem backend.
///
/// Streams the source into a staging file, checksumming each chunk as it is
/// written, then fsyncs and renames it into place.
struct FilesystemMultipart {
    key: String,
    final_path: PathBuf,
    declared_length: u64,
    started: bool,
    completed: bool,
    uploaded: u64,
    crc64: Option<u64>,
    /// Staging file of an upload that has not been renamed into place.
    /// Outlives a cancelled `upload` so `abort` can remove it.
    staging: Option<PathBuf>,
}

impl FilesystemMultipart {
    async fn write_staged(
        &mut self,
        source: UploadSource<'_>,
        temp_path: &Path,
    ) -> StorageResult<u64> {
        let mut file = fs::File::create(temp_path).await?;
        let mut digest = Crc64Digest::new();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = read_full(source, &mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            digest.write(&buf[..n]);
            self.uploaded += n as u64;
        }
        file.sync_all().await?;
        Ok(digest.sum64())
    }
}

#[async_trait]
impl MultipartUpload for FilesystemMultipart {
    fn key(&self) -> &str {
        &self.key
    }

    fn declared_length(&self) -> u64 {
        self.declared_length
    }

    #[instrument(skip(self, source), fields(backend = "filesystem"))]
    async fn upload(&mut self, source: UploadSource<'_>) -> StorageResult<UploadOutcome> {
        ensure_fresh(&self.key, self.started)?;
        self.started = true;

        let temp_path = staging_path(&self.final_path);
        self.staging = Some(temp_path.clone());
        let crc64 = match self.write_staged(source, &temp_path).await {
            Ok(crc64) => crc64,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp_path, &self.final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        self.staging = None;

        self.completed = true;
        self.crc64 = Some(crc64);
        Ok(UploadOutcome {
            uploaded_bytes: self.uploaded,
            crc64,
        })
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
        let Some(temp_path) = self.staging.take() else {
            return Ok(());
        };
        match fs::remove_file(&temp_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
