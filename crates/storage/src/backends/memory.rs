//! In-process storage backend.
//!
//! Objects live in a shared map and vanish with the process. Useful for tests
//! and for runs where direct uploads only need to be verified, not retained.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, MultipartUpload, ObjectMeta, ObjectStore, UploadOutcome, UploadSource,
    ensure_fresh, read_full,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use crc64fast_nvme::Digest as Crc64Digest;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

const PART_SIZE: usize = 64 * 1024;

type Objects = Arc<RwLock<HashMap<String, Bytes>>>;

/// In-memory object store.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Objects,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.objects.read().await;
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            last_modified: None,
            content_type: None,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(key).await?;
        let stream = async_stream::stream! {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + PART_SIZE).min(data.len());
                yield Ok(data.slice(offset..end));
                offset = end;
            }
        };
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn create_multipart(
        &self,
        key: &str,
        declared_length: u64,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        Ok(Box::new(MemoryMultipart {
            objects: self.objects.clone(),
            key: key.to_string(),
            declared_length,
            started: false,
            completed: false,
            uploaded: 0,
            crc64: None,
        }))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryMultipart {
    objects: Objects,
    key: String,
    declared_length: u64,
    started: bool,
    completed: bool,
    uploaded: u64,
    crc64: Option<u64>,
}

#[async_trait]
impl MultipartUpload for MemoryMultipart {
    fn key(&self) -> &str {
        &self.key
    }

    fn declared_length(&self) -> u64 {
        self.declared_length
    }

    async fn upload(&mut self, source: UploadSource<'_>) -> StorageResult<UploadOutcome> {
        ensure_fresh(&self.key, self.started)?;
        self.started = true;

        let mut body = BytesMut::new();
        let mut digest = Crc64Digest::new();
        let mut part = vec![0u8; PART_SIZE];
        loop {
            let n = read_full(source, &mut part).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&part[..n]);
            self.uploaded += n as u64;
        }
        // Checksum what is about to be stored, not what was read.
        let body = body.freeze();
        digest.write(&body);
        let crc64 = digest.sum64();

        self.objects.write().await.insert(self.key.clone(), body);
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
        Ok(())
    }
}
