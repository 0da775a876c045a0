//! Test doubles for the receiver's collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use depot_receiver::{
    GateRejected, MetricsError, ReceiveError, ReceiveErrorKind, TrafficMetrics, TrafficRecorder,
    WriteGate,
};
use depot_storage::{
    ByteStream, MemoryBackend, MultipartUpload, ObjectMeta, ObjectStore, StorageResult,
    UploadOutcome, UploadSource,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

/// Gate that admits everything and counts what it saw.
#[derive(Default)]
pub struct CountingGate {
    pub admitted: AtomicU64,
    pub finish_calls: AtomicU64,
    pub last_error: Mutex<Option<ReceiveErrorKind>>,
}

#[async_trait]
impl WriteGate for CountingGate {
    async fn check_before_write(
        &self,
        bytes: u64,
        _threshold: Option<u64>,
    ) -> Result<(), GateRejected> {
        self.admitted.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn finish_check(&self, error: Option<&ReceiveError>) {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = error.map(ReceiveError::kind);
    }
}

/// Gate that admits up to `allow` bytes, then rejects.
pub struct RejectingGate {
    allow: u64,
    admitted: AtomicU64,
}

impl RejectingGate {
    pub fn new(allow: u64) -> Self {
        Self {
            allow,
            admitted: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl WriteGate for RejectingGate {
    async fn check_before_write(
        &self,
        bytes: u64,
        _threshold: Option<u64>,
    ) -> Result<(), GateRejected> {
        let admitted = self.admitted.load(Ordering::SeqCst);
        if admitted + bytes > self.allow {
            return Err(GateRejected {
                reason: "bandwidth exhausted".into(),
            });
        }
        self.admitted.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenRecorder;

impl TrafficRecorder for BrokenRecorder {
    fn record(&self, _bytes: u64, _elapsed: Duration) -> Result<(), MetricsError> {
        Err(MetricsError::Encode("recorder offline".into()))
    }
}

/// Metrics whose recorders always fail, or cannot even be built.
pub struct FailingTraffic {
    pub fail_lookup: bool,
    pub lookups: AtomicU64,
}

impl FailingTraffic {
    pub fn new(fail_lookup: bool) -> Self {
        Self {
            fail_lookup,
            lookups: AtomicU64::new(0),
        }
    }
}

impl TrafficMetrics for FailingTraffic {
    fn recorder(&self, _destination: &str) -> Result<Arc<dyn TrafficRecorder>, MetricsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup {
            return Err(MetricsError::Encode("registry offline".into()));
        }
        Ok(Arc::new(BrokenRecorder))
    }
}

struct NullRecorder;

impl TrafficRecorder for NullRecorder {
    fn record(&self, _bytes: u64, _elapsed: Duration) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Metrics that remember every destination a recorder was requested for.
#[derive(Default)]
pub struct RecordingTraffic {
    pub destinations: Mutex<Vec<String>>,
}

impl RecordingTraffic {
    pub fn destinations(&self) -> Vec<String> {
        self.destinations.lock().unwrap().clone()
    }
}

impl TrafficMetrics for RecordingTraffic {
    fn recorder(&self, destination: &str) -> Result<Arc<dyn TrafficRecorder>, MetricsError> {
        self.destinations
            .lock()
            .unwrap()
            .push(destination.to_string());
        Ok(Arc::new(NullRecorder))
    }
}

/// Source that yields `data`, then fails with `kind`.
pub struct FailingSource {
    data: Vec<u8>,
    pos: usize,
    kind: io::ErrorKind,
}

impl FailingSource {
    pub fn new(data: impl Into<Vec<u8>>, kind: io::ErrorKind) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            kind,
        }
    }
}

impl AsyncRead for FailingSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Ready(Err(self.kind.into()));
        }
        let start = self.pos;
        let n = (self.data.len() - start).min(buf.remaining());
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// In-memory store whose uploads report a corrupted CRC-64.
#[derive(Clone, Default)]
pub struct TamperingStore {
    pub inner: MemoryBackend,
}

#[async_trait]
impl ObjectStore for TamperingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn create_multipart(
        &self,
        key: &str,
        declared_length: u64,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        let inner = self.inner.create_multipart(key, declared_length).await?;
        Ok(Box::new(TamperedUpload { inner }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "tampering"
    }
}

struct TamperedUpload {
    inner: Box<dyn MultipartUpload>,
}

#[async_trait]
impl MultipartUpload for TamperedUpload {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn declared_length(&self) -> u64 {
        self.inner.declared_length()
    }

    async fn upload(&mut self, source: UploadSource<'_>) -> StorageResult<UploadOutcome> {
        let outcome = self.inner.upload(source).await?;
        Ok(UploadOutcome {
            crc64: outcome.crc64 ^ 1,
            ..outcome
        })
    }

    fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    fn uploaded_bytes(&self) -> u64 {
        self.inner.uploaded_bytes()
    }

    fn server_crc64(&self) -> Option<u64> {
        self.inner.server_crc64().map(|crc| crc ^ 1)
    }

    async fn abort(&mut self) -> StorageResult<()> {
        self.inner.abort().await
    }
}
