//! Receiver that streams straight into an object-store multipart upload.

use crate::contract::{
    ArtifactReader, DataReceiver, ReceiveContext, ReceiveSource, ReceiverState, Session, Tier,
};
use crate::digest_stream::DigestReader;
use crate::error::{ReceiveError, ReceiveResult};
use crate::metrics::{self, TrafficMetrics};
use async_trait::async_trait;
use depot_core::{DigestCalculator, Digests, ReceiveConfig, Throughput, random_object_key};
use depot_storage::{MultipartUpload, ObjectStore, StorageError, UploadOutcome};
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, instrument, warn};

/// Why the stream pump stopped early.
enum PumpFailure {
    Receive(ReceiveError),
    Store(StorageError),
}

/// Streams a whole artifact into a scratch object, with no local tier.
///
/// Only [`receive_stream`](DataReceiver::receive_stream) is supported, once.
/// The object is scratch owned by the receiver: [`close`](DataReceiver::close)
/// deletes it, so callers copy it out first.
pub struct ObjectStoreReceiver {
    store: Arc<dyn ObjectStore>,
    key: String,
    declared_length: u64,
    buffer_len: usize,
    upload: Option<Box<dyn MultipartUpload>>,
    digests: Digests,
    received: u64,
    outcome: Option<UploadOutcome>,
    traffic: Arc<dyn TrafficMetrics>,
    session: Session,
    streamed: bool,
    closed: bool,
}

impl std::fmt::Debug for ObjectStoreReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreReceiver")
            .field("key", &self.key)
            .field("declared_length", &self.declared_length)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreReceiver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        declared_length: u64,
        config: &ReceiveConfig,
        context: &ReceiveContext,
    ) -> Self {
        Self {
            store,
            key: random_object_key(),
            declared_length,
            buffer_len: config.buffer_len(),
            upload: None,
            digests: DigestCalculator::new().digests(),
            received: 0,
            outcome: None,
            traffic: context.traffic.clone(),
            session: Session::new(
                "object",
                Some(declared_length),
                context.gate.clone(),
                config.circuit_breaker_threshold,
            ),
            streamed: false,
            closed: false,
        }
    }

    /// Key of the scratch object.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Result reported by the store, once the upload completed.
    pub fn outcome(&self) -> Option<UploadOutcome> {
        self.outcome
    }

    async fn open_upload(&mut self) -> ReceiveResult<Box<dyn MultipartUpload>> {
        if let Some(upload) = self.upload.take() {
            return Ok(upload);
        }
        let upload = self
            .store
            .create_multipart(&self.key, self.declared_length)
            .await
            .map_err(|e| ReceiveError::from_storage(e, 0))?;
        debug!(key = %self.key, declared = self.declared_length, "Opened multipart upload");
        Ok(upload)
    }

    #[instrument(skip(self, source), fields(backend = self.store.backend_name()))]
    async fn stream_upload(&mut self, source: ReceiveSource<'_>) -> ReceiveResult<u64> {
        let mut upload = self.open_upload().await?;

        let destination = metrics::object_destination(self.store.backend_name());
        let recorder = match self.traffic.recorder(&destination) {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                error!(destination = %destination, error = %e, "Failed to build traffic recorder");
                None
            }
        };
        let mut reader = DigestReader::new(source, recorder);
        let mut forwarded = 0u64;

        let (mut tx, mut rx) = tokio::io::duplex(self.buffer_len);
        let gate = self.session.gate().clone();
        let threshold = self.session.threshold();
        let buffer_len = self.buffer_len;

        let reader_ref = &mut reader;
        let forwarded_ref = &mut forwarded;
        // Owns `tx`: dropping the pump on failure ends the upload's input
        // without a clean shutdown.
        let pump = async move {
            let mut buf = vec![0u8; buffer_len];
            loop {
                let n = reader_ref
                    .read(&mut buf)
                    .await
                    .map_err(|e| PumpFailure::Receive(ReceiveError::from_io(e, *forwarded_ref)))?;
                if n == 0 {
                    break;
                }
                gate.check_before_write(n as u64, threshold)
                    .await
                    .map_err(|rejected| {
                        PumpFailure::Receive(ReceiveError::Overload {
                            received: *forwarded_ref,
                            reason: rejected.reason,
                        })
                    })?;
                tx.write_all(&buf[..n]).await.map_err(|e| {
                    PumpFailure::Receive(ReceiveError::StorageFailure {
                        received: *forwarded_ref,
                        source: Box::new(e),
                    })
                })?;
                *forwarded_ref += n as u64;
            }
            tx.shutdown().await.map_err(|e| {
                PumpFailure::Receive(ReceiveError::StorageFailure {
                    received: *forwarded_ref,
                    source: Box::new(e),
                })
            })?;
            Ok::<(), PumpFailure>(())
        };
        let push = async {
            upload
                .upload(&mut rx)
                .await
                .map_err(PumpFailure::Store)
        };

        // Either side failing drops the other before it can observe EOF, so
        // a failed source never completes a truncated upload.
        let joined = tokio::try_join!(pump, push);

        self.received = forwarded;
        self.digests = reader.digests();

        let result = match joined {
            Ok(((), outcome)) => {
                self.outcome = Some(outcome);
                info!(
                    key = %self.key,
                    bytes = outcome.uploaded_bytes,
                    "Streamed artifact to object store"
                );
                Ok(forwarded)
            }
            Err(failure) => {
                if !upload.is_completed()
                    && let Err(e) = upload.abort().await
                {
                    warn!(key = %self.key, error = %e, "Failed to abort multipart upload");
                }
                Err(match failure {
                    PumpFailure::Receive(e) => e,
                    PumpFailure::Store(e) => ReceiveError::from_storage(e, forwarded),
                })
            }
        };
        self.upload = Some(upload);
        result
    }

    /// Completion, declared length, received bytes and CRC-64 must all agree.
    fn check_size(&self) -> ReceiveResult<()> {
        let Some(upload) = &self.upload else {
            return Err(ReceiveError::mismatch(
                self.received,
                "no upload was started",
            ));
        };
        if !upload.is_completed() {
            return Err(ReceiveError::mismatch(
                self.received,
                format!("upload to {} did not complete", self.key),
            ));
        }
        let uploaded = upload.uploaded_bytes();
        if uploaded != self.declared_length {
            return Err(ReceiveError::mismatch(
                self.received,
                format!(
                    "declared {} bytes but uploaded {uploaded}",
                    self.declared_length
                ),
            ));
        }
        if uploaded != self.received {
            return Err(ReceiveError::mismatch(
                self.received,
                format!("uploaded {uploaded} bytes but received {}", self.received),
            ));
        }
        match upload.server_crc64() {
            Some(server) if server == self.digests.crc64 => Ok(()),
            Some(server) => Err(ReceiveError::mismatch(
                self.received,
                format!(
                    "crc64 mismatch: local {:016x}, store {server:016x}",
                    self.digests.crc64
                ),
            )),
            None => Err(ReceiveError::mismatch(
                self.received,
                "store reported no crc64",
            )),
        }
    }

    /// Drop the scratch object. Missing objects are not an error.
    async fn discard(&mut self) -> Result<(), StorageError> {
        if let Some(upload) = self.upload.as_mut()
            && !upload.is_completed()
        {
            upload.abort().await?;
        }
        match self.store.delete(&self.key).await {
            Ok(()) => {
                debug!(key = %self.key, "Deleted scratch object");
                Ok(())
            }
            Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn abort(&mut self, err: &ReceiveError) {
        self.session.fail(err);
        if let Err(e) = self.discard().await {
            warn!(key = %self.key, error = %e, "Cleanup after failed receive incomplete");
        }
    }

    fn unsupported(&self, what: &str) -> ReceiveError {
        ReceiveError::precondition(format!(
            "{what} is not supported by object-store receivers; use receive_stream"
        ))
    }
}

#[async_trait]
impl DataReceiver for ObjectStoreReceiver {
    async fn receive_chunk(&mut self, _chunk: &[u8]) -> ReceiveResult<()> {
        self.session.ensure_receiving()?;
        Err(self.unsupported("receive_chunk"))
    }

    async fn receive_byte(&mut self, _byte: u8) -> ReceiveResult<()> {
        self.session.ensure_receiving()?;
        Err(self.unsupported("receive_byte"))
    }

    async fn receive_stream(&mut self, source: ReceiveSource<'_>) -> ReceiveResult<u64> {
        self.session.ensure_receiving()?;
        if self.closed {
            return Err(ReceiveError::precondition("object-store receiver closed"));
        }
        if self.streamed {
            return Err(ReceiveError::precondition(
                "object-store receivers accept a single stream",
            ));
        }
        self.streamed = true;
        self.session.begin();

        let result = self.stream_upload(source).await;
        self.session.gate().finish_check(result.as_ref().err());
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    async fn finish(&mut self) -> ReceiveResult<Throughput> {
        if let Some(done) = self.session.finished_result() {
            return done;
        }
        if self.closed {
            return Err(ReceiveError::precondition("object-store receiver closed"));
        }
        match self.check_size() {
            Ok(()) => Ok(self.session.complete(self.received)),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn get_input_stream(&self) -> ReceiveResult<ArtifactReader> {
        self.session.ensure_finished()?;
        if self.closed {
            return Err(ReceiveError::precondition("object-store receiver closed"));
        }
        let stream = self
            .store
            .get_stream(&self.key)
            .await
            .map_err(|e| ReceiveError::from_storage(e, self.received))?;
        Ok(Box::pin(StreamReader::new(
            stream.map(|chunk| chunk.map_err(io::Error::other)),
        )))
    }

    async fn close(&mut self) -> ReceiveResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.abandon();
        self.discard()
            .await
            .map_err(|e| ReceiveError::from_storage(e, self.received))
    }

    fn received(&self) -> u64 {
        self.received
    }

    fn state(&self) -> ReceiverState {
        self.session.state()
    }

    fn tier(&self) -> Tier {
        Tier::Object
    }

    fn location(&self) -> String {
        format!("{}:{}", self.store.backend_name(), self.key)
    }

    fn digests(&self) -> Digests {
        self.digests
    }

    fn expected_length(&self) -> Option<u64> {
        self.session.expected_length()
    }

    fn throughput(&self) -> Option<Throughput> {
        self.session.throughput()
    }
}

impl Drop for ObjectStoreReceiver {
    fn drop(&mut self) {
        if !self.closed
            && self.upload.as_ref().is_some_and(|u| u.is_completed())
            && self.session.state() != ReceiverState::Failed
        {
            warn!(key = %self.key, "Object-store receiver dropped without close, scratch object left behind");
        }
    }
}
