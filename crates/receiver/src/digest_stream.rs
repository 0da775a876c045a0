//! Read-side decorator that digests and meters a byte source.

use crate::metrics::TrafficRecorder;
use depot_core::{DigestCalculator, Digests};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::error;

/// Wraps an [`AsyncRead`], feeding every byte read into a
/// [`DigestCalculator`] and reporting each read to a traffic recorder.
///
/// Metric failures are logged and never surface to the reader.
pub struct DigestReader<R> {
    inner: R,
    digest: DigestCalculator,
    recorder: Option<Arc<dyn TrafficRecorder>>,
    last_sample: Instant,
}

impl<R: AsyncRead + Unpin> DigestReader<R> {
    pub fn new(inner: R, recorder: Option<Arc<dyn TrafficRecorder>>) -> Self {
        Self {
            inner,
            digest: DigestCalculator::new(),
            recorder,
            last_sample: Instant::now(),
        }
    }

    /// Bytes read through the decorator so far.
    pub fn bytes_read(&self) -> u64 {
        self.digest.bytes()
    }

    pub fn crc64(&self) -> u64 {
        self.digest.crc64()
    }

    pub fn digests(&self) -> Digests {
        self.digest.digests()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn sample(&mut self, bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample);
        self.last_sample = now;
        if let Some(recorder) = &self.recorder
            && let Err(e) = recorder.record(bytes, elapsed)
        {
            error!(error = %e, bytes, "Failed to record read traffic");
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if !fresh.is_empty() {
            this.digest.update(fresh);
            this.sample(fresh.len() as u64);
        }
        Poll::Ready(Ok(()))
    }
}
