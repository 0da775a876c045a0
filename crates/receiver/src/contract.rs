//! The lifecycle shared by every receiver.
//!
//! A receiver moves `Init -> Receiving -> Finished`, or to `Failed` on any
//! propagated error. Both terminal states accept only [`DataReceiver::close`]
//! (and, once finished successfully, reads of the persisted bytes).

use crate::error::{ReceiveError, ReceiveResult};
use crate::gate::{OpenGate, WriteGate};
use crate::metrics::{self, PrometheusTraffic, TrafficMetrics};
use async_trait::async_trait;
use depot_core::{Digests, Throughput};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tracing::{debug, error};

/// A fresh readable view of persisted bytes.
pub type ArtifactReader = Pin<Box<dyn AsyncRead + Send>>;

/// Source drained by [`DataReceiver::receive_stream`].
pub type ReceiveSource<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Init,
    Receiving,
    Finished,
    Failed,
}

impl ReceiverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Where a receiver's authoritative bytes currently live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Memory,
    File,
    Object,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upload's byte receiver.
///
/// Mutating operations take `&mut self`: a receiver has exactly one writer.
#[async_trait]
pub trait DataReceiver: Send + Sync {
    /// Ingest a chunk.
    async fn receive_chunk(&mut self, chunk: &[u8]) -> ReceiveResult<()>;

    /// Ingest a single byte.
    async fn receive_byte(&mut self, byte: u8) -> ReceiveResult<()>;

    /// Drain `source` to end. Returns the number of bytes taken from it.
    async fn receive_stream(&mut self, source: ReceiveSource<'_>) -> ReceiveResult<u64>;

    /// Verify the persisted size and mark the receive finished.
    ///
    /// Calling again after success returns the same throughput.
    async fn finish(&mut self) -> ReceiveResult<Throughput>;

    /// Open the persisted bytes for reading. Only valid once finished.
    async fn get_input_stream(&self) -> ReceiveResult<ArtifactReader>;

    /// Release every resource the receiver owns. Safe to call repeatedly
    /// and after a failure.
    async fn close(&mut self) -> ReceiveResult<()>;

    fn received(&self) -> u64;

    fn state(&self) -> ReceiverState;

    fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    fn tier(&self) -> Tier;

    /// Human-readable location of the authoritative bytes.
    fn location(&self) -> String;

    /// Digests of everything received so far.
    fn digests(&self) -> Digests;

    fn expected_length(&self) -> Option<u64>;

    /// Throughput of a successful receive.
    fn throughput(&self) -> Option<Throughput>;
}

/// Collaborators shared by receivers built from the same factory.
#[derive(Clone)]
pub struct ReceiveContext {
    pub gate: Arc<dyn WriteGate>,
    pub traffic: Arc<dyn TrafficMetrics>,
}

impl ReceiveContext {
    pub fn new(gate: Arc<dyn WriteGate>, traffic: Arc<dyn TrafficMetrics>) -> Self {
        Self { gate, traffic }
    }
}

impl Default for ReceiveContext {
    fn default() -> Self {
        Self {
            gate: Arc::new(OpenGate),
            traffic: Arc::new(PrometheusTraffic::new()),
        }
    }
}

impl fmt::Debug for ReceiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveContext").finish_non_exhaustive()
    }
}

/// State machine and gate wiring shared by both receivers.
pub(crate) struct Session {
    kind: &'static str,
    expected_length: Option<u64>,
    state: ReceiverState,
    started: Instant,
    throughput: Option<Throughput>,
    gate: Arc<dyn WriteGate>,
    threshold: Option<u64>,
}

impl Session {
    pub(crate) fn new(
        kind: &'static str,
        expected_length: Option<u64>,
        gate: Arc<dyn WriteGate>,
        threshold: Option<u64>,
    ) -> Self {
        Self {
            kind,
            expected_length,
            state: ReceiverState::Init,
            started: Instant::now(),
            throughput: None,
            gate,
            threshold,
        }
    }

    pub(crate) fn state(&self) -> ReceiverState {
        self.state
    }

    pub(crate) fn expected_length(&self) -> Option<u64> {
        self.expected_length
    }

    pub(crate) fn throughput(&self) -> Option<Throughput> {
        self.throughput
    }

    pub(crate) fn gate(&self) -> &Arc<dyn WriteGate> {
        &self.gate
    }

    pub(crate) fn threshold(&self) -> Option<u64> {
        self.threshold
    }

    /// Reject receive calls on a terminal session.
    pub(crate) fn ensure_receiving(&self) -> ReceiveResult<()> {
        match self.state {
            ReceiverState::Init | ReceiverState::Receiving => Ok(()),
            ReceiverState::Finished => Err(ReceiveError::precondition(format!(
                "{} receiver already finished",
                self.kind
            ))),
            ReceiverState::Failed => Err(ReceiveError::precondition(format!(
                "{} receiver already failed",
                self.kind
            ))),
        }
    }

    pub(crate) fn ensure_finished(&self) -> ReceiveResult<()> {
        if self.state == ReceiverState::Finished {
            Ok(())
        } else {
            Err(ReceiveError::precondition(format!(
                "{} receiver is not finished",
                self.kind
            )))
        }
    }

    pub(crate) fn begin(&mut self) {
        if self.state == ReceiverState::Init {
            self.state = ReceiverState::Receiving;
        }
    }

    /// Run the write gate for `bytes` more bytes.
    pub(crate) async fn admit(&self, bytes: u64, received: u64) -> ReceiveResult<()> {
        self.gate
            .check_before_write(bytes, self.threshold)
            .await
            .map_err(|rejected| ReceiveError::Overload {
                received,
                reason: rejected.reason,
            })
    }

    /// Outcome of a repeated `finish`, if the session is already terminal.
    pub(crate) fn finished_result(&self) -> Option<ReceiveResult<Throughput>> {
        match self.state {
            ReceiverState::Finished => self.throughput.map(Ok),
            ReceiverState::Failed => Some(Err(ReceiveError::precondition(format!(
                "{} receiver failed and cannot finish",
                self.kind
            )))),
            ReceiverState::Init | ReceiverState::Receiving => None,
        }
    }

    pub(crate) fn complete(&mut self, received: u64) -> Throughput {
        let throughput = Throughput::new(received, self.started.elapsed());
        self.state = ReceiverState::Finished;
        self.throughput = Some(throughput);
        if let Some(rate) = throughput.bytes_per_second() {
            metrics::record_throughput(rate);
        }
        debug!(kind = self.kind, %throughput, "Receive finished");
        throughput
    }

    pub(crate) fn fail(&mut self, err: &ReceiveError) {
        self.state = ReceiverState::Failed;
        metrics::record_error(err.kind().as_str());
        error!(kind = self.kind, error = %err, error_kind = %err.kind(), "Receive failed");
    }

    /// Mark a session that is closed before finishing as failed, quietly.
    pub(crate) fn abandon(&mut self) {
        if !self.state.is_terminal() {
            debug!(kind = self.kind, "Receiver closed before finish");
            self.state = ReceiverState::Failed;
        }
    }
}
