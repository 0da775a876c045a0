//! Artifact ingestion core.
//!
//! Receivers accept an upload's bytes and decide where they land:
//! - [`TieredReceiver`] buffers in memory, spills to a temp file past a
//!   threshold, and moves to a fallback root when storage health degrades
//! - [`ObjectStoreReceiver`] streams straight into an object-store multipart
//!   upload and verifies length and CRC-64 against the store
//!
//! Both implement [`DataReceiver`]; [`ReceiverFactory`] picks one per upload.

pub mod contract;
pub mod digest_stream;
pub mod direct;
pub mod error;
pub mod factory;
pub mod gate;
pub mod health;
pub mod metrics;
pub mod tiered;

pub use contract::{ArtifactReader, DataReceiver, ReceiveContext, ReceiveSource, ReceiverState, Tier};
pub use digest_stream::DigestReader;
pub use direct::ObjectStoreReceiver;
pub use error::{ReceiveError, ReceiveErrorKind, ReceiveResult, is_client_disconnect};
pub use factory::ReceiverFactory;
pub use gate::{BandwidthGate, GateRejected, OpenGate, WriteGate};
pub use health::{FallbackRequest, FallbackSignal, HealthObserver, StorageHealthMonitor};
pub use metrics::{MetricsError, PrometheusTraffic, TrafficMetrics, TrafficRecorder};
pub use tiered::TieredReceiver;
