pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{seeded_bytes, sha256_hash};
#[allow(unused_imports)]
pub use mocks::{
    CountingGate, FailingSource, FailingTraffic, RecordingTraffic, RejectingGate, TamperingStore,
};

use depot_receiver::{ArtifactReader, DataReceiver};
use tokio::io::AsyncReadExt;

/// Read a finished receiver's persisted bytes to the end.
#[allow(dead_code)]
pub async fn read_back(receiver: &dyn DataReceiver) -> Vec<u8> {
    let mut reader: ArtifactReader = receiver.get_input_stream().await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}
