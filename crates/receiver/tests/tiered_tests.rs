// Tiered receiver behaviour: memory to disk spill, health-driven fallback,
// failure classification and cleanup.

mod common;

use common::{
    CountingGate, FailingSource, FailingTraffic, RecordingTraffic, RejectingGate, read_back,
    seeded_bytes, sha256_hash,
};
use depot_core::ReceiveConfig;
use depot_receiver::{
    DataReceiver, ReceiveContext, ReceiveErrorKind, ReceiverState, Tier, TieredReceiver,
    TrafficMetrics, WriteGate,
};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

const MIB: usize = 1024 * 1024;

fn config(root: &Path, threshold: u64) -> ReceiveConfig {
    ReceiveConfig {
        file_size_threshold: threshold,
        temp_path: root.to_path_buf(),
        ..ReceiveConfig::default()
    }
}

fn tiered(root: &Path, threshold: u64) -> TieredReceiver {
    TieredReceiver::new(&config(root, threshold), None, &ReceiveContext::default())
}

fn with_context(
    root: &Path,
    threshold: u64,
    gate: Arc<dyn WriteGate>,
    traffic: Arc<dyn TrafficMetrics>,
) -> TieredReceiver {
    TieredReceiver::new(
        &config(root, threshold),
        None,
        &ReceiveContext::new(gate, traffic),
    )
}

#[tokio::test]
async fn test_large_receive_spills_and_digest_matches() {
    let temp = TempDir::new().unwrap();
    let payload = seeded_bytes(1, 10 * MIB);
    let mut receiver = tiered(temp.path(), MIB as u64);

    let mut flipped_at = None;
    for chunk in payload.chunks(64 * 1024) {
        receiver.receive_chunk(chunk).await.unwrap();
        if flipped_at.is_none() && !receiver.is_in_memory() {
            flipped_at = Some(receiver.received());
        }
    }
    // The first chunk boundary past 1 MiB.
    assert_eq!(flipped_at, Some(MIB as u64 + 64 * 1024));

    let throughput = receiver.finish().await.unwrap();
    assert_eq!(throughput.bytes, 10 * MIB as u64);
    assert_eq!(receiver.tier(), Tier::File);
    assert_eq!(
        std::fs::metadata(receiver.file_path()).unwrap().len(),
        10 * MIB as u64
    );
    assert_eq!(receiver.digests().sha256.to_hex(), sha256_hash(&payload));

    let persisted = read_back(&receiver).await;
    assert_eq!(sha256_hash(&persisted), sha256_hash(&payload));
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_small_receive_stays_in_memory() {
    let temp = TempDir::new().unwrap();
    let payload = seeded_bytes(2, 500);
    let mut receiver = tiered(temp.path(), MIB as u64);

    let mut source: &[u8] = &payload;
    assert_eq!(receiver.receive_stream(&mut source).await.unwrap(), 500);
    receiver.finish().await.unwrap();

    assert!(receiver.is_in_memory());
    assert_eq!(receiver.tier(), Tier::Memory);
    assert!(!receiver.file_path().exists());
    assert_eq!(read_back(&receiver).await, payload.to_vec());
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_in_memory_flips_once_exactly_past_threshold() {
    let temp = TempDir::new().unwrap();
    let threshold = 1000u64;
    let payload = seeded_bytes(3, 5000);
    let mut receiver = tiered(temp.path(), threshold);

    let mut flips = 0;
    let mut was_in_memory = true;
    for chunk in payload.chunks(37) {
        receiver.receive_chunk(chunk).await.unwrap();
        let now_in_memory = receiver.is_in_memory();
        assert_eq!(now_in_memory, receiver.received() <= threshold);
        if was_in_memory && !now_in_memory {
            flips += 1;
        }
        assert!(was_in_memory || !now_in_memory, "flipped back to memory");
        was_in_memory = now_in_memory;
    }
    assert_eq!(flips, 1);

    receiver.finish().await.unwrap();
    assert_eq!(read_back(&receiver).await, payload.to_vec());
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_byte_at_a_time_matches_chunked_digest() {
    let temp = TempDir::new().unwrap();
    let payload = seeded_bytes(4, 300);

    let mut bytewise = tiered(temp.path(), 100);
    for b in payload.iter() {
        bytewise.receive_byte(*b).await.unwrap();
    }
    bytewise.finish().await.unwrap();

    let mut chunked = tiered(temp.path(), 1000);
    chunked.receive_chunk(&payload).await.unwrap();
    chunked.finish().await.unwrap();

    assert!(!bytewise.is_in_memory());
    assert!(chunked.is_in_memory());
    assert_eq!(bytewise.digests(), chunked.digests());

    bytewise.close().await.unwrap();
    chunked.close().await.unwrap();
}

#[tokio::test]
async fn test_fallback_transfers_file_mid_receive() {
    let primary = TempDir::new().unwrap();
    let alt = TempDir::new().unwrap();
    let payload = seeded_bytes(5, 3 * MIB);
    let mut receiver = tiered(primary.path(), MIB as u64);

    receiver.receive_chunk(&payload[..2 * MIB]).await.unwrap();
    assert!(!receiver.is_in_memory());
    let original = receiver.file_path();
    assert!(original.exists());

    receiver.unhealthy(Some(alt.path().to_path_buf()), "probe timed out");
    // Nothing moves until the next write.
    assert!(original.exists());

    receiver.receive_chunk(&payload[2 * MIB..]).await.unwrap();
    assert!(receiver.is_fallback());
    assert!(!original.exists());
    assert!(receiver.file_path().starts_with(alt.path()));

    receiver.finish().await.unwrap();
    let persisted = std::fs::read(receiver.file_path()).unwrap();
    assert_eq!(persisted.len(), 3 * MIB);
    assert_eq!(sha256_hash(&persisted), sha256_hash(&payload));
    assert_eq!(receiver.digests().sha256.to_hex(), sha256_hash(&payload));

    receiver.close().await.unwrap();
    assert!(!receiver.file_path().exists());
}

#[tokio::test]
async fn test_fallback_applied_at_most_once() {
    let primary = TempDir::new().unwrap();
    let alt = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let mut receiver = tiered(primary.path(), 100);

    receiver.receive_chunk(&[1u8; 200]).await.unwrap();
    receiver.unhealthy(Some(alt.path().to_path_buf()), "first");
    receiver.unhealthy(Some(other.path().to_path_buf()), "ignored before transfer");
    receiver.receive_chunk(&[2u8; 10]).await.unwrap();
    let moved = receiver.file_path();
    assert!(moved.starts_with(alt.path()));

    receiver.unhealthy(Some(other.path().to_path_buf()), "ignored after transfer");
    receiver.receive_chunk(&[3u8; 10]).await.unwrap();
    assert_eq!(receiver.file_path(), moved);
    assert_eq!(std::fs::read_dir(other.path()).unwrap().count(), 0);

    receiver.finish().await.unwrap();
    assert_eq!(std::fs::metadata(&moved).unwrap().len(), 220);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_fallback_declined_when_transfer_disabled() {
    let primary = TempDir::new().unwrap();
    let alt = TempDir::new().unwrap();
    let mut receiver = tiered(primary.path(), 100).with_transfer(false);

    receiver.receive_chunk(&[1u8; 200]).await.unwrap();
    let original = receiver.file_path();
    receiver.unhealthy(Some(alt.path().to_path_buf()), "degraded");
    receiver.receive_chunk(&[2u8; 50]).await.unwrap();

    assert!(!receiver.is_fallback());
    assert_eq!(receiver.file_path(), original);
    assert_eq!(std::fs::read_dir(alt.path()).unwrap().count(), 0);

    receiver.finish().await.unwrap();
    assert_eq!(std::fs::metadata(&original).unwrap().len(), 250);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_fallback_without_path_is_noop() {
    let temp = TempDir::new().unwrap();
    let mut receiver = tiered(temp.path(), 100);
    receiver.receive_chunk(&[1u8; 200]).await.unwrap();
    let original = receiver.file_path();

    receiver.unhealthy(None, "no fallback configured");
    receiver.receive_chunk(&[1u8; 10]).await.unwrap();
    assert!(!receiver.is_fallback());
    assert_eq!(receiver.file_path(), original);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_transfer_fails_receive_and_cleans_up() {
    let primary = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    // A regular file where the fallback directory should be: the copy cannot land.
    let blocker = outside.path().join("not-a-dir");
    std::fs::write(&blocker, b"occupied").unwrap();

    let mut receiver = tiered(primary.path(), 100);
    receiver.receive_chunk(&[1u8; 200]).await.unwrap();
    let original = receiver.file_path();
    assert!(original.exists());

    receiver.unhealthy(Some(blocker.clone()), "degraded");
    let err = receiver.receive_chunk(&[2u8; 50]).await.unwrap_err();

    assert_eq!(err.kind(), ReceiveErrorKind::StorageFailure);
    assert_eq!(err.received(), Some(200));
    assert_eq!(receiver.state(), ReceiverState::Failed);
    assert!(!receiver.is_fallback());
    assert!(!original.exists());
    assert_eq!(std::fs::read_dir(primary.path()).unwrap().count(), 0);
    assert_eq!(std::fs::read(&blocker).unwrap(), b"occupied");
    assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 1);

    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_sharded_fallback_rederives_shard() {
    let primary = TempDir::new().unwrap();
    let alt = TempDir::new().unwrap();
    let cfg = ReceiveConfig {
        sharded_path: true,
        ..config(primary.path(), 10)
    };
    let mut receiver = TieredReceiver::new(&cfg, None, &ReceiveContext::default());

    receiver.receive_chunk(&[9u8; 64]).await.unwrap();
    let before = receiver.file_path();
    let shard = before.strip_prefix(primary.path()).unwrap().to_path_buf();

    receiver.unhealthy(Some(alt.path().to_path_buf()), "degraded");
    receiver.receive_chunk(&[9u8; 1]).await.unwrap();
    assert_eq!(receiver.file_path(), alt.path().join(&shard));

    // The primary shard directories existed only for this file.
    assert_eq!(std::fs::read_dir(primary.path()).unwrap().count(), 0);

    receiver.close().await.unwrap();
    assert_eq!(std::fs::read_dir(alt.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_receive_after_finish_is_precondition_violation() {
    let temp = TempDir::new().unwrap();
    let mut receiver = tiered(temp.path(), 100);
    receiver.receive_chunk(b"payload").await.unwrap();
    receiver.finish().await.unwrap();

    let err = receiver.receive_chunk(b"more").await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::PreconditionViolation);
    let err = receiver.receive_byte(1).await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::PreconditionViolation);
    let mut source: &[u8] = b"stream";
    let err = receiver.receive_stream(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::PreconditionViolation);

    assert_eq!(receiver.received(), 7);
    assert_eq!(receiver.state(), ReceiverState::Finished);
    assert_eq!(read_back(&receiver).await, b"payload");
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_on_disk_size_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let cfg = ReceiveConfig {
        buffer_size: 1024,
        ..config(temp.path(), 100)
    };
    let mut receiver = TieredReceiver::new(&cfg, None, &ReceiveContext::default());
    receiver.receive_chunk(&[0u8; 500]).await.unwrap();

    // Grow the file past anything the receiver still has buffered.
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(receiver.file_path())
            .unwrap();
        file.write_all(&[0xAA; 4096]).unwrap();
    }

    let err = receiver.finish().await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::IntegrityMismatch);
    assert_eq!(err.received(), Some(500));
    assert_eq!(receiver.state(), ReceiverState::Failed);
    assert!(!receiver.file_path().exists());

    let err = receiver.finish().await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::PreconditionViolation);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_classified_and_cleaned_up() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(CountingGate::default());
    let mut receiver = with_context(
        temp.path(),
        100,
        gate.clone(),
        Arc::new(RecordingTraffic::default()),
    );

    let mut source = FailingSource::new(vec![7u8; 5000], io::ErrorKind::ConnectionReset);
    let err = receiver.receive_stream(&mut source).await.unwrap_err();

    assert_eq!(err.kind(), ReceiveErrorKind::ClientAborted);
    assert_eq!(err.received(), Some(5000));
    assert_eq!(receiver.state(), ReceiverState::Failed);
    assert!(!receiver.file_path().exists());
    assert_eq!(gate.finish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *gate.last_error.lock().unwrap(),
        Some(ReceiveErrorKind::ClientAborted)
    );

    let err = receiver.receive_chunk(b"late").await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::PreconditionViolation);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_other_source_errors_are_storage_failures() {
    let temp = TempDir::new().unwrap();
    let mut receiver = tiered(temp.path(), 100);
    let mut source = FailingSource::new(vec![1u8; 10], io::ErrorKind::PermissionDenied);
    let err = receiver.receive_stream(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::StorageFailure);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_gate_rejection_is_overload_without_write() {
    let temp = TempDir::new().unwrap();
    let mut receiver = with_context(
        temp.path(),
        100,
        Arc::new(RejectingGate::new(300)),
        Arc::new(RecordingTraffic::default()),
    );

    receiver.receive_chunk(&[1u8; 300]).await.unwrap();
    let path = receiver.file_path();
    assert!(path.exists());

    let err = receiver.receive_chunk(&[1u8; 1]).await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::Overload);
    assert_eq!(err.received(), Some(300));
    assert_eq!(receiver.received(), 300);
    assert_eq!(receiver.state(), ReceiverState::Failed);
    assert!(!path.exists());
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_stream_reports_success_to_gate() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(CountingGate::default());
    let mut receiver = with_context(
        temp.path(),
        MIB as u64,
        gate.clone(),
        Arc::new(RecordingTraffic::default()),
    );
    let payload = seeded_bytes(6, 200_000);
    let mut source: &[u8] = &payload;
    receiver.receive_stream(&mut source).await.unwrap();

    assert_eq!(gate.admitted.load(Ordering::SeqCst), 200_000);
    assert_eq!(gate.finish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*gate.last_error.lock().unwrap(), None);
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_metrics_failures_never_abort_receive() {
    let temp = TempDir::new().unwrap();
    for fail_lookup in [false, true] {
        let traffic = Arc::new(FailingTraffic::new(fail_lookup));
        let mut receiver = with_context(
            temp.path(),
            100,
            Arc::new(CountingGate::default()),
            traffic.clone(),
        );
        let payload = seeded_bytes(7, 1000);
        for chunk in payload.chunks(100) {
            receiver.receive_chunk(chunk).await.unwrap();
        }
        receiver.finish().await.unwrap();
        assert_eq!(read_back(&receiver).await, payload.to_vec());
        assert!(traffic.lookups.load(Ordering::SeqCst) >= 1);
        receiver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_recorder_follows_destination() {
    let primary = TempDir::new().unwrap();
    let alt = TempDir::new().unwrap();
    let traffic = Arc::new(RecordingTraffic::default());
    let mut receiver = with_context(
        primary.path(),
        100,
        Arc::new(CountingGate::default()),
        traffic.clone(),
    );

    receiver.receive_chunk(&[0u8; 50]).await.unwrap();
    receiver.receive_chunk(&[0u8; 50]).await.unwrap();
    receiver.receive_chunk(&[0u8; 50]).await.unwrap();
    receiver.receive_chunk(&[0u8; 50]).await.unwrap();
    receiver.unhealthy(Some(alt.path().to_path_buf()), "degraded");
    receiver.receive_chunk(&[0u8; 50]).await.unwrap();

    assert_eq!(
        traffic.destinations(),
        vec![
            "memory".to_string(),
            format!("file:{}", primary.path().display()),
            format!("file:{}", alt.path().display()),
        ]
    );
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_keeps_preexisting_directories() {
    let temp = TempDir::new().unwrap();
    let keep = temp.path().join("keep");
    std::fs::create_dir(&keep).unwrap();

    // Two fresh levels under an existing root.
    let root = temp.path().join("created").join("temp");
    let mut receiver = tiered(&root, 10);
    receiver.receive_chunk(&[0u8; 64]).await.unwrap();
    assert!(root.exists());

    receiver.close().await.unwrap();
    assert!(!temp.path().join("created").exists());
    assert!(keep.exists());
    assert!(temp.path().exists());
}

#[tokio::test]
async fn test_cleanup_stops_at_non_empty_directory() {
    let temp = TempDir::new().unwrap();
    let shared = temp.path().join("shared");

    let mut first = tiered(&shared, 10);
    first.receive_chunk(&[0u8; 64]).await.unwrap();
    let mut second = tiered(&shared, 10);
    second.receive_chunk(&[0u8; 64]).await.unwrap();

    first.close().await.unwrap();
    assert!(shared.exists());
    assert!(second.file_path().exists());

    second.close().await.unwrap();
    assert!(!second.file_path().exists());
    // `shared` predates the second receiver's file, so it is left in place.
    assert!(shared.exists());
}

#[tokio::test]
async fn test_close_before_finish_marks_failed() {
    let temp = TempDir::new().unwrap();
    let mut receiver = tiered(temp.path(), 10);
    receiver.receive_chunk(&[0u8; 64]).await.unwrap();
    let path = receiver.file_path();

    receiver.close().await.unwrap();
    assert_eq!(receiver.state(), ReceiverState::Failed);
    assert!(!path.exists());
    let err = receiver.finish().await.unwrap_err();
    assert_eq!(err.kind(), ReceiveErrorKind::PreconditionViolation);
}
