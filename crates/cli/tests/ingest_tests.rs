#[path = "../src/ingest.rs"]
mod ingest;

use depot_core::{DirectUploadConfig, ReceiveConfig};
use depot_receiver::ReceiverFactory;
use depot_storage::MemoryBackend;
use std::sync::Arc;
use tempfile::TempDir;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_ingest_local_tier_writes_output() {
    let temp = TempDir::new().unwrap();
    let factory = ReceiverFactory::new(ReceiveConfig {
        file_size_threshold: 1024,
        temp_path: temp.path().join("temp"),
        ..ReceiveConfig::default()
    });
    let data = payload(10_000);
    let output = temp.path().join("out.bin");

    let mut source: &[u8] = &data;
    let report = ingest::ingest(&factory, &mut source, None, None, Some(&output))
        .await
        .unwrap();

    assert_eq!(report.size, 10_000);
    assert_eq!(report.tier, "file");
    assert_eq!(
        report.sha256,
        depot_core::ContentHash::compute(&data).to_hex()
    );
    assert_eq!(report.crc64, format!("{:016x}", depot_core::hash::crc64(&data)));
    assert_eq!(std::fs::read(&output).unwrap(), data);
    // The temp root did not exist before, so the receiver removes it with its file.
    assert!(!temp.path().join("temp").exists());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["md5"], depot_core::Md5Hash::compute(&data).to_hex());
}

#[tokio::test]
async fn test_ingest_direct_cleans_up_scratch_object() {
    let temp = TempDir::new().unwrap();
    let store = MemoryBackend::new();
    let factory = ReceiverFactory::new(ReceiveConfig {
        file_size_threshold: 1024,
        temp_path: temp.path().to_path_buf(),
        direct_upload: DirectUploadConfig {
            enabled: true,
            repositories: vec![],
        },
        ..ReceiveConfig::default()
    })
    .with_object_store(Arc::new(store.clone()));
    let data = payload(5000);
    let output = temp.path().join("out.bin");

    let mut source: &[u8] = &data;
    let report = ingest::ingest(&factory, &mut source, Some(5000), None, Some(&output))
        .await
        .unwrap();

    assert_eq!(report.tier, "object");
    assert!(report.location.starts_with("memory:receive/"));
    assert_eq!(std::fs::read(&output).unwrap(), data);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_ingest_length_mismatch_fails_without_output() {
    let temp = TempDir::new().unwrap();
    let store = MemoryBackend::new();
    let factory = ReceiverFactory::new(ReceiveConfig {
        file_size_threshold: 10,
        direct_upload: DirectUploadConfig {
            enabled: true,
            repositories: vec![],
        },
        ..ReceiveConfig::default()
    })
    .with_object_store(Arc::new(store.clone()));
    let output = temp.path().join("out.bin");

    let data = payload(900);
    let mut source: &[u8] = &data;
    let err = ingest::ingest(&factory, &mut source, Some(1000), None, Some(&output))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("integrity"), "{err:#}");
    assert!(!output.exists());
    assert!(store.is_empty().await);
}
