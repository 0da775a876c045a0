//! Drive one receiver from a byte source and summarize the result.

use anyhow::{Context, Result};
use depot_core::{Digests, Throughput};
use depot_receiver::{DataReceiver, ReceiverFactory};
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

/// JSON summary printed after a receive.
#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub size: u64,
    pub elapsed_secs: f64,
    pub bytes_per_second: Option<f64>,
    pub throughput: String,
    pub md5: String,
    pub sha256: String,
    pub crc64: String,
    pub tier: String,
    pub location: String,
}

impl IngestReport {
    fn new(receiver: &dyn DataReceiver, throughput: Throughput) -> Self {
        let Digests { md5, sha256, crc64 } = receiver.digests();
        Self {
            size: throughput.bytes,
            elapsed_secs: throughput.elapsed.as_secs_f64(),
            bytes_per_second: throughput.bytes_per_second(),
            throughput: throughput.to_string(),
            md5: md5.to_hex(),
            sha256: sha256.to_hex(),
            crc64: format!("{crc64:016x}"),
            tier: receiver.tier().to_string(),
            location: receiver.location(),
        }
    }
}

/// Receive `source` through a receiver chosen by `factory`, optionally copy
/// the persisted bytes to `output`, and close the receiver.
pub async fn ingest(
    factory: &ReceiverFactory,
    source: &mut (dyn AsyncRead + Unpin + Send),
    content_length: Option<u64>,
    repository: Option<&str>,
    output: Option<&Path>,
) -> Result<IngestReport> {
    let mut receiver = factory.build(content_length, repository);
    let result = receive(receiver.as_mut(), source, output).await;
    if let Err(e) = receiver.close().await {
        warn!(error = %e, "Failed to release receiver resources");
    }
    result
}

async fn receive(
    receiver: &mut dyn DataReceiver,
    source: &mut (dyn AsyncRead + Unpin + Send),
    output: Option<&Path>,
) -> Result<IngestReport> {
    receiver
        .receive_stream(source)
        .await
        .context("Failed to receive artifact")?;
    let throughput = receiver
        .finish()
        .await
        .context("Received artifact failed verification")?;
    info!(tier = %receiver.tier(), %throughput, "Artifact received");

    if let Some(path) = output {
        let mut reader = receiver.get_input_stream().await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let copied = tokio::io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush().await?;
        file.sync_all().await?;
        info!(path = %path.display(), bytes = copied, "Wrote received artifact");
    }

    Ok(IngestReport::new(receiver, throughput))
}
