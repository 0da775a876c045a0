//! Core domain types and shared logic for the depot ingestion engine.
//!
//! This crate defines the data model used across all other crates:
//! - Receive, monitor, bandwidth and storage configuration
//! - Incremental digests (MD5, SHA-256, CRC-64/NVME)
//! - Throughput reporting
//! - Temp file naming and sharded path derivation

pub mod config;
pub mod error;
pub mod hash;
pub mod locator;
pub mod throughput;

pub use config::{
    AppConfig, BandwidthConfig, DirectUploadConfig, MonitorConfig, ReceiveConfig, StorageConfig,
};
pub use error::{Error, Result};
pub use hash::{ContentHash, DigestCalculator, Digests, Md5Hash};
pub use locator::{HashFileLocator, random_object_key, random_temp_name};
pub use throughput::Throughput;

/// Default read/copy buffer size: 64 KiB
pub const DEFAULT_BUFFER_SIZE: u64 = 64 * 1024;

/// Default in-memory threshold before spilling to disk: 1 MiB
pub const DEFAULT_FILE_SIZE_THRESHOLD: u64 = 1024 * 1024;
