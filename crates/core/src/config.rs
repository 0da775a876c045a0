//! Configuration types shared across crates.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upload receive configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Buffer size in bytes used when draining a source stream.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,
    /// Bytes held in memory before the receiver spills to a temp file.
    #[serde(default = "default_file_size_threshold")]
    pub file_size_threshold: u64,
    /// Root directory for temp files.
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,
    /// Place temp files under a shard directory derived from their name.
    /// Keeps any single directory from accumulating unbounded entries.
    #[serde(default)]
    pub sharded_path: bool,
    /// Minimum acceptable bandwidth in bytes per second.
    /// When throttling would push a write below this rate, the write is rejected
    /// instead of waiting.
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u64>,
    /// Direct-to-object-storage routing.
    #[serde(default)]
    pub direct_upload: DirectUploadConfig,
}

/// Direct-to-object-storage upload routing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirectUploadConfig {
    /// Route large uploads with a declared length straight to the object store.
    #[serde(default)]
    pub enabled: bool,
    /// Repositories (`project/repo`) allowed to upload directly.
    /// Empty means every repository.
    #[serde(default)]
    pub repositories: Vec<String>,
}

fn default_buffer_size() -> u64 {
    crate::DEFAULT_BUFFER_SIZE
}

fn default_file_size_threshold() -> u64 {
    crate::DEFAULT_FILE_SIZE_THRESHOLD
}

fn default_temp_path() -> PathBuf {
    PathBuf::from("./data/temp")
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            file_size_threshold: default_file_size_threshold(),
            temp_path: default_temp_path(),
            sharded_path: false,
            circuit_breaker_threshold: None,
            direct_upload: DirectUploadConfig::default(),
        }
    }
}

impl ReceiveConfig {
    /// Buffer size clamped to something a `Vec` can hold.
    pub fn buffer_len(&self) -> usize {
        usize::try_from(self.buffer_size).unwrap_or(usize::MAX).max(1)
    }

    /// Validate receive configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("receive.buffer_size cannot be 0".to_string());
        }
        if self.buffer_size > u32::MAX as u64 {
            return Err(format!(
                "receive.buffer_size {} exceeds maximum {}",
                self.buffer_size,
                u32::MAX
            ));
        }
        if self.circuit_breaker_threshold == Some(0) {
            return Err(
                "receive.circuit_breaker_threshold of 0 disables nothing; omit it instead"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Storage health monitor configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Run the periodic health probe.
    #[serde(default)]
    pub enabled: bool,
    /// Move data already on disk to the fallback path when the primary degrades.
    #[serde(default = "default_enable_transfer")]
    pub enable_transfer: bool,
    /// Fallback location, usually local disk.
    #[serde(default)]
    pub fallback_path: Option<PathBuf>,
    /// Seconds between probes.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Probe timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bytes written per probe.
    #[serde(default = "default_probe_data_size")]
    pub data_size: u64,
    /// Consecutive failed probes before the primary is declared unhealthy.
    #[serde(default = "default_times_to_fallback")]
    pub times_to_fallback: u32,
    /// Consecutive successful probes before the primary is healthy again.
    #[serde(default = "default_times_to_restore")]
    pub times_to_restore: u32,
}

fn default_enable_transfer() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    10
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_probe_data_size() -> u64 {
    1024 * 1024
}

fn default_times_to_fallback() -> u32 {
    3
}

fn default_times_to_restore() -> u32 {
    5
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_transfer: default_enable_transfer(),
            fallback_path: None,
            interval_secs: default_interval_secs(),
            timeout_ms: default_timeout_ms(),
            data_size: default_probe_data_size(),
            times_to_fallback: default_times_to_fallback(),
            times_to_restore: default_times_to_restore(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate monitor configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        // tokio::time::interval panics on a zero period
        if self.interval_secs == 0 {
            return Err("monitor.interval_secs cannot be 0".to_string());
        }
        if self.times_to_fallback == 0 || self.times_to_restore == 0 {
            return Err(
                "monitor.times_to_fallback and monitor.times_to_restore must be >= 1".to_string(),
            );
        }
        Ok(())
    }
}

/// Upload bandwidth limiting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BandwidthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Sustained rate in bytes per second.
    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: u32,
    /// Largest burst admitted at once, in bytes.
    #[serde(default = "default_burst_bytes")]
    pub burst_bytes: u32,
}

fn default_bytes_per_second() -> u32 {
    100 * 1024 * 1024
}

fn default_burst_bytes() -> u32 {
    4 * 1024 * 1024
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bytes_per_second: default_bytes_per_second(),
            burst_bytes: default_burst_bytes(),
        }
    }
}

impl BandwidthConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && (self.bytes_per_second == 0 || self.burst_bytes == 0) {
            return Err(
                "bandwidth.bytes_per_second and bandwidth.burst_bytes must be > 0 when enabled"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Object storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// Process-local storage, lost on exit.
    Memory,
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub receive: ReceiveConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
    /// Object store for direct uploads. None keeps every upload on local tiers.
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

impl AppConfig {
    /// Load configuration from an optional TOML file merged with `DEPOT_*`
    /// environment variables (`DEPOT_RECEIVE__BUFFER_SIZE=...`).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: AppConfig = figment
            .merge(Env::prefixed("DEPOT_").split("__"))
            .extract()
            .map_err(|e| crate::Error::ConfigLoad(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.receive
            .validate()
            .and_then(|_| self.monitor.validate())
            .and_then(|_| self.bandwidth.validate())
            .and_then(|_| match &self.storage {
                Some(storage) => storage.validate(),
                None => Ok(()),
            })
            .map_err(crate::Error::InvalidConfig)
    }
}
