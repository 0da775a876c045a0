//! Temp file naming and sharded directory derivation.

use crate::hash::ContentHash;
use rand::Rng;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const TEMP_PREFIX: &str = "artifact_";
const TEMP_SUFFIX: &str = ".temp";

/// Generate a random temp filename of the form `artifact_<n>.temp`.
pub fn random_temp_name() -> String {
    let n: u64 = rand::rng().random_range(0..=i64::MAX as u64);
    format!("{TEMP_PREFIX}{n}{TEMP_SUFFIX}")
}

/// Generate a random object key for scratch uploads.
pub fn random_object_key() -> String {
    format!("receive/{}", Uuid::new_v4())
}

/// Derives a two-level shard directory from the SHA-256 of a name.
///
/// `artifact_1.temp` always maps to the same `ab/cd` pair, spreading temp
/// files across 65536 directories.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashFileLocator;

impl HashFileLocator {
    /// Relative shard directory for a name.
    pub fn locate(&self, name: &str) -> PathBuf {
        let hex = ContentHash::compute(name.as_bytes()).to_hex();
        PathBuf::from(&hex[..2]).join(&hex[2..4])
    }

    /// Shard directory for a name under `root`.
    pub fn locate_under(&self, root: &Path, name: &str) -> PathBuf {
        root.join(self.locate(name))
    }
}
