use crate::layer::SealedLayer;
use chrono::{DateTime, Duration, Utc};
use dockhand_models::{DockhandError, LayerDescriptor, StageKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

const INDEX_FILE: &str = "layer_index.json";

/// A sealed layer as remembered by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub stage: StageKind,
    pub digest: String,
    pub diff_id: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// `name==version` pins, dependency layers only.
    #[serde(default)]
    pub installed: Vec<String>,
    /// Image paths this layer replaced from lower layers or earlier copies.
    #[serde(default)]
    pub overwritten: Vec<String>,
}

impl LayerRecord {
    pub fn from_sealed(layer: &SealedLayer) -> Self {
        Self {
            stage: layer.stage,
            digest: layer.digest.clone(),
            diff_id: layer.diff_id.clone(),
            size: layer.size(),
            created_at: Utc::now(),
            installed: Vec::new(),
            overwritten: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor {
            stage: self.stage,
            digest: self.digest.clone(),
            diff_id: self.diff_id.clone(),
            size: self.size,
        }
    }
}

/// Hashes cache key components, in order, into a single key.
pub fn cache_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

fn internal(e: impl std::fmt::Display) -> DockhandError {
    DockhandError::InternalError {
        reason: e.to_string(),
    }
}

/// Content-addressed layer store: `blobs/sha256/<hex>` plus an index from
/// cache key to record.
pub struct LayerCache {
    store_dir: PathBuf,
    index: HashMap<String, LayerRecord>,
}

impl LayerCache {
    pub fn new(store_dir: PathBuf) -> Result<Self, DockhandError> {
        fs::create_dir_all(store_dir.join("blobs").join("sha256")).map_err(internal)?;
        fs::create_dir_all(store_dir.join("tmp")).map_err(internal)?;

        let mut cache = Self {
            store_dir,
            index: HashMap::new(),
        };
        cache.load_cache()?;

        Ok(cache)
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Scratch space on the same filesystem as the blobs.
    pub fn tmp_dir(&self) -> PathBuf {
        self.store_dir.join("tmp")
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.store_dir.join("blobs").join("sha256").join(hex)
    }

    /// A record counts only while its blob is still on disk.
    #[instrument(skip(self))]
    pub fn get(&self, key: &str) -> Option<&LayerRecord> {
        self.index
            .get(key)
            .filter(|record| self.blob_path(&record.digest).is_file())
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>, DockhandError> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| DockhandError::InternalError {
            reason: format!("layer blob {digest} unreadable: {e}"),
        })
    }

    /// Stores the blob, then records it under `key` and persists the index.
    #[instrument(skip(self, layer, record), fields(digest = %layer.digest))]
    pub fn insert(
        &mut self,
        key: &str,
        layer: &SealedLayer,
        record: LayerRecord,
    ) -> Result<(), DockhandError> {
        let blob_path = self.blob_path(&layer.digest);
        if !blob_path.is_file() {
            write_atomic(&self.tmp_dir(), &blob_path, &layer.blob)?;
        }

        self.index.insert(key.to_string(), record);
        self.save_cache()?;

        info!(
            stage = %layer.stage,
            digest = %layer.digest,
            "Cached layer"
        );
        Ok(())
    }

    /// Drops records older than `max_age_days` and deletes blobs no remaining
    /// record references. Returns the number of blobs removed.
    #[instrument(skip(self))]
    pub fn cleanup_old_cache(&mut self, max_age_days: u64) -> Result<usize, DockhandError> {
        let days = max_age_days.min(365_000) as i64;
        let cutoff = Utc::now() - Duration::days(days);

        let before = self.index.len();
        self.index.retain(|_, record| record.created_at >= cutoff);
        let dropped_records = before - self.index.len();

        let live: HashSet<String> = self
            .index
            .values()
            .map(|r| r.digest.trim_start_matches("sha256:").to_string())
            .collect();

        let mut removed_count = 0;
        let blob_dir = self.store_dir.join("blobs").join("sha256");
        for entry in fs::read_dir(&blob_dir).map_err(internal)? {
            let entry = entry.map_err(internal)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live.contains(&name) {
                fs::remove_file(entry.path()).map_err(internal)?;
                removed_count += 1;
            }
        }

        self.save_cache()?;
        info!(
            dropped_records = dropped_records,
            removed_blobs = removed_count,
            "Cleaned up layer cache"
        );
        Ok(removed_count)
    }

    fn load_cache(&mut self) -> Result<(), DockhandError> {
        let index_file = self.store_dir.join(INDEX_FILE);
        if index_file.exists() {
            let data = fs::read_to_string(&index_file).map_err(internal)?;
            self.index = serde_json::from_str(&data).map_err(internal)?;
        }
        Ok(())
    }

    pub fn save_cache(&self) -> Result<(), DockhandError> {
        let data = serde_json::to_string_pretty(&self.index).map_err(internal)?;
        write_atomic(
            &self.tmp_dir(),
            &self.store_dir.join(INDEX_FILE),
            data.as_bytes(),
        )
    }
}

/// Writes into `tmp_dir` and renames over `dest`, so readers never observe
/// a partial file.
fn write_atomic(tmp_dir: &Path, dest: &Path, data: &[u8]) -> Result<(), DockhandError> {
    use std::io::Write;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(internal)?;
    }
    let mut file = tempfile::NamedTempFile::new_in(tmp_dir).map_err(internal)?;
    file.write_all(data).map_err(internal)?;
    file.persist(dest).map_err(|e| internal(e.error))?;
    Ok(())
}
