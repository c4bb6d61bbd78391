use crate::alter::job::AlterJob;
use crate::catalog::CatalogImage;
use crate::checkpoint::loader::list_checkpoints;
use crate::error::FeError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

pub(crate) const CHECKPOINT_PREFIX: &str = "image_";
pub(crate) const CHECKPOINT_SUFFIX: &str = ".fe.zst";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub filename: String,
    pub seq: u64,
    pub sha256_hex: String,
    pub created_at_micros: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointData {
    pub seq: u64,
    pub catalog: CatalogImage,
    #[serde(default)]
    pub jobs: Vec<AlterJob>,
}

pub fn checkpoint_file_name(seq: u64) -> String {
    format!("{CHECKPOINT_PREFIX}{seq:016}{CHECKPOINT_SUFFIX}")
}

/// Writes `image_{seq}.fe.zst`: zstd-compressed MessagePack followed by a
/// sha256 trailer over the compressed bytes. The file appears atomically.
pub fn write_checkpoint(data: &CheckpointData, dir: &Path) -> Result<CheckpointMeta, FeError> {
    fs::create_dir_all(dir)?;
    let encoded = rmp_serde::to_vec_named(data).map_err(|e| FeError::Encode(e.to_string()))?;
    let compressed = zstd::stream::encode_all(encoded.as_slice(), 3)
        .map_err(|e| FeError::Io(std::io::Error::other(e.to_string())))?;
    let trailer = Sha256::digest(&compressed);
    let mut payload = compressed;
    payload.extend_from_slice(&trailer);

    let filename = checkpoint_file_name(data.seq);
    let final_path = dir.join(&filename);
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&payload)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&final_path).map_err(|e| FeError::Io(e.error))?;

    Ok(CheckpointMeta {
        filename,
        seq: data.seq,
        sha256_hex: hex::encode(Sha256::digest(&payload)),
        created_at_micros: now_micros(),
    })
}

/// Deletes all but the newest `keep` images. Returns how many were removed.
pub fn prune_checkpoints(dir: &Path, keep: usize) -> Result<usize, FeError> {
    let images = list_checkpoints(dir)?;
    let excess = images.len().saturating_sub(keep);
    for (_, path) in images.iter().take(excess) {
        fs::remove_file(path)?;
    }
    Ok(excess)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
