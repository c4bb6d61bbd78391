use crate::checkpoint::writer::{CHECKPOINT_PREFIX, CHECKPOINT_SUFFIX, CheckpointData};
use crate::error::FeError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn load_checkpoint(path: &Path) -> Result<CheckpointData, FeError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 32 {
        return Err(FeError::Decode("checkpoint too small".into()));
    }
    let (compressed, trailer_hash) = bytes.split_at(bytes.len() - 32);
    if Sha256::digest(compressed).as_slice() != trailer_hash {
        return Err(FeError::Corruption {
            message: format!("checkpoint hash mismatch in {}", path.display()),
        });
    }
    let decompressed = zstd::stream::decode_all(compressed)
        .map_err(|e| FeError::Io(std::io::Error::other(e.to_string())))?;
    rmp_serde::from_slice(&decompressed).map_err(|e| FeError::Decode(e.to_string()))
}

/// Checkpoint images in `dir`, oldest first.
pub fn list_checkpoints(dir: &Path) -> Result<Vec<(u64, PathBuf)>, FeError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut images: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_prefix(CHECKPOINT_PREFIX)?
                .strip_suffix(CHECKPOINT_SUFFIX)?
                .parse::<u64>()
                .ok()
                .map(|seq| (seq, entry.path()))
        })
        .collect();
    images.sort_by_key(|(seq, _)| *seq);
    Ok(images)
}

/// Newest image that loads cleanly. Damaged images are skipped in favour of
/// older ones; in strict mode a damaged image with nothing usable behind it
/// is an error rather than an empty start.
pub fn load_latest_valid_checkpoint(
    dir: &Path,
    strict: bool,
) -> Result<Option<CheckpointData>, FeError> {
    let mut last_error = None;
    for (seq, path) in list_checkpoints(dir)?.into_iter().rev() {
        match load_checkpoint(&path) {
            Ok(data) => {
                info!(seq, path = %path.display(), "checkpoint loaded");
                return Ok(Some(data));
            }
            Err(err) => {
                warn!(
                    seq,
                    path = %path.display(),
                    error = %err,
                    "checkpoint load failed, trying older checkpoint"
                );
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) if strict => Err(err),
        _ => Ok(None),
    }
}
