use crate::error::FeError;
use crate::journal::frame::{Frame, FrameError, FrameReader, encode_frame};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const SEGMENT_MAGIC: u32 = 0x4645_4A4E;
pub const SEGMENT_HEADER_SIZE: usize = 64;
const SEGMENT_PREFIX: &str = "journal_";
const SEGMENT_SUFFIX: &str = ".fejnl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub format_version: u16,
    pub segment_seq: u64,
    pub created_at_micros: u64,
    pub prev_segment_hash: [u8; 32],
}

impl SegmentHeader {
    pub fn new(segment_seq: u64, prev_segment_hash: [u8; 32]) -> Self {
        let created_at_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            magic: SEGMENT_MAGIC,
            format_version: 1,
            segment_seq,
            created_at_micros,
            prev_segment_hash,
        }
    }

    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.format_version.to_be_bytes());
        out[8..16].copy_from_slice(&self.segment_seq.to_be_bytes());
        out[16..24].copy_from_slice(&self.created_at_micros.to_be_bytes());
        out[32..64].copy_from_slice(&self.prev_segment_hash);
        out
    }

    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Result<Self, FeError> {
        let mut u32_buf = [0u8; 4];
        u32_buf.copy_from_slice(&bytes[0..4]);
        let magic = u32::from_be_bytes(u32_buf);
        if magic != SEGMENT_MAGIC {
            return Err(FeError::Corruption {
                message: "invalid journal segment magic".into(),
            });
        }
        let mut u16_buf = [0u8; 2];
        u16_buf.copy_from_slice(&bytes[4..6]);
        let mut seq_buf = [0u8; 8];
        seq_buf.copy_from_slice(&bytes[8..16]);
        let mut ts_buf = [0u8; 8];
        ts_buf.copy_from_slice(&bytes[16..24]);
        let mut prev_segment_hash = [0u8; 32];
        prev_segment_hash.copy_from_slice(&bytes[32..64]);
        Ok(Self {
            magic,
            format_version: u16::from_be_bytes(u16_buf),
            segment_seq: u64::from_be_bytes(seq_buf),
            created_at_micros: u64::from_be_bytes(ts_buf),
            prev_segment_hash,
        })
    }
}

pub fn segment_file_name(segment_seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{segment_seq:016}{SEGMENT_SUFFIX}")
}

fn parse_segment_seq(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse::<u64>()
        .ok()
}

/// Journal segments in `dir`, ordered by segment sequence.
pub fn scan_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, FeError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            parse_segment_seq(&name).map(|seq| (seq, entry.path()))
        })
        .collect();
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

pub fn file_hash(path: &Path) -> Result<[u8; 32], FeError> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Number of leading segments whose header chain is intact. The oldest
/// surviving segment anchors the chain, since older ones may have been purged
/// after a checkpoint.
///
/// - `required=false`: every segment counts as valid.
/// - `strict=true`: the first broken link is an error.
/// - `strict=false`: validation stops at the first broken link.
pub fn validated_chain_prefix_len(
    paths: &[PathBuf],
    required: bool,
    strict: bool,
) -> Result<usize, FeError> {
    if !required {
        return Ok(paths.len());
    }
    let mut prev_hash: Option<[u8; 32]> = None;
    let mut valid = 0usize;
    for path in paths {
        let check = (|| -> Result<[u8; 32], FeError> {
            let mut file = File::open(path)?;
            let mut header = [0u8; SEGMENT_HEADER_SIZE];
            file.read_exact(&mut header)?;
            let parsed = SegmentHeader::from_bytes(&header)?;
            if prev_hash.is_some_and(|prev| prev != parsed.prev_segment_hash) {
                return Err(FeError::Corruption {
                    message: format!("journal hash chain mismatch at {}", path.display()),
                });
            }
            file_hash(path)
        })();
        match check {
            Ok(hash) => {
                prev_hash = Some(hash);
                valid += 1;
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(segment = %path.display(), error = %e, "journal chain broken, ignoring tail");
                break;
            }
        }
    }
    Ok(valid)
}

/// Reads every frame from `paths` in order. A truncated frame ends its
/// segment; a corrupt frame is an error when `strict`, otherwise it ends the
/// whole read.
pub fn read_frames(
    paths: &[PathBuf],
    hash_chain_required: bool,
    strict: bool,
) -> Result<Vec<Frame>, FeError> {
    let valid = validated_chain_prefix_len(paths, hash_chain_required, strict)?;
    let mut frames = Vec::new();
    'segments: for path in &paths[..valid] {
        let file = File::open(path)?;
        if file.metadata()?.len() < SEGMENT_HEADER_SIZE as u64 {
            continue;
        }
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        SegmentHeader::from_bytes(&header)?;
        let mut frame_reader = FrameReader::new(reader);
        loop {
            match frame_reader.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(FrameError::Truncation) => {
                    warn!(segment = %path.display(), "journal segment ends in a truncated frame");
                    break;
                }
                Err(FrameError::Corruption) => {
                    if strict {
                        return Err(FeError::Corruption {
                            message: format!("corrupt journal frame in {}", path.display()),
                        });
                    }
                    warn!(segment = %path.display(), "corrupt journal frame, stopping replay");
                    break 'segments;
                }
                Err(FrameError::Io(e)) => return Err(FeError::Io(std::io::Error::other(e))),
            }
        }
    }
    Ok(frames)
}

struct ActiveSegment {
    file: File,
    segment_seq: u64,
    size_bytes: u64,
    hasher: blake3::Hasher,
}

/// Appends frames to the newest segment and rolls over once it grows past
/// `max_segment_bytes`; each new segment header carries the hash of the
/// previous one.
pub struct SegmentWriter {
    dir: PathBuf,
    max_segment_bytes: u64,
    sync_each_append: bool,
    prev_hash: [u8; 32],
    active: Option<ActiveSegment>,
}

impl SegmentWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        max_segment_bytes: u64,
        sync_each_append: bool,
        prev_hash: [u8; 32],
    ) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes,
            sync_each_append,
            prev_hash,
            active: None,
        }
    }

    pub fn open_active(&mut self, segment_seq: u64) -> Result<(), FeError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(segment_file_name(segment_seq));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let mut hasher = blake3::Hasher::new();
        if file.metadata()?.len() == 0 {
            let header = SegmentHeader::new(segment_seq, self.prev_hash).to_bytes();
            file.write_all(&header)?;
            file.sync_data()?;
            hasher.update(&header);
        } else {
            let mut reader = File::open(&path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        let size_bytes = file.metadata()?.len();
        self.active = Some(ActiveSegment {
            file,
            segment_seq,
            size_bytes,
            hasher,
        });
        Ok(())
    }

    pub fn active_segment_seq(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.segment_seq)
    }

    pub fn append(
        &mut self,
        seq: u64,
        timestamp_micros: u64,
        op_type: u8,
        payload: &[u8],
    ) -> Result<(), FeError> {
        let frame = encode_frame(seq, timestamp_micros, op_type, payload).map_err(|e| {
            FeError::Encode(format!("journal frame for seq {seq}: {e}"))
        })?;
        let active = self.active.as_mut().ok_or_else(|| FeError::Io(std::io::Error::other(
            "journal segment is not open",
        )))?;
        active.file.write_all(&frame)?;
        if self.sync_each_append {
            active.file.sync_data()?;
        }
        active.hasher.update(&frame);
        active.size_bytes = active.size_bytes.saturating_add(frame.len() as u64);
        if active.size_bytes >= self.max_segment_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), FeError> {
        if let Some(active) = self.active.as_mut() {
            active.file.flush()?;
            active.file.sync_data()?;
        }
        Ok(())
    }

    pub fn rotate(&mut self) -> Result<(), FeError> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        active.file.flush()?;
        active.file.sync_data()?;
        self.prev_hash = *active.hasher.finalize().as_bytes();
        self.open_active(active.segment_seq + 1)
    }
}
