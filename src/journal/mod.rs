//! Write-ahead journal of catalog and alter job mutations.
//!
//! Every structural change is appended here before it is applied in memory;
//! recovery replays the records in sequence order on top of the newest
//! checkpoint image.

pub mod frame;
pub mod segment;

use crate::alter::job::{AlterJob, JobType};
use crate::catalog::table::Table;
use crate::catalog::types::{DbId, JobId, TableId};
use crate::config::{DurabilityMode, FeConfig};
use crate::error::FeError;
use crate::journal::frame::Frame;
use crate::journal::segment::{SegmentWriter, file_hash, read_frames, scan_segments};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalOp {
    CreateDatabase {
        db_id: DbId,
        name: String,
    },
    DropDatabase {
        db_id: DbId,
        name: String,
    },
    CreateTable {
        db_id: DbId,
        table: Table,
    },
    DropTable {
        db_id: DbId,
        table_id: TableId,
        name: String,
    },
    DropRollup {
        db_id: DbId,
        table_id: TableId,
        rollup_name: String,
    },
    UpsertAlterJob(Box<AlterJob>),
    RemoveAlterJob {
        job_id: JobId,
        job_type: JobType,
    },
    CancelAlterJob {
        job_id: JobId,
        job_type: JobType,
        reason: String,
    },
}

impl JournalOp {
    pub fn op_type(&self) -> u8 {
        match self {
            JournalOp::CreateDatabase { .. } => 0x01,
            JournalOp::DropDatabase { .. } => 0x02,
            JournalOp::CreateTable { .. } => 0x03,
            JournalOp::DropTable { .. } => 0x04,
            JournalOp::DropRollup { .. } => 0x05,
            JournalOp::UpsertAlterJob(_) => 0x10,
            JournalOp::RemoveAlterJob { .. } => 0x11,
            JournalOp::CancelAlterJob { .. } => 0x12,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JournalOp::CreateDatabase { .. } => "create_database",
            JournalOp::DropDatabase { .. } => "drop_database",
            JournalOp::CreateTable { .. } => "create_table",
            JournalOp::DropTable { .. } => "drop_table",
            JournalOp::DropRollup { .. } => "drop_rollup",
            JournalOp::UpsertAlterJob(_) => "upsert_alter_job",
            JournalOp::RemoveAlterJob { .. } => "remove_alter_job",
            JournalOp::CancelAlterJob { .. } => "cancel_alter_job",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FeError> {
        rmp_serde::to_vec_named(self).map_err(|e| FeError::Encode(e.to_string()))
    }

    pub fn decode(op_type: u8, payload: &[u8]) -> Result<Self, FeError> {
        let op: JournalOp =
            rmp_serde::from_slice(payload).map_err(|e| FeError::Decode(e.to_string()))?;
        if op.op_type() != op_type {
            return Err(FeError::Corruption {
                message: format!(
                    "journal op type mismatch: frame says {op_type:#04x}, payload is {}",
                    op.name()
                ),
            });
        }
        Ok(op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub seq: u64,
    pub timestamp_micros: u64,
    pub op: JournalOp,
}

impl JournalRecord {
    fn from_frame(frame: Frame) -> Result<Self, FeError> {
        Ok(Self {
            seq: frame.seq,
            timestamp_micros: frame.timestamp_micros,
            op: JournalOp::decode(frame.op_type, &frame.payload)?,
        })
    }
}

pub trait Journal: Send + Sync {
    /// Durably appends `op` and returns its sequence number.
    fn append(&self, op: &JournalOp) -> Result<u64, FeError>;

    /// All retained records in sequence order.
    fn replay(&self) -> Result<Vec<JournalRecord>, FeError>;

    fn last_seq(&self) -> u64;

    /// Makes the next append use a sequence number above `seq`. Called after
    /// loading a checkpoint image whose records were already purged.
    fn fast_forward(&self, seq: u64);

    /// Drops records with `seq <= through_seq` once a checkpoint covers them.
    /// Returns the number of records (or segments) removed.
    fn purge_through(&self, through_seq: u64) -> Result<usize, FeError>;
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[derive(Debug, Default)]
struct MemoryJournalState {
    frames: Vec<Frame>,
    last_seq: u64,
    failing_appends: u32,
}

/// Journal kept in memory. Clones share the same record list, so a second
/// frontend opened on a clone observes everything the first one appended,
/// which is how tests simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    state: Arc<Mutex<MemoryJournalState>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` appends fail with an I/O error.
    pub fn fail_next_appends(&self, n: u32) {
        self.state.lock().failing_appends = n;
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Journal for MemoryJournal {
    fn append(&self, op: &JournalOp) -> Result<u64, FeError> {
        let payload = op.encode()?;
        let mut state = self.state.lock();
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(FeError::Io(std::io::Error::other("injected journal failure")));
        }
        let seq = state.last_seq + 1;
        state.frames.push(Frame {
            seq,
            timestamp_micros: now_micros(),
            op_type: op.op_type(),
            payload,
        });
        state.last_seq = seq;
        Ok(seq)
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, FeError> {
        let frames = self.state.lock().frames.clone();
        frames.into_iter().map(JournalRecord::from_frame).collect()
    }

    fn last_seq(&self) -> u64 {
        self.state.lock().last_seq
    }

    fn fast_forward(&self, seq: u64) {
        let mut state = self.state.lock();
        state.last_seq = state.last_seq.max(seq);
    }

    fn purge_through(&self, through_seq: u64) -> Result<usize, FeError> {
        let mut state = self.state.lock();
        let before = state.frames.len();
        state.frames.retain(|f| f.seq > through_seq);
        Ok(before - state.frames.len())
    }
}

struct FileJournalState {
    writer: SegmentWriter,
    last_seq: u64,
}

/// Segmented on-disk journal: CRC32C framed records in size-rotated segment
/// files whose headers chain the blake3 hash of the previous segment.
pub struct FileJournal {
    dir: PathBuf,
    hash_chain_required: bool,
    strict: bool,
    state: Mutex<FileJournalState>,
}

impl FileJournal {
    /// Opens (or creates) the journal in `dir`. New records go to a fresh
    /// segment after the newest existing one, so a torn tail is never
    /// appended to.
    pub fn open(dir: impl Into<PathBuf>, config: &FeConfig) -> Result<Self, FeError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let segments = scan_segments(&dir)?;
        let paths: Vec<PathBuf> = segments.iter().map(|(_, p)| p.clone()).collect();
        let frames = read_frames(&paths, config.hash_chain_required, config.strict_recovery())?;
        let last_seq = frames.last().map(|f| f.seq).unwrap_or(0);
        let (next_segment_seq, prev_hash) = match segments.last() {
            Some((seq, path)) => (seq + 1, file_hash(path)?),
            None => (1, [0u8; 32]),
        };
        let mut writer = SegmentWriter::new(
            &dir,
            config.max_segment_bytes,
            config.durability_mode == DurabilityMode::Full,
            prev_hash,
        );
        writer.open_active(next_segment_seq)?;
        info!(
            dir = %dir.display(),
            segments = segments.len(),
            last_seq,
            "journal opened"
        );
        Ok(Self {
            dir,
            hash_chain_required: config.hash_chain_required,
            strict: config.strict_recovery(),
            state: Mutex::new(FileJournalState { writer, last_seq }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sync(&self) -> Result<(), FeError> {
        self.state.lock().writer.sync()
    }

    fn segment_paths(&self) -> Result<Vec<PathBuf>, FeError> {
        Ok(scan_segments(&self.dir)?
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("dir", &self.dir)
            .field("last_seq", &self.state.lock().last_seq)
            .finish()
    }
}

impl Journal for FileJournal {
    fn append(&self, op: &JournalOp) -> Result<u64, FeError> {
        let payload = op.encode()?;
        let mut state = self.state.lock();
        let seq = state.last_seq + 1;
        state
            .writer
            .append(seq, now_micros(), op.op_type(), &payload)?;
        state.last_seq = seq;
        debug!(seq, op = op.name(), "journal append");
        Ok(seq)
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, FeError> {
        let paths = {
            let mut state = self.state.lock();
            state.writer.sync()?;
            self.segment_paths()?
        };
        read_frames(&paths, self.hash_chain_required, self.strict)?
            .into_iter()
            .map(JournalRecord::from_frame)
            .collect()
    }

    fn last_seq(&self) -> u64 {
        self.state.lock().last_seq
    }

    fn fast_forward(&self, seq: u64) {
        let mut state = self.state.lock();
        state.last_seq = state.last_seq.max(seq);
    }

    fn purge_through(&self, through_seq: u64) -> Result<usize, FeError> {
        let mut state = self.state.lock();
        state.writer.rotate()?;
        let active = state.writer.active_segment_seq();
        let mut removed = 0usize;
        for (segment_seq, path) in scan_segments(&self.dir)? {
            if Some(segment_seq) == active {
                break;
            }
            let frames = read_frames(std::slice::from_ref(&path), false, self.strict)?;
            if frames.last().is_some_and(|f| f.seq > through_seq) {
                break;
            }
            fs::remove_file(&path)?;
            removed += 1;
        }
        if removed > 0 {
            info!(through_seq, removed, "journal segments purged");
        }
        Ok(removed)
    }
}

/// Reads a journal directory without opening a writer, for offline tools.
pub fn read_journal_dir(dir: &Path, config: &FeConfig) -> Result<Vec<JournalRecord>, FeError> {
    let paths: Vec<PathBuf> = scan_segments(dir)?.into_iter().map(|(_, p)| p).collect();
    read_frames(&paths, config.hash_chain_required, config.strict_recovery())?
        .into_iter()
        .map(JournalRecord::from_frame)
        .collect()
}

/// A fixed set of records that rejects appends. Lets offline tools run
/// recovery over a data directory without touching it.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyJournal {
    records: Vec<JournalRecord>,
    last_seq: Arc<Mutex<u64>>,
}

impl ReadOnlyJournal {
    pub fn new(records: Vec<JournalRecord>) -> Self {
        let last_seq = records.last().map(|r| r.seq).unwrap_or(0);
        Self {
            records,
            last_seq: Arc::new(Mutex::new(last_seq)),
        }
    }
}

impl Journal for ReadOnlyJournal {
    fn append(&self, op: &JournalOp) -> Result<u64, FeError> {
        Err(FeError::Validation(format!(
            "journal is read-only, cannot append {}",
            op.name()
        )))
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, FeError> {
        Ok(self.records.clone())
    }

    fn last_seq(&self) -> u64 {
        *self.last_seq.lock()
    }

    fn fast_forward(&self, seq: u64) {
        let mut last_seq = self.last_seq.lock();
        *last_seq = (*last_seq).max(seq);
    }

    fn purge_through(&self, _through_seq: u64) -> Result<usize, FeError> {
        Err(FeError::Validation("journal is read-only".into()))
    }
}
