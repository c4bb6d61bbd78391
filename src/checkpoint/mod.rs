//! Checkpoint images: the full catalog plus every alter job as of one
//! journal sequence number, so recovery only replays the journal tail.

pub mod loader;
pub mod writer;

pub use loader::{list_checkpoints, load_checkpoint, load_latest_valid_checkpoint};
pub use writer::{CheckpointData, CheckpointMeta, prune_checkpoints, write_checkpoint};
