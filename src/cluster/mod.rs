//! Contracts the job engine consumes from the rest of the cluster.
//!
//! Worker dispatch is fire-and-poll: [`WorkerDispatcher::build_and_backfill`]
//! returns a handle immediately and the scheduler polls it on later ticks.
//! Tasks are keyed by `(job_id, index_id)`, so dispatching the same task twice
//! (for example after a crash between dispatch and journaling) must return the
//! existing task rather than start a second one.

pub mod local;

use crate::catalog::schema::SchemaVersion;
use crate::catalog::types::{DbId, IndexId, JobId, TableId, TxnId};
use crate::error::FeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Instruction to materialize `schema` and backfill it from `origin_index_id`
/// (or from the base index when building a rollup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub job_id: JobId,
    pub db_id: DbId,
    pub table_id: TableId,
    pub origin_index_id: IndexId,
    pub schema: SchemaVersion,
}

impl BuildTask {
    pub fn index_id(&self) -> IndexId {
        self.schema.index_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub job_id: JobId,
    pub index_id: IndexId,
    pub task_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Done,
    Failed(String),
}

pub trait WorkerDispatcher: Send + Sync {
    fn build_and_backfill(&self, task: &BuildTask) -> Result<TaskHandle, FeError>;

    fn poll_status(&self, handle: &TaskHandle) -> Result<TaskStatus, FeError>;

    /// Drops a task whose result will never be published.
    fn release(&self, _handle: &TaskHandle) {}
}

pub trait TransactionManager: Send + Sync {
    /// Id the next transaction will receive; every transaction started before
    /// this call has a smaller id.
    fn next_transaction_id(&self) -> TxnId;

    fn oldest_active_transaction_id(&self, db_id: DbId) -> Option<TxnId>;
}

/// Collaborators handed to the job engine at startup.
#[derive(Clone)]
pub struct ClusterServices {
    pub workers: Arc<dyn WorkerDispatcher>,
    pub txns: Arc<dyn TransactionManager>,
}

impl ClusterServices {
    pub fn new(workers: Arc<dyn WorkerDispatcher>, txns: Arc<dyn TransactionManager>) -> Self {
        Self { workers, txns }
    }

    /// In-process workers that finish every task on its first poll and a
    /// transaction manager with no open transactions.
    pub fn local() -> Self {
        Self::new(
            Arc::new(local::LocalWorkers::default()),
            Arc::new(local::LocalTxnManager::default()),
        )
    }
}

impl std::fmt::Debug for ClusterServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterServices").finish_non_exhaustive()
    }
}
