use crate::catalog::schema::SchemaVersion;
use crate::catalog::table::{Table, TableState};
use crate::catalog::types::{DbId, IndexId, JobId, TableId, TxnId};
use crate::cluster::{BuildTask, TaskHandle};
use crate::error::{FeError, ResourceType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {
    Pending,
    WaitingTxn,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::WaitingTxn,
        JobState::Running,
        JobState::Finished,
        JobState::Cancelled,
        JobState::Failed,
    ];

    pub fn is_final_state(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Cancelled | JobState::Failed
        )
    }

    /// Forward edges only; every non-terminal state may also be cancelled or
    /// failed.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::WaitingTxn)
            | (JobState::WaitingTxn, JobState::Running)
            | (JobState::Running, JobState::Finished) => true,
            (from, JobState::Cancelled | JobState::Failed) => !from.is_final_state(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::WaitingTxn => write!(f, "WAITING_TXN"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Finished => write!(f, "FINISHED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobType {
    SchemaChange,
    Rollup,
}

impl JobType {
    /// State a table is put in while a job of this type owns it.
    pub fn table_state(self) -> TableState {
        match self {
            JobType::SchemaChange => TableState::SchemaChange,
            JobType::Rollup => TableState::Rollup,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::SchemaChange => write!(f, "SCHEMA_CHANGE"),
            JobType::Rollup => write!(f, "ROLLUP"),
        }
    }
}

/// An index under construction. `origin_index_id` is the index it replaces,
/// or `None` when it is added next to the existing ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowIndex {
    pub origin_index_id: Option<IndexId>,
    pub index_name: String,
    pub schema: SchemaVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlterJobPayload {
    SchemaChange {
        shadows: Vec<ShadowIndex>,
    },
    Rollup {
        base_index_id: IndexId,
        rollup: ShadowIndex,
    },
}

impl AlterJobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            AlterJobPayload::SchemaChange { .. } => JobType::SchemaChange,
            AlterJobPayload::Rollup { .. } => JobType::Rollup,
        }
    }

    pub fn shadow_indexes(&self) -> Vec<&ShadowIndex> {
        match self {
            AlterJobPayload::SchemaChange { shadows } => shadows.iter().collect(),
            AlterJobPayload::Rollup { rollup, .. } => vec![rollup],
        }
    }

    pub fn shadow(&self, index_id: IndexId) -> Option<&ShadowIndex> {
        self.shadow_indexes()
            .into_iter()
            .find(|s| s.schema.index_id == index_id)
    }

    /// Index whose data backfills `shadow`.
    fn source_index_id(&self, shadow: &ShadowIndex) -> IndexId {
        match self {
            AlterJobPayload::SchemaChange { .. } => {
                shadow.origin_index_id.unwrap_or(shadow.schema.index_id)
            }
            AlterJobPayload::Rollup { base_index_id, .. } => *base_index_id,
        }
    }

    /// Checks that the indexes this job was planned against are still the
    /// table's current ones.
    pub fn verify(&self, table: &Table) -> Result<(), FeError> {
        match self {
            AlterJobPayload::SchemaChange { shadows } => {
                for shadow in shadows {
                    let origin = shadow.origin_index_id.ok_or_else(|| FeError::Corruption {
                        message: format!(
                            "schema change shadow index {} has no origin",
                            shadow.schema.index_id
                        ),
                    })?;
                    if table.index_meta(origin).is_none() {
                        return Err(FeError::not_found(
                            ResourceType::Index,
                            format!("{}.{}", table.name(), shadow.index_name),
                        ));
                    }
                }
                Ok(())
            }
            AlterJobPayload::Rollup {
                base_index_id,
                rollup,
            } => {
                if table.base_index_id() != *base_index_id {
                    return Err(FeError::Validation(format!(
                        "base index of table '{}' changed while building rollup '{}'",
                        table.name(),
                        rollup.index_name
                    )));
                }
                if table.index_id_by_name(&rollup.index_name).is_some() {
                    return Err(FeError::already_exists(
                        ResourceType::Index,
                        format!("{}.{}", table.name(), rollup.index_name),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Makes the shadow indexes the table's visible ones.
    pub fn publish(&self, table: &mut Table) -> Result<(), FeError> {
        self.verify(table)?;
        match self {
            AlterJobPayload::SchemaChange { shadows } => {
                for shadow in shadows {
                    if let Some(origin) = shadow.origin_index_id {
                        table.replace_index(origin, shadow.schema.clone())?;
                    }
                }
                Ok(())
            }
            AlterJobPayload::Rollup { rollup, .. } => {
                table.add_index(&rollup.index_name, rollup.schema.clone())
            }
        }
    }
}

/// Worker-side progress of one shadow index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildTaskState {
    pub index_id: IndexId,
    pub handle: Option<TaskHandle>,
    pub done: bool,
}

/// A persisted schema change or rollup job. Everything except the retry
/// bookkeeping is journaled on every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlterJob {
    pub job_id: JobId,
    pub job_type: JobType,
    pub db_id: DbId,
    pub table_id: TableId,
    pub table_name: String,
    pub state: JobState,
    pub payload: AlterJobPayload,
    pub watershed_txn_id: Option<TxnId>,
    pub tasks: Vec<BuildTaskState>,
    pub created_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub timeout_ms: u64,
    pub error_msg: Option<String>,
    /// Reason of an accepted cancel request the job has not acted on yet.
    /// The first request wins.
    #[serde(default)]
    pub cancel_requested: Option<String>,
    #[serde(skip)]
    pub attempts: u32,
    #[serde(skip)]
    pub next_attempt_at_ms: u64,
}

impl AlterJob {
    pub fn new(
        job_id: JobId,
        db_id: DbId,
        table: &Table,
        payload: AlterJobPayload,
        timeout_ms: u64,
        now_ms: u64,
    ) -> Self {
        let tasks = payload
            .shadow_indexes()
            .iter()
            .map(|s| BuildTaskState {
                index_id: s.schema.index_id,
                handle: None,
                done: false,
            })
            .collect();
        Self {
            job_id,
            job_type: payload.job_type(),
            db_id,
            table_id: table.id(),
            table_name: table.name().to_string(),
            state: JobState::Pending,
            payload,
            watershed_txn_id: None,
            tasks,
            created_at_ms: now_ms,
            finished_at_ms: None,
            timeout_ms,
            error_msg: None,
            cancel_requested: None,
            attempts: 0,
            next_attempt_at_ms: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.is_final_state()
    }

    pub fn transition_to(&mut self, next: JobState, now_ms: u64) -> Result<(), FeError> {
        if !self.state.can_transition_to(next) {
            return Err(FeError::InvalidStateTransition {
                job_id: self.job_id,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.attempts = 0;
        self.next_attempt_at_ms = 0;
        if next.is_final_state() {
            self.finished_at_ms = Some(now_ms);
        }
        Ok(())
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        !self.is_done() && now_ms.saturating_sub(self.created_at_ms) > self.timeout_ms
    }

    /// `(done, total)` shadow indexes.
    pub fn progress(&self) -> (usize, usize) {
        let done = self.tasks.iter().filter(|t| t.done).count();
        (done, self.tasks.len())
    }

    pub fn all_tasks_done(&self) -> bool {
        self.tasks.iter().all(|t| t.done)
    }

    pub fn build_task(&self, index_id: IndexId) -> Option<BuildTask> {
        let shadow = self.payload.shadow(index_id)?;
        Some(BuildTask {
            job_id: self.job_id,
            db_id: self.db_id,
            table_id: self.table_id,
            origin_index_id: self.payload.source_index_id(shadow),
            schema: shadow.schema.clone(),
        })
    }

    /// True when both jobs would journal the same record.
    pub fn same_persisted_state(&self, other: &AlterJob) -> bool {
        self.job_id == other.job_id
            && self.state == other.state
            && self.watershed_txn_id == other.watershed_txn_id
            && self.tasks == other.tasks
            && self.finished_at_ms == other.finished_at_ms
            && self.error_msg == other.error_msg
            && self.cancel_requested == other.cancel_requested
            && self.payload == other.payload
    }

    pub fn info(&self) -> AlterJobInfo {
        let (done, total) = self.progress();
        AlterJobInfo {
            job_id: self.job_id,
            job_type: self.job_type,
            table_name: self.table_name.clone(),
            state: self.state,
            progress: format!("{done}/{total}"),
            error_msg: self.error_msg.clone(),
            created_at_ms: self.created_at_ms,
            finished_at_ms: self.finished_at_ms,
        }
    }
}

/// Introspection row for one job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AlterJobInfo {
    pub job_id: JobId,
    pub job_type: JobType,
    pub table_name: String,
    pub state: JobState,
    pub progress: String,
    pub error_msg: Option<String>,
    pub created_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
