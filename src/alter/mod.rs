//! Asynchronous schema change and rollup jobs.
//!
//! A request is validated and turned into a PENDING job synchronously; the
//! scheduler then walks it through WAITING_TXN and RUNNING. Only the FINISHED
//! transition changes what readers of the catalog see.

pub mod job;
pub mod registry;
pub mod rollup;
pub mod runner;
pub mod scheduler;
pub mod schema_change;

use crate::alter::job::{AlterJob, AlterJobInfo, AlterJobPayload, JobType, now_ms};
use crate::alter::registry::{JobRegistry, JobSlot};
use crate::alter::rollup::RollupHandler;
use crate::alter::runner::{JobRunner, StepOutcome};
use crate::alter::schema_change::SchemaChangeHandler;
use crate::catalog::Catalog;
use crate::catalog::schema::{ColumnDef, ColumnPosition};
use crate::catalog::table::Table;
use crate::catalog::types::{IndexId, JobId};
use crate::cluster::ClusterServices;
use crate::config::FeConfig;
use crate::error::{FeError, ResourceType};
use crate::journal::JournalOp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlterClause {
    /// Adds `column` to the base index, or to `rollup` (and the base).
    AddColumn {
        column: ColumnDef,
        position: Option<ColumnPosition>,
        rollup: Option<String>,
    },
    /// Drops a value column from `rollup`, or from the base and every rollup
    /// that carries it.
    DropColumn {
        name: String,
        rollup: Option<String>,
    },
    AddRollup {
        name: String,
        columns: Vec<String>,
    },
}

impl AlterClause {
    pub fn job_type(&self) -> JobType {
        match self {
            AlterClause::AddColumn { .. } | AlterClause::DropColumn { .. } => {
                JobType::SchemaChange
            }
            AlterClause::AddRollup { .. } => JobType::Rollup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterTableRequest {
    pub db_name: String,
    pub table_name: String,
    pub clauses: Vec<AlterClause>,
}

impl AlterTableRequest {
    pub fn new(
        db_name: impl Into<String>,
        table_name: impl Into<String>,
        clauses: Vec<AlterClause>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            table_name: table_name.into(),
            clauses,
        }
    }
}

/// One kind of alter job: validates requests into a job payload and keeps
/// the registry of its jobs.
pub trait AlterHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    fn registry(&self) -> &JobRegistry;

    /// Builds the shadow indexes for `clauses` against the current table.
    /// `next_index_id` allocates ids for new indexes.
    fn plan(
        &self,
        table: &Table,
        clauses: &[AlterClause],
        next_index_id: &dyn Fn() -> IndexId,
    ) -> Result<AlterJobPayload, FeError>;

    fn get_alter_jobs(&self) -> BTreeMap<JobId, AlterJob> {
        self.registry().get_alter_jobs()
    }
}

/// Entry point for ALTER TABLE requests and owner of every alter job.
pub struct Alter {
    catalog: Arc<Catalog>,
    config: FeConfig,
    schema_change: SchemaChangeHandler,
    rollup: RollupHandler,
    runner: JobRunner,
}

impl Alter {
    pub fn new(catalog: Arc<Catalog>, cluster: ClusterServices, config: FeConfig) -> Self {
        let runner = JobRunner::new(Arc::clone(&catalog), cluster, config.clone());
        Self {
            catalog,
            config,
            schema_change: SchemaChangeHandler::default(),
            rollup: RollupHandler::default(),
            runner,
        }
    }

    pub fn schema_change_handler(&self) -> &SchemaChangeHandler {
        &self.schema_change
    }

    pub fn rollup_handler(&self) -> &RollupHandler {
        &self.rollup
    }

    pub fn handler(&self, job_type: JobType) -> &dyn AlterHandler {
        match job_type {
            JobType::SchemaChange => &self.schema_change,
            JobType::Rollup => &self.rollup,
        }
    }

    fn handlers(&self) -> [&dyn AlterHandler; 2] {
        [&self.schema_change, &self.rollup]
    }

    /// Validates the request and registers a PENDING job for it. Returns as
    /// soon as the job is journaled; the work happens on scheduler ticks.
    pub fn process_alter_table(&self, request: &AlterTableRequest) -> Result<JobId, FeError> {
        let Some(first) = request.clauses.first() else {
            return Err(FeError::Validation("alter request has no clauses".into()));
        };
        let job_type = first.job_type();
        if request.clauses.iter().any(|c| c.job_type() != job_type) {
            return Err(FeError::Validation(
                "schema change and rollup clauses cannot be mixed in one request".into(),
            ));
        }
        let handler = self.handler(job_type);
        let db = self.catalog.database(&request.db_name)?;

        let mutation = self.catalog.begin_mutation();
        let mut tables = db.write_live()?;
        let table = tables.table(&request.table_name).ok_or_else(|| {
            FeError::not_found(
                ResourceType::Table,
                format!("{}.{}", request.db_name, request.table_name),
            )
        })?;
        if !table.engine().supports_alter() {
            return Err(FeError::UnsupportedEngine {
                table: table.name().to_string(),
                engine: table.engine().to_string(),
            });
        }
        table.ensure_normal()?;
        let payload = handler.plan(table, &request.clauses, &|| self.catalog.next_id())?;
        let job_id = self.catalog.next_id();
        let job = AlterJob::new(
            job_id,
            db.id(),
            table,
            payload,
            self.config.alter_job_timeout_ms,
            now_ms(),
        );
        let table_id = table.id();

        mutation.log(&JournalOp::UpsertAlterJob(Box::new(job.clone())))?;
        tables
            .table_mut(table_id)
            .ok_or_else(|| FeError::not_found(ResourceType::Table, &request.table_name))?
            .begin_job(job_id, job_type.table_state())?;
        handler.registry().register(job)?;
        drop(tables);
        info!(
            job_id,
            job_type = %job_type,
            table = %request.table_name,
            "alter job created"
        );
        Ok(job_id)
    }

    /// Requests cooperative cancellation. The request is journaled before
    /// this returns, so it survives a restart; the scheduler's next step
    /// releases the job's worker tasks and returns the table to NORMAL
    /// without publishing anything. A second request keeps the first reason.
    pub fn cancel_alter_job(&self, job_id: JobId, reason: &str) -> Result<(), FeError> {
        let slot = self
            .slot(job_id)
            .ok_or_else(|| FeError::not_found(ResourceType::AlterJob, job_id.to_string()))?;
        let job = slot.snapshot();
        if job.is_done() {
            return Err(FeError::JobAlreadyFinal {
                job_id,
                state: job.state.to_string(),
            });
        }
        let mutation = self.catalog.begin_mutation();
        let armed = slot.request_cancel(reason, || {
            mutation
                .log(&JournalOp::CancelAlterJob {
                    job_id,
                    job_type: job.job_type,
                    reason: reason.to_string(),
                })
                .map(|_| ())
        })?;
        drop(mutation);
        if armed {
            info!(job_id, table = %job.table_name, reason, "alter job cancel requested");
        } else {
            debug!(job_id, "alter job already has a cancel request");
        }
        Ok(())
    }

    pub fn get_alter_jobs(&self, job_type: JobType) -> BTreeMap<JobId, AlterJob> {
        self.handler(job_type).get_alter_jobs()
    }

    pub fn slot(&self, job_id: JobId) -> Option<Arc<JobSlot>> {
        self.handlers()
            .into_iter()
            .find_map(|h| h.registry().get(job_id))
    }

    pub fn job(&self, job_id: JobId) -> Option<AlterJob> {
        self.slot(job_id).map(|slot| slot.snapshot())
    }

    pub fn job_info(&self, job_id: JobId) -> Result<AlterJobInfo, FeError> {
        self.job(job_id)
            .map(|job| job.info())
            .ok_or_else(|| FeError::not_found(ResourceType::AlterJob, job_id.to_string()))
    }

    /// Slots of jobs that still need scheduler attention.
    pub fn active_slots(&self) -> Vec<Arc<JobSlot>> {
        self.handlers()
            .into_iter()
            .flat_map(|h| h.registry().slots())
            .filter(|slot| !slot.state().is_final_state())
            .collect()
    }

    pub fn active_job_count(&self) -> usize {
        self.handlers()
            .into_iter()
            .map(|h| h.registry().active_count())
            .sum()
    }

    pub fn run_step(&self, slot: &JobSlot) -> StepOutcome {
        self.runner.run_step(slot)
    }

    /// Forgets terminal jobs that finished more than `history_job_keep_ms`
    /// before `now`.
    pub fn purge_expired(&self, now: u64) -> Result<usize, FeError> {
        let mut purged = 0usize;
        for handler in self.handlers() {
            for (job_id, job) in handler.get_alter_jobs() {
                let Some(finished_at) = job.finished_at_ms else {
                    continue;
                };
                if finished_at.saturating_add(self.config.history_job_keep_ms) >= now {
                    continue;
                }
                let mutation = self.catalog.begin_mutation();
                mutation.log(&JournalOp::RemoveAlterJob {
                    job_id,
                    job_type: handler.job_type(),
                })?;
                handler.registry().remove(job_id);
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "expired alter jobs removed");
        }
        Ok(purged)
    }

    pub(crate) fn restore_job(&self, job: AlterJob) {
        self.catalog.observe_id(job.job_id);
        for shadow in job.payload.shadow_indexes() {
            self.catalog.observe_id(shadow.schema.index_id);
        }
        self.handler(job.job_type).registry().restore(job);
    }

    /// Re-arms a journaled cancel request during recovery.
    pub(crate) fn replay_cancel(
        &self,
        job_id: JobId,
        job_type: JobType,
        reason: &str,
    ) -> Result<(), FeError> {
        let slot = self
            .handler(job_type)
            .registry()
            .get(job_id)
            .ok_or_else(|| FeError::Corruption {
                message: format!("journal cancels unknown alter job {job_id}"),
            })?;
        slot.request_cancel(reason, || Ok(()))?;
        Ok(())
    }

    pub(crate) fn forget_job(&self, job_id: JobId, job_type: JobType) {
        self.handler(job_type).registry().remove(job_id);
    }

    pub(crate) fn all_jobs(&self) -> Vec<AlterJob> {
        self.handlers()
            .into_iter()
            .flat_map(|h| h.get_alter_jobs().into_values())
            .collect()
    }
}

impl std::fmt::Debug for Alter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alter")
            .field("active_jobs", &self.active_job_count())
            .finish_non_exhaustive()
    }
}
