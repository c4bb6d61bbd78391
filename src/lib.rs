pub mod alter;
pub mod catalog;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod error;
pub mod journal;
#[cfg(test)]
mod lib_tests;
pub mod offline;
pub mod query;
pub mod recovery;

pub use crate::alter::job::{AlterJob, AlterJobInfo, JobState, JobType};
pub use crate::alter::scheduler::{AlterScheduler, SchedulerHandle, TickReport};
pub use crate::alter::{Alter, AlterClause, AlterTableRequest};
pub use crate::catalog::{Catalog, CreateTableRequest};
pub use crate::config::FeConfig;
pub use crate::error::FeError;

use crate::catalog::types::{JobId, TableId};
use crate::checkpoint::{CheckpointData, CheckpointMeta, prune_checkpoints, write_checkpoint};
use crate::cluster::ClusterServices;
use crate::error::ResourceType;
use crate::journal::{FileJournal, Journal};
use crate::query::{PlanFragment, ScanRequest, plan_scan};
use crate::recovery::{RecoveryReport, recover};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const JOURNAL_DIR: &str = "journal";
const CHECKPOINT_DIR: &str = "checkpoints";
const CHECKPOINTS_TO_KEEP: usize = 2;

/// Creates a directory with restrictive permissions (0o700 on Unix).
fn create_private_dir_all(path: &Path) -> Result<(), FeError> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().recursive(true).mode(0o700).create(path)?;
        if !fs::metadata(path)?.is_dir() {
            return Err(FeError::Validation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// One frontend node: the catalog, the alter job engine and its scheduler,
/// backed by a journal and (optionally) checkpoint images.
pub struct Frontend {
    config: FeConfig,
    catalog: Arc<Catalog>,
    alter: Arc<Alter>,
    scheduler: Arc<AlterScheduler>,
    scheduler_handle: Mutex<Option<SchedulerHandle>>,
    checkpoint_dir: Option<PathBuf>,
    recovery: RecoveryReport,
}

impl Frontend {
    /// Opens (or creates) a frontend rooted at `dir`, recovering any state a
    /// previous process left there. The scheduler is not started.
    pub fn open(config: FeConfig, dir: &Path, cluster: ClusterServices) -> Result<Self, FeError> {
        config.validate()?;
        create_private_dir_all(dir)?;
        let checkpoint_dir = dir.join(CHECKPOINT_DIR);
        create_private_dir_all(&checkpoint_dir)?;
        let journal = FileJournal::open(dir.join(JOURNAL_DIR), &config)?;
        Self::open_with_journal(config, Arc::new(journal), Some(checkpoint_dir), cluster)
    }

    /// Opens a frontend over an existing journal. Without a checkpoint
    /// directory, [`Frontend::checkpoint`] is unavailable.
    pub fn open_with_journal(
        config: FeConfig,
        journal: Arc<dyn Journal>,
        checkpoint_dir: Option<PathBuf>,
        cluster: ClusterServices,
    ) -> Result<Self, FeError> {
        config.validate()?;
        info!(
            alter_scheduler_interval_ms = config.alter_scheduler_interval_ms,
            max_concurrent_job_steps = config.max_concurrent_job_steps,
            max_job_step_attempts = config.max_job_step_attempts,
            alter_job_timeout_ms = config.alter_job_timeout_ms,
            history_job_keep_ms = config.history_job_keep_ms,
            db_lock_timeout_ms = config.db_lock_timeout_ms,
            durability_mode = ?config.durability_mode,
            recovery_mode = ?config.recovery_mode,
            "femeta config"
        );
        let catalog = Arc::new(Catalog::new(journal));
        let alter = Arc::new(Alter::new(Arc::clone(&catalog), cluster, config.clone()));
        let recovery = recover(&catalog, &alter, checkpoint_dir.as_deref(), &config)?;
        let scheduler = Arc::new(AlterScheduler::new(Arc::clone(&alter), config.clone()));
        Ok(Self {
            config,
            catalog,
            alter,
            scheduler,
            scheduler_handle: Mutex::new(None),
            checkpoint_dir,
            recovery,
        })
    }

    pub fn config(&self) -> &FeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn alter(&self) -> &Arc<Alter> {
        &self.alter
    }

    pub fn scheduler(&self) -> &Arc<AlterScheduler> {
        &self.scheduler
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Starts the periodic scheduler loop on the current tokio runtime. A
    /// second call while the loop is running is a no-op.
    pub fn start_scheduler(&self) {
        let mut handle = self.scheduler_handle.lock();
        if handle.as_ref().is_some_and(SchedulerHandle::is_running) {
            return;
        }
        *handle = Some(Arc::clone(&self.scheduler).spawn());
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler_handle
            .lock()
            .as_ref()
            .is_some_and(SchedulerHandle::is_running)
    }

    /// Runs one scheduler pass on the calling thread.
    pub fn tick(&self) -> TickReport {
        self.scheduler.tick()
    }

    /// Stops the scheduler loop and, when checkpoints are configured, writes
    /// a final image.
    pub async fn shutdown(&self) -> Result<(), FeError> {
        let handle = self.scheduler_handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        if self.checkpoint_dir.is_some() {
            self.checkpoint()?;
        }
        Ok(())
    }

    pub fn create_database(&self, name: &str) -> Result<(), FeError> {
        self.catalog.create_database(name).map(|_| ())
    }

    pub fn drop_database(&self, name: &str) -> Result<(), FeError> {
        self.catalog.drop_database(name)
    }

    pub fn create_table(&self, db_name: &str, request: CreateTableRequest) -> Result<TableId, FeError> {
        self.catalog.create_table(db_name, request)
    }

    pub fn drop_table(&self, db_name: &str, table_name: &str) -> Result<(), FeError> {
        self.catalog.drop_table(db_name, table_name)
    }

    pub fn drop_rollup(&self, db_name: &str, table_name: &str, rollup_name: &str) -> Result<(), FeError> {
        self.catalog.drop_rollup(db_name, table_name, rollup_name)
    }

    /// Accepts an ALTER TABLE request and returns as soon as the job is
    /// journaled in PENDING.
    pub fn process_alter_table(&self, request: &AlterTableRequest) -> Result<JobId, FeError> {
        self.alter.process_alter_table(request)
    }

    pub fn cancel_alter_job(&self, job_id: JobId, reason: &str) -> Result<(), FeError> {
        self.alter.cancel_alter_job(job_id, reason)
    }

    pub fn get_alter_jobs(&self, job_type: JobType) -> BTreeMap<JobId, AlterJob> {
        self.alter.get_alter_jobs(job_type)
    }

    pub fn job_info(&self, job_id: JobId) -> Result<AlterJobInfo, FeError> {
        self.alter.job_info(job_id)
    }

    /// Waits until the job reaches a terminal state. Something else has to
    /// drive the job: the scheduler loop or explicit ticks.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Duration) -> Result<AlterJob, FeError> {
        let slot = self
            .alter
            .slot(job_id)
            .ok_or_else(|| FeError::not_found(ResourceType::AlterJob, job_id.to_string()))?;
        let mut rx = slot.subscribe();
        drop(slot);
        match tokio::time::timeout(timeout, rx.wait_for(AlterJob::is_done)).await {
            Ok(Ok(job)) => Ok((*job).clone()),
            Ok(Err(_)) => Err(FeError::not_found(ResourceType::AlterJob, job_id.to_string())),
            Err(_) => Err(FeError::Timeout),
        }
    }

    pub fn plan_query(&self, request: &ScanRequest) -> Result<PlanFragment, FeError> {
        plan_scan(&self.catalog, request)
    }

    /// Writes a checkpoint image of the catalog and every known job, then
    /// drops journal segments and older images it makes redundant.
    pub fn checkpoint(&self) -> Result<CheckpointMeta, FeError> {
        let dir = self.checkpoint_dir.as_deref().ok_or_else(|| {
            FeError::Validation("no checkpoint directory configured".into())
        })?;
        let data = {
            let _exclusive = self.catalog.begin_checkpoint();
            CheckpointData {
                seq: self.catalog.journal().last_seq(),
                catalog: self.catalog.image(),
                jobs: self.alter.all_jobs(),
            }
        };
        let meta = write_checkpoint(&data, dir)?;
        let purged_segments = self.catalog.journal().purge_through(data.seq)?;
        let pruned_images = prune_checkpoints(dir, CHECKPOINTS_TO_KEEP)?;
        info!(
            seq = data.seq,
            file = %meta.filename,
            jobs = data.jobs.len(),
            purged_segments,
            pruned_images,
            "checkpoint written"
        );
        Ok(meta)
    }
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("alter", &self.alter)
            .field("scheduler_running", &self.is_scheduler_running())
            .finish_non_exhaustive()
    }
}
