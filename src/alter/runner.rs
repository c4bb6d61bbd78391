use crate::alter::job::{AlterJob, JobState, now_ms};
use crate::alter::registry::JobSlot;
use crate::catalog::Catalog;
use crate::catalog::table::Table;
use crate::cluster::{ClusterServices, TaskHandle, TaskStatus};
use crate::config::FeConfig;
use crate::error::{FeError, ResourceType};
use crate::journal::JournalOp;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a single call to [`JobRunner::run_step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do this tick (terminal job, backoff, or still waiting).
    Idle,
    /// Another step of the same job is in progress.
    Busy,
    /// The job's committed state changed.
    Advanced(JobState),
    /// A transient error was recorded; the job will be retried.
    Retrying { attempt: u32 },
}

/// Executes job steps. Each step works on a copy of the job, journals the
/// result when anything persisted changed, and only then publishes it.
pub struct JobRunner {
    catalog: Arc<Catalog>,
    cluster: ClusterServices,
    config: FeConfig,
}

impl JobRunner {
    pub fn new(catalog: Arc<Catalog>, cluster: ClusterServices, config: FeConfig) -> Self {
        Self {
            catalog,
            cluster,
            config,
        }
    }

    pub fn run_step(&self, slot: &JobSlot) -> StepOutcome {
        let Some(_step) = slot.try_begin_step() else {
            return StepOutcome::Busy;
        };
        let current = slot.snapshot();
        if current.is_done() {
            return StepOutcome::Idle;
        }
        let now = now_ms();
        let cancel_reason = slot.cancel_reason();
        if cancel_reason.is_none() && now < current.next_attempt_at_ms {
            return StepOutcome::Idle;
        }

        let mut next = current.clone();
        if let Err(err) = self.advance(&mut next, cancel_reason, now) {
            self.record_error(&mut next, err, now);
        }
        if next == current {
            return StepOutcome::Idle;
        }

        let committed = match self.commit(slot, &current, next.clone()) {
            Ok(true) => next,
            Ok(false) => return StepOutcome::Idle,
            Err(err) => {
                // Nothing reached the journal; fold the error into the last
                // committed state instead.
                let mut retry = current.clone();
                self.record_error(&mut retry, err, now);
                match self.commit(slot, &current, retry.clone()) {
                    Ok(true) => retry,
                    Ok(false) => return StepOutcome::Idle,
                    Err(err) => {
                        warn!(job_id = current.job_id, error = %err, "alter job state could not be persisted");
                        let mut bumped = current.clone();
                        bumped.attempts = current.attempts + 1;
                        bumped.next_attempt_at_ms =
                            now + self.config.retry_backoff_ms(bumped.attempts);
                        slot.publish(bumped);
                        return StepOutcome::Retrying {
                            attempt: current.attempts + 1,
                        };
                    }
                }
            }
        };

        if committed.state != current.state {
            StepOutcome::Advanced(committed.state)
        } else if committed.attempts > current.attempts {
            StepOutcome::Retrying {
                attempt: committed.attempts,
            }
        } else {
            StepOutcome::Idle
        }
    }

    fn advance(
        &self,
        job: &mut AlterJob,
        cancel_reason: Option<String>,
        now: u64,
    ) -> Result<(), FeError> {
        if let Some(reason) = cancel_reason {
            job.transition_to(JobState::Cancelled, now)?;
            job.error_msg = Some(reason);
            return Ok(());
        }
        if job.is_timed_out(now) {
            job.transition_to(JobState::Failed, now)?;
            job.error_msg = Some("timeout".into());
            return Ok(());
        }
        match job.state {
            JobState::Pending => self.run_pending(job, now),
            JobState::WaitingTxn => self.run_waiting_txn(job, now),
            JobState::Running => self.run_running(job, now),
            JobState::Finished | JobState::Cancelled | JobState::Failed => Ok(()),
        }
    }

    /// Fixes the watershed: every transaction that could still write with
    /// the old schema has an id below it.
    fn run_pending(&self, job: &mut AlterJob, now: u64) -> Result<(), FeError> {
        let table = self.owned_table(job)?;
        job.payload.verify(&table)?;
        job.watershed_txn_id = Some(self.cluster.txns.next_transaction_id());
        job.transition_to(JobState::WaitingTxn, now)?;
        debug!(job_id = job.job_id, watershed = ?job.watershed_txn_id, "watershed recorded");
        Ok(())
    }

    fn run_waiting_txn(&self, job: &mut AlterJob, now: u64) -> Result<(), FeError> {
        let watershed = job.watershed_txn_id.ok_or_else(|| FeError::Corruption {
            message: format!("alter job {} is waiting without a watershed", job.job_id),
        })?;
        let oldest = self
            .cluster
            .txns
            .oldest_active_transaction_id(job.db_id);
        if oldest.is_some_and(|txn| txn < watershed) {
            debug!(job_id = job.job_id, ?oldest, watershed, "waiting for older transactions");
            return Ok(());
        }
        self.dispatch_missing(job)?;
        job.transition_to(JobState::Running, now)?;
        Ok(())
    }

    fn run_running(&self, job: &mut AlterJob, now: u64) -> Result<(), FeError> {
        self.dispatch_missing(job)?;
        let mut failure = None;
        for task in job.tasks.iter_mut().filter(|t| !t.done) {
            let Some(handle) = task.handle.as_ref() else {
                continue;
            };
            match self.cluster.workers.poll_status(handle)? {
                TaskStatus::Pending => {}
                TaskStatus::Done => task.done = true,
                TaskStatus::Failed(reason) => {
                    warn!(
                        job_id = job.job_id,
                        index_id = task.index_id,
                        reason = %reason,
                        "build task failed, will re-dispatch"
                    );
                    task.handle = None;
                    failure.get_or_insert(FeError::Worker(reason));
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if job.all_tasks_done() {
            job.transition_to(JobState::Finished, now)?;
        }
        Ok(())
    }

    fn dispatch_missing(&self, job: &mut AlterJob) -> Result<(), FeError> {
        for i in 0..job.tasks.len() {
            if job.tasks[i].done || job.tasks[i].handle.is_some() {
                continue;
            }
            let index_id = job.tasks[i].index_id;
            let task = job.build_task(index_id).ok_or_else(|| FeError::Corruption {
                message: format!("alter job {} has no shadow index {index_id}", job.job_id),
            })?;
            let handle = self.cluster.workers.build_and_backfill(&task)?;
            debug!(job_id = job.job_id, index_id, task_id = handle.task_id, "build task dispatched");
            job.tasks[i].handle = Some(handle);
        }
        Ok(())
    }

    fn release(&self, handles: &[TaskHandle]) {
        for handle in handles {
            self.cluster.workers.release(handle);
        }
    }

    fn owned_table(&self, job: &AlterJob) -> Result<Table, FeError> {
        let db = self
            .catalog
            .get_database_by_id(job.db_id)
            .ok_or_else(|| FeError::not_found(ResourceType::Database, job.db_id.to_string()))?;
        let state = db.read_lock();
        let table = state
            .table_by_id(job.table_id)
            .ok_or_else(|| FeError::not_found(ResourceType::Table, &job.table_name))?;
        if table.pending_job() != Some(job.job_id) {
            return Err(FeError::Validation(format!(
                "table '{}' is no longer owned by alter job {}",
                job.table_name, job.job_id
            )));
        }
        Ok(table.clone())
    }

    fn record_error(&self, job: &mut AlterJob, err: FeError, now: u64) {
        let message = if err.is_transient() {
            job.attempts += 1;
            if job.attempts < self.config.max_job_step_attempts {
                job.next_attempt_at_ms = now + self.config.retry_backoff_ms(job.attempts);
                warn!(
                    job_id = job.job_id,
                    state = %job.state,
                    attempt = job.attempts,
                    error = %err,
                    "alter job step failed, retrying"
                );
                return;
            }
            format!("giving up after {} attempts: {err}", job.attempts)
        } else {
            err.to_string()
        };
        if job.transition_to(JobState::Failed, now).is_ok() {
            job.error_msg = Some(message);
        }
    }

    /// Journals and publishes `next`. Terminal states also release the table
    /// (and publish the shadow indexes when FINISHED) under the database
    /// write lock. Returns `false` when that lock was contended. Worker tasks
    /// of a CANCELLED or FAILED job are released only once that state is in
    /// the journal.
    fn commit(&self, slot: &JobSlot, current: &AlterJob, mut next: AlterJob) -> Result<bool, FeError> {
        let mutation = self.catalog.begin_mutation();
        if !next.is_done() {
            if !next.same_persisted_state(current) {
                mutation.log(&JournalOp::UpsertAlterJob(Box::new(next.clone())))?;
            }
            log_transition(current, &next);
            slot.publish(next);
            return Ok(true);
        }

        let abandoned = take_abandoned_handles(&mut next);
        let Some(db) = self.catalog.get_database_by_id(next.db_id) else {
            mutation.log(&JournalOp::UpsertAlterJob(Box::new(next.clone())))?;
            log_transition(current, &next);
            slot.publish(next);
            self.release(&abandoned);
            return Ok(true);
        };
        let Some(mut tables) = db.try_write_lock_for(self.config.db_lock_timeout()) else {
            debug!(job_id = next.job_id, database = db.name(), "database lock busy, retrying next tick");
            return Ok(false);
        };
        let updated = match tables.table_by_id(next.table_id) {
            Some(table) => {
                let mut table = table.clone();
                if next.state == JobState::Finished {
                    next.payload.publish(&mut table)?;
                }
                table.end_job(next.job_id);
                Some(table)
            }
            None if next.state == JobState::Finished => {
                return Err(FeError::not_found(ResourceType::Table, &next.table_name));
            }
            None => None,
        };
        mutation.log(&JournalOp::UpsertAlterJob(Box::new(next.clone())))?;
        if let Some(table) = updated
            && let Some(entry) = tables.table_mut(next.table_id)
        {
            *entry = table;
        }
        drop(tables);
        log_transition(current, &next);
        slot.publish(next);
        self.release(&abandoned);
        Ok(true)
    }
}

/// Clears the task handles of a job that ends without publishing, returning
/// them for release.
fn take_abandoned_handles(job: &mut AlterJob) -> Vec<TaskHandle> {
    if job.state == JobState::Finished {
        return Vec::new();
    }
    job.tasks.iter_mut().filter_map(|t| t.handle.take()).collect()
}

fn log_transition(current: &AlterJob, next: &AlterJob) {
    if current.state == next.state {
        return;
    }
    match next.state {
        JobState::Finished => info!(
            job_id = next.job_id,
            job_type = %next.job_type,
            table = %next.table_name,
            "alter job finished"
        ),
        JobState::Cancelled | JobState::Failed => warn!(
            job_id = next.job_id,
            job_type = %next.job_type,
            table = %next.table_name,
            state = %next.state,
            error = next.error_msg.as_deref().unwrap_or(""),
            "alter job ended"
        ),
        _ => info!(
            job_id = next.job_id,
            table = %next.table_name,
            from = %current.state,
            to = %next.state,
            "alter job state changed"
        ),
    }
}
