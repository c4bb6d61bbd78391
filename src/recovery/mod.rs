use crate::alter::Alter;
use crate::alter::job::{AlterJob, JobState};
use crate::catalog::Catalog;
use crate::checkpoint::load_latest_valid_checkpoint;
use crate::config::FeConfig;
use crate::error::FeError;
use crate::journal::{JournalOp, JournalRecord};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub checkpoint_seq: Option<u64>,
    pub replayed: usize,
    pub skipped: usize,
    pub last_seq: u64,
    pub resumed_jobs: usize,
}

/// Rebuilds `catalog` and `alter` from the newest checkpoint image (if any)
/// and the journal records after it. Both must be empty on entry.
pub fn recover(
    catalog: &Catalog,
    alter: &Alter,
    checkpoint_dir: Option<&Path>,
    config: &FeConfig,
) -> Result<RecoveryReport, FeError> {
    let mut report = RecoveryReport::default();
    let mut from_seq = 0u64;
    if let Some(dir) = checkpoint_dir
        && let Some(image) = load_latest_valid_checkpoint(dir, config.strict_recovery())?
    {
        catalog.load_image(image.catalog)?;
        for job in image.jobs {
            alter.restore_job(job);
        }
        catalog.journal().fast_forward(image.seq);
        from_seq = image.seq;
        report.checkpoint_seq = Some(image.seq);
    }

    info!(from_seq, "recovery: replay journal");
    for record in catalog.journal().replay()? {
        if record.seq <= from_seq {
            continue;
        }
        match apply_record(catalog, alter, &record) {
            Ok(()) => report.replayed += 1,
            Err(err) if config.strict_recovery() => return Err(err),
            Err(err) => {
                warn!(
                    seq = record.seq,
                    op = record.op.name(),
                    error = %err,
                    "recovery: skipping journal record"
                );
                report.skipped += 1;
            }
        }
    }
    report.last_seq = catalog.journal().last_seq();
    report.resumed_jobs = alter.active_job_count();
    info!(
        replayed = report.replayed,
        last_seq = report.last_seq,
        resumed_jobs = report.resumed_jobs,
        "recovery complete"
    );
    Ok(report)
}

fn apply_record(catalog: &Catalog, alter: &Alter, record: &JournalRecord) -> Result<(), FeError> {
    match &record.op {
        JournalOp::UpsertAlterJob(job) => apply_job(catalog, alter, job),
        JournalOp::RemoveAlterJob { job_id, job_type } => {
            alter.forget_job(*job_id, *job_type);
            Ok(())
        }
        JournalOp::CancelAlterJob {
            job_id,
            job_type,
            reason,
        } => alter.replay_cancel(*job_id, *job_type, reason),
        op => catalog.replay_op(op),
    }
}

/// Re-applies the table side of a job record: ownership while the job is
/// live, the published indexes once FINISHED, release otherwise.
fn apply_job(catalog: &Catalog, alter: &Alter, job: &AlterJob) -> Result<(), FeError> {
    if let Some(db) = catalog.get_database_by_id(job.db_id) {
        let mut tables = db.write_lock();
        if let Some(table) = tables.table_mut(job.table_id) {
            let owned = table.pending_job() == Some(job.job_id);
            match job.state {
                JobState::Finished => {
                    if owned {
                        job.payload.publish(table)?;
                        table.end_job(job.job_id);
                    }
                }
                JobState::Cancelled | JobState::Failed => {
                    table.end_job(job.job_id);
                }
                JobState::Pending | JobState::WaitingTxn | JobState::Running => {
                    if !owned {
                        table.begin_job(job.job_id, job.job_type.table_state())?;
                    }
                }
            }
        }
    }
    alter.restore_job(job.clone());
    Ok(())
}
