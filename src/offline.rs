//! Read-only inspection of a frontend data directory: journal dump, job
//! listing and metadata invariant checks. Nothing here writes to the
//! directory.

use crate::alter::Alter;
use crate::alter::job::{AlterJobInfo, JobState};
use crate::catalog::Catalog;
use crate::catalog::table::TableState;
use crate::cluster::ClusterServices;
use crate::config::FeConfig;
use crate::error::FeError;
use crate::journal::{Journal, ReadOnlyJournal, read_journal_dir};
use crate::recovery::{RecoveryReport, recover};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const JOURNAL_DIR: &str = "journal";
const CHECKPOINT_DIR: &str = "checkpoints";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JournalDumpEntry {
    pub seq: u64,
    pub timestamp_micros: u64,
    pub op: &'static str,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexSummary {
    pub name: String,
    pub index_id: u64,
    pub schema_version: u32,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableSummary {
    pub name: String,
    pub table_id: u64,
    pub state: String,
    pub pending_job: Option<u64>,
    pub indexes: Vec<IndexSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseSummary {
    pub name: String,
    pub db_id: u64,
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobsReport {
    pub jobs: Vec<AlterJobInfo>,
    pub by_state: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InvariantReport {
    pub ok: bool,
    pub table_count: u64,
    pub active_jobs: u64,
    pub violations: Vec<String>,
}

/// Catalog and jobs as a frontend opening `data_dir` would recover them.
pub struct OfflineState {
    pub catalog: Arc<Catalog>,
    pub alter: Alter,
    pub report: RecoveryReport,
}

pub fn recover_read_only(data_dir: &Path, config: &FeConfig) -> Result<OfflineState, FeError> {
    let records = read_journal_dir(&data_dir.join(JOURNAL_DIR), config)?;
    let journal: Arc<dyn Journal> = Arc::new(ReadOnlyJournal::new(records));
    let catalog = Arc::new(Catalog::new(journal));
    let alter = Alter::new(Arc::clone(&catalog), ClusterServices::local(), config.clone());
    let checkpoint_dir = data_dir.join(CHECKPOINT_DIR);
    let checkpoint_dir = checkpoint_dir.is_dir().then_some(checkpoint_dir);
    let report = recover(&catalog, &alter, checkpoint_dir.as_deref(), config)?;
    Ok(OfflineState {
        catalog,
        alter,
        report,
    })
}

pub fn journal_dump(data_dir: &Path, config: &FeConfig) -> Result<Vec<JournalDumpEntry>, FeError> {
    read_journal_dir(&data_dir.join(JOURNAL_DIR), config)?
        .into_iter()
        .map(|record| {
            Ok(JournalDumpEntry {
                seq: record.seq,
                timestamp_micros: record.timestamp_micros,
                op: record.op.name(),
                payload: serde_json::to_value(&record.op)
                    .map_err(|e| FeError::Encode(e.to_string()))?,
            })
        })
        .collect()
}

pub fn jobs_report(data_dir: &Path, config: &FeConfig) -> Result<JobsReport, FeError> {
    let state = recover_read_only(data_dir, config)?;
    let mut jobs: Vec<AlterJobInfo> = state.alter.all_jobs().iter().map(|j| j.info()).collect();
    jobs.sort_by_key(|j| j.job_id);
    let by_state = JobState::ALL
        .iter()
        .map(|s| (s.to_string(), jobs.iter().filter(|j| j.state == *s).count()))
        .collect();
    Ok(JobsReport { jobs, by_state })
}

pub fn catalog_summary(data_dir: &Path, config: &FeConfig) -> Result<Vec<DatabaseSummary>, FeError> {
    let state = recover_read_only(data_dir, config)?;
    Ok(summarize_catalog(&state.catalog))
}

pub fn summarize_catalog(catalog: &Catalog) -> Vec<DatabaseSummary> {
    catalog
        .databases()
        .iter()
        .map(|db| {
            let tables = db.read_lock();
            DatabaseSummary {
                name: db.name().to_string(),
                db_id: db.id(),
                tables: tables
                    .tables()
                    .map(|table| TableSummary {
                        name: table.name().to_string(),
                        table_id: table.id(),
                        state: table.state().to_string(),
                        pending_job: table.pending_job(),
                        indexes: table
                            .indexes()
                            .into_iter()
                            .map(|(name, meta)| IndexSummary {
                                name: name.to_string(),
                                index_id: meta.index_id,
                                schema_version: meta.schema_version,
                                columns: meta.column_names().iter().map(|c| c.to_string()).collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            }
        })
        .collect()
}

pub fn invariant_report(data_dir: &Path, config: &FeConfig) -> Result<InvariantReport, FeError> {
    let state = recover_read_only(data_dir, config)?;
    Ok(check_invariants(&state.catalog, &state.alter))
}

/// Cross-checks table ownership against live jobs and index bookkeeping.
pub fn check_invariants(catalog: &Catalog, alter: &Alter) -> InvariantReport {
    let mut violations = Vec::new();
    let mut table_count = 0u64;
    let jobs: BTreeMap<u64, _> = alter.all_jobs().into_iter().map(|j| (j.job_id, j)).collect();

    for db in catalog.databases() {
        let tables = db.read_lock();
        for table in tables.tables() {
            table_count += 1;
            let qualified = format!("{}.{}", db.name(), table.name());
            if table.index_meta(table.base_index_id()).is_none() {
                violations.push(format!("{qualified}: base index {} missing", table.base_index_id()));
            }
            if table.index_id_by_name(table.name()) != Some(table.base_index_id()) {
                violations.push(format!("{qualified}: base index is not named after the table"));
            }
            match (table.state(), table.pending_job()) {
                (TableState::Normal, None) => {}
                (TableState::Normal, Some(job_id)) => {
                    violations.push(format!("{qualified}: NORMAL but owned by job {job_id}"));
                }
                (state, None) => {
                    violations.push(format!("{qualified}: {state} without an owning job"));
                }
                (state, Some(job_id)) => match jobs.get(&job_id) {
                    None => violations.push(format!("{qualified}: owned by unknown job {job_id}")),
                    Some(job) if job.is_done() => violations.push(format!(
                        "{qualified}: owned by job {job_id} which is already {}",
                        job.state
                    )),
                    Some(job) if job.job_type.table_state() != state => violations.push(format!(
                        "{qualified}: state {state} does not match {} job {job_id}",
                        job.job_type
                    )),
                    Some(_) => {}
                },
            }
        }
    }

    for job in jobs.values().filter(|j| !j.is_done()) {
        let owner = catalog
            .get_database_by_id(job.db_id)
            .and_then(|db| db.read_lock().table_by_id(job.table_id).map(|t| t.pending_job()));
        match owner {
            Some(Some(owner)) if owner == job.job_id => {}
            Some(_) => violations.push(format!(
                "job {} is {} but does not own table '{}'",
                job.job_id, job.state, job.table_name
            )),
            None => violations.push(format!(
                "job {} is {} but table '{}' is gone",
                job.job_id, job.state, job.table_name
            )),
        }
    }

    InvariantReport {
        ok: violations.is_empty(),
        table_count,
        active_jobs: alter.active_job_count() as u64,
        violations,
    }
}
