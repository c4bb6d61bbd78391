use femeta::alter::job::{JobState, JobType};
use femeta::alter::{AlterClause, AlterTableRequest};
use femeta::catalog::CreateTableRequest;
use femeta::catalog::schema::ColumnDef;
use femeta::catalog::table::TableState;
use femeta::catalog::types::ColumnType;
use femeta::cluster::ClusterServices;
use femeta::cluster::local::{LocalTxnManager, LocalWorkers};
use femeta::config::FeConfig;
use femeta::error::FeError;
use femeta::journal::MemoryJournal;
use femeta::query::ScanRequest;
use femeta::Frontend;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Harness {
    fe: Frontend,
    workers: Arc<LocalWorkers>,
    txns: Arc<LocalTxnManager>,
}

fn harness_with(config: FeConfig) -> Harness {
    let workers = Arc::new(LocalWorkers::default());
    let txns = Arc::new(LocalTxnManager::default());
    let fe = Frontend::open_with_journal(
        config,
        Arc::new(MemoryJournal::new()),
        None,
        ClusterServices::new(workers.clone(), txns.clone()),
    )
    .expect("open");
    fe.create_database("db1").expect("db");
    fe.create_table(
        "db1",
        CreateTableRequest::olap("tbl1", vec![ColumnDef::key("k1", ColumnType::Int)]),
    )
    .expect("tbl1");
    Harness { fe, workers, txns }
}

fn harness() -> Harness {
    harness_with(FeConfig::for_tests())
}

fn add_k2() -> AlterTableRequest {
    AlterTableRequest::new(
        "db1",
        "tbl1",
        vec![AlterClause::AddColumn {
            column: ColumnDef::value("k2", ColumnType::Int).with_default("1"),
            position: None,
            rollup: None,
        }],
    )
}

fn tick_until_done(fe: &Frontend, job_id: u64, max_ticks: usize) -> JobState {
    for _ in 0..max_ticks {
        let state = fe.job_info(job_id).expect("info").state;
        if state.is_final_state() {
            return state;
        }
        fe.tick();
    }
    fe.job_info(job_id).expect("info").state
}

#[test]
fn add_column_publishes_new_base_schema() {
    let h = harness();
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    let pending = h.fe.job_info(job_id).expect("info");
    assert_eq!(pending.state, JobState::Pending);
    assert_eq!(pending.job_type, JobType::SchemaChange);

    assert_eq!(tick_until_done(&h.fe, job_id, 10), JobState::Finished);

    let table = h.fe.catalog().table_snapshot("db1", "tbl1").expect("table");
    assert_eq!(table.state(), TableState::Normal);
    assert_eq!(table.base_schema().len(), 2);
    assert_eq!(table.index_name_by_id(table.base_index_id()), Some("tbl1"));
    assert_eq!(table.base_index_meta().schema_version, 1);

    let plan = h.fe.plan_query(&ScanRequest::table("db1", "tbl1")).expect("plan");
    assert_eq!(plan.index_name(), "tbl1");
    assert!(plan.children.is_empty());

    let info = h.fe.job_info(job_id).expect("info");
    assert!(info.finished_at_ms.is_some());
    assert_eq!(info.error_msg, None);
}

#[test]
fn second_alter_on_busy_table_is_rejected_without_a_job() {
    let h = harness();
    h.workers.hold();
    let first = h.fe.process_alter_table(&add_k2()).expect("alter");
    let err = h
        .fe
        .process_alter_table(&AlterTableRequest::new(
            "db1",
            "tbl1",
            vec![AlterClause::AddRollup {
                name: "r1".into(),
                columns: vec!["k1".into()],
            }],
        ))
        .expect_err("busy");
    assert!(matches!(err, FeError::ConcurrentModification { job_id, .. } if job_id == first));
    assert!(h.fe.get_alter_jobs(JobType::Rollup).is_empty());
    assert!(matches!(
        h.fe.drop_table("db1", "tbl1"),
        Err(FeError::ConcurrentModification { .. })
    ));
    assert!(matches!(
        h.fe.drop_database("db1"),
        Err(FeError::HasActiveJobs { .. })
    ));
}

#[test]
fn validation_errors_create_no_job() {
    let h = harness();
    let cases = [
        AlterTableRequest::new(
            "db1",
            "tbl1",
            vec![AlterClause::AddColumn {
                column: ColumnDef::value("k1", ColumnType::Int),
                position: None,
                rollup: None,
            }],
        ),
        AlterTableRequest::new(
            "db1",
            "nope",
            vec![AlterClause::DropColumn {
                name: "k1".into(),
                rollup: None,
            }],
        ),
        AlterTableRequest::new("nope", "tbl1", vec![]),
    ];
    for request in &cases {
        assert!(h.fe.process_alter_table(request).is_err());
    }
    assert!(h.fe.get_alter_jobs(JobType::SchemaChange).is_empty());
    assert_eq!(
        h.fe.catalog().table_snapshot("db1", "tbl1").expect("table").state(),
        TableState::Normal
    );
}

#[test]
fn cancel_while_running_releases_work_and_keeps_old_schema() {
    let h = harness();
    h.workers.hold();
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    h.fe.tick();
    h.fe.tick();
    assert_eq!(h.fe.job_info(job_id).expect("info").state, JobState::Running);
    assert_eq!(h.workers.task_count(), 1);

    h.fe.cancel_alter_job(job_id, "user cancelled").expect("cancel");
    assert_eq!(h.fe.job_info(job_id).expect("info").state, JobState::Running);
    h.fe.tick();
    let info = h.fe.job_info(job_id).expect("info");
    assert_eq!(info.state, JobState::Cancelled);
    assert_eq!(info.error_msg.as_deref(), Some("user cancelled"));
    assert_eq!(h.workers.released().len(), 1);
    assert_eq!(h.workers.task_count(), 0);

    let table = h.fe.catalog().table_snapshot("db1", "tbl1").expect("table");
    assert_eq!(table.state(), TableState::Normal);
    assert_eq!(table.base_schema().len(), 1);
    assert_eq!(table.base_index_meta().schema_version, 0);

    assert!(matches!(
        h.fe.cancel_alter_job(job_id, "again"),
        Err(FeError::JobAlreadyFinal { .. })
    ));
    // The table accepts a new job once the cancelled one let go of it.
    h.workers.resume();
    let retry = h.fe.process_alter_table(&add_k2()).expect("alter again");
    assert_eq!(tick_until_done(&h.fe, retry, 10), JobState::Finished);
}

#[test]
fn open_transactions_hold_the_job_in_waiting_txn() {
    let h = harness();
    let db_id = h.fe.catalog().database("db1").expect("db").id();
    let txn = h.txns.begin(db_id);
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    for _ in 0..5 {
        h.fe.tick();
    }
    let job = h.fe.alter().job(job_id).expect("job");
    assert_eq!(job.state, JobState::WaitingTxn);
    assert!(job.watershed_txn_id.is_some_and(|w| w > txn));
    assert_eq!(h.workers.dispatch_count(), 0);

    // Transactions begun after the watershed do not block the job.
    let later = h.txns.begin(db_id);
    assert!(h.txns.finish(txn));
    h.fe.tick();
    assert_eq!(h.fe.job_info(job_id).expect("info").state, JobState::Running);
    assert!(h.txns.finish(later));
    assert_eq!(tick_until_done(&h.fe, job_id, 5), JobState::Finished);
}

#[test]
fn transient_dispatch_failures_are_retried() {
    let h = harness();
    h.workers.fail_next_dispatches(2);
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    assert_eq!(tick_until_done(&h.fe, job_id, 10), JobState::Finished);
    assert_eq!(
        h.fe.catalog().table_snapshot("db1", "tbl1").expect("table").base_schema().len(),
        2
    );
}

#[test]
fn persistent_task_failure_fails_the_job() {
    let h = harness_with(FeConfig {
        max_job_step_attempts: 3,
        ..FeConfig::for_tests()
    });
    h.workers.set_task_failure(Some("disk full"));
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    assert_eq!(tick_until_done(&h.fe, job_id, 20), JobState::Failed);
    let info = h.fe.job_info(job_id).expect("info");
    let msg = info.error_msg.expect("failure reason");
    assert!(msg.starts_with("giving up after 3 attempts"), "{msg}");
    assert!(msg.contains("disk full"), "{msg}");
    let table = h.fe.catalog().table_snapshot("db1", "tbl1").expect("table");
    assert_eq!(table.state(), TableState::Normal);
    assert_eq!(table.base_schema().len(), 1);
}

#[test]
fn jobs_past_their_timeout_fail() {
    let h = harness_with(FeConfig {
        alter_job_timeout_ms: 1,
        ..FeConfig::for_tests()
    });
    h.workers.hold();
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    std::thread::sleep(Duration::from_millis(5));
    h.fe.tick();
    let info = h.fe.job_info(job_id).expect("info");
    assert_eq!(info.state, JobState::Failed);
    assert_eq!(info.error_msg.as_deref(), Some("timeout"));
}

#[test]
fn rollup_job_adds_a_queryable_index() {
    let h = harness();
    h.fe.create_table(
        "db1",
        CreateTableRequest::olap(
            "sales",
            vec![
                ColumnDef::key("region", ColumnType::Varchar(32)),
                ColumnDef::key("day", ColumnType::Date),
                ColumnDef::value("amount", ColumnType::BigInt),
            ],
        ),
    )
    .expect("sales");
    let job_id = h
        .fe
        .process_alter_table(&AlterTableRequest::new(
            "db1",
            "sales",
            vec![AlterClause::AddRollup {
                name: "by_region".into(),
                columns: vec!["region".into(), "amount".into()],
            }],
        ))
        .expect("rollup");
    assert_eq!(tick_until_done(&h.fe, job_id, 10), JobState::Finished);

    let plan = h
        .fe
        .plan_query(&ScanRequest::table("db1", "sales").with_columns(&["region", "amount"]))
        .expect("plan");
    assert_eq!(plan.index_name(), "by_region");
    let full = h.fe.plan_query(&ScanRequest::table("db1", "sales")).expect("plan");
    assert_eq!(full.index_name(), "sales");

    h.fe.drop_rollup("db1", "sales", "by_region").expect("drop rollup");
    let plan = h
        .fe
        .plan_query(&ScanRequest::table("db1", "sales").with_columns(&["region", "amount"]))
        .expect("plan");
    assert_eq!(plan.index_name(), "sales");
}

#[test]
fn readers_see_either_the_old_or_the_new_schema() {
    let h = harness();
    h.workers.hold();
    let job_id = h.fe.process_alter_table(&add_k2()).expect("alter");
    h.fe.tick();
    h.fe.tick();
    let stop = AtomicBool::new(false);

    std::thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let mut seen_new = false;
                    while !stop.load(Ordering::Acquire) {
                        let table = h.fe.catalog().table_snapshot("db1", "tbl1").expect("table");
                        let base = table.base_index_meta();
                        match (base.schema_version, base.columns.len()) {
                            (0, 1) => assert!(!seen_new, "schema went backwards"),
                            (1, 2) => seen_new = true,
                            other => panic!("half-published schema {other:?}"),
                        }
                    }
                })
            })
            .collect();

        h.workers.resume();
        assert_eq!(tick_until_done(&h.fe, job_id, 10), JobState::Finished);
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        for reader in readers {
            reader.join().expect("reader");
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_scheduler_completes_jobs_on_many_tables() {
    let h = harness();
    let mut jobs = Vec::new();
    for i in 0..8 {
        let name = format!("t{i}");
        h.fe.create_table(
            "db1",
            CreateTableRequest::olap(&name, vec![ColumnDef::key("k1", ColumnType::Int)]),
        )
        .expect("table");
        jobs.push(
            h.fe
                .process_alter_table(&AlterTableRequest::new(
                    "db1",
                    &name,
                    vec![AlterClause::AddColumn {
                        column: ColumnDef::value("v1", ColumnType::Int),
                        position: None,
                        rollup: None,
                    }],
                ))
                .expect("alter"),
        );
    }
    h.fe.start_scheduler();
    for job_id in jobs {
        let job = h
            .fe
            .wait_for_job(job_id, Duration::from_secs(10))
            .await
            .expect("job settles");
        assert_eq!(job.state, JobState::Finished);
    }
    h.fe.shutdown().await.expect("shutdown");
}
