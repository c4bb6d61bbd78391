use super::Frontend;
use crate::alter::job::{JobState, JobType};
use crate::alter::{AlterClause, AlterTableRequest};
use crate::catalog::CreateTableRequest;
use crate::catalog::schema::ColumnDef;
use crate::catalog::types::ColumnType;
use crate::cluster::ClusterServices;
use crate::cluster::local::{LocalTxnManager, LocalWorkers};
use crate::config::FeConfig;
use crate::error::{FeError, FeErrorCode};
use crate::journal::MemoryJournal;
use crate::query::ScanRequest;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn seed(fe: &Frontend) {
    fe.create_database("db1").expect("create db");
    fe.create_table(
        "db1",
        CreateTableRequest::olap("tbl1", vec![ColumnDef::key("k1", ColumnType::Int)]),
    )
    .expect("create table");
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

fn held_cluster() -> (Arc<LocalWorkers>, ClusterServices) {
    let workers = Arc::new(LocalWorkers::default());
    workers.hold();
    let cluster = ClusterServices::new(workers.clone(), Arc::new(LocalTxnManager::default()));
    (workers, cluster)
}

#[test]
fn open_on_disk_runs_add_column_to_completion() {
    let dir = tempdir().expect("tempdir");
    let fe = Frontend::open(FeConfig::for_tests(), dir.path(), ClusterServices::local())
        .expect("open");
    assert!(dir.path().join("journal").is_dir());
    assert!(dir.path().join("checkpoints").is_dir());
    seed(&fe);

    let job_id = fe.process_alter_table(&add_k2()).expect("alter");
    assert_eq!(fe.job_info(job_id).expect("info").state, JobState::Pending);
    for _ in 0..3 {
        fe.tick();
    }
    let info = fe.job_info(job_id).expect("info");
    assert_eq!(info.state, JobState::Finished);
    assert_eq!(info.progress, "1/1");

    let plan = fe
        .plan_query(&ScanRequest::table("db1", "tbl1"))
        .expect("plan");
    assert_eq!(plan.index_name(), "tbl1");
    assert!(plan.children.is_empty());
    assert!(plan.explain().contains("schema_version=1 columns=[k1, k2]"));
}

#[test]
fn invalid_config_is_rejected_at_open() {
    let config = FeConfig {
        max_concurrent_job_steps: 0,
        ..FeConfig::for_tests()
    };
    let err = Frontend::open_with_journal(
        config,
        Arc::new(MemoryJournal::new()),
        None,
        ClusterServices::local(),
    )
    .expect_err("invalid config");
    assert_eq!(err.code(), FeErrorCode::InvalidConfig);
}

#[test]
fn checkpoint_requires_a_directory() {
    let fe = Frontend::open_with_journal(
        FeConfig::for_tests(),
        Arc::new(MemoryJournal::new()),
        None,
        ClusterServices::local(),
    )
    .expect("open");
    assert!(matches!(fe.checkpoint(), Err(FeError::Validation(_))));
}

#[test]
fn checkpoint_then_reopen_restores_catalog_and_jobs() {
    let dir = tempdir().expect("tempdir");
    let (finished, running) = {
        let (_workers, cluster) = held_cluster();
        let fe = Frontend::open(FeConfig::for_tests(), dir.path(), cluster).expect("open");
        seed(&fe);
        fe.create_table(
            "db1",
            CreateTableRequest::olap("tbl2", vec![ColumnDef::key("k1", ColumnType::Int)]),
        )
        .expect("tbl2");

        let rollup = AlterTableRequest::new(
            "db1",
            "tbl2",
            vec![AlterClause::AddRollup {
                name: "r1".into(),
                columns: vec!["k1".into()],
            }],
        );
        let running = fe.process_alter_table(&rollup).expect("rollup");
        let finished = fe.process_alter_table(&add_k2()).expect("alter");
        fe.cancel_alter_job(finished, "changed my mind").expect("cancel");
        fe.tick();
        fe.tick();
        assert_eq!(fe.job_info(running).expect("info").state, JobState::Running);

        let meta = fe.checkpoint().expect("checkpoint");
        assert!(meta.filename.starts_with("image_"));
        (finished, running)
    };

    let fe = Frontend::open(FeConfig::for_tests(), dir.path(), ClusterServices::local())
        .expect("reopen");
    let report = fe.recovery_report();
    assert!(report.checkpoint_seq.is_some());
    assert_eq!(report.replayed, 0);
    assert_eq!(report.resumed_jobs, 1);

    let cancelled = fe.job_info(finished).expect("info");
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.error_msg.as_deref(), Some("changed my mind"));
    assert_eq!(
        fe.catalog()
            .table_snapshot("db1", "tbl1")
            .expect("tbl1")
            .base_schema()
            .len(),
        1
    );

    // The restarted workers never saw the task; the job re-dispatches it.
    for _ in 0..3 {
        fe.tick();
    }
    assert_eq!(fe.job_info(running).expect("info").state, JobState::Finished);
    let tbl2 = fe.catalog().table_snapshot("db1", "tbl2").expect("tbl2");
    assert!(tbl2.index_id_by_name("r1").is_some());

    let next_id = fe.catalog().next_id();
    assert!(next_id > running);
}

#[test]
fn rollup_jobs_are_listed_per_type() {
    let fe = Frontend::open_with_journal(
        FeConfig::for_tests(),
        Arc::new(MemoryJournal::new()),
        None,
        ClusterServices::local(),
    )
    .expect("open");
    seed(&fe);
    let job_id = fe
        .process_alter_table(&AlterTableRequest::new(
            "db1",
            "tbl1",
            vec![AlterClause::AddRollup {
                name: "r1".into(),
                columns: vec!["k1".into()],
            }],
        ))
        .expect("rollup");
    assert!(fe.get_alter_jobs(JobType::Rollup).contains_key(&job_id));
    assert!(fe.get_alter_jobs(JobType::SchemaChange).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_job_returns_when_scheduler_finishes() {
    let fe = Frontend::open_with_journal(
        FeConfig::for_tests(),
        Arc::new(MemoryJournal::new()),
        None,
        ClusterServices::local(),
    )
    .expect("open");
    seed(&fe);
    fe.start_scheduler();
    fe.start_scheduler();
    assert!(fe.is_scheduler_running());

    let job_id = fe.process_alter_table(&add_k2()).expect("alter");
    let job = fe
        .wait_for_job(job_id, Duration::from_secs(5))
        .await
        .expect("job settles");
    assert_eq!(job.state, JobState::Finished);

    fe.shutdown().await.expect("shutdown");
    assert!(!fe.is_scheduler_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_job_times_out_while_workers_are_held() {
    let (workers, cluster) = held_cluster();
    let fe = Frontend::open_with_journal(
        FeConfig::for_tests(),
        Arc::new(MemoryJournal::new()),
        None,
        cluster,
    )
    .expect("open");
    seed(&fe);
    fe.start_scheduler();
    let job_id = fe.process_alter_table(&add_k2()).expect("alter");

    let err = fe
        .wait_for_job(job_id, Duration::from_millis(100))
        .await
        .expect_err("still running");
    assert!(matches!(err, FeError::Timeout));
    assert!(matches!(
        fe.wait_for_job(9_999, Duration::from_millis(10)).await,
        Err(FeError::NotFound { .. })
    ));

    workers.resume();
    let job = fe
        .wait_for_job(job_id, Duration::from_secs(5))
        .await
        .expect("job settles");
    assert_eq!(job.state, JobState::Finished);
    fe.shutdown().await.expect("shutdown");
}
