use femeta::alter::job::JobState;
use femeta::alter::{AlterClause, AlterTableRequest};
use femeta::catalog::CreateTableRequest;
use femeta::catalog::schema::ColumnDef;
use femeta::catalog::types::ColumnType;
use femeta::cluster::ClusterServices;
use femeta::config::FeConfig;
use femeta::offline;
use femeta::Frontend;
use std::fs;
use tempfile::tempdir;

fn populated_dir() -> (tempfile::TempDir, u64) {
    let dir = tempdir().expect("tempdir");
    let fe = Frontend::open(FeConfig::for_tests(), dir.path(), ClusterServices::local())
        .expect("open");
    fe.create_database("db1").expect("db");
    fe.create_table(
        "db1",
        CreateTableRequest::olap(
            "tbl1",
            vec![
                ColumnDef::key("k1", ColumnType::Int),
                ColumnDef::value("v1", ColumnType::BigInt),
            ],
        ),
    )
    .expect("table");
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
    for _ in 0..3 {
        fe.tick();
    }
    assert_eq!(fe.job_info(job_id).expect("info").state, JobState::Finished);
    (dir, job_id)
}

fn listing(dir: &std::path::Path) -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = fs::read_dir(dir.join("journal"))
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| {
            let len = e.metadata().expect("metadata").len();
            (e.file_name().to_string_lossy().to_string(), len)
        })
        .collect();
    out.sort();
    out
}

#[test]
fn journal_dump_lists_every_record_in_order() {
    let (dir, job_id) = populated_dir();
    let before = listing(dir.path());
    let entries = offline::journal_dump(dir.path(), &FeConfig::for_tests()).expect("dump");
    assert_eq!(listing(dir.path()), before, "dump must not touch the directory");

    let ops: Vec<&str> = entries.iter().map(|e| e.op).collect();
    assert_eq!(ops[0], "create_database");
    assert_eq!(ops[1], "create_table");
    assert!(ops[2..].iter().all(|op| *op == "upsert_alter_job"));
    assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    let last = serde_json::to_string(&entries.last().expect("entry").payload).expect("json");
    assert!(last.contains(&job_id.to_string()));
}

#[test]
fn jobs_and_catalog_reports_reflect_recovered_state() {
    let (dir, job_id) = populated_dir();
    let jobs = offline::jobs_report(dir.path(), &FeConfig::for_tests()).expect("jobs");
    assert_eq!(jobs.jobs.len(), 1);
    assert_eq!(jobs.jobs[0].job_id, job_id);
    assert_eq!(jobs.by_state.get("FINISHED"), Some(&1));
    assert_eq!(jobs.by_state.get("RUNNING"), Some(&0));

    let catalog = offline::catalog_summary(dir.path(), &FeConfig::for_tests()).expect("catalog");
    assert_eq!(catalog.len(), 1);
    let table = &catalog[0].tables[0];
    assert_eq!(table.name, "tbl1");
    assert_eq!(table.state, "NORMAL");
    let names: Vec<&str> = table.indexes.iter().map(|i| i.name.as_str()).collect();
    assert!(names.contains(&"tbl1") && names.contains(&"r1"));

    let invariants = offline::invariant_report(dir.path(), &FeConfig::for_tests()).expect("check");
    assert!(invariants.ok, "{:?}", invariants.violations);
    assert_eq!(invariants.table_count, 1);
    assert_eq!(invariants.active_jobs, 0);
}
