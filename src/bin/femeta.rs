use femeta::config::{FeConfig, RecoveryMode};
use femeta::offline;
use std::path::Path;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "journal" => match args.get(2).map(String::as_str) {
            Some("dump") => cmd_journal_dump(&args[3..]),
            Some(other) => Err(format!("unknown journal command: {other}")),
            None => Err("missing journal subcommand".into()),
        },
        "jobs" => match args.get(2).map(String::as_str) {
            Some("list") => cmd_jobs_list(&args[3..]),
            Some(other) => Err(format!("unknown jobs command: {other}")),
            None => Err("missing jobs subcommand".into()),
        },
        "catalog" => match args.get(2).map(String::as_str) {
            Some("show") => cmd_catalog_show(&args[3..]),
            Some(other) => Err(format!("unknown catalog command: {other}")),
            None => Err("missing catalog subcommand".into()),
        },
        "check" => match args.get(2).map(String::as_str) {
            Some("invariants") => cmd_check_invariants(&args[3..]),
            Some(other) => Err(format!("unknown check command: {other}")),
            None => Err("missing check subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_journal_dump(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let config = parse_recovery_config(args);
    let entries = offline::journal_dump(Path::new(&data_dir), &config)
        .map_err(|e| format!("journal dump: {e}"))?;
    for entry in entries {
        let line = serde_json::to_string(&entry).map_err(|e| format!("encode: {e}"))?;
        println!("{line}");
    }
    Ok(())
}

fn cmd_jobs_list(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let config = parse_recovery_config(args);
    let report = offline::jobs_report(Path::new(&data_dir), &config)
        .map_err(|e| format!("jobs: {e}"))?;
    if args.iter().any(|a| a == "--json") {
        let json = serde_json::to_string_pretty(&report).map_err(|e| format!("encode: {e}"))?;
        println!("{json}");
        return Ok(());
    }
    for job in &report.jobs {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            job.job_id,
            job.job_type,
            job.table_name,
            job.state,
            job.progress,
            job.error_msg.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_catalog_show(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let config = parse_recovery_config(args);
    let summary = offline::catalog_summary(Path::new(&data_dir), &config)
        .map_err(|e| format!("catalog: {e}"))?;
    let json = serde_json::to_string_pretty(&summary).map_err(|e| format!("encode: {e}"))?;
    println!("{json}");
    Ok(())
}

fn cmd_check_invariants(args: &[String]) -> Result<(), String> {
    let data_dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let config = parse_recovery_config(args);
    let report = offline::invariant_report(Path::new(&data_dir), &config)
        .map_err(|e| format!("invariants: {e}"))?;
    println!(
        "{}\t{}\t{}",
        if report.ok { "ok" } else { "violations" },
        report.table_count,
        report.active_jobs
    );
    for v in &report.violations {
        println!("violation\t{v}");
    }
    if report.ok {
        Ok(())
    } else {
        Err("invariant violations found".into())
    }
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn parse_recovery_config(args: &[String]) -> FeConfig {
    let mut cfg = FeConfig::default();
    if args.iter().any(|a| a == "--permissive") {
        cfg.recovery_mode = RecoveryMode::Permissive;
        cfg.hash_chain_required = false;
    }
    cfg
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  femeta journal dump --data-dir <fe-dir> [--permissive]");
    eprintln!("  femeta jobs list --data-dir <fe-dir> [--json] [--permissive]");
    eprintln!("  femeta catalog show --data-dir <fe-dir> [--permissive]");
    eprintln!("  femeta check invariants --data-dir <fe-dir> [--permissive]");
}
