use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use pageview_import::{ImportConfig, ImportError, LogManager, PageviewImporter, SqliteStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let matches = Command::new("pageview-import")
        .about("Import pageview rows from a CSV export, skipping records already stored")
        .arg(
            Arg::new("path")
                .long("path")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true)
                .help("CSV export to import (.csv, .csv.gz or .csv.zst)"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("pageviews.db")
                .help("SQLite database file; created when missing"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_parser(clap::value_parser!(usize))
                .help("Records per insert batch (1-5000)"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Directory for the per-run log file"),
        )
        .arg(
            Arg::new("charset")
                .long("charset")
                .help("Input character set, e.g. windows-1252"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the summary as JSON")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = ImportConfig::from_env().context("invalid PAGEVIEW_IMPORT_* environment")?;
    if let Some(n) = matches.get_one::<usize>("batch-size") {
        config.batch_size = *n;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("log-dir") {
        config.log_dir = dir.clone();
    }
    if let Some(charset) = matches.get_one::<String>("charset") {
        config.charset = charset.clone();
    }
    config.validate().context("invalid command-line options")?;

    let path = matches
        .get_one::<PathBuf>("path")
        .ok_or_else(|| anyhow::anyhow!("Provide --path <file>"))?;
    let db = matches
        .get_one::<PathBuf>("db")
        .ok_or_else(|| anyhow::anyhow!("Provide --db <file>"))?;

    let mut log = LogManager::create(&config.log_dir)
        .map_err(ImportError::Log)
        .with_context(|| format!("creating run log in {}", config.log_dir.display()))?;
    let store = SqliteStore::open(db)
        .await
        .with_context(|| format!("opening database {}", db.display()))?;
    let importer = PageviewImporter::new(Arc::new(store), config);

    let summary = match importer.run(path, &mut log).await {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Import failed: {e}");
            eprintln!("Log file: {}", log.path().display());
            log.close()?;
            return Ok(ExitCode::FAILURE);
        }
    };
    log.close()?;

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
        println!("Log file:               {}", log.path().display());
    }

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
