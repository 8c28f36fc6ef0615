#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use pagefile_lib::config::{MigrationConfig, MigrationMode, ResolutionPolicy, RetirementMode};
use pagefile_lib::db::{column_exists, open_sqlite_pool};
use pagefile_lib::filer::SqliteFilerStore;
use pagefile_lib::logging::{self, LogOptions};
use pagefile_lib::migration::{migrate_to_managed_files, write_report, MigrationReport};
use pagefile_lib::plugin::count_legacy_references;
use pagefile_lib::schema;

#[derive(Parser)]
#[command(name = "migrate_files", about = "File plugin schema and filer migration helper")]
struct Cli {
    /// Optional explicit DB path
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Media root the raw file references are relative to
    #[arg(long, value_name = "DIR", global = true)]
    media_root: Option<PathBuf>,

    /// Where managed files are stored (defaults to <media-root>/filer_public)
    #[arg(long, value_name = "DIR", global = true)]
    filer_root: Option<PathBuf>,

    /// Also write JSON logs to a daily file in this directory
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show applied/pending schema steps and remaining raw references
    Status,
    /// Apply pending schema steps (optionally up to a target version)
    Up {
        /// Target version to stop at (inclusive)
        #[arg(long, value_name = "VERSION")]
        to: Option<String>,
        #[command(flatten)]
        flags: RunFlags,
        /// Drop the raw column even when rows were skipped
        #[arg(long)]
        force_drop: bool,
    },
    /// Run only the filer migration against the current schema
    Run {
        /// Report what would happen without touching rows or files
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        flags: RunFlags,
    },
}

#[derive(clap::Args)]
struct RunFlags {
    /// Delete raw files without writing the backup archive
    #[arg(long)]
    no_archive: bool,
    /// Fail the batch on the first unreadable raw file
    #[arg(long)]
    abort_on_error: bool,
    /// Write the migration report as JSON to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(&LogOptions {
        dir: cli.log_dir.clone(),
        default_filter: None,
    })?;

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };

    match &cli.cmd {
        Cmd::Status => status(&db_path).await,
        Cmd::Up {
            to,
            flags,
            force_drop,
        } => {
            let config = load_config(&cli, flags)?.with_force_drop_legacy(*force_drop);
            up(&db_path, to.as_deref(), &config, flags.report.as_deref()).await
        }
        Cmd::Run { dry_run, flags } => {
            let mode = if *dry_run {
                MigrationMode::DryRun
            } else {
                MigrationMode::Apply
            };
            let config = load_config(&cli, flags)?.with_mode(mode);
            run(&db_path, &config, flags.report.as_deref()).await
        }
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().unwrap_or(std::env::current_dir()?);
    Ok(base.join("pagefile").join("pagefile.sqlite3"))
}

fn load_config(cli: &Cli, flags: &RunFlags) -> Result<MigrationConfig> {
    let mut config = match &cli.media_root {
        Some(root) => MigrationConfig::new(root),
        None => MigrationConfig::from_env()?,
    };
    if let Some(filer_root) = &cli.filer_root {
        config = config.with_filer_root(filer_root);
    }
    if flags.no_archive {
        config = config.with_retirement(RetirementMode::Delete);
    }
    if flags.abort_on_error {
        config = config.with_resolution_policy(ResolutionPolicy::Abort);
    }
    Ok(config)
}

async fn status(db: &Path) -> Result<()> {
    println!("DB: {}", db.display());
    if !db.exists() {
        for version in schema::step_versions() {
            println!("{:<32}  pending", version);
        }
        println!("Legacy references: 0");
        return Ok(());
    }

    let pool = open_sqlite_pool(db, false).await?;
    let steps = schema::status(&pool).await?;
    for step in &steps {
        let state = if step.applied { "applied" } else { "pending" };
        println!("{:<32}  {}", step.version, state);
    }
    let applied = steps.iter().filter(|step| step.applied).count();
    println!("Applied: {}/{}", applied, steps.len());

    let legacy = if column_exists(&pool, "file_plugins", "file_src").await? {
        count_legacy_references(&pool).await?
    } else {
        0
    };
    println!("Legacy references: {}", legacy);
    Ok(())
}

async fn up(
    db: &Path,
    to: Option<&str>,
    config: &MigrationConfig,
    report_path: Option<&Path>,
) -> Result<()> {
    let pool = open_sqlite_pool(db, true).await?;
    let store = SqliteFilerStore::new(pool.clone(), config.filer_root.clone());

    let mut report = schema::SchemaReport::default();
    let outcome = schema::apply_migrations_into(&pool, to, &store, config, &mut report).await;

    if report.applied.is_empty() {
        println!("Nothing to apply.");
    } else {
        println!("Applied:");
        for version in &report.applied {
            println!("  {}", version);
        }
    }

    // Written even when a later step failed: skipped ids and retired paths
    // are what the operator needs to fix the remaining rows.
    if let Some(data) = &report.data {
        print_summary(data);
        if let Some(path) = report_path {
            write_report(path, data).await?;
        }
    }

    outcome?;
    Ok(())
}

async fn run(db: &Path, config: &MigrationConfig, report_path: Option<&Path>) -> Result<()> {
    let pool = open_sqlite_pool(db, false).await?;
    if !column_exists(&pool, "file_plugins", "file_src").await? {
        return Err(anyhow!(
            "file_plugins has no file_src column; run `up --to 0005_file_plugin_add_file_src` first"
        ));
    }

    let store = SqliteFilerStore::new(pool.clone(), config.filer_root.clone());
    let report = migrate_to_managed_files(&pool, &store, config).await?;
    print_summary(&report);
    if let Some(path) = report_path {
        write_report(path, &report).await?;
    }
    Ok(())
}

fn print_summary(report: &MigrationReport) {
    let counts = &report.counts;
    println!("Mode: {:?}", report.mode);
    println!("Processed: {}", counts.processed);
    println!("Migrated: {}", counts.migrated);
    println!("Skipped: {}", counts.skipped);
    println!("Created files: {}", counts.created_files);
    println!("Reused files: {}", counts.reused_files);
    if !report.skipped_ids.is_empty() {
        println!("Skipped ids: {:?}", report.skipped_ids);
    }
    if let Some(archive) = &report.archive {
        println!("Archive: {} ({} members)", archive.path, archive.members.len());
    }
}
