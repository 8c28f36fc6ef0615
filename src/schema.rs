use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Executor, SqlitePool};
use tracing::{info, warn};

use crate::config::MigrationConfig;
use crate::filer::ManagedFileStore;
use crate::migration::{migrate_to_managed_files, MigrationReport};
use crate::{AppError, AppResult};

enum StepKind {
    Sql(&'static str),
    MigrateToFiler,
}

struct SchemaStep {
    version: &'static str,
    kind: StepKind,
}

static STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: "0001_cms_plugins",
        kind: StepKind::Sql(include_str!("../migrations/0001_cms_plugins.sql")),
    },
    SchemaStep {
        version: "0002_filer",
        kind: StepKind::Sql(include_str!("../migrations/0002_filer.sql")),
    },
    SchemaStep {
        version: "0003_file_plugin",
        kind: StepKind::Sql(include_str!("../migrations/0003_file_plugin.sql")),
    },
    SchemaStep {
        version: "0004_folder_plugin",
        kind: StepKind::Sql(include_str!("../migrations/0004_folder_plugin.sql")),
    },
    SchemaStep {
        version: "0005_file_plugin_add_file_src",
        kind: StepKind::Sql(include_str!(
            "../migrations/0005_file_plugin_add_file_src.sql"
        )),
    },
    SchemaStep {
        version: "0006_migrate_to_filer",
        kind: StepKind::MigrateToFiler,
    },
    SchemaStep {
        version: "0007_file_plugin_drop_file",
        kind: StepKind::Sql(include_str!("../migrations/0007_file_plugin_drop_file.sql")),
    },
];

impl SchemaStep {
    fn checksum(&self) -> String {
        match self.kind {
            StepKind::Sql(sql) => {
                let cleaned = sql
                    .lines()
                    .filter(|line| {
                        let t = line.trim_start();
                        !(t.is_empty() || t.starts_with("--"))
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                hex::encode(Sha256::digest(cleaned.as_bytes()))
            }
            StepKind::MigrateToFiler => hex::encode(Sha256::digest(self.version.as_bytes())),
        }
    }
}

/// Every known step version, in apply order.
pub fn step_versions() -> Vec<&'static str> {
    STEPS.iter().map(|step| step.version).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepStatus {
    pub version: String,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaReport {
    /// Versions applied by this call.
    pub applied: Vec<String>,
    /// Outcome of the data step, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MigrationReport>,
}

async fn ensure_table(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "schema_table_create"))?;
    Ok(())
}

/// Recorded versions and their checksums.
pub async fn applied_versions(pool: &SqlitePool) -> AppResult<HashMap<String, String>> {
    ensure_table(pool).await?;
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT version, checksum FROM schema_migrations")
            .fetch_all(pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "schema_applied"))?;
    Ok(rows.into_iter().collect())
}

pub async fn status(pool: &SqlitePool) -> AppResult<Vec<StepStatus>> {
    let applied = applied_versions(pool).await?;
    Ok(STEPS
        .iter()
        .map(|step| StepStatus {
            version: step.version.to_string(),
            applied: applied.contains_key(step.version),
        })
        .collect())
}

async fn record(pool: &SqlitePool, step: &SchemaStep) -> AppResult<()> {
    sqlx::query("INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)")
        .bind(step.version)
        .bind(Utc::now().timestamp_millis())
        .bind(step.checksum())
        .execute(pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "schema_record")
                .with_context("version", step.version)
        })?;
    Ok(())
}

async fn apply_sql(pool: &SqlitePool, step: &SchemaStep, sql: &str) -> AppResult<()> {
    let wrap = |err: sqlx::Error| {
        AppError::from(err)
            .with_context("operation", "schema_apply")
            .with_context("version", step.version)
    };

    let mut tx = pool.begin().await.map_err(wrap)?;
    sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(wrap)?;
    let violations = sqlx::query("PRAGMA foreign_key_check;")
        .fetch_all(&mut *tx)
        .await
        .map_err(wrap)?;
    if !violations.is_empty() {
        return Err(AppError::new(
            "MIGRATE/FOREIGN_KEY",
            "Schema step left foreign key violations.",
        )
        .with_context("version", step.version)
        .with_context("violations", violations.len().to_string()));
    }
    sqlx::query("INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)")
        .bind(step.version)
        .bind(Utc::now().timestamp_millis())
        .bind(step.checksum())
        .execute(&mut *tx)
        .await
        .map_err(wrap)?;
    tx.commit().await.map_err(wrap)?;
    Ok(())
}

/// Apply pending steps up to and including `target` (every step when `None`).
///
/// Recorded steps are skipped, so calling this again is a no-op. The data
/// step is only recorded once no row was left behind; otherwise the run stops
/// before the raw column is dropped unless `force_drop_legacy` is set.
pub async fn apply_migrations<S>(
    pool: &SqlitePool,
    target: Option<&str>,
    store: &S,
    config: &MigrationConfig,
) -> AppResult<SchemaReport>
where
    S: ManagedFileStore,
{
    let mut report = SchemaReport::default();
    apply_migrations_into(pool, target, store, config, &mut report).await?;
    Ok(report)
}

/// Like [`apply_migrations`], but progress lands in `report` as it happens so
/// the data step's outcome survives a failed run.
pub async fn apply_migrations_into<S>(
    pool: &SqlitePool,
    target: Option<&str>,
    store: &S,
    config: &MigrationConfig,
    report: &mut SchemaReport,
) -> AppResult<()>
where
    S: ManagedFileStore,
{
    if !config.mode.is_apply() {
        return Err(AppError::new(
            "MIGRATE/DRY_RUN",
            "Schema upgrades cannot run in dry-run mode.",
        ));
    }

    let last = match target {
        Some(target) => STEPS
            .iter()
            .position(|step| step.version == target)
            .ok_or_else(|| {
                AppError::new("MIGRATE/UNKNOWN_TARGET", "Unknown schema version.")
                    .with_context("version", target.to_string())
            })?,
        None => STEPS.len() - 1,
    };

    let applied = applied_versions(pool).await?;

    for step in &STEPS[..=last] {
        if let Some(recorded) = applied.get(step.version) {
            if *recorded != step.checksum() {
                return Err(AppError::new(
                    "MIGRATE/CHECKSUM",
                    "An applied schema step has changed since it ran.",
                )
                .with_context("version", step.version));
            }
            continue;
        }

        match step.kind {
            StepKind::Sql(sql) => apply_sql(pool, step, sql).await?,
            StepKind::MigrateToFiler => {
                let data = migrate_to_managed_files(pool, store, config).await?;
                let skipped = data.counts.skipped;
                let skipped_ids = data
                    .skipped_ids
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                report.data = Some(data);

                if skipped > 0 {
                    if !config.force_drop_legacy {
                        return Err(AppError::new(
                            "MIGRATE/LEGACY_REMAIN",
                            "Some file plugins still reference raw files; fix them and rerun.",
                        )
                        .with_context("version", step.version)
                        .with_context("skipped", skipped.to_string())
                        .with_context("ids", skipped_ids));
                    }
                    warn!(
                        target: "pagefile",
                        event = "schema_force_drop_legacy",
                        skipped,
                        ids = %skipped_ids
                    );
                }
                record(pool, step).await?;
            }
        }

        info!(target: "pagefile", event = "schema_step_applied", version = step.version);
        report.applied.push(step.version.to_string());
    }

    Ok(())
}
