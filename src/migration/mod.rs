//! Moves file plugins from raw media paths onto managed filer records.
//!
//! For every `file_plugins` row that still holds a raw path the migrator
//! derives a display name, resolves or creates the managed file, points the
//! row at it with a single-row update and finally retires the raw file.
//! Rows are independent: a row whose file cannot be read is skipped (or
//! aborts the batch under [`ResolutionPolicy::Abort`]) and is retried on the
//! next run, while already-migrated rows are never selected again.

mod retire;
mod rows;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::fs as async_fs;
use tokio::task;

use crate::config::{MigrationConfig, MigrationMode, ResolutionPolicy, RetirementMode};
use crate::db::column_exists;
use crate::filer::{ManagedFileDefaults, ManagedFileStore, Resolved};
use crate::paths::{derive_filename, hash_path, resolve_legacy_path};
use crate::{AppError, AppResult};

pub use retire::{archive_paths, dedup_paths, delete_paths, ArchiveSummary, RetirementOutcome};
pub use rows::{LegacyFileRow, MigratedFileRow};

const SKIP_REASON_INVALID_PATH: &str = "invalid_relative_path";
const SKIP_REASON_SOURCE_MISSING: &str = "missing_source";
const SKIP_REASON_SOURCE_UNREADABLE: &str = "unreadable_source";
const SKIP_REASON_STORE_FAILED: &str = "store_failed";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MigrationCounts {
    pub processed: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub created_files: u64,
    pub reused_files: u64,
    #[serde(default)]
    pub skipped_reasons: BTreeMap<String, u64>,
}

impl MigrationCounts {
    fn increment_processed(&mut self) {
        self.processed += 1;
    }

    fn record_migrated(&mut self, created: bool) {
        self.migrated += 1;
        if created {
            self.created_files += 1;
        } else {
            self.reused_files += 1;
        }
    }

    fn record_skip(&mut self, reason: &str) {
        self.skipped += 1;
        *self.skipped_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub mode: MigrationMode,
    /// False when the raw column was already gone and nothing was looked at.
    pub legacy_column_present: bool,
    pub counts: MigrationCounts,
    /// Ids of rows left unmigrated.
    #[serde(default)]
    pub skipped_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSummary>,
    #[serde(default)]
    pub retired: Vec<RetirementOutcome>,
}

impl MigrationReport {
    fn empty(mode: MigrationMode, legacy_column_present: bool) -> Self {
        Self {
            mode,
            legacy_column_present,
            counts: MigrationCounts::default(),
            skipped_ids: Vec::new(),
            archive: None,
            retired: Vec::new(),
        }
    }

    pub fn has_skipped(&self) -> bool {
        self.counts.skipped > 0
    }
}

/// Why a single row could not be resolved.
///
/// `contained` failures (unreadable sources, filesystem errors inside the
/// store) are skipped under [`ResolutionPolicy::Skip`]; the rest always
/// propagate.
struct RowFailure {
    reason: &'static str,
    contained: bool,
    error: AppError,
}

/// Point every `file_plugins` row that still has a raw path at a managed file,
/// then retire the raw files.
pub async fn migrate_to_managed_files<S>(
    pool: &SqlitePool,
    store: &S,
    config: &MigrationConfig,
) -> AppResult<MigrationReport>
where
    S: ManagedFileStore,
{
    let mode = config.mode;

    if !column_exists(pool, "file_plugins", "file").await? {
        tracing::info!(
            target: "pagefile",
            event = "filer_migration_noop",
            reason = "legacy_column_absent"
        );
        return Ok(MigrationReport::empty(mode, false));
    }

    // Loaded up front: updates below must not race an open cursor on a
    // single-connection pool.
    let rows = sqlx::query(rows::SELECT_LEGACY_SQL)
        .fetch_all(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "filer_migration_query"))?;

    let mut report = MigrationReport::empty(mode, true);
    let mut candidates: Vec<PathBuf> = Vec::new();

    for row in &rows {
        let legacy = LegacyFileRow::from_row(row)?;
        let Some(raw) = legacy.raw_reference() else {
            continue;
        };
        let raw = raw.to_string();

        report.counts.increment_processed();

        let filename = derive_filename(&raw).to_string();
        tracing::info!(
            target: "pagefile",
            event = "filer_migration_filename",
            id = legacy.id,
            filename = %filename,
            "Will use {filename} as filename."
        );

        let outcome = match resolve_legacy_path(config.media_root(), &raw) {
            None => Err(RowFailure {
                reason: SKIP_REASON_INVALID_PATH,
                contained: true,
                error: AppError::new(
                    "MIGRATE/INVALID_PATH",
                    "Raw file reference escapes the media root.",
                )
                .with_context("id", legacy.id.to_string()),
            }),
            Some(old_path) => {
                if mode.is_apply() {
                    resolve_row(store, &old_path, &filename)
                        .await
                        .map(|resolved| (old_path, Some(resolved)))
                } else {
                    check_readable(&old_path).await.map(|()| (old_path, None))
                }
            }
        };

        let (old_path, resolved) = match outcome {
            Ok(done) => done,
            Err(failure) => {
                if config.on_resolve_error == ResolutionPolicy::Abort || !failure.contained {
                    return Err(failure
                        .error
                        .with_context("operation", "filer_migration_resolve")
                        .with_context("id", legacy.id.to_string()));
                }
                tracing::warn!(
                    target: "pagefile",
                    event = "filer_migration_skip",
                    id = legacy.id,
                    reason = failure.reason,
                    error = %failure.error
                );
                report.counts.record_skip(failure.reason);
                report.skipped_ids.push(legacy.id);
                continue;
            }
        };

        match resolved {
            Some(resolved) => {
                let migrated = legacy.into_migrated(resolved.file.id);
                sqlx::query(rows::UPDATE_FILE_SRC_SQL)
                    .bind(migrated.file_src)
                    .bind(migrated.id)
                    .execute(pool)
                    .await
                    .map_err(|err| {
                        AppError::from(err)
                            .with_context("operation", "filer_migration_update")
                            .with_context("id", migrated.id.to_string())
                    })?;
                report.counts.record_migrated(resolved.created);
                tracing::debug!(
                    target: "pagefile",
                    event = "filer_migration_row_done",
                    id = migrated.id,
                    file_src = migrated.file_src,
                    created = resolved.created
                );
            }
            None => report.counts.migrated += 1,
        }

        candidates.push(old_path);
    }

    if mode.is_apply() {
        let candidates = dedup_paths(candidates);
        retire_candidates(config, candidates, &mut report).await?;
    }

    tracing::info!(
        target: "pagefile",
        event = "filer_migration_complete",
        mode = ?mode,
        processed = report.counts.processed,
        migrated = report.counts.migrated,
        skipped = report.counts.skipped,
        created_files = report.counts.created_files
    );

    Ok(report)
}

async fn resolve_row<S>(
    store: &S,
    old_path: &std::path::Path,
    filename: &str,
) -> Result<Resolved, RowFailure>
where
    S: ManagedFileStore,
{
    let raw = async_fs::File::open(old_path).await.map_err(|err| RowFailure {
        reason: open_failure_reason(&err),
        contained: true,
        error: AppError::from(err).with_context("path_hash", hash_path(old_path)),
    })?;

    let defaults = ManagedFileDefaults::from_filename(filename);
    store
        .get_or_create(raw, &defaults)
        .await
        .map_err(|error| RowFailure {
            reason: SKIP_REASON_STORE_FAILED,
            contained: error.is_io(),
            error,
        })
}

async fn check_readable(old_path: &std::path::Path) -> Result<(), RowFailure> {
    async_fs::File::open(old_path)
        .await
        .map(|_| ())
        .map_err(|err| RowFailure {
            reason: open_failure_reason(&err),
            contained: true,
            error: AppError::from(err).with_context("path_hash", hash_path(old_path)),
        })
}

fn open_failure_reason(err: &std::io::Error) -> &'static str {
    if err.kind() == std::io::ErrorKind::NotFound {
        SKIP_REASON_SOURCE_MISSING
    } else {
        SKIP_REASON_SOURCE_UNREADABLE
    }
}

async fn retire_candidates(
    config: &MigrationConfig,
    candidates: Vec<PathBuf>,
    report: &mut MigrationReport,
) -> AppResult<()> {
    if candidates.is_empty() {
        return Ok(());
    }

    if config.retirement == RetirementMode::ArchiveThenDelete {
        let archive = config.archive_path();
        let media_root = config.media_root.clone();
        let to_archive = candidates.clone();
        let summary =
            task::spawn_blocking(move || archive_paths(&archive, &media_root, &to_archive))
                .await
                .map_err(|err| {
                    AppError::new("RETIRE/ARCHIVE", "Archive task failed.")
                        .with_context("error", err.to_string())
                })??;
        report.archive = Some(summary);
    }

    let outcomes = delete_paths(&candidates);
    for outcome in &outcomes {
        let path_hash = hash_path(std::path::Path::new(&outcome.path));
        if outcome.deleted {
            tracing::info!(
                target: "pagefile",
                event = "retire_deleted",
                path_hash = %path_hash
            );
        } else {
            tracing::info!(
                target: "pagefile",
                event = "retire_delete_failed",
                path_hash = %path_hash,
                error = outcome.error.as_deref().unwrap_or_default()
            );
        }
    }
    report.retired = outcomes;

    Ok(())
}

/// Write `report` as pretty JSON via a synced temp file and a rename.
pub async fn write_report(path: &std::path::Path, report: &MigrationReport) -> AppResult<()> {
    use tokio::io::AsyncWriteExt;

    let serialized = serde_json::to_vec_pretty(report).map_err(|err| {
        AppError::from(err).with_context("operation", "filer_migration_report_encode")
    })?;

    let tmp_path = path.with_extension("tmp");
    let mut file = async_fs::File::create(&tmp_path).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "filer_migration_report_create")
            .with_context("path", tmp_path.display().to_string())
    })?;
    file.write_all(&serialized).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "filer_migration_report_write")
            .with_context("path", tmp_path.display().to_string())
    })?;
    file.sync_all().await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "filer_migration_report_sync")
            .with_context("path", tmp_path.display().to_string())
    })?;
    drop(file);

    async_fs::rename(&tmp_path, path).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "filer_migration_report_rename")
            .with_context("from", tmp_path.display().to_string())
            .with_context("to", path.display().to_string())
    })?;
    Ok(())
}
