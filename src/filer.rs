//! Managed-file store.
//!
//! The migration only needs one thing from the file-management subsystem:
//! "give me the managed record for these bytes, creating it if needed".
//! [`ManagedFileStore`] is that seam; [`SqliteFilerStore`] is the
//! content-addressed implementation backed by the `filer_files` table.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::paths::hash_path;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFile {
    pub id: i64,
    pub name: String,
    pub original_filename: String,
    /// Storage path relative to the filer root.
    pub file: String,
    pub sha256: String,
    pub size: i64,
    pub folder_id: Option<i64>,
    pub uploaded_at: i64,
}

impl ManagedFile {
    /// Display label: the explicit name, else the original upload name.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.original_filename
        } else {
            &self.name
        }
    }

    fn from_row(row: &SqliteRow) -> AppResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            original_filename: row.try_get("original_filename")?,
            file: row.try_get("file")?,
            sha256: row.try_get("sha256")?,
            size: row.try_get("size")?,
            folder_id: row.try_get("folder_id")?,
            uploaded_at: row.try_get("uploaded_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFolder {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// Values used only when a new managed record has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFileDefaults {
    pub name: String,
    pub original_filename: String,
}

impl ManagedFileDefaults {
    /// Same value for the display name and the original filename.
    pub fn from_filename(filename: &str) -> Self {
        Self {
            name: filename.to_string(),
            original_filename: filename.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub file: ManagedFile,
    pub created: bool,
}

#[allow(async_fn_in_trait)]
pub trait ManagedFileStore {
    /// Return the managed record matching `raw`, creating it from `defaults`
    /// when none exists. Repeated calls with the same content return the same
    /// record.
    async fn get_or_create<R>(
        &self,
        raw: R,
        defaults: &ManagedFileDefaults,
    ) -> AppResult<Resolved>
    where
        R: AsyncRead + Unpin;
}

/// Read size for streaming a raw file into the staging area.
const COPY_CHUNK: usize = 64 * 1024;
/// Directory under the filer root where incoming bytes land before they are
/// hashed and placed.
const STAGING_DIR: &str = ".staging";

const FILE_COLUMNS: &str =
    "id, name, original_filename, file, sha256, size, folder_id, uploaded_at";

struct StagedFile {
    path: PathBuf,
    sha256: String,
    size: u64,
}

/// Content-addressed store: files live under
/// `<root>/<h0h1>/<h2h3>/<uuid>/<name>` and are matched by SHA-256.
#[derive(Debug, Clone)]
pub struct SqliteFilerStore {
    pool: SqlitePool,
    root: PathBuf,
}

impl SqliteFilerStore {
    pub fn new(pool: SqlitePool, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a record's bytes.
    pub fn path_of(&self, file: &ManagedFile) -> PathBuf {
        self.root.join(&file.file)
    }

    async fn find_by_sha256(&self, sha256: &str) -> AppResult<Option<ManagedFile>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM filer_files WHERE sha256 = ?1");
        let row = sqlx::query(&sql)
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "filer_lookup"))?;
        row.as_ref().map(ManagedFile::from_row).transpose()
    }

    /// Stream `raw` into a fresh staging file, hashing as it goes.
    async fn stage<R>(&self, raw: R) -> AppResult<StagedFile>
    where
        R: AsyncRead + Unpin,
    {
        let dir = self.root.join(STAGING_DIR);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|err| filer_io_error(err, "filer_create_dir", &dir))?;

        let path = dir.join(format!("{}.part", Uuid::new_v4()));
        match copy_hashing(raw, &path).await {
            Ok((sha256, size)) => Ok(StagedFile { path, sha256, size }),
            Err(err) => {
                async_fs::remove_file(&path).await.ok();
                Err(err)
            }
        }
    }

    async fn promote(&self, staged: &StagedFile, relative: &str) -> AppResult<PathBuf> {
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|err| filer_io_error(err, "filer_create_dir", parent))?;
        }
        async_fs::rename(&staged.path, &target)
            .await
            .map_err(|err| filer_io_error(err, "filer_rename", &target))?;
        Ok(target)
    }
}

async fn copy_hashing<R>(mut raw: R, path: &Path) -> AppResult<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut out = async_fs::File::create(path)
        .await
        .map_err(|err| filer_io_error(err, "filer_create", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut size = 0u64;
    loop {
        let read = raw
            .read(&mut buf)
            .await
            .map_err(|err| filer_io_error(err, "filer_read_source", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        out.write_all(&buf[..read])
            .await
            .map_err(|err| filer_io_error(err, "filer_write", path))?;
        size += read as u64;
    }
    out.flush()
        .await
        .map_err(|err| filer_io_error(err, "filer_write", path))?;
    out.sync_all()
        .await
        .map_err(|err| filer_io_error(err, "filer_sync", path))?;
    Ok((hex::encode(hasher.finalize()), size))
}

impl ManagedFileStore for SqliteFilerStore {
    async fn get_or_create<R>(
        &self,
        raw: R,
        defaults: &ManagedFileDefaults,
    ) -> AppResult<Resolved>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.stage(raw).await?;

        let existing = match self.find_by_sha256(&staged.sha256).await {
            Ok(existing) => existing,
            Err(err) => {
                async_fs::remove_file(&staged.path).await.ok();
                return Err(err);
            }
        };
        if let Some(existing) = existing {
            async_fs::remove_file(&staged.path).await.ok();
            tracing::debug!(
                target: "pagefile",
                event = "filer_reuse",
                id = existing.id,
                sha256 = %staged.sha256
            );
            return Ok(Resolved {
                file: existing,
                created: false,
            });
        }

        let relative = format!(
            "{}/{}/{}/{}",
            &staged.sha256[0..2],
            &staged.sha256[2..4],
            Uuid::new_v4(),
            storage_name(&defaults.original_filename)
        );
        let target = match self.promote(&staged, &relative).await {
            Ok(target) => target,
            Err(err) => {
                async_fs::remove_file(&staged.path).await.ok();
                return Err(err);
            }
        };

        let size = staged.size as i64;
        let now = Utc::now().timestamp_millis();
        let insert = sqlx::query(
            "INSERT INTO filer_files (name, original_filename, file, sha256, size, uploaded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&defaults.name)
        .bind(&defaults.original_filename)
        .bind(&relative)
        .bind(&staged.sha256)
        .bind(size)
        .bind(now)
        .execute(&self.pool)
        .await;

        let id = match insert {
            Ok(done) => done.last_insert_rowid(),
            Err(err) => {
                async_fs::remove_file(&target).await.ok();
                return Err(AppError::from(err)
                    .with_context("operation", "filer_insert")
                    .with_context("path_hash", hash_path(&target)));
            }
        };

        tracing::info!(
            target: "pagefile",
            event = "filer_created",
            id,
            size,
            path_hash = %hash_path(&target)
        );

        Ok(Resolved {
            file: ManagedFile {
                id,
                name: defaults.name.clone(),
                original_filename: defaults.original_filename.clone(),
                file: relative,
                sha256: staged.sha256,
                size,
                folder_id: None,
                uploaded_at: now,
            },
            created: true,
        })
    }
}

fn filer_io_error(err: std::io::Error, operation: &str, path: &Path) -> AppError {
    AppError::new("FILER/IO", "Failed to store managed file.")
        .with_context("operation", operation.to_string())
        .with_context("path_hash", hash_path(path))
        .with_cause(err)
}

fn storage_name(original: &str) -> String {
    let cleaned: String = original
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "file".to_string(),
        name => name.to_string(),
    }
}

pub async fn get_managed_file(pool: &SqlitePool, id: i64) -> AppResult<Option<ManagedFile>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM filer_files WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "get_managed_file")
                .with_context("id", id.to_string())
        })?;
    row.as_ref().map(ManagedFile::from_row).transpose()
}

pub async fn count_managed_files(pool: &SqlitePool) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM filer_files")
        .fetch_one(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "count_managed_files"))?;
    Ok(count)
}
