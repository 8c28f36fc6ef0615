#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tempfile::TempDir;

use pagefile_lib::config::MigrationConfig;
use pagefile_lib::filer::SqliteFilerStore;
use pagefile_lib::schema;

pub const ADD_FILE_SRC: &str = "0005_file_plugin_add_file_src";

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

/// A database migrated up to the point where raw paths and `file_src` sit
/// side by side, plus a media root and filer root on disk.
pub struct Fixture {
    pub dir: TempDir,
    pub media: PathBuf,
    pub pool: SqlitePool,
    pub store: SqliteFilerStore,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let media = dir.path().join("media");
        std::fs::create_dir_all(&media).expect("media dir");
        let pool = temp_pool().await;
        let store = SqliteFilerStore::new(pool.clone(), dir.path().join("filer"));
        let fixture = Self {
            dir,
            media,
            pool,
            store,
        };
        schema::apply_migrations(&fixture.pool, Some(ADD_FILE_SRC), &fixture.store, &fixture.config())
            .await
            .expect("schema up to file_src");
        fixture
    }

    pub fn config(&self) -> MigrationConfig {
        MigrationConfig::new(&self.media).with_filer_root(self.store.root())
    }

    /// `<media>/../cms_page_media_file_backup.tar.gz`
    pub fn archive(&self) -> PathBuf {
        self.config().archive_path()
    }

    pub fn write_media(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.media.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub async fn add_file_plugin(&self, raw: Option<&str>) -> i64 {
        insert_file_plugin(&self.pool, raw).await
    }

    pub async fn file_src(&self, id: i64) -> Option<i64> {
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT file_src FROM file_plugins WHERE cmsplugin_ptr_id = ?1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .unwrap()
    }
}

pub async fn insert_file_plugin(pool: &SqlitePool, raw: Option<&str>) -> i64 {
    let id = sqlx::query("INSERT INTO cms_plugins (plugin_type, created_at) VALUES ('FilePlugin', ?1)")
        .bind(Utc::now().timestamp_millis())
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();
    sqlx::query("INSERT INTO file_plugins (cmsplugin_ptr_id, file) VALUES (?1, ?2)")
        .bind(id)
        .bind(raw)
        .execute(pool)
        .await
        .unwrap();
    id
}

/// Member names of a tar.gz, in archive order, without trailing slashes.
pub fn archive_members(archive: &Path) -> Vec<String> {
    let file = std::fs::File::open(archive).expect("open archive");
    let mut reader = tar::Archive::new(flate2::read::GzDecoder::new(file));
    reader
        .entries()
        .expect("entries")
        .map(|entry| {
            entry
                .expect("entry")
                .path()
                .expect("entry path")
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}
