#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use anyhow::Result;
use assert_cmd::Command;
use tempfile::tempdir;

use pagefile_lib::db::open_sqlite_pool;
use pagefile_lib::migration::MigrationReport;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("migrate_files").expect("migrate_files binary");
    cmd.env_remove("PAGEFILE_MEDIA_ROOT")
        .env_remove("PAGEFILE_FILER_ROOT")
        .env("PAGEFILE_LOG", "off");
    cmd
}

#[test]
fn status_on_missing_db_lists_pending_steps() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("missing.sqlite3");

    let output = cli().args(["--db", db.to_str().unwrap(), "status"]).output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("0006_migrate_to_filer"));
    assert!(stdout.contains("pending"));
    assert!(!db.exists());
    Ok(())
}

#[test]
fn run_without_media_root_fails() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("db.sqlite3");

    let output = cli().args(["--db", db.to_str().unwrap(), "run"]).output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("CONFIG/MISSING_MEDIA_ROOT"));
    Ok(())
}

#[tokio::test]
async fn up_migrates_rows_and_writes_the_report() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("db.sqlite3");
    let media = dir.path().join("media");
    std::fs::create_dir_all(media.join("a"))?;
    std::fs::write(media.join("a/doc.pdf"), b"doc-bytes")?;
    let db_arg = db.to_str().unwrap();
    let media_arg = media.to_str().unwrap();

    cli()
        .args(["--db", db_arg, "--media-root", media_arg, "up", "--to", util::ADD_FILE_SRC])
        .assert()
        .success();

    {
        let pool = open_sqlite_pool(&db, false).await?;
        util::insert_file_plugin(&pool, Some("a/doc.pdf")).await;
        pool.close().await;
    }

    let report_path = dir.path().join("report.json");
    let output = cli()
        .args([
            "--db",
            db_arg,
            "--media-root",
            media_arg,
            "up",
            "--report",
            report_path.to_str().unwrap(),
        ])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("0007_file_plugin_drop_file"));
    assert!(stdout.contains("Migrated: 1"));

    let report: MigrationReport = serde_json::from_slice(&std::fs::read(&report_path)?)?;
    assert_eq!(report.counts.migrated, 1);
    assert_eq!(report.counts.created_files, 1);
    assert!(dir.path().join("cms_page_media_file_backup.tar.gz").exists());
    assert!(!media.join("a/doc.pdf").exists());

    let output = cli().args(["--db", db_arg, "status"]).output()?;
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Applied: 7/7"));
    assert!(stdout.contains("Legacy references: 0"));
    Ok(())
}

#[tokio::test]
async fn blocked_up_still_writes_the_report() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("db.sqlite3");
    let media = dir.path().join("media");
    std::fs::create_dir_all(&media)?;
    let db_arg = db.to_str().unwrap();
    let media_arg = media.to_str().unwrap();

    cli()
        .args(["--db", db_arg, "--media-root", media_arg, "up", "--to", util::ADD_FILE_SRC])
        .assert()
        .success();

    let missing = {
        let pool = open_sqlite_pool(&db, false).await?;
        let id = util::insert_file_plugin(&pool, Some("a/gone.pdf")).await;
        pool.close().await;
        id
    };

    let report_path = dir.path().join("report.json");
    let output = cli()
        .args([
            "--db",
            db_arg,
            "--media-root",
            media_arg,
            "up",
            "--report",
            report_path.to_str().unwrap(),
        ])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("MIGRATE/LEGACY_REMAIN"));
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Skipped: 1"));

    let report: MigrationReport = serde_json::from_slice(&std::fs::read(&report_path)?)?;
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(report.skipped_ids, vec![missing]);
    Ok(())
}
