#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use anyhow::Result;

use pagefile_lib::config::{MigrationConfig, MigrationMode};
use pagefile_lib::db::column_exists;
use pagefile_lib::filer::SqliteFilerStore;
use pagefile_lib::schema;

use util::{temp_pool, Fixture};

#[tokio::test]
async fn fresh_database_reaches_head_and_rerun_is_a_no_op() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = temp_pool().await;
    let store = SqliteFilerStore::new(pool.clone(), dir.path().join("filer"));
    let config = MigrationConfig::new(dir.path().join("media"));

    let report = schema::apply_migrations(&pool, None, &store, &config).await?;
    assert_eq!(report.applied, schema::step_versions());
    assert!(!column_exists(&pool, "file_plugins", "file").await?);
    assert!(column_exists(&pool, "file_plugins", "file_src").await?);
    assert!(column_exists(&pool, "folder_plugins", "folder_src").await?);

    let again = schema::apply_migrations(&pool, None, &store, &config).await?;
    assert!(again.applied.is_empty());
    assert!(again.data.is_none());
    assert!(schema::status(&pool).await?.iter().all(|step| step.applied));
    Ok(())
}

#[tokio::test]
async fn unknown_target_and_dry_run_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = temp_pool().await;
    let store = SqliteFilerStore::new(pool.clone(), dir.path().join("filer"));
    let config = MigrationConfig::new(dir.path().join("media"));

    let err = schema::apply_migrations(&pool, Some("9999_nope"), &store, &config)
        .await
        .expect_err("unknown target");
    assert_eq!(err.code(), "MIGRATE/UNKNOWN_TARGET");

    let dry = config.with_mode(MigrationMode::DryRun);
    let err = schema::apply_migrations(&pool, None, &store, &dry)
        .await
        .expect_err("dry run");
    assert_eq!(err.code(), "MIGRATE/DRY_RUN");
    Ok(())
}

#[tokio::test]
async fn raw_column_survives_until_skipped_rows_are_fixed() -> Result<()> {
    let fx = Fixture::new().await;
    let id = fx.add_file_plugin(Some("a/doc.pdf")).await;

    let err = schema::apply_migrations(&fx.pool, None, &fx.store, &fx.config())
        .await
        .expect_err("skipped row blocks the drop");
    assert_eq!(err.code(), "MIGRATE/LEGACY_REMAIN");
    assert_eq!(err.context().get("ids").map(String::as_str), Some(id.to_string().as_str()));
    assert!(column_exists(&fx.pool, "file_plugins", "file").await?);
    let pending: Vec<_> = schema::status(&fx.pool)
        .await?
        .into_iter()
        .filter(|step| !step.applied)
        .map(|step| step.version)
        .collect();
    assert_eq!(pending, vec!["0006_migrate_to_filer", "0007_file_plugin_drop_file"]);

    fx.write_media("a/doc.pdf", b"doc-bytes");
    let report = schema::apply_migrations(&fx.pool, None, &fx.store, &fx.config()).await?;
    assert_eq!(report.applied, vec!["0006_migrate_to_filer", "0007_file_plugin_drop_file"]);
    assert_eq!(report.data.as_ref().map(|data| data.counts.migrated), Some(1));
    assert!(fx.file_src(id).await.is_some());
    assert!(!column_exists(&fx.pool, "file_plugins", "file").await?);
    Ok(())
}

#[tokio::test]
async fn force_drop_discards_unmigrated_references() -> Result<()> {
    let fx = Fixture::new().await;
    let id = fx.add_file_plugin(Some("gone.pdf")).await;

    let config = fx.config().with_force_drop_legacy(true);
    let report = schema::apply_migrations(&fx.pool, None, &fx.store, &config).await?;

    assert_eq!(report.data.as_ref().map(|data| data.counts.skipped), Some(1));
    assert!(report.applied.contains(&"0007_file_plugin_drop_file".to_string()));
    assert!(!column_exists(&fx.pool, "file_plugins", "file").await?);
    assert_eq!(fx.file_src(id).await, None);
    Ok(())
}

#[tokio::test]
async fn edited_step_fails_the_checksum_check() -> Result<()> {
    let fx = Fixture::new().await;
    sqlx::query("UPDATE schema_migrations SET checksum = 'edited' WHERE version = '0001_cms_plugins'")
        .execute(&fx.pool)
        .await?;

    let err = schema::apply_migrations(&fx.pool, None, &fx.store, &fx.config())
        .await
        .expect_err("checksum mismatch");
    assert_eq!(err.code(), "MIGRATE/CHECKSUM");
    assert_eq!(
        err.context().get("version").map(String::as_str),
        Some("0001_cms_plugins")
    );
    Ok(())
}

#[tokio::test]
async fn blocked_drop_still_reports_the_data_step() -> Result<()> {
    let fx = Fixture::new().await;
    fx.write_media("a/doc.pdf", b"doc-bytes");
    let migrated = fx.add_file_plugin(Some("a/doc.pdf")).await;
    let missing = fx.add_file_plugin(Some("b/gone.pdf")).await;

    let mut report = schema::SchemaReport::default();
    let err = schema::apply_migrations_into(&fx.pool, None, &fx.store, &fx.config(), &mut report)
        .await
        .expect_err("skipped row blocks the drop");
    assert_eq!(err.code(), "MIGRATE/LEGACY_REMAIN");

    assert!(report.applied.is_empty());
    let data = report.data.expect("data step outcome kept");
    assert_eq!(data.counts.migrated, 1);
    assert_eq!(data.skipped_ids, vec![missing]);
    assert!(fx.file_src(migrated).await.is_some());
    Ok(())
}
