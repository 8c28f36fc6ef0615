//! Row shapes of `file_plugins` as they exist around the filer migration.
//!
//! These are frozen on purpose: the migration reads and writes exactly these
//! columns no matter how `plugin::FilePlugin` evolves.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::AppResult;

/// `file_plugins` after `0005_file_plugin_add_file_src`: raw path and the new
/// reference side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFileRow {
    pub id: i64,
    pub file: Option<String>,
    pub file_src: Option<i64>,
}

/// The part of `file_plugins` the migration writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigratedFileRow {
    pub id: i64,
    pub file_src: i64,
}

pub(crate) const SELECT_LEGACY_SQL: &str = "SELECT cmsplugin_ptr_id AS id, file, file_src \
     FROM file_plugins \
     WHERE file IS NOT NULL AND file != '' AND file_src IS NULL \
     ORDER BY cmsplugin_ptr_id";

pub(crate) const UPDATE_FILE_SRC_SQL: &str =
    "UPDATE file_plugins SET file_src = ?1 WHERE cmsplugin_ptr_id = ?2";

impl LegacyFileRow {
    pub(crate) fn from_row(row: &SqliteRow) -> AppResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            file: row.try_get("file")?,
            file_src: row.try_get("file_src")?,
        })
    }

    /// The raw reference, if it is set and non-empty.
    pub fn raw_reference(&self) -> Option<&str> {
        self.file.as_deref().filter(|raw| !raw.is_empty())
    }

    pub fn into_migrated(self, file_src: i64) -> MigratedFileRow {
        MigratedFileRow {
            id: self.id,
            file_src,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reference_is_absent() {
        let row = LegacyFileRow {
            id: 1,
            file: Some(String::new()),
            file_src: None,
        };
        assert_eq!(row.raw_reference(), None);
        let row = LegacyFileRow {
            id: 2,
            file: None,
            file_src: None,
        };
        assert_eq!(row.raw_reference(), None);
    }

    #[test]
    fn mapping_keeps_the_row_id() {
        let row = LegacyFileRow {
            id: 7,
            file: Some("a/doc.pdf".into()),
            file_src: None,
        };
        assert_eq!(
            row.into_migrated(3),
            MigratedFileRow { id: 7, file_src: 3 }
        );
    }
}
