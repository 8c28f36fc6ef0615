//! Page plugins that attach managed files and folders.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::config::{MigrationConfig, TemplateChoice};
use crate::db::column_exists;
use crate::filer::{ManagedFile, ManagedFolder};
use crate::{AppError, AppResult};

pub const FILE_MISSING_LABEL: &str = "<file is missing>";
pub const FOLDER_MISSING_LABEL: &str = "<folder is missing>";
pub const DEFAULT_TEMPLATE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LinkTarget {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "_self")]
    SameWindow,
    #[serde(rename = "_blank")]
    NewWindow,
    #[serde(rename = "_parent")]
    ParentWindow,
    #[serde(rename = "_top")]
    TopmostFrame,
}

impl LinkTarget {
    pub const ALL: [LinkTarget; 5] = [
        LinkTarget::Unset,
        LinkTarget::SameWindow,
        LinkTarget::NewWindow,
        LinkTarget::ParentWindow,
        LinkTarget::TopmostFrame,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            LinkTarget::Unset => "",
            LinkTarget::SameWindow => "_self",
            LinkTarget::NewWindow => "_blank",
            LinkTarget::ParentWindow => "_parent",
            LinkTarget::TopmostFrame => "_top",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid link target: {value}")]
pub struct ParseLinkTargetError {
    value: String,
}

impl ParseLinkTargetError {
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl FromStr for LinkTarget {
    type Err = ParseLinkTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkTarget::ALL
            .into_iter()
            .find(|target| target.as_str() == s)
            .ok_or_else(|| ParseLinkTargetError {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePlugin {
    pub id: i64,
    pub file_src: Option<i64>,
    pub file_name: String,
    pub link_target: LinkTarget,
    pub link_title: String,
    pub show_file_size: bool,
    pub attributes: Map<String, Value>,
}

impl FilePlugin {
    /// `file` is the record `file_src` points at, if it still exists.
    pub fn label(&self, file: Option<&ManagedFile>) -> String {
        match (self.file_src, file) {
            (Some(_), Some(file)) => file.label().to_string(),
            _ => FILE_MISSING_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderPlugin {
    pub id: i64,
    pub template: String,
    pub folder_src: Option<i64>,
    pub link_target: LinkTarget,
    pub show_file_size: bool,
    pub attributes: Map<String, Value>,
}

impl FolderPlugin {
    pub fn label(&self, folder: Option<&ManagedFolder>) -> String {
        match (self.folder_src, folder) {
            (Some(_), Some(folder)) => folder.name.clone(),
            _ => FOLDER_MISSING_LABEL.to_string(),
        }
    }
}

/// `default` first, then the configured extras.
pub fn folder_templates(config: &MigrationConfig) -> Vec<TemplateChoice> {
    let mut choices = vec![TemplateChoice {
        name: DEFAULT_TEMPLATE.to_string(),
        label: "Default".to_string(),
    }];
    choices.extend(
        config
            .folder_templates
            .iter()
            .filter(|choice| choice.name != DEFAULT_TEMPLATE)
            .cloned(),
    );
    choices
}

fn parse_link_target(row: &SqliteRow) -> AppResult<LinkTarget> {
    let raw: String = row.try_get("link_target")?;
    raw.parse().map_err(|err: ParseLinkTargetError| {
        AppError::new("PLUGIN/LINK_TARGET", err.to_string())
            .with_context("value", err.value().to_string())
    })
}

fn parse_attributes(row: &SqliteRow) -> AppResult<Map<String, Value>> {
    let raw: String = row.try_get("attributes")?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str(&raw)?)
}

impl FilePlugin {
    fn from_row(row: &SqliteRow) -> AppResult<Self> {
        Ok(Self {
            id: row.try_get("cmsplugin_ptr_id")?,
            file_src: row.try_get("file_src")?,
            file_name: row.try_get("file_name")?,
            link_target: parse_link_target(row)?,
            link_title: row.try_get("link_title")?,
            show_file_size: row.try_get("show_file_size")?,
            attributes: parse_attributes(row)?,
        })
    }
}

impl FolderPlugin {
    fn from_row(row: &SqliteRow) -> AppResult<Self> {
        Ok(Self {
            id: row.try_get("cmsplugin_ptr_id")?,
            template: row.try_get("template")?,
            folder_src: row.try_get("folder_src")?,
            link_target: parse_link_target(row)?,
            show_file_size: row.try_get("show_file_size")?,
            attributes: parse_attributes(row)?,
        })
    }
}

const FILE_PLUGIN_COLUMNS: &str =
    "cmsplugin_ptr_id, file_src, file_name, link_target, link_title, show_file_size, attributes";

pub async fn get_file_plugin(pool: &SqlitePool, id: i64) -> AppResult<Option<FilePlugin>> {
    let sql = format!("SELECT {FILE_PLUGIN_COLUMNS} FROM file_plugins WHERE cmsplugin_ptr_id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "get_file_plugin")
                .with_context("id", id.to_string())
        })?;
    row.as_ref().map(FilePlugin::from_row).transpose()
}

pub async fn list_file_plugins(pool: &SqlitePool) -> AppResult<Vec<FilePlugin>> {
    let sql = format!("SELECT {FILE_PLUGIN_COLUMNS} FROM file_plugins ORDER BY cmsplugin_ptr_id");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "list_file_plugins"))?;
    rows.iter().map(FilePlugin::from_row).collect()
}

pub async fn get_folder_plugin(pool: &SqlitePool, id: i64) -> AppResult<Option<FolderPlugin>> {
    let row = sqlx::query(
        "SELECT cmsplugin_ptr_id, template, folder_src, link_target, show_file_size, attributes \
         FROM folder_plugins WHERE cmsplugin_ptr_id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "get_folder_plugin")
            .with_context("id", id.to_string())
    })?;
    row.as_ref().map(FolderPlugin::from_row).transpose()
}

/// Rows still waiting for the filer migration; zero once the raw column is
/// gone.
pub async fn count_legacy_references(pool: &SqlitePool) -> AppResult<i64> {
    if !column_exists(pool, "file_plugins", "file").await? {
        return Ok(0);
    }
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM file_plugins \
         WHERE file IS NOT NULL AND file != '' AND file_src IS NULL",
    )
    .fetch_one(pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "count_legacy_references"))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(file_src: Option<i64>) -> FilePlugin {
        FilePlugin {
            id: 1,
            file_src,
            file_name: String::new(),
            link_target: LinkTarget::Unset,
            link_title: String::new(),
            show_file_size: false,
            attributes: Map::new(),
        }
    }

    fn managed(name: &str) -> ManagedFile {
        ManagedFile {
            id: 3,
            name: name.into(),
            original_filename: "doc.pdf".into(),
            file: "ab/cd/u/doc.pdf".into(),
            sha256: "abcd".into(),
            size: 3,
            folder_id: None,
            uploaded_at: 0,
        }
    }

    #[test]
    fn link_targets_parse_their_html_values() {
        assert_eq!("_blank".parse::<LinkTarget>(), Ok(LinkTarget::NewWindow));
        assert_eq!("".parse::<LinkTarget>(), Ok(LinkTarget::Unset));
        let err = "_new".parse::<LinkTarget>().unwrap_err();
        assert_eq!(err.value(), "_new");
        assert_eq!(LinkTarget::TopmostFrame.to_string(), "_top");
    }

    #[test]
    fn file_label_falls_back_when_missing() {
        assert_eq!(plugin(None).label(None), FILE_MISSING_LABEL);
        assert_eq!(plugin(Some(3)).label(None), FILE_MISSING_LABEL);
        assert_eq!(plugin(Some(3)).label(Some(&managed(""))), "doc.pdf");
        assert_eq!(plugin(Some(3)).label(Some(&managed("Report"))), "Report");
    }

    #[test]
    fn folder_label_and_templates() {
        let mut config = MigrationConfig::new("/srv/media");
        config.folder_templates = crate::config::parse_template_choices("gallery:Gallery");
        let folder = FolderPlugin {
            id: 2,
            template: "gallery".into(),
            folder_src: Some(5),
            link_target: LinkTarget::Unset,
            show_file_size: true,
            attributes: Map::new(),
        };
        assert_eq!(folder.label(None), FOLDER_MISSING_LABEL);
        let named = ManagedFolder {
            id: 5,
            name: "Press".into(),
            parent_id: None,
        };
        assert_eq!(folder.label(Some(&named)), "Press");

        let names: Vec<_> = folder_templates(&config)
            .into_iter()
            .map(|choice| choice.name)
            .collect();
        assert_eq!(names, vec!["default", "gallery"]);
    }
}
