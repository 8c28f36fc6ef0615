use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::archive_path_for;
use crate::AppError;

pub const ENV_MEDIA_ROOT: &str = "PAGEFILE_MEDIA_ROOT";
pub const ENV_FILER_ROOT: &str = "PAGEFILE_FILER_ROOT";
pub const ENV_FOLDER_TEMPLATES: &str = "PAGEFILE_FOLDER_TEMPLATES";
pub const ENV_ARCHIVE: &str = "PAGEFILE_ARCHIVE";

const DEFAULT_FILER_DIR: &str = "filer_public";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    DryRun,
    #[default]
    Apply,
}

impl MigrationMode {
    pub const fn is_apply(self) -> bool {
        matches!(self, MigrationMode::Apply)
    }
}

/// What happens to raw files once their rows point at managed files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetirementMode {
    /// Delete each raw file, ignoring failures.
    Delete,
    /// Write one tar.gz of every raw file, then delete them.
    #[default]
    ArchiveThenDelete,
}

/// What happens when a raw file cannot be turned into a managed file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// The first failure aborts the batch.
    Abort,
    /// Log, leave the row unmigrated and continue.
    #[default]
    Skip,
}

/// A folder template choice: stored value and display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateChoice {
    pub name: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub media_root: PathBuf,
    pub filer_root: PathBuf,
    pub mode: MigrationMode,
    pub retirement: RetirementMode,
    pub on_resolve_error: ResolutionPolicy,
    /// Drop the raw column even when some rows could not be migrated.
    pub force_drop_legacy: bool,
    /// Extra folder templates on top of `default`.
    pub folder_templates: Vec<TemplateChoice>,
}

impl MigrationConfig {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        let media_root = media_root.into();
        let filer_root = media_root.join(DEFAULT_FILER_DIR);
        Self {
            media_root,
            filer_root,
            mode: MigrationMode::default(),
            retirement: RetirementMode::default(),
            on_resolve_error: ResolutionPolicy::default(),
            force_drop_legacy: false,
            folder_templates: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        let media_root = env::var_os(ENV_MEDIA_ROOT)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                AppError::new(
                    "CONFIG/MISSING_MEDIA_ROOT",
                    "No media root configured for the file migration.",
                )
                .with_context("env", ENV_MEDIA_ROOT)
            })?;

        let mut config = Self::new(PathBuf::from(media_root));

        if let Some(filer_root) = env::var_os(ENV_FILER_ROOT).filter(|value| !value.is_empty()) {
            config.filer_root = PathBuf::from(filer_root);
        }

        if let Ok(raw) = env::var(ENV_FOLDER_TEMPLATES) {
            config.folder_templates = parse_template_choices(&raw);
        }

        if matches!(env::var(ENV_ARCHIVE).as_deref(), Ok("0") | Ok("false")) {
            config.retirement = RetirementMode::Delete;
        }

        Ok(config)
    }

    pub fn with_filer_root(mut self, filer_root: impl Into<PathBuf>) -> Self {
        self.filer_root = filer_root.into();
        self
    }

    pub fn with_mode(mut self, mode: MigrationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retirement(mut self, retirement: RetirementMode) -> Self {
        self.retirement = retirement;
        self
    }

    pub fn with_resolution_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.on_resolve_error = policy;
        self
    }

    pub fn with_force_drop_legacy(mut self, force: bool) -> Self {
        self.force_drop_legacy = force;
        self
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn archive_path(&self) -> PathBuf {
        archive_path_for(&self.media_root)
    }
}

/// Parse `name:label` pairs separated by commas. A bare name is its own label.
pub fn parse_template_choices(raw: &str) -> Vec<TemplateChoice> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, label)) => TemplateChoice {
                name: name.trim().to_string(),
                label: label.trim().to_string(),
            },
            None => TemplateChoice {
                name: entry.to_string(),
                label: entry.to_string(),
            },
        })
        .filter(|choice| !choice.name.is_empty())
        .collect()
}
