use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::paths::{archive_member_name, hash_path};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementOutcome {
    pub path: String,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub path: String,
    /// Members written by this run.
    pub members: Vec<String>,
    /// Members kept from an archive an earlier run left behind.
    #[serde(default)]
    pub carried_over: usize,
}

/// Order-preserving dedup: the first occurrence of each path wins.
pub fn dedup_paths<I>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Write every path into the gzip-compressed tar at `archive`.
///
/// Each path becomes a single member: files with their bytes, directories as
/// a bare directory entry without their contents. Members of an archive left
/// by an earlier run are carried over unless a new path replaces them, so a
/// rerun never loses an earlier backup. The new archive is built next to the
/// old one and renamed into place; any failure surfaces as `RETIRE/ARCHIVE`
/// and leaves the previous archive untouched.
pub fn archive_paths(
    archive: &Path,
    media_root: &Path,
    paths: &[PathBuf],
) -> AppResult<ArchiveSummary> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| archive_error(err, "archive_create_dirs", parent))?;
    }

    let staging = staging_path(archive);
    let summary = build_archive(archive, &staging, media_root, paths).and_then(|summary| {
        fs::rename(&staging, archive)
            .map_err(|err| archive_error(err, "archive_rename", archive))?;
        Ok(summary)
    });
    if summary.is_err() {
        fs::remove_file(&staging).ok();
    }
    let summary = summary?;

    tracing::info!(
        target: "pagefile",
        event = "retire_archive_written",
        members = summary.members.len(),
        carried_over = summary.carried_over,
        path_hash = %hash_path(archive)
    );
    Ok(summary)
}

fn staging_path(archive: &Path) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    archive.with_file_name(name)
}

fn archive_error(err: std::io::Error, operation: &str, path: &Path) -> AppError {
    AppError::new("RETIRE/ARCHIVE", "Failed to write the raw file archive.")
        .with_context("operation", operation.to_string())
        .with_context("path", path.display().to_string())
        .with_cause(err)
}

fn build_archive(
    archive: &Path,
    staging: &Path,
    media_root: &Path,
    paths: &[PathBuf],
) -> AppResult<ArchiveSummary> {
    let names: Vec<PathBuf> = paths
        .iter()
        .map(|path| archive_member_name(media_root, path))
        .collect();

    let file = File::create(staging).map_err(|err| archive_error(err, "archive_create", staging))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let carried_over = if archive.exists() {
        let replaced: HashSet<&Path> = names.iter().map(PathBuf::as_path).collect();
        carry_over(archive, &replaced, &mut builder)
            .map_err(|err| archive_error(err, "archive_carry_over", archive))?
    } else {
        0
    };

    let mut members = Vec::with_capacity(paths.len());
    for (path, name) in paths.iter().zip(&names) {
        let meta =
            fs::symlink_metadata(path).map_err(|err| archive_error(err, "archive_stat", path))?;
        if meta.is_dir() {
            builder
                .append_dir(name, path)
                .map_err(|err| archive_error(err, "archive_append_dir", path))?;
        } else {
            builder
                .append_path_with_name(path, name)
                .map_err(|err| archive_error(err, "archive_append", path))?;
        }
        members.push(name.to_string_lossy().replace('\\', "/"));
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| archive_error(err, "archive_finish_tar", staging))?;
    let mut file = encoder
        .finish()
        .map_err(|err| archive_error(err, "archive_finish_gzip", staging))?;
    file.flush()
        .map_err(|err| archive_error(err, "archive_flush", staging))?;
    file.sync_all()
        .map_err(|err| archive_error(err, "archive_sync", staging))?;

    Ok(ArchiveSummary {
        path: archive.display().to_string(),
        members,
        carried_over,
    })
}

/// Copy every member of the existing archive except the `replaced` ones.
fn carry_over<W: Write>(
    archive: &Path,
    replaced: &HashSet<&Path>,
    builder: &mut tar::Builder<W>,
) -> std::io::Result<usize> {
    let mut existing = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    let mut carried = 0;
    for entry in existing.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        if replaced.contains(name.as_path()) {
            continue;
        }
        let mut header = entry.header().clone();
        builder.append_data(&mut header, &name, &mut entry)?;
        carried += 1;
    }
    Ok(carried)
}

/// Best-effort removal: every path is attempted, failures are reported per
/// path and never returned as an error.
pub fn delete_paths(paths: &[PathBuf]) -> Vec<RetirementOutcome> {
    paths
        .iter()
        .map(|path| match fs::remove_file(path) {
            Ok(()) => RetirementOutcome {
                path: path.display().to_string(),
                deleted: true,
                error: None,
            },
            Err(err) => RetirementOutcome {
                path: path.display().to_string(),
                deleted: false,
                error: Some(err.to_string()),
            },
        })
        .collect()
}
