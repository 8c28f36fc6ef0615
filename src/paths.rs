use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// File name of the tar.gz written next to the media root before raw files are deleted.
pub const ARCHIVE_FILE_NAME: &str = "cms_page_media_file_backup.tar.gz";

pub fn hash_path(p: &Path) -> String {
    let mut h = Sha256::new();
    h.update(p.as_os_str().to_string_lossy().as_bytes());
    format!("{:x}", h.finalize())
}

/// Display name for a raw reference: everything after the last `/`.
pub fn derive_filename(raw: &str) -> &str {
    raw.rsplit('/').next().unwrap_or(raw)
}

/// Join a raw reference onto the media root.
///
/// Returns `None` for references that are absolute or climb out of the root.
pub fn resolve_legacy_path(media_root: &Path, raw: &str) -> Option<PathBuf> {
    let relative = Path::new(raw);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return None;
    }

    let candidate = media_root.join(relative);
    candidate.starts_with(media_root).then_some(candidate)
}

/// `<media_root>/../cms_page_media_file_backup.tar.gz`
pub fn archive_path_for(media_root: &Path) -> PathBuf {
    media_root.join("..").join(ARCHIVE_FILE_NAME)
}

/// Archive member name: the path relative to the media root, or the bare
/// file name for paths outside it.
pub fn archive_member_name(media_root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(media_root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("unnamed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn filename_is_last_segment() {
        assert_eq!(derive_filename("a/b/doc.pdf"), "doc.pdf");
        assert_eq!(derive_filename("doc.pdf"), "doc.pdf");
        assert_eq!(derive_filename("cms_page_media/1/"), "");
    }

    #[test]
    fn rejects_parent_and_absolute_references() {
        let root = Path::new("/srv/media");
        assert!(resolve_legacy_path(root, "../secret.txt").is_none());
        assert!(resolve_legacy_path(root, "a/../../secret.txt").is_none());
        assert!(resolve_legacy_path(root, "/etc/passwd").is_none());
        assert_eq!(
            resolve_legacy_path(root, "cms_page_media/1/doc.pdf"),
            Some(PathBuf::from("/srv/media/cms_page_media/1/doc.pdf"))
        );
    }

    #[test]
    fn archive_sits_one_level_above_media_root() {
        let path = archive_path_for(Path::new("/srv/site/media"));
        assert_eq!(
            path,
            PathBuf::from("/srv/site/media/../cms_page_media_file_backup.tar.gz")
        );
    }

    #[test]
    fn member_names_are_relative_to_media_root() {
        let root = Path::new("/srv/media");
        assert_eq!(
            archive_member_name(root, Path::new("/srv/media/a/doc.pdf")),
            PathBuf::from("a/doc.pdf")
        );
        assert_eq!(
            archive_member_name(root, Path::new("/elsewhere/report.pdf")),
            PathBuf::from("report.pdf")
        );
    }

    proptest! {
        #[test]
        fn derived_filename_never_contains_a_slash(raw in "[a-z0-9_./]{0,40}") {
            let name = derive_filename(&raw);
            prop_assert!(!name.contains('/'));
            prop_assert!(raw.ends_with(name));
        }
    }
}
