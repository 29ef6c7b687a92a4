// Remote archive stores
//
// The orchestrator only needs two primitives: list the exported archives and
// download one of them. Downloads are idempotent: a destination that already
// has the expected size is reused as-is.

pub mod drive;
pub mod local;

use std::fs;
use std::path::{Component, Path, PathBuf};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{RemoteConfig, RemoteKind};
use crate::error::{MigrateError, Result};

/// One archive file as listed by a remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
}

pub trait RemoteStore {
    fn name(&self) -> &str;

    /// All files in `folder` (or the store's default folder) whose name matches `pattern`
    fn list(&self, folder: Option<&str>, pattern: Option<&Regex>) -> Result<Vec<RemoteFile>>;

    /// Fetch `file` to `dest`, returning the local path
    fn download(&self, file: &RemoteFile, dest: &Path) -> Result<PathBuf>;
}

/// A local copy counts as downloaded when it exists with the listed size
pub fn is_valid_download(dest: &Path, expected_size: u64) -> bool {
    fs::metadata(dest)
        .map(|m| m.is_file() && m.len() == expected_size)
        .unwrap_or(false)
}

/// A listed name must be one plain path component; it is joined onto the
/// download and extraction directories as is.
pub fn is_safe_file_name(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

pub(crate) fn matches_pattern(name: &str, pattern: Option<&Regex>) -> bool {
    pattern.map(|re| re.is_match(name)).unwrap_or(true)
}

/// Check a finished download against the listing and fail with a Download error otherwise
pub(crate) fn check_downloaded_size(file: &RemoteFile, path: &Path) -> Result<()> {
    let actual = fs::metadata(path)?.len();
    if actual != file.size {
        let _ = fs::remove_file(path);
        return Err(MigrateError::Download {
            name: file.name.clone(),
            reason: format!("size mismatch: expected {} bytes, got {}", file.size, actual),
        });
    }
    Ok(())
}

/// Build the configured remote store
pub fn from_config(cfg: &RemoteConfig) -> Result<Box<dyn RemoteStore>> {
    match cfg.kind {
        RemoteKind::LocalFolder => {
            let dir = cfg.source_dir.clone().ok_or_else(|| {
                MigrateError::Configuration("remote.source_dir is required".to_string())
            })?;
            Ok(Box::new(local::LocalFolderStore::new(dir)))
        }
        RemoteKind::Drive => {
            let token = cfg.access_token.clone().ok_or_else(|| {
                MigrateError::Configuration("drive access token is required".to_string())
            })?;
            let store = drive::DriveStore::new(token, cfg.folder_id.clone())?;
            Ok(Box::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listed_names_must_stay_in_their_directory() {
        assert!(is_safe_file_name("takeout-001.zip"));
        assert!(is_safe_file_name("takeout.zip.002"));
        assert!(!is_safe_file_name(""));
        assert!(!is_safe_file_name(".."));
        assert!(!is_safe_file_name("."));
        assert!(!is_safe_file_name("../escape.zip"));
        assert!(!is_safe_file_name("nested/takeout.zip"));
        assert!(!is_safe_file_name("..\\escape.zip"));
        assert!(!is_safe_file_name("/etc/passwd.zip"));
    }
}
