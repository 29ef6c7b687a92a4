// Remote store backed by a local folder of exported archives

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use regex::Regex;
use walkdir::WalkDir;

use crate::constants::TEMP_FILE_PREFIX;
use crate::error::{MigrateError, Result};
use super::{check_downloaded_size, is_valid_download, matches_pattern, RemoteFile, RemoteStore};

pub struct LocalFolderStore {
    root: PathBuf,
}

impl LocalFolderStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn source_path(&self, file: &RemoteFile) -> PathBuf {
        self.root.join(&file.id)
    }
}

impl RemoteStore for LocalFolderStore {
    fn name(&self) -> &str {
        "local folder"
    }

    fn list(&self, folder: Option<&str>, pattern: Option<&Regex>) -> Result<Vec<RemoteFile>> {
        let base = match folder {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        };
        if !base.is_dir() {
            return Err(MigrateError::NotFound(format!("source folder {}", base.display())));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut files = Vec::new();
        for entry in WalkDir::new(&base)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !matches_pattern(&name, pattern) {
                continue;
            }
            if !seen.insert(name.clone()) {
                log::warn!("Ignoring duplicate archive name {} at {}", name, entry.path().display());
                continue;
            }

            let meta = entry.metadata().map_err(|e| MigrateError::Other(e.to_string()))?;
            let id = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            files.push(RemoteFile {
                id,
                name,
                size: meta.len(),
                modified_time: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        log::info!("Listed {} archives in {}", files.len(), base.display());
        Ok(files)
    }

    fn download(&self, file: &RemoteFile, dest: &Path) -> Result<PathBuf> {
        if is_valid_download(dest, file.size) {
            log::debug!("{} already present, skipping copy", file.name);
            return Ok(dest.to_path_buf());
        }

        let source = self.source_path(file);
        let mut input = File::open(&source).map_err(|e| MigrateError::Download {
            name: file.name.clone(),
            reason: format!("{}: {}", source.display(), e),
        })?;

        let dir = dest
            .parent()
            .ok_or_else(|| MigrateError::InvalidPath(dest.display().to_string()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile_in(dir)?;
        std::io::copy(&mut input, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| MigrateError::Io(e.error))?;

        check_downloaded_size(file, dest)?;
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("b.zip"), b"bb").unwrap();
        fs::write(tmp.path().join("sub/a.zip"), b"a").unwrap();
        fs::write(tmp.path().join("readme.txt"), b"x").unwrap();

        let store = LocalFolderStore::new(tmp.path().to_path_buf());
        let re = Regex::new(r"(?i)\.zip$").unwrap();
        let mut files = store.list(None, Some(&re)).unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.zip");
        assert_eq!(files[0].id, Path::new("sub").join("a.zip").to_string_lossy());
        assert_eq!(files[1].size, 2);
    }

    #[test]
    fn test_download_is_idempotent() {
        let src = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::write(src.path().join("a.zip"), b"archive").unwrap();

        let store = LocalFolderStore::new(src.path().to_path_buf());
        let file = store.list(None, None).unwrap().remove(0);
        let dest = work.path().join("downloads/a.zip");

        store.download(&file, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"archive");

        // source gone: a valid local copy is still accepted
        fs::remove_file(src.path().join("a.zip")).unwrap();
        assert_eq!(store.download(&file, &dest).unwrap(), dest);
    }

    #[test]
    fn test_missing_source_is_download_error() {
        let src = TempDir::new().unwrap();
        let store = LocalFolderStore::new(src.path().to_path_buf());
        let file = RemoteFile {
            id: "gone.zip".into(),
            name: "gone.zip".into(),
            size: 3,
            modified_time: None,
        };
        let err = store.download(&file, &src.path().join("out/gone.zip")).unwrap_err();
        assert!(matches!(err, MigrateError::Download { .. }));
    }
}
