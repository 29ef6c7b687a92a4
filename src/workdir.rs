// Working directory layout and exclusive lock

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use fs2::FileExt;

use crate::constants::{
    CHECKPOINT_FILENAME, CORRUPTED_ZIPS_FILENAME, DOWNLOADS_FOLDER, EXTRACTED_FOLDER,
    FAILED_UPLOADS_FILENAME, FILE_STATE_FILENAME, LOCK_FILENAME, RESTART_MARKER, STOP_MARKER,
    UPLOADED_FILES_FILENAME, ZIP_STATE_FILENAME,
};
use crate::error::{MigrateError, Result};

/// All paths of one migration working directory
#[derive(Debug, Clone)]
pub struct WorkPaths {
    pub root: PathBuf,
    pub downloads: PathBuf,
    pub extracted: PathBuf,
}

impl WorkPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            downloads: root.join(DOWNLOADS_FOLDER),
            extracted: root.join(EXTRACTED_FOLDER),
        }
    }

    pub fn zip_state_file(&self) -> PathBuf {
        self.root.join(ZIP_STATE_FILENAME)
    }

    pub fn file_state_file(&self) -> PathBuf {
        self.root.join(FILE_STATE_FILENAME)
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILENAME)
    }

    pub fn failed_uploads_file(&self) -> PathBuf {
        self.root.join(FAILED_UPLOADS_FILENAME)
    }

    pub fn corrupted_zips_file(&self) -> PathBuf {
        self.root.join(CORRUPTED_ZIPS_FILENAME)
    }

    pub fn uploaded_files_file(&self) -> PathBuf {
        self.root.join(UPLOADED_FILES_FILENAME)
    }

    pub fn stop_marker(&self) -> PathBuf {
        self.root.join(STOP_MARKER)
    }

    pub fn restart_marker(&self) -> PathBuf {
        self.root.join(RESTART_MARKER)
    }

    /// Local download location for an archive unit
    pub fn download_path(&self, unit_name: &str) -> PathBuf {
        self.downloads.join(unit_name)
    }

    /// Extraction target for an archive unit (or multi-part set)
    pub fn extract_dir(&self, unit_name: &str) -> PathBuf {
        self.extracted.join(unit_name)
    }

    /// Create the folder structure if missing
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.downloads)?;
        fs::create_dir_all(&self.extracted)?;
        Ok(())
    }

    /// Remove downloads, extracted files and failure-tracking side files.
    /// The duplicate-upload record survives on purpose: it is the last line of
    /// defense against re-importing after a reset.
    pub fn wipe_working_files(&self) -> Result<()> {
        for dir in [&self.downloads, &self.extracted] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        for file in [self.failed_uploads_file(), self.corrupted_zips_file()] {
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        self.init()
    }
}

/// Exclusive advisory lock on a working directory, held for the life of a run.
pub struct WorkDirLock {
    file: File,
    path: PathBuf,
}

impl WorkDirLock {
    pub fn acquire(paths: &WorkPaths) -> Result<Self> {
        fs::create_dir_all(&paths.root)?;
        let path = paths.root.join(LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| MigrateError::Locked(paths.root.display().to_string()))?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wipe_keeps_duplicate_record() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::new(tmp.path());
        paths.init().unwrap();

        fs::write(paths.download_path("a.zip"), b"zip").unwrap();
        fs::create_dir_all(paths.extract_dir("a.zip")).unwrap();
        fs::write(paths.failed_uploads_file(), b"{}").unwrap();
        fs::write(paths.corrupted_zips_file(), b"{}").unwrap();
        fs::write(paths.uploaded_files_file(), b"{}").unwrap();

        paths.wipe_working_files().unwrap();

        assert!(!paths.download_path("a.zip").exists());
        assert!(!paths.extract_dir("a.zip").exists());
        assert!(!paths.failed_uploads_file().exists());
        assert!(!paths.corrupted_zips_file().exists());
        assert!(paths.uploaded_files_file().exists());
        assert!(paths.downloads.is_dir());
    }

    #[test]
    fn test_second_lock_is_refused() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::new(tmp.path());
        let first = WorkDirLock::acquire(&paths).unwrap();
        assert!(first.path().exists());
        let second = WorkDirLock::acquire(&paths);
        assert!(matches!(second, Err(MigrateError::Locked(_))));
        drop(first);
        assert!(WorkDirLock::acquire(&paths).is_ok());
    }
}
