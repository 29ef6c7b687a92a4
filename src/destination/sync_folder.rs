// Synced-folder destination
//
// Files are copied into `<sync_dir>/<album>/`; the folder's sync client does
// the actual upload. Verification waits for the copy to still be present with
// the expected size and content.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::constants::TEMP_FILE_PREFIX;
use crate::error::{MigrateError, Result};
use crate::hash::compute_full_hash;
use crate::wait::{poll_until, PollSpec};
use super::ImportClient;

struct Placed {
    size: u64,
    hash: String,
}

pub struct SyncFolderImporter {
    root: PathBuf,
    poll: PollSpec,
    placed: HashMap<PathBuf, Placed>,
}

impl SyncFolderImporter {
    pub fn new(root: PathBuf, poll: PollSpec) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, poll, placed: HashMap::new() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn album_dir(&self, album: Option<&str>) -> Result<PathBuf> {
        match album {
            None => Ok(self.root.clone()),
            Some(name) => {
                let folder = sanitize_folder_name(name);
                if folder.is_empty() {
                    return Err(MigrateError::InvalidPath(format!("album name {:?}", name)));
                }
                Ok(self.root.join(folder))
            }
        }
    }
}

/// Album names become single path components
fn sanitize_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

/// Destination for `file_name` in `dir`: an existing file with the same
/// content is reused, otherwise the first free `stem_N.ext` is taken.
fn choose_target(dir: &Path, file_name: &str, source_hash: &str) -> Result<(PathBuf, bool)> {
    let first = dir.join(file_name);
    if !first.exists() {
        return Ok((first, false));
    }
    if compute_full_hash(&first)? == source_hash {
        return Ok((first, true));
    }

    let stem = first.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = first.extension().and_then(|e| e.to_str()).unwrap_or("");
    for i in 1..1000 {
        let name = if ext.is_empty() {
            format!("{}_{}", stem, i)
        } else {
            format!("{}_{}.{}", stem, i, ext)
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok((candidate, false));
        }
        if compute_full_hash(&candidate)? == source_hash {
            return Ok((candidate, true));
        }
    }

    Err(MigrateError::Other(format!("Could not find a free name for {} in {}", file_name, dir.display())))
}

/// Copy via a temp file in the target directory and preserve mtime
fn copy_into_place(source: &Path, dest: &Path) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| MigrateError::InvalidPath(dest.display().to_string()))?;
    let mut input = fs::File::open(source)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(dir)?;
    io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| MigrateError::Io(e.error))?;

    if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
        let _ = filetime::set_file_mtime(dest, filetime::FileTime::from_system_time(modified));
    }
    Ok(())
}

impl ImportClient for SyncFolderImporter {
    fn name(&self) -> &str {
        "sync folder"
    }

    fn import_file(&mut self, path: &Path, album: Option<&str>) -> Result<String> {
        let upload_err = |reason: String| MigrateError::Upload {
            path: path.display().to_string(),
            reason,
        };

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrateError::InvalidPath(path.display().to_string()))?;
        let size = fs::metadata(path)
            .map_err(|e| upload_err(e.to_string()))?
            .len();
        let hash = compute_full_hash(path)?;

        let dir = self.album_dir(album)?;
        fs::create_dir_all(&dir).map_err(|e| upload_err(e.to_string()))?;

        let (target, reused) = choose_target(&dir, file_name, &hash)?;
        if reused {
            log::debug!("{} already present at {}", file_name, target.display());
        } else {
            copy_into_place(path, &target).map_err(|e| upload_err(e.to_string()))?;
            log::debug!("Copied {} -> {}", path.display(), target.display());
        }

        self.placed.insert(target.clone(), Placed { size, hash });
        Ok(target.to_string_lossy().to_string())
    }

    fn verify(&mut self, asset: &str) -> Result<bool> {
        let target = PathBuf::from(asset);
        let expected = self.placed.get(&target);

        poll_until(self.poll, || {
            let meta = match fs::metadata(&target) {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            match expected {
                None => Ok(meta.is_file()),
                Some(p) if meta.len() != p.size => Ok(false),
                Some(p) => Ok(compute_full_hash(&target)? == p.hash),
            }
        })
    }
}
