// Photos app destination (macOS, driven through osascript)
//
// Each operation is a small AppleScript fed on stdin; paths and names go in
// through argv so nothing user-controlled is spliced into script text.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{MigrateError, Result};
use crate::tools::osascript_path;
use crate::wait::{poll_until, PollSpec};
use super::{AlbumHandle, AlbumStore, ImportClient};

const IMPORT_SCRIPT: &str = r#"on run argv
    set mediaFile to POSIX file (item 1 of argv) as alias
    tell application "Photos"
        set imported to import {mediaFile} skip check duplicates true
        if (count of imported) is 0 then error "Photos imported nothing"
        return id of item 1 of imported
    end tell
end run"#;

const VERIFY_SCRIPT: &str = r#"on run argv
    tell application "Photos"
        try
            set found to media item id (item 1 of argv)
            return "true"
        on error
            return "false"
        end try
    end tell
end run"#;

const ALBUM_SCRIPT: &str = r#"on run argv
    set albumName to item 1 of argv
    tell application "Photos"
        if exists album albumName then return id of album albumName
        return id of (make new album named albumName)
    end tell
end run"#;

const ADD_SCRIPT: &str = r#"on run argv
    tell application "Photos"
        add {media item id (item 2 of argv)} to album id (item 1 of argv)
    end tell
end run"#;

pub struct PhotosAppImporter {
    osascript: PathBuf,
    poll: PollSpec,
    albums: HashMap<String, AlbumHandle>,
}

impl PhotosAppImporter {
    pub fn new(poll: PollSpec) -> Self {
        Self::with_osascript(osascript_path(), poll)
    }

    pub fn with_osascript(osascript: PathBuf, poll: PollSpec) -> Self {
        Self { osascript, poll, albums: HashMap::new() }
    }

    /// Run `script` with `args`, returning trimmed stdout
    fn run_script(&self, script: &str, args: &[&str]) -> Result<String> {
        let mut child = Command::new(&self.osascript)
            .arg("-")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MigrateError::Upload {
                path: args.first().copied().unwrap_or_default().to_string(),
                reason: format!("Failed to run osascript: {}", e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MigrateError::Upload {
                path: args.first().copied().unwrap_or_default().to_string(),
                reason: format!("osascript exited with {}: {}", output.status.code().unwrap_or(-1), stderr),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl AlbumStore for PhotosAppImporter {
    fn get_or_create(&mut self, name: &str) -> Result<AlbumHandle> {
        if let Some(handle) = self.albums.get(name) {
            return Ok(handle.clone());
        }
        let id = self.run_script(ALBUM_SCRIPT, &[name])?;
        if id.is_empty() {
            return Err(MigrateError::Upload {
                path: name.to_string(),
                reason: "Photos returned no album id".to_string(),
            });
        }
        let handle = AlbumHandle(id);
        self.albums.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn add(&mut self, album: &AlbumHandle, asset: &str) -> Result<()> {
        self.run_script(ADD_SCRIPT, &[&album.0, asset]).map(|_| ())
    }
}

impl ImportClient for PhotosAppImporter {
    fn name(&self) -> &str {
        "Photos"
    }

    fn import_file(&mut self, path: &Path, album: Option<&str>) -> Result<String> {
        let path_str = path
            .to_str()
            .ok_or_else(|| MigrateError::InvalidPath(path.display().to_string()))?;
        let asset = self.run_script(IMPORT_SCRIPT, &[path_str])?;
        if asset.is_empty() {
            return Err(MigrateError::Upload {
                path: path_str.to_string(),
                reason: "Photos returned no media item id".to_string(),
            });
        }

        // the asset is in the library at this point; album membership alone is not worth a re-import
        if let Some(name) = album {
            let added = self.get_or_create(name).and_then(|h| self.add(&h, &asset));
            if let Err(e) = added {
                log::warn!("Imported {} but could not add it to album {:?}: {}", path.display(), name, e);
            }
        }

        Ok(asset)
    }

    fn verify(&mut self, asset: &str) -> Result<bool> {
        let poll = self.poll;
        poll_until(poll, || Ok(self.run_script(VERIFY_SCRIPT, &[asset])? == "true"))
    }
}
