// Media discovery in an extracted archive

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::constants::{IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::error::Result;
use crate::metadata::sidecar::{find_sidecar, is_sidecar};

/// One media file and its sidecar, as found after extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    /// Path relative to the extraction root, '/'-separated
    pub relative: String,
    pub path: PathBuf,
    pub sidecar: Option<PathBuf>,
    pub is_video: bool,
}

fn lower_ext(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

pub fn is_video_file(path: &Path) -> bool {
    lower_ext(path)
        .map(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

pub fn is_media_file(path: &Path) -> bool {
    lower_ext(path)
        .map(|e| VIDEO_EXTENSIONS.contains(&e.as_str()) || IMAGE_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Walk an extraction directory and pair every media file with its sidecar.
/// Results are sorted by relative path.
pub fn discover_media(root: &Path) -> Result<Vec<MediaEntry>> {
    let mut entries = Vec::new();
    let mut ignored = 0usize;

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if hidden || is_sidecar(path) {
            continue;
        }
        if !is_media_file(path) {
            ignored += 1;
            log::debug!("Skipping non-media file {}", path.display());
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        entries.push(MediaEntry {
            relative,
            path: path.to_path_buf(),
            sidecar: find_sidecar(path),
            is_video: is_video_file(path),
        });
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));

    let with_sidecar = entries.iter().filter(|e| e.sidecar.is_some()).count();
    log::info!(
        "Discovered {} media files in {} ({} with sidecars, {} other files skipped)",
        entries.len(),
        root.display(),
        with_sidecar,
        ignored
    );

    Ok(entries)
}
