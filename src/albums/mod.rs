// Album resolution
// Album name per media file, from the album metadata JSON in its folder
// (preferred) or from the folder name itself. Results are cached per folder.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use regex::Regex;

use crate::constants::{ALBUM_METADATA_FILENAMES, CONTAINER_FOLDERS};

fn year_folder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(photos from \d{4}|\d{4})$").ok())
        .as_ref()
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct AlbumResolver {
    ttl: Duration,
    ignored: HashSet<String>,
    cache: HashMap<PathBuf, (Instant, Option<String>)>,
}

impl AlbumResolver {
    pub fn new(ttl: Duration, extra_ignored: &[String]) -> Self {
        let mut ignored: HashSet<String> = CONTAINER_FOLDERS.iter().map(|s| s.to_string()).collect();
        ignored.extend(extra_ignored.iter().map(|s| s.trim().to_lowercase()));
        Self {
            ttl,
            ignored,
            cache: HashMap::new(),
        }
    }

    /// Album of one media file; `root` is the extraction root, which is never an album
    pub fn resolve(&mut self, media_path: &Path, root: &Path) -> Option<String> {
        let dir = media_path.parent()?;
        if let Some((at, album)) = self.cache.get(dir) {
            if at.elapsed() < self.ttl {
                return album.clone();
            }
        }

        let album = self.resolve_dir(dir, root);
        self.cache.insert(dir.to_path_buf(), (Instant::now(), album.clone()));
        album
    }

    fn resolve_dir(&self, dir: &Path, root: &Path) -> Option<String> {
        if let Some(title) = album_title_from_json(dir) {
            return Some(title);
        }
        if dir == root {
            return None;
        }
        let name = normalize_name(dir.file_name()?.to_str()?);
        if name.is_empty() || self.is_ignored(&name) {
            return None;
        }
        Some(name)
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.contains(&name.to_lowercase())
            || year_folder_re().map(|re| re.is_match(name)).unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// `title` of the album metadata document in `dir`, if present and readable
fn album_title_from_json(dir: &Path) -> Option<String> {
    for name in ALBUM_METADATA_FILENAMES {
        let path = dir.join(name);
        let Ok(raw) = fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(value) => {
                let title = value
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(normalize_name)
                    .filter(|t| !t.is_empty());
                if title.is_some() {
                    return title;
                }
            }
            Err(e) => log::warn!("Ignoring malformed album metadata {}: {}", path.display(), e),
        }
    }
    None
}
