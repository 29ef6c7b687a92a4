// Crash-safe JSON persistence
//
// Every write goes to a temp file in the target directory, is fsynced, then
// renamed over the target. A reader never observes a half-written document.
// Unreadable documents are moved aside and replaced by an empty default.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::TEMP_FILE_PREFIX;
use crate::error::{MigrateError, Result};

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| MigrateError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent)?;

    let data = serde_json::to_vec_pretty(value)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(parent)?;
    tmp.write_all(&data)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| MigrateError::Io(e.error))?;

    // Make the rename itself durable
    #[cfg(unix)]
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Read a JSON document. Missing file -> default. Corrupt file -> quarantined, default.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            log::error!("State file {} is unreadable ({}); starting empty", path.display(), e);
            return T::default();
        }
    };

    match serde_json::from_slice::<T>(&raw) {
        Ok(value) => value,
        Err(e) => {
            let quarantine = quarantine_path(path);
            log::error!(
                "State file {} is corrupt ({}); moved to {} and starting empty",
                path.display(),
                e,
                quarantine.display()
            );
            if let Err(rename_err) = fs::rename(path, &quarantine) {
                log::warn!("Could not quarantine {}: {}", path.display(), rename_err);
            }
            T::default()
        }
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state.json".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, stamp))
}

/// A string-keyed JSON map that is flushed to disk on every mutation.
#[derive(Debug)]
pub struct JsonMap<V> {
    path: PathBuf,
    entries: BTreeMap<String, V>,
}

impl<V: Serialize + DeserializeOwned> JsonMap<V> {
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: read_json_or_default(path),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Result<()> {
        self.entries.insert(key.into(), value);
        self.flush()
    }

    /// Mutate (or create) one entry and flush.
    pub fn upsert<F>(&mut self, key: &str, create: impl FnOnce() -> V, update: F) -> Result<()>
    where
        F: FnOnce(&mut V),
    {
        let entry = self.entries.entry(key.to_string()).or_insert_with(create);
        update(entry);
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<V>> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let mut map: BTreeMap<String, u32> = BTreeMap::new();
        map.insert("a".to_string(), 1);

        write_json_atomic(&path, &map).unwrap();
        write_json_atomic(&path, &map).unwrap();

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
        let back: BTreeMap<String, u32> = read_json_or_default(&path);
        assert_eq!(back.get("a"), Some(&1));
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();

        let map: BTreeMap<String, u32> = read_json_or_default(&path);
        assert!(map.is_empty());
        assert!(!path.exists());
        let quarantined = fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("state.json.corrupt-")
            })
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn test_json_map_persists_each_mutation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map.json");

        let mut map: JsonMap<u32> = JsonMap::load(&path);
        map.insert("x", 1).unwrap();
        map.upsert("x", || 0, |v| *v += 5).unwrap();
        map.upsert("y", || 7, |_| {}).unwrap();

        let reloaded: JsonMap<u32> = JsonMap::load(&path);
        assert_eq!(reloaded.get("x"), Some(&6));
        assert_eq!(reloaded.get("y"), Some(&7));

        let mut reloaded = reloaded;
        reloaded.remove("x").unwrap();
        assert_eq!(JsonMap::<u32>::load(&path).len(), 1);
        reloaded.clear().unwrap();
        assert!(!path.exists());
    }
}
