// Persistent state ledger
//
// Durable record of per-archive and per-file progress. Every resumption
// decision the orchestrator makes is a function of what is stored here.
// Each transition is flushed to disk before the call returns.

pub mod records;
pub mod state;
pub mod store;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::workdir::WorkPaths;
use state::transition_allowed;
use store::{read_json_or_default, write_json_atomic, JsonMap};

pub use records::{CorruptedZip, FailedUpload, SideRecords, UploadedFile};
pub use state::{ArchiveState, FileState};

/// Persisted record of one archive unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub state: ArchiveState,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
}

/// Persisted record of one media file, keyed by "<archive>/<relative path>"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub state: FileState,
    pub zip_name: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// Set when the file was transcoded and now lives under another name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_path: Option<String>,
}

/// Optional data attached to an archive transition.
/// Fields left `None` keep their previous value, except `error`, which is
/// replaced on every transition.
#[derive(Debug, Clone, Default)]
pub struct ArchiveUpdate {
    pub extracted_dir: Option<String>,
    pub error: Option<String>,
    pub remote_id: Option<String>,
    pub expected_size: Option<u64>,
}

impl ArchiveUpdate {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Default::default()
        }
    }
}

/// Optional data attached to a file transition. Same merge rule as ArchiveUpdate.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub error: Option<String>,
    pub asset_identifier: Option<String>,
    pub album: Option<String>,
    pub converted_path: Option<String>,
}

impl FileUpdate {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Default::default()
        }
    }
}

/// Breadcrumb of the last in-progress step. Informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Archive,
    File,
}

/// One recorded transition, kept in memory for the current process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub kind: EntityKind,
    pub key: String,
    pub from: Option<String>,
    pub to: String,
}

/// Per-archive tally of file states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTally {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
}

impl FileTally {
    pub fn all_synced(&self) -> bool {
        self.total > 0 && self.synced == self.total
    }
}

/// Build the ledger key of a media file
pub fn file_key(zip_name: &str, relative_path: &str) -> String {
    format!("{}/{}", zip_name, relative_path.replace('\\', "/"))
}

pub struct StateLedger {
    archives: JsonMap<ArchiveRecord>,
    files: JsonMap<FileRecord>,
    checkpoint_path: PathBuf,
    run_id: String,
    journal: Vec<Transition>,
}

impl StateLedger {
    /// Open the ledger stored in a working directory. Corrupt documents are
    /// quarantined and the affected map starts empty.
    pub fn open(paths: &WorkPaths) -> Result<Self> {
        fs::create_dir_all(&paths.root)?;
        let ledger = Self {
            archives: JsonMap::load(&paths.zip_state_file()),
            files: JsonMap::load(&paths.file_state_file()),
            checkpoint_path: paths.checkpoint_file(),
            run_id: uuid::Uuid::new_v4().to_string(),
            journal: Vec::new(),
        };
        log::debug!(
            "Ledger opened: {} archive records, {} file records",
            ledger.archives.len(),
            ledger.files.len()
        );
        Ok(ledger)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    // ----- archive units -----

    pub fn get_state(&self, name: &str) -> Option<ArchiveState> {
        self.archives.get(name).map(|r| r.state)
    }

    pub fn archive(&self, name: &str) -> Option<&ArchiveRecord> {
        self.archives.get(name)
    }

    pub fn archives(&self) -> impl Iterator<Item = (&String, &ArchiveRecord)> {
        self.archives.iter()
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.get_state(name) == Some(ArchiveState::Uploaded)
    }

    /// Record a transition for an archive unit and flush it
    pub fn set_state(&mut self, name: &str, state: ArchiveState, update: ArchiveUpdate) -> Result<()> {
        let prev = self.archives.get(name).cloned();
        if let Some(ref prev) = prev {
            if !transition_allowed(
                prev.state.rank(),
                prev.state.is_terminal(),
                state.rank(),
                prev.state == state,
            ) {
                return Err(MigrateError::InvalidTransition {
                    key: name.to_string(),
                    from: prev.state.to_string(),
                    to: state.to_string(),
                });
            }
        }

        let record = ArchiveRecord {
            state,
            updated_at: Utc::now(),
            extracted_dir: update
                .extracted_dir
                .or_else(|| prev.as_ref().and_then(|p| p.extracted_dir.clone())),
            error: update.error,
            remote_id: update
                .remote_id
                .or_else(|| prev.as_ref().and_then(|p| p.remote_id.clone())),
            expected_size: update
                .expected_size
                .or_else(|| prev.as_ref().and_then(|p| p.expected_size)),
        };
        self.archives.insert(name, record)?;

        log::debug!(
            "{}: {} -> {}",
            name,
            prev.as_ref().map(|p| p.state.as_str()).unwrap_or("none"),
            state
        );
        self.journal.push(Transition {
            kind: EntityKind::Archive,
            key: name.to_string(),
            from: prev.map(|p| p.state.to_string()),
            to: state.to_string(),
        });
        Ok(())
    }

    pub fn query_by_state(&self, state: ArchiveState) -> Vec<String> {
        self.archives
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn archive_counts(&self) -> BTreeMap<ArchiveState, usize> {
        let mut counts = BTreeMap::new();
        for (_, r) in self.archives.iter() {
            *counts.entry(r.state).or_insert(0) += 1;
        }
        counts
    }

    // ----- media files -----

    pub fn file_state(&self, key: &str) -> Option<FileState> {
        self.files.get(key).map(|r| r.state)
    }

    pub fn file(&self, key: &str) -> Option<&FileRecord> {
        self.files.get(key)
    }

    /// Record a transition for a media file and flush it
    pub fn set_file_state(
        &mut self,
        key: &str,
        zip_name: &str,
        state: FileState,
        update: FileUpdate,
    ) -> Result<()> {
        let prev = self.files.get(key).cloned();
        if let Some(ref prev) = prev {
            if !transition_allowed(
                prev.state.rank(),
                prev.state.is_terminal(),
                state.rank(),
                prev.state == state,
            ) {
                return Err(MigrateError::InvalidTransition {
                    key: key.to_string(),
                    from: prev.state.to_string(),
                    to: state.to_string(),
                });
            }
        }

        if state == FileState::Synced {
            let unit_ok = self
                .get_state(zip_name)
                .map(|s| s.at_least(ArchiveState::Converted))
                .unwrap_or(false);
            if !unit_ok {
                return Err(MigrateError::InvalidTransition {
                    key: key.to_string(),
                    from: prev.map(|p| p.state.to_string()).unwrap_or_else(|| "none".to_string()),
                    to: format!("{} (archive {} not converted)", state, zip_name),
                });
            }
        }

        let record = FileRecord {
            state,
            zip_name: zip_name.to_string(),
            updated_at: Utc::now(),
            error: update.error,
            asset_identifier: update
                .asset_identifier
                .or_else(|| prev.as_ref().and_then(|p| p.asset_identifier.clone())),
            album: update.album.or_else(|| prev.as_ref().and_then(|p| p.album.clone())),
            converted_path: update
                .converted_path
                .or_else(|| prev.as_ref().and_then(|p| p.converted_path.clone())),
        };
        self.files.insert(key, record)?;

        self.journal.push(Transition {
            kind: EntityKind::File,
            key: key.to_string(),
            from: prev.map(|p| p.state.to_string()),
            to: state.to_string(),
        });
        Ok(())
    }

    /// Move a failed file back to the predecessor of its failing stage.
    /// Returns the state it was reset to, or None if it was not failed.
    pub fn reset_file_for_retry(&mut self, key: &str) -> Result<Option<FileState>> {
        let Some(record) = self.files.get(key).cloned() else {
            return Ok(None);
        };
        let Some(target) = record.state.retry_predecessor() else {
            return Ok(None);
        };
        self.set_file_state(key, &record.zip_name, target, FileUpdate::default())?;
        Ok(Some(target))
    }

    /// Force a non-synced file back to EXTRACTED after its extracted copy was rebuilt
    pub fn reset_file_to_extracted(&mut self, key: &str) -> Result<bool> {
        let Some(record) = self.files.get(key).cloned() else {
            return Ok(false);
        };
        if record.state.is_terminal() || record.state == FileState::Extracted {
            return Ok(false);
        }
        let rewritten = FileRecord {
            state: FileState::Extracted,
            updated_at: Utc::now(),
            error: None,
            converted_path: None,
            ..record.clone()
        };
        self.files.insert(key, rewritten)?;
        self.journal.push(Transition {
            kind: EntityKind::File,
            key: key.to_string(),
            from: Some(record.state.to_string()),
            to: FileState::Extracted.to_string(),
        });
        Ok(true)
    }

    /// File keys of one archive, in key order
    pub fn files_for_archive(&self, zip_name: &str) -> Vec<(String, FileRecord)> {
        self.files
            .iter()
            .filter(|(_, r)| r.zip_name == zip_name)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    pub fn query_files_by_state(&self, state: FileState) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn file_tally(&self, zip_name: &str) -> FileTally {
        let mut tally = FileTally::default();
        for (_, r) in self.files.iter().filter(|(_, r)| r.zip_name == zip_name) {
            tally.total += 1;
            if r.state == FileState::Synced {
                tally.synced += 1;
            } else if r.state.is_failed() {
                tally.failed += 1;
            }
        }
        tally
    }

    pub fn file_counts(&self) -> BTreeMap<FileState, usize> {
        let mut counts = BTreeMap::new();
        for (_, r) in self.files.iter() {
            *counts.entry(r.state).or_insert(0) += 1;
        }
        counts
    }

    // ----- checkpoint -----

    pub fn set_checkpoint(&self, step: &str, zip_name: Option<&str>, file_path: Option<&str>) -> Result<()> {
        let checkpoint = Checkpoint {
            step: step.to_string(),
            zip_name: zip_name.map(str::to_string),
            file_path: file_path.map(str::to_string),
            timestamp: Utc::now(),
            run_id: Some(self.run_id.clone()),
            host: hostname::get().ok().map(|h| h.to_string_lossy().to_string()),
        };
        write_json_atomic(&self.checkpoint_path, &checkpoint)
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        read_json_or_default::<Option<Checkpoint>>(&self.checkpoint_path)
    }

    pub fn clear_checkpoint(&self) -> Result<()> {
        if self.checkpoint_path.exists() {
            fs::remove_file(&self.checkpoint_path)?;
        }
        Ok(())
    }

    // ----- reset / journal -----

    /// Erase every archive and file record and the checkpoint
    pub fn reset(&mut self) -> Result<()> {
        log::warn!(
            "Resetting ledger ({} archive records, {} file records)",
            self.archives.len(),
            self.files.len()
        );
        self.archives.clear()?;
        self.files.clear()?;
        self.clear_checkpoint()?;
        self.journal.clear();
        Ok(())
    }

    pub fn journal(&self) -> &[Transition] {
        &self.journal
    }

    /// Number of transitions recorded for one key in this process
    pub fn transitions_for(&self, key: &str) -> usize {
        self.journal.iter().filter(|t| t.key == key).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> (WorkPaths, StateLedger) {
        let paths = WorkPaths::new(tmp.path());
        paths.init().unwrap();
        let ledger = StateLedger::open(&paths).unwrap();
        (paths, ledger)
    }

    #[test]
    fn test_set_state_persists_and_merges_metadata() {
        let tmp = TempDir::new().unwrap();
        let (paths, mut ledger) = open(&tmp);

        ledger
            .set_state(
                "a-001.zip",
                ArchiveState::Downloaded,
                ArchiveUpdate {
                    remote_id: Some("id-1".into()),
                    expected_size: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();
        ledger
            .set_state(
                "a-001.zip",
                ArchiveState::Extracted,
                ArchiveUpdate {
                    extracted_dir: Some("/w/extracted/a-001.zip".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let reopened = StateLedger::open(&paths).unwrap();
        let rec = reopened.archive("a-001.zip").unwrap();
        assert_eq!(rec.state, ArchiveState::Extracted);
        assert_eq!(rec.remote_id.as_deref(), Some("id-1"));
        assert_eq!(rec.expected_size, Some(42));
        assert_eq!(rec.extracted_dir.as_deref(), Some("/w/extracted/a-001.zip"));
        assert!(!reopened.is_complete("a-001.zip"));
    }

    #[test]
    fn test_regression_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_paths, mut ledger) = open(&tmp);

        ledger.set_state("u.zip", ArchiveState::Converted, ArchiveUpdate::default()).unwrap();
        let err = ledger
            .set_state("u.zip", ArchiveState::Downloaded, ArchiveUpdate::default())
            .unwrap_err();
        assert!(matches!(err, MigrateError::InvalidTransition { .. }));
        assert_eq!(ledger.get_state("u.zip"), Some(ArchiveState::Converted));
    }

    #[test]
    fn test_query_by_state_and_error_replacement() {
        let tmp = TempDir::new().unwrap();
        let (_paths, mut ledger) = open(&tmp);

        ledger
            .set_state("b.zip", ArchiveState::FailedExtraction, ArchiveUpdate::error("bad crc"))
            .unwrap();
        ledger.set_state("a.zip", ArchiveState::FailedExtraction, ArchiveUpdate::default()).unwrap();
        ledger.set_state("c.zip", ArchiveState::Uploaded, ArchiveUpdate::default()).unwrap();

        assert_eq!(
            ledger.query_by_state(ArchiveState::FailedExtraction),
            vec!["a.zip".to_string(), "b.zip".to_string()]
        );
        assert_eq!(ledger.archive("b.zip").unwrap().error.as_deref(), Some("bad crc"));

        ledger.set_state("b.zip", ArchiveState::Downloaded, ArchiveUpdate::default()).unwrap();
        assert!(ledger.archive("b.zip").unwrap().error.is_none());
        assert!(ledger.is_complete("c.zip"));
    }

    #[test]
    fn test_synced_requires_converted_archive() {
        let tmp = TempDir::new().unwrap();
        let (_paths, mut ledger) = open(&tmp);
        let key = file_key("a.zip", "Album/img.jpg");

        ledger.set_state("a.zip", ArchiveState::Extracted, ArchiveUpdate::default()).unwrap();
        ledger.set_file_state(&key, "a.zip", FileState::Converted, FileUpdate::default()).unwrap();
        assert!(ledger
            .set_file_state(&key, "a.zip", FileState::Synced, FileUpdate::default())
            .is_err());

        ledger.set_state("a.zip", ArchiveState::Converted, ArchiveUpdate::default()).unwrap();
        ledger
            .set_file_state(
                &key,
                "a.zip",
                FileState::Synced,
                FileUpdate {
                    asset_identifier: Some("asset-1".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(ledger.file_tally("a.zip"), FileTally { total: 1, synced: 1, failed: 0 });
        assert!(ledger.file_tally("a.zip").all_synced());
    }

    #[test]
    fn test_file_retry_resets_to_predecessor() {
        let tmp = TempDir::new().unwrap();
        let (_paths, mut ledger) = open(&tmp);
        let key = file_key("a.zip", "x.jpg");

        ledger.set_file_state(&key, "a.zip", FileState::Converted, FileUpdate::default()).unwrap();
        ledger
            .set_file_state(&key, "a.zip", FileState::FailedUpload, FileUpdate::error("timeout"))
            .unwrap();
        assert_eq!(ledger.file_tally("a.zip").failed, 1);
        assert_eq!(ledger.query_files_by_state(FileState::FailedUpload), vec![key.clone()]);

        assert_eq!(ledger.reset_file_for_retry(&key).unwrap(), Some(FileState::Converted));
        assert_eq!(ledger.file_state(&key), Some(FileState::Converted));
        assert_eq!(ledger.reset_file_for_retry(&key).unwrap(), None);
    }

    #[test]
    fn test_checkpoint_round_trip_and_clear() {
        let tmp = TempDir::new().unwrap();
        let (_paths, ledger) = open(&tmp);

        assert!(ledger.checkpoint().is_none());
        ledger.set_checkpoint("extracting", Some("a.zip"), None).unwrap();
        let cp = ledger.checkpoint().unwrap();
        assert_eq!(cp.step, "extracting");
        assert_eq!(cp.zip_name.as_deref(), Some("a.zip"));
        assert_eq!(cp.run_id.as_deref(), Some(ledger.run_id()));

        ledger.clear_checkpoint().unwrap();
        assert!(ledger.checkpoint().is_none());
    }

    #[test]
    fn test_corrupt_state_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::new(tmp.path());
        paths.init().unwrap();
        fs::write(paths.zip_state_file(), b"[[[").unwrap();

        let ledger = StateLedger::open(&paths).unwrap();
        assert!(ledger.get_state("anything").is_none());
        assert!(!paths.zip_state_file().exists());
    }

    #[test]
    fn test_reset_erases_everything() {
        let tmp = TempDir::new().unwrap();
        let (paths, mut ledger) = open(&tmp);

        ledger.set_state("a.zip", ArchiveState::Uploaded, ArchiveUpdate::default()).unwrap();
        ledger
            .set_file_state(&file_key("a.zip", "x.jpg"), "a.zip", FileState::Extracted, FileUpdate::default())
            .unwrap();
        ledger.set_checkpoint("uploading", Some("a.zip"), None).unwrap();

        ledger.reset().unwrap();
        assert!(ledger.get_state("a.zip").is_none());
        assert!(ledger.journal().is_empty());
        assert!(!paths.zip_state_file().exists());
        assert!(!paths.checkpoint_file().exists());

        // an explicit reset permits starting over from pending
        ledger.set_state("a.zip", ArchiveState::Pending, ArchiveUpdate::default()).unwrap();
        assert_eq!(ledger.transitions_for("a.zip"), 1);
    }
}
