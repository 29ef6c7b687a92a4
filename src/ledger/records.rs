// Side records: failed uploads, corrupted archives, uploaded-file fingerprints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::Fingerprint;
use crate::workdir::WorkPaths;
use super::store::JsonMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedUpload {
    pub file: String,
    #[serde(default)]
    pub album: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorruptedZip {
    pub file_name: String,
    pub file_size: u64,
    pub local_path: String,
    pub error: String,
    pub detected_at: DateTime<Utc>,
    /// Extractions of this exact copy that failed
    #[serde(default = "one")]
    pub failures: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedFile {
    pub file_path: String,
    #[serde(default)]
    pub album_name: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_identifier: Option<String>,
    pub file_size: u64,
}

pub struct SideRecords {
    failed_uploads: JsonMap<FailedUpload>,
    corrupted: JsonMap<CorruptedZip>,
    uploaded: JsonMap<UploadedFile>,
}

impl SideRecords {
    pub fn open(paths: &WorkPaths) -> Self {
        Self {
            failed_uploads: JsonMap::load(&paths.failed_uploads_file()),
            corrupted: JsonMap::load(&paths.corrupted_zips_file()),
            uploaded: JsonMap::load(&paths.uploaded_files_file()),
        }
    }

    // failed uploads

    /// Add a failed upload or bump its failure count, keyed by ledger file key
    pub fn record_failed_upload(&mut self, key: &str, file: &str, album: Option<&str>) -> Result<()> {
        self.failed_uploads.upsert(
            key,
            || FailedUpload {
                file: file.to_string(),
                album: album.map(str::to_string),
                retry_count: 0,
            },
            |entry| {
                entry.retry_count += 1;
                entry.file = file.to_string();
                entry.album = album.map(str::to_string);
            },
        )
    }

    pub fn clear_failed_upload(&mut self, key: &str) -> Result<()> {
        self.failed_uploads.remove(key).map(|_| ())
    }

    pub fn failed_uploads(&self) -> impl Iterator<Item = (&String, &FailedUpload)> {
        self.failed_uploads.iter()
    }

    pub fn failed_upload_count(&self) -> usize {
        self.failed_uploads.len()
    }

    // corrupted archives

    pub fn record_corrupted(&mut self, remote_id: &str, entry: CorruptedZip) -> Result<()> {
        log::warn!(
            "Recording corrupted archive {} ({} bytes): {}",
            entry.file_name,
            entry.file_size,
            entry.error
        );
        self.corrupted.insert(remote_id, entry)
    }

    pub fn clear_corrupted(&mut self, remote_id: &str) -> Result<()> {
        self.corrupted.remove(remote_id).map(|_| ())
    }

    pub fn is_corrupted(&self, remote_id: &str) -> bool {
        self.corrupted.contains_key(remote_id)
    }

    pub fn corrupted(&self) -> impl Iterator<Item = (&String, &CorruptedZip)> {
        self.corrupted.iter()
    }

    // uploaded fingerprints

    /// Previously imported entry for this fingerprint, only if the size matches
    pub fn lookup_uploaded(&self, fingerprint: &Fingerprint) -> Option<&UploadedFile> {
        self.uploaded
            .get(&fingerprint.key)
            .filter(|entry| entry.file_size == fingerprint.size)
    }

    pub fn record_uploaded(
        &mut self,
        fingerprint: &Fingerprint,
        file_path: &str,
        album: Option<&str>,
        asset_identifier: Option<&str>,
    ) -> Result<()> {
        self.uploaded.insert(
            fingerprint.key.clone(),
            UploadedFile {
                file_path: file_path.to_string(),
                album_name: album.map(str::to_string),
                uploaded_at: Utc::now(),
                asset_identifier: asset_identifier.map(str::to_string),
                file_size: fingerprint.size,
            },
        )
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded.len()
    }

    /// Drop failed-upload and corrupted-archive records. Uploaded fingerprints are kept.
    pub fn reset_failure_records(&mut self) -> Result<()> {
        self.failed_uploads.clear()?;
        self.corrupted.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fingerprint(key: &str, size: u64) -> Fingerprint {
        Fingerprint { key: key.to_string(), size }
    }

    #[test]
    fn test_failed_upload_retry_count_increments() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::new(tmp.path());
        let mut side = SideRecords::open(&paths);

        side.record_failed_upload("a.zip/x.jpg", "/w/x.jpg", Some("Trip")).unwrap();
        side.record_failed_upload("a.zip/x.jpg", "/w/x.jpg", Some("Trip")).unwrap();

        let reopened = SideRecords::open(&paths);
        let (_, entry) = reopened.failed_uploads().next().unwrap();
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.album.as_deref(), Some("Trip"));

        side.clear_failed_upload("a.zip/x.jpg").unwrap();
        assert_eq!(SideRecords::open(&paths).failed_upload_count(), 0);
    }

    #[test]
    fn test_uploaded_lookup_requires_matching_size() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::new(tmp.path());
        let mut side = SideRecords::open(&paths);

        side.record_uploaded(&fingerprint("fp1", 100), "/w/x.jpg", None, Some("asset-9")).unwrap();

        let hit = side.lookup_uploaded(&fingerprint("fp1", 100)).unwrap();
        assert_eq!(hit.asset_identifier.as_deref(), Some("asset-9"));
        assert!(side.lookup_uploaded(&fingerprint("fp1", 101)).is_none());
        assert!(side.lookup_uploaded(&fingerprint("fp2", 100)).is_none());
    }

    #[test]
    fn test_reset_keeps_uploaded_fingerprints() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::new(tmp.path());
        let mut side = SideRecords::open(&paths);

        side.record_uploaded(&fingerprint("fp1", 1), "/w/x.jpg", None, None).unwrap();
        side.record_failed_upload("k", "/w/y.jpg", None).unwrap();
        side.record_corrupted(
            "remote-2",
            CorruptedZip {
                file_name: "a-002.zip".into(),
                file_size: 2048,
                local_path: "/w/downloads/a-002.zip".into(),
                error: "invalid central directory".into(),
                detected_at: Utc::now(),
                failures: 1,
            },
        )
        .unwrap();
        assert!(side.is_corrupted("remote-2"));

        side.reset_failure_records().unwrap();
        let reopened = SideRecords::open(&paths);
        assert_eq!(reopened.uploaded_count(), 1);
        assert_eq!(reopened.failed_upload_count(), 0);
        assert!(!reopened.is_corrupted("remote-2"));
    }

    #[test]
    fn test_corrupted_entry_without_failure_count_reads_as_one() {
        let entry: CorruptedZip = serde_json::from_str(
            r#"{"file_name":"a.zip","file_size":5,"local_path":"/w/a.zip","error":"bad","detected_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(entry.failures, 1);
    }
}
