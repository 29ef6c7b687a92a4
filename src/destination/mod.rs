// Destination import clients
//
// Two bindings: the Photos app (via osascript) and a synced folder whose
// client uploads whatever lands in it. Album membership goes through the
// AlbumStore capability; there is no runtime probing of the binding.

pub mod photos_app;
pub mod sync_folder;

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{DestinationConfig, DestinationKind};
use crate::error::{MigrateError, Result};
use crate::wait::PollSpec;

/// Opaque album identifier of a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumHandle(pub String);

pub trait AlbumStore {
    fn get_or_create(&mut self, name: &str) -> Result<AlbumHandle>;
    fn add(&mut self, album: &AlbumHandle, asset: &str) -> Result<()>;
}

pub trait ImportClient {
    fn name(&self) -> &str;

    /// Import one file (into `album` if given) and return the asset handle
    fn import_file(&mut self, path: &Path, album: Option<&str>) -> Result<String>;

    /// Confirm the asset exists at the destination
    fn verify(&mut self, asset: &str) -> Result<bool>;
}

/// One file handed to `import_batch`
#[derive(Debug, Clone)]
pub struct BatchItem<'a> {
    pub key: &'a str,
    pub path: &'a Path,
    pub album: Option<&'a str>,
}

/// Per-file progress reported by `import_batch`
#[derive(Debug)]
pub enum ImportEvent {
    Imported { asset: String },
    Verified { asset: String },
    ImportFailed(MigrateError),
    VerificationFailed { asset: String, error: MigrateError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFlow {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: BTreeMap<String, bool>,
    pub stopped: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }
}

/// Import files in order, verifying each when asked. `observer` sees every
/// event and may stop the batch; remaining files are left untouched.
pub fn import_batch<F>(
    client: &mut dyn ImportClient,
    items: &[BatchItem<'_>],
    verify: bool,
    mut observer: F,
) -> BatchReport
where
    F: FnMut(&BatchItem<'_>, ImportEvent) -> Result<BatchFlow>,
{
    let mut report = BatchReport::default();

    for item in items {
        let (ok, flow) = import_one(client, item, verify, &mut observer);
        report.results.insert(item.key.to_string(), ok);
        if flow == BatchFlow::Stop {
            report.stopped = true;
            break;
        }
    }

    report
}

fn import_one<F>(
    client: &mut dyn ImportClient,
    item: &BatchItem<'_>,
    verify: bool,
    observer: &mut F,
) -> (bool, BatchFlow)
where
    F: FnMut(&BatchItem<'_>, ImportEvent) -> Result<BatchFlow>,
{
    // an observer that cannot record progress must halt the batch
    let notify = |observer: &mut F, event: ImportEvent| match observer(item, event) {
        Ok(flow) => flow,
        Err(e) => {
            log::error!("Stopping batch: could not record progress for {}: {}", item.key, e);
            BatchFlow::Stop
        }
    };

    let asset = match client.import_file(item.path, item.album) {
        Ok(asset) => asset,
        Err(e) => {
            log::warn!("Import failed for {}: {}", item.path.display(), e);
            return (false, notify(observer, ImportEvent::ImportFailed(e)));
        }
    };

    if notify(observer, ImportEvent::Imported { asset: asset.clone() }) == BatchFlow::Stop {
        return (false, BatchFlow::Stop);
    }
    if !verify {
        return (true, BatchFlow::Continue);
    }

    let failure = match client.verify(&asset) {
        Ok(true) => None,
        Ok(false) => Some(MigrateError::Verification {
            path: item.path.display().to_string(),
            reason: format!("asset {} not found at {}", asset, client.name()),
        }),
        Err(e) => Some(MigrateError::Verification {
            path: item.path.display().to_string(),
            reason: e.to_string(),
        }),
    };

    match failure {
        None => (true, notify(observer, ImportEvent::Verified { asset })),
        Some(error) => {
            log::warn!("{}", error);
            (false, notify(observer, ImportEvent::VerificationFailed { asset, error }))
        }
    }
}

/// Build the configured destination
pub fn from_config(cfg: &DestinationConfig) -> Result<Box<dyn ImportClient>> {
    let poll = PollSpec::from_secs(
        cfg.sync_min_wait_secs,
        cfg.sync_check_interval_secs,
        cfg.sync_timeout_secs,
    );
    match cfg.kind {
        DestinationKind::SyncFolder => {
            let dir = cfg.sync_dir.clone().ok_or_else(|| {
                MigrateError::Configuration("destination.sync_dir is required".to_string())
            })?;
            Ok(Box::new(sync_folder::SyncFolderImporter::new(dir, poll)?))
        }
        DestinationKind::PhotosApp => Ok(Box::new(photos_app::PhotosAppImporter::new(poll))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct ScriptedClient {
        fail_import: Vec<&'static str>,
        fail_verify: Vec<&'static str>,
        imported: Vec<PathBuf>,
    }

    impl ImportClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn import_file(&mut self, path: &Path, _album: Option<&str>) -> Result<String> {
            let name = path.file_name().unwrap().to_str().unwrap();
            if self.fail_import.contains(&name) {
                return Err(MigrateError::Upload { path: name.into(), reason: "refused".into() });
            }
            self.imported.push(path.to_path_buf());
            Ok(format!("asset:{}", name))
        }

        fn verify(&mut self, asset: &str) -> Result<bool> {
            Ok(!self.fail_verify.iter().any(|n| asset.ends_with(n)))
        }
    }

    fn items<'a>(paths: &'a [PathBuf], keys: &'a [String]) -> Vec<BatchItem<'a>> {
        paths
            .iter()
            .zip(keys)
            .map(|(p, k)| BatchItem { key: k, path: p, album: None })
            .collect()
    }

    #[test]
    fn test_batch_reports_each_outcome() {
        let paths: Vec<PathBuf> = ["/a.jpg", "/b.jpg", "/c.jpg"].iter().map(PathBuf::from).collect();
        let keys: Vec<String> = vec!["k/a".into(), "k/b".into(), "k/c".into()];
        let mut client = ScriptedClient { fail_import: vec!["b.jpg"], fail_verify: vec!["c.jpg"], imported: vec![] };

        let mut events = Vec::new();
        let report = import_batch(&mut client, &items(&paths, &keys), true, |item, event| {
            events.push(format!("{}:{}", item.key, match event {
                ImportEvent::Imported { .. } => "imported",
                ImportEvent::Verified { .. } => "verified",
                ImportEvent::ImportFailed(_) => "import_failed",
                ImportEvent::VerificationFailed { .. } => "verify_failed",
            }));
            Ok(BatchFlow::Continue)
        });

        assert_eq!(report.results.get("k/a"), Some(&true));
        assert_eq!(report.results.get("k/b"), Some(&false));
        assert_eq!(report.results.get("k/c"), Some(&false));
        assert_eq!(report.succeeded(), 1);
        assert!(!report.stopped);
        assert_eq!(
            events,
            vec!["k/a:imported", "k/a:verified", "k/b:import_failed", "k/c:imported", "k/c:verify_failed"]
        );
    }

    #[test]
    fn test_observer_can_stop_batch() {
        let paths: Vec<PathBuf> = ["/a.jpg", "/b.jpg"].iter().map(PathBuf::from).collect();
        let keys: Vec<String> = vec!["a".into(), "b".into()];
        let mut client = ScriptedClient { fail_import: vec![], fail_verify: vec!["a.jpg"], imported: vec![] };

        let report = import_batch(&mut client, &items(&paths, &keys), true, |_, event| {
            Ok(match event {
                ImportEvent::VerificationFailed { .. } => BatchFlow::Stop,
                _ => BatchFlow::Continue,
            })
        });

        assert!(report.stopped);
        assert_eq!(report.results.len(), 1);
        assert_eq!(client.imported.len(), 1);
    }

    #[test]
    fn test_skip_verification() {
        let paths = vec![PathBuf::from("/a.jpg")];
        let keys = vec!["a".to_string()];
        let mut client = ScriptedClient { fail_import: vec![], fail_verify: vec!["a.jpg"], imported: vec![] };
        let report = import_batch(&mut client, &items(&paths, &keys), false, |_, _| Ok(BatchFlow::Continue));
        assert_eq!(report.succeeded(), 1);
    }
}
