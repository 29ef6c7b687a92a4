// Migration orchestrator
//
// Drives every archive unit through download, extraction, metadata fusion,
// album resolution and import, one unit at a time. The ledger decides what is
// done; the disk is only consulted to find work that has to be redone (a lost
// extraction, a missing download).

pub mod control;
pub mod disk;
pub mod unit;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use regex::Regex;

use crate::albums::AlbumResolver;
use crate::archive::discover::{discover_media, MediaEntry};
use crate::archive::extract::{extract_archive, has_end_of_central_directory, join_parts};
use crate::archive::{group_units, ArchiveUnit, PartStyle};
use crate::config::MigrateConfig;
use crate::constants::{CORRUPTED_REDOWNLOAD_LIMIT, JOINED_SUFFIX, MAX_REDOWNLOAD_WAIT_SECS};
use crate::destination::{self, import_batch, BatchFlow, BatchItem, ImportClient, ImportEvent};
use crate::error::{MigrateError, Result};
use crate::hash::{compute_fingerprint, Fingerprint};
use crate::ledger::{
    file_key, ArchiveState, ArchiveUpdate, CorruptedZip, FileState, FileUpdate, SideRecords, StateLedger,
};
use crate::metadata::MetadataFusion;
use crate::remote::{self, is_valid_download, RemoteFile, RemoteStore};
use crate::wait::{poll_until, PollSpec};
use crate::workdir::{WorkDirLock, WorkPaths};

pub use control::{
    write_restart_marker, write_stop_marker, ControlSignal, DecisionHandler, PolicyHandler, PromptHandler,
    RunControl, VerificationDecision,
};
pub use disk::{DiskBudget, DiskVerdict};
pub use unit::{RunSummary, UnitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Every unit that is not uploaded yet
    Full,
    /// Files that failed import or verification
    RetryFailedUploads,
    /// Units whose extraction failed (re-download, re-extract)
    RetryFailedExtractions,
    /// Files whose metadata merge failed
    RetryFailedConversions,
}

impl RunMode {
    pub fn label(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::RetryFailedUploads => "retry failed uploads",
            RunMode::RetryFailedExtractions => "retry failed extractions",
            RunMode::RetryFailedConversions => "retry failed conversions",
        }
    }
}

/// Everything a run needs besides its collaborators
pub struct RunContext {
    pub config: MigrateConfig,
    pub paths: WorkPaths,
    pub mode: RunMode,
    pub control: Arc<RunControl>,
}

impl RunContext {
    pub fn new(config: MigrateConfig, mode: RunMode) -> Self {
        let paths = WorkPaths::new(&config.work_dir);
        let control = Arc::new(RunControl::new(&paths));
        Self { config, paths, mode, control }
    }
}

enum RunEnd {
    Finished,
    Stopped,
    RestartRequested,
}

/// A unit's import candidate
struct Candidate {
    key: String,
    path: PathBuf,
    album: Option<String>,
    fingerprint: Fingerprint,
    /// Asset of an import that was never confirmed
    unconfirmed: Option<String>,
}

pub struct Orchestrator {
    ctx: RunContext,
    ledger: StateLedger,
    side: SideRecords,
    remote: Box<dyn RemoteStore>,
    destination: Box<dyn ImportClient>,
    fusion: MetadataFusion,
    albums: AlbumResolver,
    handler: Box<dyn DecisionHandler>,
    budget: DiskBudget,
    pattern: Regex,
    ignore_verification_failures: bool,
    imports: usize,
}

impl Orchestrator {
    pub fn new(
        ctx: RunContext,
        remote: Box<dyn RemoteStore>,
        destination: Box<dyn ImportClient>,
        fusion: MetadataFusion,
        handler: Box<dyn DecisionHandler>,
    ) -> Result<Self> {
        ctx.paths.init()?;
        let pattern = Regex::new(&ctx.config.remote.name_pattern)
            .map_err(|e| MigrateError::Configuration(format!("remote.name_pattern: {}", e)))?;
        let ledger = StateLedger::open(&ctx.paths)?;
        let side = SideRecords::open(&ctx.paths);
        let processing = &ctx.config.processing;
        let albums = AlbumResolver::new(
            Duration::from_secs(processing.album_cache_ttl_secs),
            &processing.ignored_album_dirs,
        );
        let budget = DiskBudget::from_config(&ctx.config.disk);

        Ok(Self {
            ctx,
            ledger,
            side,
            remote,
            destination,
            fusion,
            albums,
            handler,
            budget,
            pattern,
            ignore_verification_failures: false,
            imports: 0,
        })
    }

    /// Build the configured remote, destination and metadata tools
    pub fn from_config(ctx: RunContext, handler: Box<dyn DecisionHandler>) -> Result<Self> {
        let remote = remote::from_config(&ctx.config.remote)?;
        let destination = destination::from_config(&ctx.config.destination)?;
        let fusion = MetadataFusion::from_config(&ctx.config.processing);
        Self::new(ctx, remote, destination, fusion, handler)
    }

    pub fn ledger(&self) -> &StateLedger {
        &self.ledger
    }

    pub fn side_records(&self) -> &SideRecords {
        &self.side
    }

    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.ctx.control)
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.ctx.mode = mode;
    }

    /// Run until every unit was processed or a stop was requested.
    /// A restart request wipes all state and begins again as a full run.
    pub fn run(&mut self) -> Result<RunSummary> {
        let _lock = WorkDirLock::acquire(&self.ctx.paths)?;
        log::info!(
            "Starting {} run {} in {}",
            self.ctx.mode.label(),
            self.ledger.run_id(),
            self.ctx.paths.root.display()
        );

        let mut summary = RunSummary::default();
        loop {
            match self.run_once(&mut summary)? {
                RunEnd::Finished => break,
                RunEnd::Stopped => {
                    summary.stopped = true;
                    break;
                }
                RunEnd::RestartRequested => {
                    log::warn!("Restart requested: wiping state and starting over");
                    self.reset()?;
                    self.ctx.mode = RunMode::Full;
                    summary = RunSummary {
                        restarts: summary.restarts + 1,
                        ..Default::default()
                    };
                }
            }
        }

        summary.imports = self.imports;
        log::info!(
            "Run finished: {} completed, {} partial, {} failed, {} deferred, {} skipped, {} imports",
            summary.completed,
            summary.partial,
            summary.failed,
            summary.deferred,
            summary.skipped,
            summary.imports
        );
        Ok(summary)
    }

    /// Erase the ledger, failure records and working files. Uploaded
    /// fingerprints are kept so nothing is imported twice after a reset.
    pub fn reset(&mut self) -> Result<()> {
        wipe_state(&mut self.ledger, &mut self.side, &self.ctx.paths)?;
        self.albums.clear();
        self.ignore_verification_failures = false;
        Ok(())
    }

    fn run_once(&mut self, summary: &mut RunSummary) -> Result<RunEnd> {
        if let Some(end) = self.check_control() {
            return Ok(end);
        }

        self.ledger.set_checkpoint("list", None, None)?;
        let listing = self.remote.list(None, Some(&self.pattern))?;
        let units = group_units(&listing);
        log::info!(
            "{} lists {} files in {} archive units",
            self.remote.name(),
            listing.len(),
            units.len()
        );
        self.warn_unlisted(&units);

        let selected = self.select_units(units)?;
        let ordered = self.order_units(selected);

        for unit in &ordered {
            if let Some(end) = self.check_control() {
                return Ok(end);
            }
            self.ledger.set_checkpoint("unit", Some(&unit.name), None)?;

            let outcome = match self.process_unit(unit, true) {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::error!("{} failed: {}", unit.name, e);
                    UnitOutcome::Errored { reason: e.to_string() }
                }
            };
            log::info!("{}: {}", unit.name, outcome.label());

            let stopped = outcome == UnitOutcome::UserStopped;
            summary.record(&unit.name, outcome);
            if stopped {
                return Ok(RunEnd::Stopped);
            }
        }

        if let Some(end) = self.check_control() {
            return Ok(end);
        }
        self.ledger.clear_checkpoint()?;
        Ok(RunEnd::Finished)
    }

    fn check_control(&self) -> Option<RunEnd> {
        match self.ctx.control.poll()? {
            ControlSignal::Stop => {
                log::info!("Stop requested");
                Some(RunEnd::Stopped)
            }
            ControlSignal::Restart => Some(RunEnd::RestartRequested),
        }
    }

    fn warn_unlisted(&self, units: &[ArchiveUnit]) {
        let listed: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
        for (name, record) in self.ledger.archives() {
            if record.state != ArchiveState::Uploaded && !listed.contains(name.as_str()) {
                log::warn!("{} is {} in the ledger but no longer listed by the remote", name, record.state);
            }
        }
    }

    /// Units this run works on. Retry modes reset the failed files first.
    fn select_units(&mut self, units: Vec<ArchiveUnit>) -> Result<Vec<ArchiveUnit>> {
        let names: BTreeSet<String> = match self.ctx.mode {
            RunMode::Full => return Ok(units),
            RunMode::RetryFailedUploads => {
                self.reset_failed_files(&[FileState::FailedUpload, FileState::FailedVerification])?
            }
            RunMode::RetryFailedConversions => {
                let mut names = self.reset_failed_files(&[FileState::FailedConversion])?;
                names.extend(self.ledger.query_by_state(ArchiveState::FailedConversion));
                names
            }
            RunMode::RetryFailedExtractions => self
                .ledger
                .query_by_state(ArchiveState::FailedExtraction)
                .into_iter()
                .collect(),
        };

        log::info!("{} units to retry", names.len());
        Ok(units.into_iter().filter(|u| names.contains(&u.name)).collect())
    }

    fn reset_failed_files(&mut self, states: &[FileState]) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for state in states {
            for key in self.ledger.query_files_by_state(*state) {
                if let Some(record) = self.ledger.file(&key) {
                    names.insert(record.zip_name.clone());
                }
                self.ledger.reset_file_for_retry(&key)?;
            }
        }
        Ok(names)
    }

    /// Locally present units first, then remote-only ones, each by name
    fn order_units(&self, units: Vec<ArchiveUnit>) -> Vec<ArchiveUnit> {
        let (mut local, mut remote_only): (Vec<_>, Vec<_>) =
            units.into_iter().partition(|u| self.is_local(u));
        local.sort_by(|a, b| a.name.cmp(&b.name));
        remote_only.sort_by(|a, b| a.name.cmp(&b.name));
        local.extend(remote_only);
        local
    }

    fn is_local(&self, unit: &ArchiveUnit) -> bool {
        if self.ctx.paths.extract_dir(&unit.name).is_dir() {
            return true;
        }
        !unit.parts.is_empty()
            && unit
                .parts
                .iter()
                .all(|p| is_valid_download(&self.ctx.paths.download_path(&p.name), p.size))
    }

    fn process_unit(&mut self, unit: &ArchiveUnit, allow_wait: bool) -> Result<UnitOutcome> {
        let name = unit.name.as_str();
        let state = self.ledger.get_state(name);

        if state == Some(ArchiveState::Uploaded) {
            if self.ctx.paths.extract_dir(name).exists() {
                log::debug!("{} is uploaded but its extraction is still on disk", name);
            }
            return Ok(UnitOutcome::Skipped { reason: "already uploaded".to_string() });
        }
        if allow_wait
            && self.ctx.mode == RunMode::Full
            && state == Some(ArchiveState::FailedExtraction)
            && self.still_corrupted(unit)
        {
            log::info!("{} is still the corrupted copy; re-export it and use --retry-failed-extractions", name);
            return Ok(UnitOutcome::Skipped { reason: "corrupted at the source".to_string() });
        }
        if !unit.is_complete() {
            let reason = format!("missing parts: {}", unit.missing_parts.join(", "));
            log::warn!("{} cannot be processed, {}", name, reason);
            self.ledger.set_state(
                name,
                ArchiveState::FailedDownload,
                ArchiveUpdate {
                    error: Some(reason.clone()),
                    remote_id: Some(unit.remote_id()),
                    expected_size: Some(unit.total_size()),
                    ..Default::default()
                },
            )?;
            return Ok(UnitOutcome::FailedDownload { reason });
        }

        let state = state.unwrap_or(ArchiveState::Pending);
        let extracted = state.at_least(ArchiveState::Extracted) || state == ArchiveState::FailedConversion;
        if !extracted || !self.ctx.paths.extract_dir(name).is_dir() {
            if extracted {
                log::warn!("{} is {} but its extracted files are gone; extracting again", name, state);
            }
            if let Some(outcome) = self.ensure_downloaded(unit, state)? {
                return Ok(outcome);
            }
            if let Some(outcome) = self.extract_unit(unit)? {
                if allow_wait && matches!(outcome, UnitOutcome::FailedExtraction { corrupted: true, .. }) {
                    if let Some(fresh) = self.wait_for_fresh_copy(unit)? {
                        log::info!("A fresh copy of {} appeared, processing it", name);
                        return self.process_unit(&fresh, false);
                    }
                }
                return Ok(outcome);
            }
        }

        if let Some(outcome) = self.convert_unit(unit)? {
            return Ok(outcome);
        }
        self.upload_unit(unit)
    }

    fn unit_update(unit: &ArchiveUnit) -> ArchiveUpdate {
        ArchiveUpdate {
            remote_id: Some(unit.remote_id()),
            expected_size: Some(unit.total_size()),
            ..Default::default()
        }
    }

    // ----- download -----

    fn ensure_downloaded(&mut self, unit: &ArchiveUnit, state: ArchiveState) -> Result<Option<UnitOutcome>> {
        let name = unit.name.as_str();
        let missing: Vec<&RemoteFile> = unit
            .parts
            .iter()
            .filter(|p| !is_valid_download(&self.ctx.paths.download_path(&p.name), p.size))
            .collect();

        if !missing.is_empty() {
            let missing_bytes: u64 = missing.iter().map(|p| p.size).sum();
            let verdict = self.budget.check(
                &self.ctx.paths.root,
                unit.total_size(),
                unit.total_size().saturating_sub(missing_bytes),
            )?;
            if verdict != DiskVerdict::Fits {
                log::warn!("Deferring {}: {}", name, verdict);
                return Ok(Some(UnitOutcome::Deferred { reason: verdict.to_string() }));
            }

            if unit.is_multi_part()
                && missing.len() < unit.parts.len()
                && !self.handler.confirm_part_downloads(name, missing.len(), missing_bytes)
            {
                let reason = format!("download of {} remaining parts declined", missing.len());
                self.ledger.set_state(
                    name,
                    ArchiveState::FailedDownload,
                    ArchiveUpdate { error: Some(reason.clone()), ..Self::unit_update(unit) },
                )?;
                return Ok(Some(UnitOutcome::FailedDownload { reason }));
            }

            for part in missing {
                self.ledger.set_checkpoint("download", Some(name), Some(&part.name))?;
                let dest = self.ctx.paths.download_path(&part.name);
                if let Err(e) = self.remote.download(part, &dest) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    log::error!("Download of {} failed: {}", part.name, e);
                    let reason = e.to_string();
                    self.ledger.set_state(
                        name,
                        ArchiveState::FailedDownload,
                        ArchiveUpdate { error: Some(reason.clone()), ..Self::unit_update(unit) },
                    )?;
                    return Ok(Some(UnitOutcome::FailedDownload { reason }));
                }
            }
        }

        if !state.at_least(ArchiveState::Downloaded) {
            self.ledger.set_state(name, ArchiveState::Downloaded, Self::unit_update(unit))?;
        }
        Ok(None)
    }

    // ----- extraction -----

    fn joined_path(&self, unit: &ArchiveUnit) -> PathBuf {
        self.ctx
            .paths
            .download_path(&format!("{}{}", unit.name, JOINED_SUFFIX))
    }

    fn extract_unit(&mut self, unit: &ArchiveUnit) -> Result<Option<UnitOutcome>> {
        let name = unit.name.as_str();
        self.ledger.set_checkpoint("extract", Some(name), None)?;

        let dest = self.ctx.paths.extract_dir(name);
        let part_paths: Vec<PathBuf> = unit
            .parts
            .iter()
            .map(|p| self.ctx.paths.download_path(&p.name))
            .collect();

        if unit.style == PartStyle::Split {
            let reason = "spanned .zNN sets cannot be joined; export with byte-split .zip.NNN parts".to_string();
            log::error!("{}: {}", name, reason);
            self.ledger.set_state(
                name,
                ArchiveState::FailedExtraction,
                ArchiveUpdate { error: Some(reason.clone()), ..Self::unit_update(unit) },
            )?;
            return Ok(Some(UnitOutcome::FailedExtraction { details: reason, corrupted: false }));
        }

        if unit.is_multi_part() {
            if let Some(outcome) = self.check_trailing_part(unit, &part_paths)? {
                return Ok(Some(outcome));
            }
        }

        let result = if unit.is_multi_part() {
            join_parts(&part_paths, name).and_then(|joined| {
                let report = extract_archive(&joined, &dest);
                remove_quietly(&joined);
                report
            })
        } else {
            match part_paths.first() {
                Some(zip) => extract_archive(zip, &dest),
                None => Err(MigrateError::NotFound(format!("{} has no parts", name))),
            }
        };

        match result {
            Ok(report) => {
                if report.skipped > 0 {
                    log::warn!("{}: skipped {} entries with unsafe paths", name, report.skipped);
                }
                self.clear_corrupted_for(unit)?;

                // records processed from a lost extraction have to be converted again,
                // except imports that already reached the library
                let mut reset = 0usize;
                for (key, record) in self.ledger.files_for_archive(name) {
                    if record.state == FileState::Copied {
                        if let Some(asset) = record.asset_identifier.as_deref() {
                            if self.confirm_earlier_import(unit, &key, asset)? {
                                continue;
                            }
                        }
                    }
                    if self.ledger.reset_file_to_extracted(&key)? {
                        reset += 1;
                    }
                }
                if reset > 0 {
                    log::info!("{}: {} files will be converted again", name, reset);
                }

                let state = self.ledger.get_state(name).unwrap_or(ArchiveState::Pending);
                if !state.at_least(ArchiveState::Extracted) {
                    self.ledger.set_state(
                        name,
                        ArchiveState::Extracted,
                        ArchiveUpdate {
                            extracted_dir: Some(report.dir.display().to_string()),
                            ..Default::default()
                        },
                    )?;
                }
                Ok(None)
            }
            Err(MigrateError::Extraction(reason)) => self.quarantine(unit, reason).map(Some),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::error!("Extraction of {} failed: {}", name, e);
                let reason = e.to_string();
                self.ledger
                    .set_state(name, ArchiveState::FailedExtraction, ArchiveUpdate::error(reason.clone()))?;
                Ok(Some(UnitOutcome::FailedExtraction { details: reason, corrupted: false }))
            }
        }
    }

    /// A byte-split set whose listing ends early looks complete but has no
    /// end-of-central-directory record in its last part. Keep the parts and
    /// wait for the rest of the export.
    fn check_trailing_part(&mut self, unit: &ArchiveUnit, part_paths: &[PathBuf]) -> Result<Option<UnitOutcome>> {
        let Some(last) = part_paths.last() else {
            return Ok(None);
        };
        if has_end_of_central_directory(last)? {
            return Ok(None);
        }

        let reason = format!(
            "trailing parts missing: {} does not end the archive",
            last.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
        );
        log::warn!("{}: {}", unit.name, reason);
        self.ledger.set_state(
            &unit.name,
            ArchiveState::FailedDownload,
            ArchiveUpdate { error: Some(reason.clone()), ..Self::unit_update(unit) },
        )?;
        Ok(Some(UnitOutcome::FailedDownload { reason }))
    }

    /// Delete the local copy of a corrupted unit and record it for re-download
    fn quarantine(&mut self, unit: &ArchiveUnit, reason: String) -> Result<UnitOutcome> {
        let size = unit.total_size();
        let remote_id = unit.remote_id();
        let error = MigrateError::CorruptedArchive {
            name: unit.name.clone(),
            remote_id: remote_id.clone(),
            size,
            reason: reason.clone(),
        };
        log::error!("{}", error);

        for part in &unit.parts {
            remove_quietly(&self.ctx.paths.download_path(&part.name));
        }
        remove_quietly(&self.joined_path(unit));

        // same bytes failing again count towards giving up on full runs
        let failures = self
            .side
            .corrupted()
            .filter(|(_, c)| c.file_name == unit.name && c.file_size == size)
            .map(|(_, c)| c.failures)
            .max()
            .unwrap_or(0)
            + 1;
        self.clear_corrupted_for(unit)?;

        self.ledger.set_state(
            &unit.name,
            ArchiveState::FailedExtraction,
            ArchiveUpdate { error: Some(reason.clone()), ..Self::unit_update(unit) },
        )?;
        self.side.record_corrupted(
            &remote_id,
            CorruptedZip {
                file_name: unit.name.clone(),
                file_size: size,
                local_path: self.ctx.paths.download_path(&unit.name).display().to_string(),
                error: reason,
                detected_at: Utc::now(),
                failures,
            },
        )?;
        Ok(UnitOutcome::FailedExtraction { details: error.to_string(), corrupted: true })
    }

    /// Settle an import that was never confirmed before its extraction was lost.
    /// Returns true when the library holds the asset and the file is now synced.
    fn confirm_earlier_import(&mut self, unit: &ArchiveUnit, key: &str, asset: &str) -> Result<bool> {
        let name = unit.name.as_str();
        let converted = self
            .ledger
            .get_state(name)
            .map(|s| s.at_least(ArchiveState::Converted))
            .unwrap_or(false);
        if !converted {
            return Ok(false);
        }
        let present = !self.ctx.config.destination.verify || self.destination.verify(asset).unwrap_or(false);
        if !present {
            log::info!("{} is not in the library, {} will be imported again", asset, key);
            return Ok(false);
        }

        let original = self.ctx.paths.extract_dir(name).join(relative_in_unit(name, key));
        let album = self.ledger.file(key).and_then(|r| r.album.clone());
        let update = FileUpdate {
            asset_identifier: Some(asset.to_string()),
            album: album.clone(),
            ..Default::default()
        };
        self.ledger.set_file_state(key, name, FileState::Synced, update)?;
        match compute_fingerprint(&original) {
            Ok(fingerprint) => self.side.record_uploaded(
                &fingerprint,
                &original.display().to_string(),
                album.as_deref(),
                Some(asset),
            )?,
            Err(e) => log::debug!("No fingerprint for {}: {}", original.display(), e),
        }
        self.side.clear_failed_upload(key)?;
        log::info!("{} was imported by an earlier run as {}", key, asset);
        Ok(true)
    }

    /// The listed copy already failed extraction often enough to stop re-downloading it
    fn still_corrupted(&self, unit: &ArchiveUnit) -> bool {
        let size = unit.total_size();
        self.side.corrupted().any(|(_, c)| {
            c.file_name == unit.name && c.file_size == size && c.failures >= CORRUPTED_REDOWNLOAD_LIMIT
        })
    }

    fn clear_corrupted_for(&mut self, unit: &ArchiveUnit) -> Result<()> {
        let ids: Vec<String> = self
            .side
            .corrupted()
            .filter(|(_, c)| c.file_name == unit.name)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.side.clear_corrupted(&id)?;
        }
        Ok(())
    }

    /// Poll the remote for a re-exported copy of a corrupted unit
    fn wait_for_fresh_copy(&self, unit: &ArchiveUnit) -> Result<Option<ArchiveUnit>> {
        let cfg = &self.ctx.config.corrupted;
        let wait = cfg.wait_for_redownload_secs.min(MAX_REDOWNLOAD_WAIT_SECS);
        if wait == 0 {
            return Ok(None);
        }
        log::info!("Waiting up to {}s for a fresh copy of {}", wait, unit.name);

        let mut fresh: Option<ArchiveUnit> = None;
        poll_until(PollSpec::from_secs(0, cfg.poll_interval_secs.max(1), wait), || {
            let listing = match self.remote.list(None, Some(&self.pattern)) {
                Ok(listing) => listing,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("Listing failed while waiting for {}: {}", unit.name, e);
                    return Ok(false);
                }
            };
            fresh = group_units(&listing)
                .into_iter()
                .find(|u| u.name == unit.name && u.is_complete() && parts_changed(u, unit));
            Ok(fresh.is_some())
        })?;

        if fresh.is_none() {
            log::warn!("No fresh copy of {} appeared, moving on", unit.name);
        }
        Ok(fresh)
    }

    // ----- metadata fusion -----

    fn convert_unit(&mut self, unit: &ArchiveUnit) -> Result<Option<UnitOutcome>> {
        let name = unit.name.as_str();
        let dir = self.ctx.paths.extract_dir(name);

        // transcoded outputs live next to their sources and are not media of their own
        let generated: HashSet<PathBuf> = self
            .ledger
            .files_for_archive(name)
            .into_iter()
            .filter_map(|(_, r)| r.converted_path.map(PathBuf::from))
            .collect();

        let entries: Vec<MediaEntry> = match discover_media(&dir) {
            Ok(entries) => entries.into_iter().filter(|e| !generated.contains(&e.path)).collect(),
            Err(e) => {
                let reason = format!("media discovery failed: {}", e);
                log::error!("{}: {}", name, reason);
                self.ledger
                    .set_state(name, ArchiveState::FailedConversion, ArchiveUpdate::error(reason.clone()))?;
                return Ok(Some(UnitOutcome::FailedConversion { reason }));
            }
        };

        for entry in &entries {
            let key = file_key(name, &entry.relative);
            if self.ledger.file(&key).is_none() {
                self.ledger
                    .set_file_state(&key, name, FileState::Extracted, FileUpdate::default())?;
            }
        }

        let pending: Vec<&MediaEntry> = entries
            .iter()
            .filter(|e| self.ledger.file_state(&file_key(name, &e.relative)) == Some(FileState::Extracted))
            .collect();
        if !pending.is_empty() {
            log::info!("Merging metadata into {} files of {}", pending.len(), name);
        }

        let batch_size = self.ctx.config.processing.metadata_batch_size.max(1);
        for batch in pending.chunks(batch_size) {
            self.ledger
                .set_checkpoint("metadata", Some(name), batch.first().map(|e| e.relative.as_str()))?;
            for entry in batch {
                let key = file_key(name, &entry.relative);
                match self.fusion.fuse(entry) {
                    Ok(fused) => {
                        let update = FileUpdate {
                            converted_path: fused.transcoded.then(|| fused.path.display().to_string()),
                            ..Default::default()
                        };
                        self.ledger.set_file_state(&key, name, FileState::Converted, update)?;
                    }
                    Err(e) => {
                        log::warn!("{}: {}", name, e);
                        self.ledger.set_file_state(
                            &key,
                            name,
                            FileState::FailedConversion,
                            FileUpdate::error(e.to_string()),
                        )?;
                    }
                }
            }
        }

        let state = self.ledger.get_state(name).unwrap_or(ArchiveState::Pending);
        if !state.at_least(ArchiveState::Converted) {
            let records = self.ledger.files_for_archive(name);
            let all_failed = !records.is_empty()
                && records.iter().all(|(_, r)| r.state == FileState::FailedConversion);
            if all_failed {
                let reason = format!("metadata merge failed for all {} files", records.len());
                self.ledger
                    .set_state(name, ArchiveState::FailedConversion, ArchiveUpdate::error(reason.clone()))?;
                return Ok(Some(UnitOutcome::FailedConversion { reason }));
            }
            self.ledger.set_state(name, ArchiveState::Converted, ArchiveUpdate::default())?;
        }
        Ok(None)
    }

    // ----- import -----

    fn import_candidates(&mut self, unit: &ArchiveUnit) -> Result<Vec<Candidate>> {
        let name = unit.name.as_str();
        let dir = self.ctx.paths.extract_dir(name);
        let mut candidates = Vec::new();

        for (key, record) in self.ledger.files_for_archive(name) {
            if !matches!(record.state, FileState::Converted | FileState::Copied) {
                continue;
            }
            let original = dir.join(relative_in_unit(name, &key));
            let path = record
                .converted_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| original.clone());
            let album = self.albums.resolve(&original, &dir);
            let unconfirmed = match record.state {
                FileState::Copied => record.asset_identifier.clone(),
                _ => None,
            };

            match compute_fingerprint(&path) {
                Ok(fingerprint) => candidates.push(Candidate { key, path, album, fingerprint, unconfirmed }),
                Err(e) => {
                    log::warn!("Cannot import {}: {}", path.display(), e);
                    self.ledger
                        .set_file_state(&key, name, FileState::FailedUpload, FileUpdate::error(e.to_string()))?;
                    self.side
                        .record_failed_upload(&key, &path.display().to_string(), album.as_deref())?;
                }
            }
        }
        Ok(candidates)
    }

    fn upload_unit(&mut self, unit: &ArchiveUnit) -> Result<UnitOutcome> {
        let name = unit.name.as_str();
        let verify = self.ctx.config.destination.verify;

        let mut to_import = Vec::new();
        for mut candidate in self.import_candidates(unit)? {
            // a run that died between import and verification left the asset behind
            if let Some(asset) = candidate.unconfirmed.take() {
                let present = !verify || self.destination.verify(&asset).unwrap_or(false);
                if present {
                    log::info!("{} was imported by an earlier run as {}", candidate.path.display(), asset);
                    let item = BatchItem {
                        key: &candidate.key,
                        path: &candidate.path,
                        album: candidate.album.as_deref(),
                    };
                    mark_synced(&mut self.ledger, &mut self.side, name, &item, &asset, &candidate.fingerprint)?;
                    continue;
                }
            }
            if let Some(previous) = self.side.lookup_uploaded(&candidate.fingerprint) {
                log::info!(
                    "{} was already imported at {}, skipping",
                    candidate.path.display(),
                    previous.uploaded_at.to_rfc3339()
                );
                let update = FileUpdate {
                    asset_identifier: previous.asset_identifier.clone(),
                    album: candidate.album.clone(),
                    ..Default::default()
                };
                self.ledger.set_file_state(&candidate.key, name, FileState::Synced, update)?;
                continue;
            }
            to_import.push(candidate);
        }
        if !to_import.is_empty() {
            log::info!("Importing {} files of {} into {}", to_import.len(), name, self.destination.name());
        }

        let batch_size = self.ctx.config.processing.upload_batch_size.max(1);
        for batch in to_import.chunks(batch_size) {
            self.ledger
                .set_checkpoint("upload", Some(name), batch.first().map(|c| c.key.as_str()))?;

            let items: Vec<BatchItem<'_>> = batch
                .iter()
                .map(|c| BatchItem { key: &c.key, path: &c.path, album: c.album.as_deref() })
                .collect();
            let fingerprints: HashMap<&str, &Fingerprint> =
                batch.iter().map(|c| (c.key.as_str(), &c.fingerprint)).collect();

            let Orchestrator {
                ledger,
                side,
                destination,
                handler,
                ignore_verification_failures,
                imports,
                ..
            } = &mut *self;
            let mut stop_requested = false;

            let report = import_batch(destination.as_mut(), &items, verify, |item, event| {
                let fingerprint = fingerprints
                    .get(item.key)
                    .copied()
                    .ok_or_else(|| MigrateError::Other(format!("no fingerprint for {}", item.key)))?;
                match event {
                    ImportEvent::Imported { asset } => {
                        *imports += 1;
                        let update = FileUpdate {
                            asset_identifier: Some(asset.clone()),
                            album: item.album.map(str::to_string),
                            ..Default::default()
                        };
                        ledger.set_file_state(item.key, name, FileState::Copied, update)?;
                        if !verify {
                            mark_synced(ledger, side, name, item, &asset, fingerprint)?;
                        }
                        Ok(BatchFlow::Continue)
                    }
                    ImportEvent::Verified { asset } => {
                        mark_synced(ledger, side, name, item, &asset, fingerprint)?;
                        Ok(BatchFlow::Continue)
                    }
                    ImportEvent::ImportFailed(e) => {
                        ledger.set_file_state(item.key, name, FileState::FailedUpload, FileUpdate::error(e.to_string()))?;
                        side.record_failed_upload(item.key, &item.path.display().to_string(), item.album)?;
                        Ok(BatchFlow::Continue)
                    }
                    ImportEvent::VerificationFailed { asset, error } => {
                        let update = FileUpdate {
                            error: Some(error.to_string()),
                            asset_identifier: Some(asset),
                            ..Default::default()
                        };
                        ledger.set_file_state(item.key, name, FileState::FailedVerification, update)?;
                        side.record_failed_upload(item.key, &item.path.display().to_string(), item.album)?;
                        if *ignore_verification_failures {
                            return Ok(BatchFlow::Continue);
                        }
                        match handler.on_verification_failure(item.path, &error) {
                            VerificationDecision::Continue => Ok(BatchFlow::Continue),
                            VerificationDecision::IgnoreAll => {
                                *ignore_verification_failures = true;
                                Ok(BatchFlow::Continue)
                            }
                            VerificationDecision::Stop => {
                                stop_requested = true;
                                Ok(BatchFlow::Stop)
                            }
                        }
                    }
                }
            });

            if stop_requested {
                log::info!("Stopping during {} at the operator's request", name);
                return Ok(UnitOutcome::UserStopped);
            }
            if report.stopped {
                return Err(MigrateError::Other(format!("could not record import progress for {}", name)));
            }
        }

        self.finish_unit(unit)
    }

    fn finish_unit(&mut self, unit: &ArchiveUnit) -> Result<UnitOutcome> {
        let name = unit.name.as_str();
        let tally = self.ledger.file_tally(name);

        if tally.total == 0 || tally.all_synced() {
            if tally.total == 0 {
                log::warn!("{} contained no media files", name);
            }
            self.ledger.set_state(name, ArchiveState::Uploaded, ArchiveUpdate::default())?;
            self.cleanup(unit);
            return Ok(UnitOutcome::Completed { files: tally.total });
        }

        log::warn!(
            "{}: {} of {} files synced, {} failed; keeping local files",
            name,
            tally.synced,
            tally.total,
            tally.failed
        );
        Ok(UnitOutcome::Partial {
            synced: tally.synced,
            failed: tally.failed,
            total: tally.total,
        })
    }

    /// Delete the downloads and extraction of a completed unit
    fn cleanup(&self, unit: &ArchiveUnit) {
        for part in &unit.parts {
            remove_quietly(&self.ctx.paths.download_path(&part.name));
        }
        remove_quietly(&self.joined_path(unit));

        let dir = self.ctx.paths.extract_dir(&unit.name);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("Could not remove {}: {}", dir.display(), e);
            }
        }
        log::debug!("Cleaned up local files of {}", unit.name);
    }
}

fn mark_synced(
    ledger: &mut StateLedger,
    side: &mut SideRecords,
    zip_name: &str,
    item: &BatchItem<'_>,
    asset: &str,
    fingerprint: &Fingerprint,
) -> Result<()> {
    let update = FileUpdate {
        asset_identifier: Some(asset.to_string()),
        album: item.album.map(str::to_string),
        ..Default::default()
    };
    ledger.set_file_state(item.key, zip_name, FileState::Synced, update)?;
    side.record_uploaded(fingerprint, &item.path.display().to_string(), item.album, Some(asset))?;
    side.clear_failed_upload(item.key)
}

/// Path of a file below its unit's extraction directory
fn relative_in_unit<'a>(zip_name: &str, key: &'a str) -> &'a str {
    key.strip_prefix(zip_name)
        .and_then(|r| r.strip_prefix('/'))
        .unwrap_or(key)
}

/// Same unit, but the remote now holds different bytes
fn parts_changed(now: &ArchiveUnit, before: &ArchiveUnit) -> bool {
    now.parts.len() != before.parts.len()
        || now
            .parts
            .iter()
            .zip(&before.parts)
            .any(|(a, b)| a.id != b.id || a.size != b.size || a.modified_time != b.modified_time)
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

fn wipe_state(ledger: &mut StateLedger, side: &mut SideRecords, paths: &WorkPaths) -> Result<()> {
    ledger.reset()?;
    side.reset_failure_records()?;
    paths.wipe_working_files()
}

/// Reset a working directory that is not in use by a run
pub fn reset_working_directory(paths: &WorkPaths) -> Result<()> {
    let _lock = WorkDirLock::acquire(paths)?;
    let mut ledger = StateLedger::open(paths)?;
    let mut side = SideRecords::open(paths);
    wipe_state(&mut ledger, &mut side, paths)
}
