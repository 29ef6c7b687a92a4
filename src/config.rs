// Run configuration
// Layering: built-in defaults < TOML file < environment < CLI flags (applied by the binary).
// The merged config is validated once before any work starts.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::constants::{
    BYTES_PER_GB, DEFAULT_ALBUM_CACHE_TTL_SECS, DEFAULT_ARCHIVE_PATTERN, DEFAULT_EXPANSION_FACTOR,
    DEFAULT_METADATA_BATCH_SIZE, DEFAULT_REDOWNLOAD_POLL_SECS, DEFAULT_REDOWNLOAD_WAIT_SECS,
    DEFAULT_SYNC_CHECK_INTERVAL_SECS, DEFAULT_SYNC_MIN_WAIT_SECS, DEFAULT_SYNC_TIMEOUT_SECS,
    DEFAULT_UNSUPPORTED_VIDEO_EXTENSIONS, DEFAULT_UPLOAD_BATCH_SIZE, MAX_REDOWNLOAD_WAIT_SECS,
};
use crate::error::{MigrateError, Result};

/// Where archive units are listed and downloaded from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    LocalFolder,
    Drive,
}

/// How files reach the destination library
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    PhotosApp,
    SyncFolder,
}

/// What to do when an imported asset cannot be confirmed at the destination
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    Prompt,
    Stop,
    Continue,
    IgnoreAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub kind: RemoteKind,
    /// Folder holding exported archives (local_folder)
    pub source_dir: Option<PathBuf>,
    /// Drive folder id to list (drive)
    pub folder_id: Option<String>,
    pub name_pattern: String,
    /// OAuth access token (drive); normally supplied via PHOTO_MIGRATOR_DRIVE_TOKEN
    pub access_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::LocalFolder,
            source_dir: None,
            folder_id: None,
            name_pattern: DEFAULT_ARCHIVE_PATTERN.to_string(),
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    pub sync_dir: Option<PathBuf>,
    pub verify: bool,
    pub sync_min_wait_secs: u64,
    pub sync_check_interval_secs: u64,
    pub sync_timeout_secs: u64,
    pub on_verification_failure: VerificationPolicy,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            kind: DestinationKind::PhotosApp,
            sync_dir: None,
            verify: true,
            sync_min_wait_secs: DEFAULT_SYNC_MIN_WAIT_SECS,
            sync_check_interval_secs: DEFAULT_SYNC_CHECK_INTERVAL_SECS,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            on_verification_failure: VerificationPolicy::Prompt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub merge_metadata: bool,
    pub transcode_videos: bool,
    pub unsupported_video_extensions: Vec<String>,
    pub metadata_batch_size: usize,
    pub upload_batch_size: usize,
    pub album_cache_ttl_secs: u64,
    /// Extra folder names that never become album names
    pub ignored_album_dirs: Vec<String>,
    pub exiftool_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            merge_metadata: true,
            transcode_videos: true,
            unsupported_video_extensions: DEFAULT_UNSUPPORTED_VIDEO_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            metadata_batch_size: DEFAULT_METADATA_BATCH_SIZE,
            upload_batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
            album_cache_ttl_secs: DEFAULT_ALBUM_CACHE_TTL_SECS,
            ignored_album_dirs: Vec::new(),
            exiftool_path: None,
            ffmpeg_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub max_disk_space_gb: Option<f64>,
    pub expansion_factor: f64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            max_disk_space_gb: None,
            expansion_factor: DEFAULT_EXPANSION_FACTOR,
        }
    }
}

impl DiskConfig {
    pub fn max_bytes(&self) -> Option<u64> {
        self.max_disk_space_gb.map(|gb| (gb * BYTES_PER_GB) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorruptedConfig {
    /// How long to wait for a fresh copy of a corrupted archive before moving on (0 = don't wait)
    pub wait_for_redownload_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for CorruptedConfig {
    fn default() -> Self {
        Self {
            wait_for_redownload_secs: DEFAULT_REDOWNLOAD_WAIT_SECS,
            poll_interval_secs: DEFAULT_REDOWNLOAD_POLL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    pub work_dir: PathBuf,
    pub remote: RemoteConfig,
    pub destination: DestinationConfig,
    pub processing: ProcessingConfig,
    pub disk: DiskConfig,
    pub corrupted: CorruptedConfig,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            remote: RemoteConfig::default(),
            destination: DestinationConfig::default(),
            processing: ProcessingConfig::default(),
            disk: DiskConfig::default(),
            corrupted: CorruptedConfig::default(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "photo-migrator")
}

fn default_work_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("photo-migrator-work"))
}

/// Default location of the config file (platform config dir)
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

fn env_nonempty(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn apply_env_overrides(cfg: &mut MigrateConfig) {
    if let Some(dir) = env_nonempty("PHOTO_MIGRATOR_WORK_DIR") {
        cfg.work_dir = PathBuf::from(dir);
    }
    if let Some(token) = env_nonempty("PHOTO_MIGRATOR_DRIVE_TOKEN") {
        cfg.remote.access_token = Some(token);
    }
    if let Some(gb) = env_nonempty("PHOTO_MIGRATOR_MAX_DISK_GB").and_then(|v| v.parse::<f64>().ok()) {
        cfg.disk.max_disk_space_gb = Some(gb);
    }
}

/// Check the merged config. Every failure here is a ConfigurationError.
pub fn validate(cfg: &MigrateConfig) -> Result<()> {
    let fail = |msg: String| Err(MigrateError::Configuration(msg));

    if cfg.work_dir.as_os_str().is_empty() {
        return fail("work_dir cannot be empty".to_string());
    }
    match cfg.remote.kind {
        RemoteKind::LocalFolder => match cfg.remote.source_dir {
            Some(ref dir) if dir.is_dir() => {}
            Some(ref dir) => return fail(format!("remote.source_dir {} is not a directory", dir.display())),
            None => return fail("remote.source_dir is required for the local_folder remote".to_string()),
        },
        RemoteKind::Drive => {
            if cfg.remote.folder_id.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return fail("remote.folder_id is required for the drive remote".to_string());
            }
            if cfg.remote.access_token.is_none() {
                return fail("drive remote needs an access token (PHOTO_MIGRATOR_DRIVE_TOKEN)".to_string());
            }
        }
    }
    if let Err(e) = regex::Regex::new(&cfg.remote.name_pattern) {
        return fail(format!("remote.name_pattern is not a valid regex: {}", e));
    }
    if cfg.destination.kind == DestinationKind::SyncFolder && cfg.destination.sync_dir.is_none() {
        return fail("destination.sync_dir is required for the sync_folder destination".to_string());
    }
    if cfg.destination.sync_check_interval_secs == 0 {
        return fail("destination.sync_check_interval_secs must be >= 1".to_string());
    }
    if cfg.processing.metadata_batch_size == 0 || cfg.processing.upload_batch_size == 0 {
        return fail("batch sizes must be >= 1".to_string());
    }
    if let Some(gb) = cfg.disk.max_disk_space_gb {
        if !(gb > 0.0) {
            return fail("disk.max_disk_space_gb must be > 0".to_string());
        }
    }
    if !(cfg.disk.expansion_factor >= 1.0) {
        return fail("disk.expansion_factor must be >= 1.0".to_string());
    }
    if cfg.corrupted.wait_for_redownload_secs > MAX_REDOWNLOAD_WAIT_SECS {
        return fail(format!(
            "corrupted.wait_for_redownload_secs cannot exceed {}",
            MAX_REDOWNLOAD_WAIT_SECS
        ));
    }
    if cfg.corrupted.wait_for_redownload_secs > 0 && cfg.corrupted.poll_interval_secs == 0 {
        return fail("corrupted.poll_interval_secs must be >= 1".to_string());
    }
    Ok(())
}

/// Parse a TOML config document on top of the defaults.
pub fn parse_config(raw: &str) -> Result<MigrateConfig> {
    Ok(toml::from_str::<MigrateConfig>(raw)?)
}

/// Load defaults, the config file and env overrides. Validation is left to the caller
/// so CLI flags can be applied first.
pub fn load_config(explicit_path: Option<&Path>) -> Result<MigrateConfig> {
    let mut cfg = match explicit_path {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|e| {
                MigrateError::Configuration(format!("cannot read config {}: {}", path.display(), e))
            })?;
            parse_config(&raw)?
        }
        None => match default_config_path() {
            Some(path) if path.is_file() => {
                let raw = fs::read_to_string(&path)?;
                parse_config(&raw)?
            }
            _ => MigrateConfig::default(),
        },
    };

    apply_env_overrides(&mut cfg);
    Ok(cfg)
}
