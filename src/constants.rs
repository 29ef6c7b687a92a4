// Photo Migrator Constants
// File names here are part of the on-disk working directory layout.
// Changing them orphans the state of earlier runs.

// Persisted state (working directory root)
pub const ZIP_STATE_FILENAME: &str = "zip_processing_state.json";
pub const FILE_STATE_FILENAME: &str = "file_processing_state.json";
pub const CHECKPOINT_FILENAME: &str = "checkpoint.json";
pub const FAILED_UPLOADS_FILENAME: &str = "failed_uploads.json";
pub const CORRUPTED_ZIPS_FILENAME: &str = "corrupted_zips.json";
pub const UPLOADED_FILES_FILENAME: &str = "uploaded_files.json";
pub const LOCK_FILENAME: &str = ".migrator.lock";

// Control markers, consumed between archive units
pub const STOP_MARKER: &str = "STOP";
pub const RESTART_MARKER: &str = "RESTART";

// Working directory layout
pub const DOWNLOADS_FOLDER: &str = "downloads";
pub const EXTRACTED_FOLDER: &str = "extracted";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const JOINED_SUFFIX: &str = ".joined.zip";
pub const TEMP_FILE_PREFIX: &str = ".pm_tmp_";

// Hashing
pub const HASH_CHUNK_SIZE: usize = 1_048_576; // 1MB
pub const FINGERPRINT_SCHEME: &str = "path_size_mtime_v1";

// Disk budget: raw archive size x factor ~ download + extraction + processing
pub const DEFAULT_EXPANSION_FACTOR: f64 = 2.5;
pub const BYTES_PER_GB: f64 = 1_073_741_824.0;

// Batching
pub const DEFAULT_METADATA_BATCH_SIZE: usize = 50;
pub const DEFAULT_UPLOAD_BATCH_SIZE: usize = 25;

// Album resolver cache expiry
pub const DEFAULT_ALBUM_CACHE_TTL_SECS: u64 = 300;

// Bounded waits
pub const DEFAULT_REDOWNLOAD_WAIT_SECS: u64 = 0;
pub const MAX_REDOWNLOAD_WAIT_SECS: u64 = 3600;
pub const DEFAULT_REDOWNLOAD_POLL_SECS: u64 = 30;

// Full runs stop re-downloading an archive after this many identical extraction failures
pub const CORRUPTED_REDOWNLOAD_LIMIT: u32 = 2;
pub const DEFAULT_SYNC_MIN_WAIT_SECS: u64 = 0;
pub const DEFAULT_SYNC_CHECK_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;
pub const PROMPT_TIMEOUT_SECS: u64 = 600;

// Remote listing
pub const DEFAULT_ARCHIVE_PATTERN: &str = r"(?i)\.(zip|z\d{2}|zip\.\d{3})$";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_PAGE_SIZE: u32 = 1000;

// Sidecar JSON
pub const SIDECAR_EXTENSION: &str = "json";
pub const SUPPLEMENTAL_MARKER: &str = ".supplemental-metadata";
pub const SIDECAR_MAX_NAME_LEN: usize = 51;
pub const LEGACY_SIDECAR_MAX_NAME_LEN: usize = 46;
pub const ALBUM_METADATA_FILENAMES: [&str; 3] = ["metadata.json", "metadaten.json", "métadonnées.json"];

// Folders that group an export but are never albums
pub const CONTAINER_FOLDERS: [&str; 4] = ["takeout", "google photos", "google fotos", "google foto"];

// Video extensions
pub const VIDEO_EXTENSIONS: [&str; 16] = [
    "mp4", "mov", "avi", "mkv", "mts", "m2ts", "mpg", "mpeg",
    "wmv", "flv", "webm", "3gp", "m4v", "vob", "ogv", "dv",
];

// Containers the destination library cannot import directly
pub const DEFAULT_UNSUPPORTED_VIDEO_EXTENSIONS: [&str; 9] = [
    "avi", "wmv", "mkv", "flv", "webm", "mpg", "mpeg", "vob", "ogv",
];

// Image extensions
pub const IMAGE_EXTENSIONS: [&str; 12] = [
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "heic", "heif", "webp", "dng", "raw",
];

// Transcode settings
pub const TRANSCODE_CODEC: &str = "libx264";
pub const TRANSCODE_CRF: u32 = 23;
pub const TRANSCODE_CONTAINER: &str = "mp4";
