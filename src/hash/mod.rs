// Hashing module using BLAKE3

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;
use crate::constants::{FINGERPRINT_SCHEME, HASH_CHUNK_SIZE};
use crate::error::{MigrateError, Result};

/// Content fingerprint used for duplicate-upload avoidance.
/// Identity is (absolute path, size, modification time); file contents are not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: String,
    pub size: u64,
}

/// Compute the fingerprint of a file on disk.
/// Format: "blake3:path_size_mtime_v1:<hash>"
pub fn compute_fingerprint(path: &Path) -> Result<Fingerprint> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let meta = std::fs::metadata(&absolute)
        .map_err(|e| MigrateError::InvalidPath(format!("{}: {}", absolute.display(), e)))?;
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| (d.as_secs(), d.subsec_nanos()))
        .unwrap_or((0, 0));

    Ok(Fingerprint {
        key: fingerprint_key(&absolute.to_string_lossy(), size, mtime.0, mtime.1),
        size,
    })
}

fn fingerprint_key(absolute_path: &str, size: u64, mtime_secs: u64, mtime_nanos: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(absolute_path.as_bytes());
    hasher.update(&[0u8]);
    hasher.update(&size.to_le_bytes());
    hasher.update(&mtime_secs.to_le_bytes());
    hasher.update(&mtime_nanos.to_le_bytes());
    format!("blake3:{}:{}", FINGERPRINT_SCHEME, hasher.finalize().to_hex())
}

/// Compute full BLAKE3 hash of entire file
pub fn compute_full_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| MigrateError::Other(format!("Failed to open {} for hashing: {}", path.display(), e)))?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("blake3:full:{}", hasher.finalize().to_hex()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_stable_for_unchanged_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"pixels").unwrap();

        let a = compute_fingerprint(&path).unwrap();
        let b = compute_fingerprint(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size, 6);
        assert!(a.key.starts_with("blake3:path_size_mtime_v1:"));
    }

    #[test]
    fn test_fingerprint_changes_with_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"pixels").unwrap();

        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let before = compute_fingerprint(&path).unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(2_000_000, 0)).unwrap();
        let after = compute_fingerprint(&path).unwrap();
        assert_ne!(before.key, after.key);
    }

    #[test]
    fn test_fingerprint_differs_by_path() {
        assert_ne!(
            fingerprint_key("/a/photo.jpg", 10, 1, 0),
            fingerprint_key("/b/photo.jpg", 10, 1, 0)
        );
    }

    #[test]
    fn test_full_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let hash = compute_full_hash(file.path()).unwrap();
        assert!(hash.starts_with("blake3:full:"));
    }
}
