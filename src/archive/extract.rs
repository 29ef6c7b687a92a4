// Archive extraction
//
// Entries are unpacked into `<dest>.partial` and the directory is renamed into
// place only after every entry was written, so a present extraction
// directory is always complete. Structural problems (unreadable central
// directory, CRC or decompression failures) surface as
// `MigrateError::Extraction`; local write failures stay `Io`.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use chrono::NaiveDate;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::constants::{JOINED_SUFFIX, PARTIAL_SUFFIX, TEMP_FILE_PREFIX};
use crate::error::{MigrateError, Result};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

const EOCD_SIGNATURE: &[u8] = b"PK\x05\x06";
/// Fixed EOCD record plus the longest possible archive comment
const EOCD_SEARCH_WINDOW: u64 = 22 + 65_535;

/// Summary of one extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub dir: PathBuf,
    pub files: usize,
    pub bytes: u64,
    /// Entries skipped because their path escaped the target directory
    pub skipped: usize,
}

fn structural(zip_path: &Path, reason: impl std::fmt::Display) -> MigrateError {
    MigrateError::Extraction(format!("{}: {}", zip_path.display(), reason))
}

fn open_error(zip_path: &Path, err: ZipError) -> MigrateError {
    match err {
        ZipError::Io(e) => MigrateError::Io(e),
        ZipError::UnsupportedArchive(_) => MigrateError::Zip(err),
        other => structural(zip_path, other),
    }
}

/// Whether the file ends in an end-of-central-directory record. The last part
/// of a byte-split set carries it; an earlier part never does.
pub fn has_end_of_central_directory(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let window = len.min(EOCD_SEARCH_WINDOW);
    file.seek(SeekFrom::Start(len - window))?;

    let mut tail = Vec::with_capacity(window as usize);
    file.read_to_end(&mut tail)?;
    Ok(tail.windows(EOCD_SIGNATURE.len()).any(|w| w == EOCD_SIGNATURE))
}

/// Unpack `zip_path` into `dest`
pub fn extract_archive(zip_path: &Path, dest: &Path) -> Result<ExtractionReport> {
    let partial = partial_dir(dest);
    if partial.exists() {
        log::info!("Removing stale partial extraction {}", partial.display());
        fs::remove_dir_all(&partial)?;
    }
    fs::create_dir_all(&partial)?;

    let result = extract_into(zip_path, &partial);
    let (files, bytes, skipped) = match result {
        Ok(counts) => counts,
        Err(e) => {
            let _ = fs::remove_dir_all(&partial);
            return Err(e);
        }
    };

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::rename(&partial, dest)?;

    log::info!(
        "Extracted {} ({} files, {} bytes) to {}",
        zip_path.display(),
        files,
        bytes,
        dest.display()
    );

    Ok(ExtractionReport {
        dir: dest.to_path_buf(),
        files,
        bytes,
        skipped,
    })
}

fn extract_into(zip_path: &Path, target: &Path) -> Result<(usize, u64, usize)> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| open_error(zip_path, e))?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut files = 0usize;
    let mut bytes = 0u64;
    let mut skipped = 0usize;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| structural(zip_path, e))?;

        let outpath = match entry.enclosed_name() {
            Some(relative) => target.join(relative),
            None => {
                log::warn!("Skipping entry with unsafe path in {}: {}", zip_path.display(), entry.name());
                skipped += 1;
                continue;
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut outfile = File::create(&outpath)?;
        loop {
            // read errors mean the archive data is bad; write errors are ours
            let n = entry
                .read(&mut buffer)
                .map_err(|e| structural(zip_path, format!("{}: {}", entry.name(), e)))?;
            if n == 0 {
                break;
            }
            outfile.write_all(&buffer[..n])?;
            bytes += n as u64;
        }
        outfile.sync_all()?;
        drop(outfile);

        // Entry timestamps make re-extracted files byte- and mtime-identical
        if let Some(ts) = entry.last_modified().and_then(zip_time_to_unix) {
            let _ = filetime::set_file_mtime(&outpath, filetime::FileTime::from_unix_time(ts, 0));
        }

        files += 1;
    }

    Ok((files, bytes, skipped))
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
        .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
        .map(|naive| naive.and_utc().timestamp())
}

fn partial_dir(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

/// Concatenate the parts of a multi-part set into one archive next to the first part.
/// Returns the joined path; an up-to-date joined file is reused.
pub fn join_parts(parts: &[PathBuf], set_name: &str) -> Result<PathBuf> {
    let first = parts
        .first()
        .ok_or_else(|| MigrateError::Extraction(format!("{}: no parts to join", set_name)))?;
    let dir = first
        .parent()
        .ok_or_else(|| MigrateError::InvalidPath(first.display().to_string()))?;
    let joined = dir.join(format!("{}{}", set_name, JOINED_SUFFIX));

    let mut expected = 0u64;
    for part in parts {
        expected += fs::metadata(part)
            .map_err(|e| MigrateError::NotFound(format!("{}: {}", part.display(), e)))?
            .len();
    }
    if fs::metadata(&joined).map(|m| m.len() == expected).unwrap_or(false) {
        log::debug!("Reusing joined archive {}", joined.display());
        return Ok(joined);
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(dir)?;
    for part in parts {
        let mut input = File::open(part)?;
        std::io::copy(&mut input, tmp.as_file_mut())?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(&joined).map_err(|e| MigrateError::Io(e.error))?;

    log::info!("Joined {} parts into {}", parts.len(), joined.display());
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::from_date_and_time(2019, 7, 4, 12, 30, 0).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_creates_tree_and_preserves_mtime() {
        let tmp = TempDir::new().unwrap();
        let zip_path = tmp.path().join("a.zip");
        write_zip(&zip_path, &[("Takeout/Trip/img.jpg", b"jpeg"), ("Takeout/Trip/img.jpg.json", b"{}")]);

        let dest = tmp.path().join("out").join("a.zip");
        let report = extract_archive(&zip_path, &dest).unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 6);
        let img = dest.join("Takeout/Trip/img.jpg");
        assert_eq!(fs::read(&img).unwrap(), b"jpeg");
        assert!(!partial_dir(&dest).exists());

        let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&img).unwrap());
        let expected = NaiveDate::from_ymd_opt(2019, 7, 4)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(mtime.unix_seconds(), expected);
    }

    #[test]
    fn test_garbage_is_structural_error() {
        let tmp = TempDir::new().unwrap();
        let zip_path = tmp.path().join("bad.zip");
        fs::write(&zip_path, b"this is definitely not a zip archive").unwrap();

        let dest = tmp.path().join("out");
        let err = extract_archive(&zip_path, &dest).unwrap_err();
        assert!(matches!(err, MigrateError::Extraction(_)));
        assert!(!dest.exists());
        assert!(!partial_dir(&dest).exists());
    }

    #[test]
    fn test_truncated_archive_is_structural_error() {
        let tmp = TempDir::new().unwrap();
        let zip_path = tmp.path().join("trunc.zip");
        write_zip(&zip_path, &[("x.jpg", &[7u8; 4096])]);
        let data = fs::read(&zip_path).unwrap();
        fs::write(&zip_path, &data[..data.len() / 2]).unwrap();

        let err = extract_archive(&zip_path, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(err, MigrateError::Extraction(_)));
    }

    #[test]
    fn test_stale_partial_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let zip_path = tmp.path().join("a.zip");
        write_zip(&zip_path, &[("one.jpg", b"1")]);

        let dest = tmp.path().join("a.zip.d");
        let partial = partial_dir(&dest);
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("leftover.jpg"), b"old").unwrap();

        extract_archive(&zip_path, &dest).unwrap();
        assert!(dest.join("one.jpg").exists());
        assert!(!dest.join("leftover.jpg").exists());
    }

    #[test]
    fn test_join_parts_concatenates_in_order() {
        let tmp = TempDir::new().unwrap();
        let whole = tmp.path().join("whole.zip");
        write_zip(&whole, &[("p.jpg", b"photo-bytes")]);
        let data = fs::read(&whole).unwrap();
        let mid = data.len() / 2;
        let p1 = tmp.path().join("set.zip.001");
        let p2 = tmp.path().join("set.zip.002");
        fs::write(&p1, &data[..mid]).unwrap();
        fs::write(&p2, &data[mid..]).unwrap();

        let joined = join_parts(&[p1.clone(), p2.clone()], "set.zip").unwrap();
        assert_eq!(fs::read(&joined).unwrap(), data);

        let report = extract_archive(&joined, &tmp.path().join("set")).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(join_parts(&[p1, p2], "set.zip").unwrap(), joined);
    }

    #[test]
    fn test_only_the_last_part_ends_a_set() {
        let tmp = TempDir::new().unwrap();
        let whole = tmp.path().join("whole.zip");
        write_zip(&whole, &[("p.jpg", &[3u8; 2048])]);
        let data = fs::read(&whole).unwrap();
        let third = data.len() / 3;
        let p1 = tmp.path().join("set.zip.001");
        let p2 = tmp.path().join("set.zip.002");
        let p3 = tmp.path().join("set.zip.003");
        fs::write(&p1, &data[..third]).unwrap();
        fs::write(&p2, &data[third..2 * third]).unwrap();
        fs::write(&p3, &data[2 * third..]).unwrap();

        assert!(has_end_of_central_directory(&whole).unwrap());
        assert!(has_end_of_central_directory(&p3).unwrap());
        assert!(!has_end_of_central_directory(&p1).unwrap());
        assert!(!has_end_of_central_directory(&p2).unwrap());
    }
}
