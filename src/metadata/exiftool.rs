// ExifTool wrapper for writing sidecar metadata into media files

use std::path::{Path, PathBuf};
use std::process::Command;
use chrono::{DateTime, Utc};

use crate::error::{MigrateError, Result};
use super::sidecar::{GpsPoint, SidecarMetadata};
use super::MetadataWriter;

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Reject paths that are unsafe to hand to an external tool.
/// Paths must be absolute, valid UTF-8 and free of control characters.
pub fn validate_tool_path(path: &Path) -> Result<&str> {
    let s = path
        .to_str()
        .ok_or_else(|| MigrateError::InvalidPath(format!("not valid UTF-8: {}", path.display())))?;
    if !path.is_absolute() {
        return Err(MigrateError::InvalidPath(format!("not absolute: {}", s)));
    }
    if s.chars().any(|c| c.is_control()) {
        return Err(MigrateError::InvalidPath(format!(
            "control character in path: {}",
            s.escape_debug()
        )));
    }
    Ok(s)
}

// Tag values go through argv, but exiftool still treats newlines as separators in some modes
fn clean_value(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn push_date_args(args: &mut Vec<String>, taken_at: &DateTime<Utc>, is_video: bool) {
    let stamp = taken_at.format(EXIF_DATE_FORMAT).to_string();
    for tag in ["DateTimeOriginal", "CreateDate", "ModifyDate"] {
        args.push(format!("-{}={}", tag, stamp));
    }
    if is_video {
        for tag in ["QuickTime:CreateDate", "QuickTime:ModifyDate", "QuickTime:TrackCreateDate", "QuickTime:MediaCreateDate"] {
            args.push(format!("-{}={}", tag, stamp));
        }
    }
}

fn push_gps_args(args: &mut Vec<String>, gps: &GpsPoint, is_video: bool) {
    let lat_ref = if gps.latitude < 0.0 { "S" } else { "N" };
    let lon_ref = if gps.longitude < 0.0 { "W" } else { "E" };
    args.push(format!("-GPSLatitude={}", gps.latitude.abs()));
    args.push(format!("-GPSLatitudeRef={}", lat_ref));
    args.push(format!("-GPSLongitude={}", gps.longitude.abs()));
    args.push(format!("-GPSLongitudeRef={}", lon_ref));
    if let Some(alt) = gps.altitude {
        args.push(format!("-GPSAltitude={}", alt.abs()));
        // 0 = above sea level, 1 = below
        args.push(format!("-GPSAltitudeRef={}", if alt < 0.0 { 1 } else { 0 }));
    }
    if is_video {
        let coords = match gps.altitude {
            Some(alt) => format!("{}, {}, {}", gps.latitude, gps.longitude, alt),
            None => format!("{}, {}", gps.latitude, gps.longitude),
        };
        args.push(format!("-Keys:GPSCoordinates={}", coords));
    }
}

/// Build the full exiftool argument list for one file. Returns None when
/// the sidecar carries nothing worth writing.
pub fn build_write_args(media: &Path, meta: &SidecarMetadata, is_video: bool) -> Result<Option<Vec<String>>> {
    let target = validate_tool_path(media)?;
    if meta.is_empty() {
        return Ok(None);
    }

    let mut args: Vec<String> = vec!["-overwrite_original".into(), "-P".into(), "-m".into()];
    if is_video {
        args.push("-api".into());
        args.push("QuickTimeUTC".into());
    }

    if let Some(ref taken_at) = meta.taken_at {
        push_date_args(&mut args, taken_at, is_video);
    }
    if let Some(ref gps) = meta.gps {
        push_gps_args(&mut args, gps, is_video);
    }
    if let Some(ref description) = meta.description {
        let description = clean_value(description);
        if !description.is_empty() {
            args.push(format!("-ImageDescription={}", description));
            args.push(format!("-XMP-dc:Description={}", description));
            args.push(format!("-IPTC:Caption-Abstract={}", description));
        }
    }

    // "--" ends option parsing; the path can never be read as a flag
    args.push("--".into());
    args.push(target.to_string());
    Ok(Some(args))
}

/// Writes metadata by invoking exiftool once per file
pub struct ExifToolWriter {
    exiftool: PathBuf,
}

impl ExifToolWriter {
    pub fn new(exiftool: PathBuf) -> Self {
        Self { exiftool }
    }

    pub fn is_available(&self) -> bool {
        crate::tools::is_tool_available(&self.exiftool, "-ver")
    }
}

impl MetadataWriter for ExifToolWriter {
    fn write(&self, media: &Path, meta: &SidecarMetadata, is_video: bool) -> Result<bool> {
        let Some(args) = build_write_args(media, meta, is_video)? else {
            return Ok(false);
        };

        let output = Command::new(&self.exiftool)
            .args(&args)
            .output()
            .map_err(|e| MigrateError::ExifTool(format!("Failed to run exiftool: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MigrateError::ExifTool(format!(
                "exiftool exited with {} for {}: {}",
                output.status.code().unwrap_or(-1),
                media.display(),
                stderr
            )));
        }

        Ok(true)
    }
}
