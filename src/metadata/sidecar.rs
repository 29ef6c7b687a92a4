// Sidecar JSON parsing and media <-> sidecar pairing
//
// Exported sidecars sit next to the media file as `<name>.<ext>.json` or
// `<name>.<ext>.supplemental-metadata.json`. Long names are truncated by the
// exporter, duplicates move the `(n)` counter behind the extension, and
// edited copies (`-edited`) share the original's sidecar.

use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::constants::{
    ALBUM_METADATA_FILENAMES, LEGACY_SIDECAR_MAX_NAME_LEN, SIDECAR_EXTENSION, SIDECAR_MAX_NAME_LEN,
    SUPPLEMENTAL_MARKER,
};
use crate::error::Result;

const EDITED_SUFFIX: &str = "-edited";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// Fields read from one sidecar
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub gps: Option<GpsPoint>,
}

impl SidecarMetadata {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.taken_at.is_none() && self.gps.is_none()
    }
}

/// Read and parse a sidecar file
pub fn parse_sidecar(path: &Path) -> Result<SidecarMetadata> {
    let raw = fs::read(path)?;
    let value: Value = serde_json::from_slice(&raw)?;
    Ok(parse_sidecar_value(&value))
}

/// Extract the fields we write back into media files. Unknown or malformed fields are ignored.
pub fn parse_sidecar_value(value: &Value) -> SidecarMetadata {
    SidecarMetadata {
        title: non_empty_str(value.get("title")),
        description: non_empty_str(value.get("description")),
        taken_at: value
            .get("photoTakenTime")
            .and_then(|t| t.get("timestamp"))
            .and_then(parse_timestamp),
        gps: value
            .get("geoData")
            .and_then(parse_gps)
            .or_else(|| value.get("geoDataExif").and_then(parse_gps)),
    }
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// Exported as a string of epoch seconds, occasionally as a number
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    let secs = match v {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

fn parse_gps(v: &Value) -> Option<GpsPoint> {
    let latitude = v.get("latitude")?.as_f64()?;
    let longitude = v.get("longitude")?.as_f64()?;
    // 0,0 is how the exporter writes "no location"
    if latitude == 0.0 && longitude == 0.0 {
        return None;
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    let altitude = v.get("altitude").and_then(|a| a.as_f64()).filter(|a| *a != 0.0);
    Some(GpsPoint {
        latitude,
        longitude,
        altitude,
    })
}

/// True for per-file sidecars; album metadata documents are excluded
pub fn is_sidecar(path: &Path) -> bool {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(SIDECAR_EXTENSION))
        .unwrap_or(false);
    is_json && !is_album_metadata(path)
}

pub fn is_album_metadata(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| ALBUM_METADATA_FILENAMES.iter().any(|m| m.eq_ignore_ascii_case(n)))
        .unwrap_or(false)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Split "name(2).jpg" into ("name.jpg", "(2)")
fn split_duplicate_counter(file_name: &str) -> (String, String) {
    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    };
    if stem.ends_with(')') {
        if let Some(open) = stem.rfind('(') {
            let counter = &stem[open + 1..stem.len() - 1];
            if !counter.is_empty() && counter.chars().all(|c| c.is_ascii_digit()) {
                return (format!("{}{}", &stem[..open], ext), stem[open..].to_string());
            }
        }
    }
    (file_name.to_string(), String::new())
}

/// Candidate sidecar file names for a media file name, most specific first
pub fn sidecar_candidates(file_name: &str) -> Vec<String> {
    let (base, counter) = split_duplicate_counter(file_name);

    let mut bases = vec![base.clone()];
    if let Some(idx) = base.rfind('.') {
        let (stem, ext) = base.split_at(idx);
        if let Some(original) = stem.strip_suffix(EDITED_SUFFIX) {
            bases.push(format!("{}{}", original, ext));
        }
    }

    let json = format!(".{}", SIDECAR_EXTENSION);
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    for b in &bases {
        push(format!("{}{}{}", b, counter, json));

        let supplemental = format!("{}{}", b, SUPPLEMENTAL_MARKER);
        push(format!("{}{}{}", supplemental, counter, json));

        let limit = SIDECAR_MAX_NAME_LEN - json.len() - counter.chars().count();
        if supplemental.chars().count() > limit {
            push(format!("{}{}{}", truncate_chars(&supplemental, limit), counter, json));
        }

        let legacy_limit = LEGACY_SIDECAR_MAX_NAME_LEN.saturating_sub(counter.chars().count());
        if b.chars().count() > legacy_limit {
            push(format!("{}{}{}", truncate_chars(b, legacy_limit), counter, json));
        }

        // counter placed before the extension, as some exports do
        if !counter.is_empty() {
            push(format!("{}{}", file_name, json));
        }
    }

    out
}

/// Locate the sidecar of a media file, if any
pub fn find_sidecar(media_path: &Path) -> Option<PathBuf> {
    let parent = media_path.parent()?;
    let file_name = media_path.file_name()?.to_str()?;

    for candidate in sidecar_candidates(file_name) {
        let path = parent.join(&candidate);
        if path.is_file() {
            return Some(path);
        }
    }

    find_truncated_sidecar(parent, file_name)
}

// Last resort: a sidecar whose name is an arbitrary truncation of
// "<name>.<ext>.supplemental-metadata"
fn find_truncated_sidecar(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let (base, counter) = split_duplicate_counter(file_name);
    let full = format!("{}{}", base, SUPPLEMENTAL_MARKER);
    let min_len = base.chars().count().min(LEGACY_SIDECAR_MAX_NAME_LEN);
    let json = format!(".{}", SIDECAR_EXTENSION);

    let mut matches: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_sidecar(p))
        .filter(|p| {
            let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            let Some(stem) = name.strip_suffix(json.as_str()) else {
                return false;
            };
            let stem = stem.strip_suffix(counter.as_str()).unwrap_or(stem);
            stem.chars().count() >= min_len && full.starts_with(stem)
        })
        .collect();

    matches.sort();
    // the longest surviving prefix is the closest match
    matches.into_iter().max_by_key(|p| p.as_os_str().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_sidecar() {
        let meta = parse_sidecar_value(&json!({
            "title": "IMG_0001.jpg",
            "description": "  Beach day ",
            "photoTakenTime": { "timestamp": "1562243400", "formatted": "Jul 4, 2019" },
            "geoData": { "latitude": 48.8584, "longitude": 2.2945, "altitude": 35.0 }
        }));
        assert_eq!(meta.title.as_deref(), Some("IMG_0001.jpg"));
        assert_eq!(meta.description.as_deref(), Some("Beach day"));
        assert_eq!(meta.taken_at.unwrap().timestamp(), 1_562_243_400);
        let gps = meta.gps.unwrap();
        assert_eq!(gps.latitude, 48.8584);
        assert_eq!(gps.altitude, Some(35.0));
    }

    #[test]
    fn test_zero_gps_falls_back_to_exif_geo() {
        let meta = parse_sidecar_value(&json!({
            "geoData": { "latitude": 0.0, "longitude": 0.0 },
            "geoDataExif": { "latitude": -33.86, "longitude": 151.21, "altitude": 0.0 }
        }));
        let gps = meta.gps.unwrap();
        assert_eq!(gps.longitude, 151.21);
        assert_eq!(gps.altitude, None);

        let none = parse_sidecar_value(&json!({ "geoData": { "latitude": 0.0, "longitude": 0.0 } }));
        assert!(none.gps.is_none());
        assert!(none.is_empty());
    }

    #[test]
    fn test_malformed_fields_are_ignored() {
        let meta = parse_sidecar_value(&json!({
            "description": 12,
            "photoTakenTime": { "timestamp": "yesterday" },
            "geoData": "somewhere"
        }));
        assert_eq!(meta, SidecarMetadata::default());
    }

    #[test]
    fn test_candidates_cover_duplicate_and_edited() {
        let dup = sidecar_candidates("IMG_0001(1).jpg");
        assert_eq!(dup[0], "IMG_0001.jpg(1).json");
        assert!(dup.contains(&"IMG_0001.jpg.supplemental-metadata(1).json".to_string()));
        assert!(dup.contains(&"IMG_0001(1).jpg.json".to_string()));

        let edited = sidecar_candidates("IMG_0002-edited.jpg");
        assert!(edited.contains(&"IMG_0002.jpg.json".to_string()));
    }

    #[test]
    fn test_candidates_truncate_long_names() {
        let name = "a_really_long_photo_file_name_from_some_camera_app.jpg";
        let candidates = sidecar_candidates(name);
        assert!(candidates.iter().all(|c| c.ends_with(".json")));
        assert!(candidates
            .iter()
            .any(|c| c.chars().count() == SIDECAR_MAX_NAME_LEN));
        assert!(candidates.contains(&format!("{}.json", truncate_chars(name, LEGACY_SIDECAR_MAX_NAME_LEN))));
    }

    #[test]
    fn test_find_sidecar_on_disk() {
        let tmp = TempDir::new().unwrap();
        let media = tmp.path().join("PXL_20230101.jpg");
        fs::write(&media, b"x").unwrap();
        assert!(find_sidecar(&media).is_none());

        let sidecar = tmp.path().join("PXL_20230101.jpg.supplemental-met.json");
        fs::write(&sidecar, b"{}").unwrap();
        fs::write(tmp.path().join("metadata.json"), b"{}").unwrap();
        assert_eq!(find_sidecar(&media), Some(sidecar));

        let exact = tmp.path().join("PXL_20230101.jpg.json");
        fs::write(&exact, b"{}").unwrap();
        assert_eq!(find_sidecar(&media), Some(exact));
    }
}
