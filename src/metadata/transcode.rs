// Video transcoding for containers the destination cannot import
//
// Produces an H.264/AAC MP4 next to the source. Output is written to a temp
// name and renamed, and keeps the source's modification time.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::constants::{TRANSCODE_CODEC, TRANSCODE_CONTAINER, TRANSCODE_CRF};
use crate::error::{MigrateError, Result};
use super::exiftool::validate_tool_path;
use super::Transcoder;

/// Output path for a transcoded file: `clip.avi` -> `clip.mp4`, or
/// `clip_converted.mp4` if that name is already taken.
pub fn transcoded_path(source: &Path) -> PathBuf {
    let direct = source.with_extension(TRANSCODE_CONTAINER);
    if direct != source && !direct.exists() {
        return direct;
    }
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    source.with_file_name(format!("{}_converted.{}", stem, TRANSCODE_CONTAINER))
}

pub fn build_transcode_args(source: &str, tmp_output: &str) -> Vec<String> {
    let crf = TRANSCODE_CRF.to_string();
    [
        "-y", "-hide_banner", "-loglevel", "error",
        "-i", source,
        "-c:v", TRANSCODE_CODEC,
        "-preset", "medium",
        "-crf", crf.as_str(),
        "-c:a", "aac",
        "-b:a", "128k",
        "-movflags", "+faststart",
        "-map_metadata", "0",
        tmp_output,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    pub fn is_available(&self) -> bool {
        crate::tools::is_tool_available(&self.ffmpeg, "-version")
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, source: &Path) -> Result<PathBuf> {
        let source_str = validate_tool_path(source)?;
        let output = transcoded_path(source);
        let tmp_path = output.with_extension(format!("tmp.{}", TRANSCODE_CONTAINER));
        let tmp_str = validate_tool_path(&tmp_path)?;

        let result = Command::new(&self.ffmpeg)
            .args(build_transcode_args(source_str, tmp_str))
            .output()
            .map_err(|e| MigrateError::FFmpeg(format!("Failed to run ffmpeg: {}", e)))?;

        if !result.status.success() {
            let _ = fs::remove_file(&tmp_path);
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(MigrateError::FFmpeg(format!(
                "transcode of {} failed: {}",
                source.display(),
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }

        fs::rename(&tmp_path, &output)?;

        if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
            let _ = filetime::set_file_mtime(&output, filetime::FileTime::from_system_time(modified));
        }

        log::info!("Transcoded {} -> {}", source.display(), output.display());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_transcoded_path_avoids_collision() {
        let tmp = TempDir::new().unwrap();
        let avi = tmp.path().join("clip.avi");
        assert_eq!(transcoded_path(&avi), tmp.path().join("clip.mp4"));

        fs::write(tmp.path().join("clip.mp4"), b"x").unwrap();
        assert_eq!(transcoded_path(&avi), tmp.path().join("clip_converted.mp4"));
    }

    #[test]
    fn test_transcode_args_shape() {
        let args = build_transcode_args("/in/clip.avi", "/in/clip.tmp.mp4");
        assert_eq!(args[0], "-y");
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "23"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/in/clip.avi"));
        assert_eq!(args.last().unwrap(), "/in/clip.tmp.mp4");
    }

    #[test]
    fn test_missing_ffmpeg_is_reported() {
        let tmp = TempDir::new().unwrap();
        let avi = tmp.path().join("clip.avi");
        fs::write(&avi, b"not really video").unwrap();

        let transcoder = FfmpegTranscoder::new(tmp.path().join("no-such-ffmpeg"));
        assert!(!transcoder.is_available());
        assert!(matches!(transcoder.transcode(&avi), Err(MigrateError::FFmpeg(_))));
    }
}
