// Metadata fusion: sidecar JSON -> media file tags, plus optional transcoding

pub mod exiftool;
pub mod sidecar;
pub mod transcode;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::archive::discover::MediaEntry;
use crate::config::ProcessingConfig;
use crate::error::{MigrateError, Result};
use sidecar::{parse_sidecar, SidecarMetadata};

/// Writes capture date, GPS and description into a media file.
/// Returns whether anything was written.
pub trait MetadataWriter {
    fn write(&self, media: &Path, meta: &SidecarMetadata, is_video: bool) -> Result<bool>;
}

/// Converts a video into an importable container, returning the new file
pub trait Transcoder {
    fn transcode(&self, source: &Path) -> Result<PathBuf>;
}

/// Result of fusing one media file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionOutcome {
    /// File to import from now on (differs from the source after a transcode)
    pub path: PathBuf,
    pub transcoded: bool,
    pub metadata_written: bool,
}

pub struct MetadataFusion {
    writer: Option<Box<dyn MetadataWriter>>,
    transcoder: Option<Box<dyn Transcoder>>,
    unsupported_video: HashSet<String>,
}

impl MetadataFusion {
    pub fn new(
        writer: Option<Box<dyn MetadataWriter>>,
        transcoder: Option<Box<dyn Transcoder>>,
        unsupported_video_extensions: &[String],
    ) -> Self {
        Self {
            writer,
            transcoder,
            unsupported_video: unsupported_video_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// Fusion backed by exiftool and ffmpeg, honoring the processing switches
    pub fn from_config(cfg: &ProcessingConfig) -> Self {
        let writer: Option<Box<dyn MetadataWriter>> = if cfg.merge_metadata {
            let path = crate::tools::exiftool_path(cfg.exiftool_path.as_deref());
            Some(Box::new(exiftool::ExifToolWriter::new(path)))
        } else {
            None
        };
        let transcoder: Option<Box<dyn Transcoder>> = if cfg.transcode_videos {
            let path = crate::tools::ffmpeg_path(cfg.ffmpeg_path.as_deref());
            Some(Box::new(transcode::FfmpegTranscoder::new(path)))
        } else {
            None
        };
        Self::new(writer, transcoder, &cfg.unsupported_video_extensions)
    }

    pub fn needs_transcode(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.unsupported_video.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Transcode if needed, then write sidecar metadata. Any failure is a
    /// MetadataMerge error for this file alone.
    pub fn fuse(&self, entry: &MediaEntry) -> Result<FusionOutcome> {
        let fail = |reason: String| MigrateError::MetadataMerge {
            path: entry.path.display().to_string(),
            reason,
        };

        let mut path = entry.path.clone();
        let mut transcoded = false;
        if entry.is_video && self.needs_transcode(&path) {
            if let Some(ref transcoder) = self.transcoder {
                path = transcoder.transcode(&path).map_err(|e| fail(e.to_string()))?;
                transcoded = true;
            }
        }

        let mut metadata_written = false;
        if let (Some(writer), Some(sidecar_path)) = (self.writer.as_ref(), entry.sidecar.as_ref()) {
            let meta = match parse_sidecar(sidecar_path) {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("Ignoring unreadable sidecar {}: {}", sidecar_path.display(), e);
                    SidecarMetadata::default()
                }
            };
            metadata_written = writer
                .write(&path, &meta, entry.is_video)
                .map_err(|e| fail(e.to_string()))?;
        }

        Ok(FusionOutcome {
            path,
            transcoded,
            metadata_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct RecordingWriter {
        calls: Rc<RefCell<Vec<(PathBuf, bool)>>>,
        fail_on: Option<&'static str>,
    }

    impl MetadataWriter for RecordingWriter {
        fn write(&self, media: &Path, meta: &SidecarMetadata, is_video: bool) -> Result<bool> {
            if let Some(name) = self.fail_on {
                if media.ends_with(name) {
                    return Err(MigrateError::ExifTool("boom".into()));
                }
            }
            self.calls.borrow_mut().push((media.to_path_buf(), is_video));
            Ok(!meta.is_empty())
        }
    }

    struct CopyTranscoder;

    impl Transcoder for CopyTranscoder {
        fn transcode(&self, source: &Path) -> Result<PathBuf> {
            let out = source.with_extension("mp4");
            fs::copy(source, &out)?;
            Ok(out)
        }
    }

    fn entry(dir: &Path, name: &str, sidecar: Option<&str>, is_video: bool) -> MediaEntry {
        let path = dir.join(name);
        fs::write(&path, b"media").unwrap();
        let sidecar = sidecar.map(|s| {
            let p = dir.join(format!("{}.json", name));
            fs::write(&p, s).unwrap();
            p
        });
        MediaEntry {
            relative: name.to_string(),
            path,
            sidecar,
            is_video,
        }
    }

    #[test]
    fn test_fuse_writes_sidecar_metadata() {
        let tmp = TempDir::new().unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let fusion = MetadataFusion::new(
            Some(Box::new(RecordingWriter { calls: calls.clone(), fail_on: None })),
            None,
            &[],
        );

        let e = entry(tmp.path(), "img.jpg", Some(r#"{"description":"hi"}"#), false);
        let outcome = fusion.fuse(&e).unwrap();
        assert_eq!(outcome.path, e.path);
        assert!(outcome.metadata_written);
        assert!(!outcome.transcoded);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_unsupported_video_is_transcoded_first() {
        let tmp = TempDir::new().unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let fusion = MetadataFusion::new(
            Some(Box::new(RecordingWriter { calls: calls.clone(), fail_on: None })),
            Some(Box::new(CopyTranscoder)),
            &["avi".to_string()],
        );

        let e = entry(tmp.path(), "clip.AVI", Some(r#"{"description":"x"}"#), true);
        let outcome = fusion.fuse(&e).unwrap();
        assert!(outcome.transcoded);
        assert_eq!(outcome.path, tmp.path().join("clip.mp4"));
        assert_eq!(calls.borrow()[0], (tmp.path().join("clip.mp4"), true));
    }

    #[test]
    fn test_writer_failure_is_metadata_merge_error() {
        let tmp = TempDir::new().unwrap();
        let fusion = MetadataFusion::new(
            Some(Box::new(RecordingWriter {
                calls: Rc::new(RefCell::new(Vec::new())),
                fail_on: Some("bad.jpg"),
            })),
            None,
            &[],
        );

        let bad = entry(tmp.path(), "bad.jpg", Some("{}"), false);
        assert!(matches!(fusion.fuse(&bad), Err(MigrateError::MetadataMerge { .. })));

        let garbled = entry(tmp.path(), "ok.jpg", Some("{ not json"), false);
        assert!(!fusion.fuse(&garbled).unwrap().metadata_written);
    }

    #[test]
    fn test_no_sidecar_passes_through() {
        let tmp = TempDir::new().unwrap();
        let fusion = MetadataFusion::new(None, None, &[]);
        let e = entry(tmp.path(), "plain.png", None, false);
        let outcome = fusion.fuse(&e).unwrap();
        assert_eq!(outcome.path, e.path);
        assert!(!outcome.metadata_written);
    }
}
