// External tool resolver for exiftool/ffmpeg/osascript
//
// Resolution order:
// 1) Explicit path from the config file
// 2) Environment variable override (PHOTO_MIGRATOR_EXIFTOOL_PATH, etc.)
// 3) Binary next to the executable (or in its bin/ subdirectory)
// 4) PATH fallback

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

fn resolve_tool(configured: Option<&Path>, env_key: &str, default_name: &str) -> PathBuf {
    if let Some(p) = configured {
        return p.to_path_buf();
    }

    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(v.trim());
        if p.exists() {
            return p;
        }
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        for candidate in [dir.join(&filename), dir.join("bin").join(&filename)] {
            if candidate.exists() {
                return candidate;
            }
        }
    }

    PathBuf::from(default_name)
}

/// Get path to exiftool binary
pub fn exiftool_path(configured: Option<&Path>) -> PathBuf {
    resolve_tool(configured, "PHOTO_MIGRATOR_EXIFTOOL_PATH", "exiftool")
}

/// Get path to ffmpeg binary
pub fn ffmpeg_path(configured: Option<&Path>) -> PathBuf {
    resolve_tool(configured, "PHOTO_MIGRATOR_FFMPEG_PATH", "ffmpeg")
}

/// Get path to osascript (macOS Photos bridge)
pub fn osascript_path() -> PathBuf {
    resolve_tool(None, "PHOTO_MIGRATOR_OSASCRIPT_PATH", "osascript")
}

/// Check whether a resolved tool can actually be executed.
/// exiftool answers `-ver`, ffmpeg answers `-version`.
pub fn is_tool_available(path: &Path, version_flag: &str) -> bool {
    Command::new(path)
        .arg(version_flag)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tool_fallback() {
        let path = resolve_tool(None, "PHOTO_MIGRATOR_TEST_NONEXISTENT", "testcmd");
        assert_eq!(path, PathBuf::from("testcmd"));
    }

    #[test]
    fn test_configured_path_wins() {
        let configured = PathBuf::from("/opt/tools/exiftool");
        let path = resolve_tool(Some(&configured), "PHOTO_MIGRATOR_TEST_UNUSED", "exiftool");
        assert_eq!(path, configured);
    }

    #[test]
    fn test_env_override() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let temp_file = temp_dir.path().join("fake_tool");
        std::fs::write(&temp_file, "test").unwrap();

        std::env::set_var("PHOTO_MIGRATOR_TEST_TOOL", temp_file.to_str().unwrap());
        let path = resolve_tool(None, "PHOTO_MIGRATOR_TEST_TOOL", "default");
        assert_eq!(path, temp_file);
        std::env::remove_var("PHOTO_MIGRATOR_TEST_TOOL");
    }
}
