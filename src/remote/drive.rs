// Drive v3 REST store (blocking)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::constants::{DRIVE_API_BASE, DRIVE_PAGE_SIZE, TEMP_FILE_PREFIX};
use crate::error::{MigrateError, Result};
use super::{check_downloaded_size, is_safe_file_name, is_valid_download, matches_pattern, RemoteFile, RemoteStore};

const LIST_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

impl From<DriveFile> for RemoteFile {
    fn from(f: DriveFile) -> Self {
        RemoteFile {
            size: f.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            modified_time: f
                .modified_time
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            id: f.id,
            name: f.name,
        }
    }
}

fn check_status(status: StatusCode, what: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(MigrateError::Authentication(format!(
            "{} rejected with {}; refresh the access token",
            what, status
        )));
    }
    Err(MigrateError::Download {
        name: what.to_string(),
        reason: format!("HTTP {}", status),
    })
}

fn folder_query(folder_id: &str) -> String {
    format!("'{}' in parents and trashed = false", folder_id.replace('\'', "\\'"))
}

pub struct DriveStore {
    client: Client,
    base_url: String,
    token: String,
    default_folder: Option<String>,
}

impl DriveStore {
    pub fn new(token: String, default_folder: Option<String>) -> Result<Self> {
        Self::with_base_url(token, default_folder, DRIVE_API_BASE.to_string())
    }

    pub fn with_base_url(token: String, default_folder: Option<String>, base_url: String) -> Result<Self> {
        // no overall timeout: archive downloads can take hours
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            default_folder,
        })
    }

    fn list_page(&self, folder_id: &str, page_token: Option<&str>) -> Result<FileListPage> {
        let page_size = DRIVE_PAGE_SIZE.to_string();
        let mut query: Vec<(&str, String)> = vec![
            ("q", folder_query(folder_id)),
            ("fields", "nextPageToken,files(id,name,size,modifiedTime)".to_string()),
            ("pageSize", page_size),
            ("orderBy", "name".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/files", self.base_url))
            .bearer_auth(&self.token)
            .query(&query)
            .timeout(Duration::from_secs(LIST_TIMEOUT_SECS))
            .send()?;
        check_status(response.status(), "drive listing")?;
        Ok(response.json()?)
    }
}

impl RemoteStore for DriveStore {
    fn name(&self) -> &str {
        "drive"
    }

    fn list(&self, folder: Option<&str>, pattern: Option<&Regex>) -> Result<Vec<RemoteFile>> {
        let folder_id = folder
            .map(str::to_string)
            .or_else(|| self.default_folder.clone())
            .ok_or_else(|| MigrateError::Configuration("no drive folder id configured".to_string()))?;

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self.list_page(&folder_id, page_token.as_deref())?;
            pages += 1;
            files.extend(
                page.files
                    .into_iter()
                    .filter(|f| {
                        if !is_safe_file_name(&f.name) {
                            log::warn!("Ignoring drive file {} with unusable name {:?}", f.id, f.name);
                            return false;
                        }
                        matches_pattern(&f.name, pattern)
                    })
                    .map(RemoteFile::from),
            );
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        log::info!("Listed {} archives from drive folder {} ({} pages)", files.len(), folder_id, pages);
        Ok(files)
    }

    fn download(&self, file: &RemoteFile, dest: &Path) -> Result<PathBuf> {
        if is_valid_download(dest, file.size) {
            log::debug!("{} already downloaded, skipping", file.name);
            return Ok(dest.to_path_buf());
        }

        let dir = dest
            .parent()
            .ok_or_else(|| MigrateError::InvalidPath(dest.display().to_string()))?;
        fs::create_dir_all(dir)?;

        log::info!("Downloading {} ({} bytes)", file.name, file.size);
        let mut response = self
            .client
            .get(format!("{}/files/{}", self.base_url, file.id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .map_err(|e| MigrateError::Download {
                name: file.name.clone(),
                reason: e.to_string(),
            })?;
        check_status(response.status(), &file.name)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile_in(dir)?;
        response
            .copy_to(tmp.as_file_mut())
            .map_err(|e| MigrateError::Download {
                name: file.name.clone(),
                reason: e.to_string(),
            })?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| MigrateError::Io(e.error))?;

        check_downloaded_size(file, dest)?;
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_and_convert() {
        let page: FileListPage = serde_json::from_str(
            r#"{
                "nextPageToken": "tok",
                "files": [
                    {"id": "1", "name": "takeout-001.zip", "size": "1048576", "modifiedTime": "2024-01-02T03:04:05.000Z"},
                    {"id": "2", "name": "folder"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("tok"));

        let files: Vec<RemoteFile> = page.files.into_iter().map(RemoteFile::from).collect();
        assert_eq!(files[0].size, 1_048_576);
        assert_eq!(files[0].modified_time.unwrap().timestamp(), 1_704_164_645);
        assert_eq!(files[1].size, 0);
        assert!(files[1].modified_time.is_none());
    }

    #[test]
    fn test_auth_statuses_are_fatal() {
        let err = check_status(StatusCode::UNAUTHORIZED, "drive listing").unwrap_err();
        assert!(err.is_fatal());
        let err = check_status(StatusCode::FORBIDDEN, "x.zip").unwrap_err();
        assert!(matches!(err, MigrateError::Authentication(_)));
        let err = check_status(StatusCode::INTERNAL_SERVER_ERROR, "x.zip").unwrap_err();
        assert!(matches!(err, MigrateError::Download { .. }));
        assert!(check_status(StatusCode::OK, "x.zip").is_ok());
    }

    #[test]
    fn test_folder_query_escapes_quotes() {
        assert_eq!(folder_query("ab'c"), r"'ab\'c' in parents and trashed = false");
    }
}
