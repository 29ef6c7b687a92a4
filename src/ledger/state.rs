// Processing states for archive units and media files
//
// Forward states form a lattice ordered by rank. Failed states sit outside
// it: any forward state may divert to a failure, and a failure may re-enter
// the lattice at any rank (retry). Terminal success never changes again
// except through an explicit reset.

use std::fmt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Pending,
    Downloaded,
    Extracted,
    Converted,
    Uploaded,
    FailedDownload,
    FailedExtraction,
    FailedConversion,
}

impl ArchiveState {
    pub fn rank(self) -> Option<u8> {
        match self {
            ArchiveState::Pending => Some(0),
            ArchiveState::Downloaded => Some(1),
            ArchiveState::Extracted => Some(2),
            ArchiveState::Converted => Some(3),
            ArchiveState::Uploaded => Some(4),
            _ => None,
        }
    }

    pub fn is_failed(self) -> bool {
        self.rank().is_none()
    }

    pub fn is_terminal(self) -> bool {
        self == ArchiveState::Uploaded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveState::Pending => "pending",
            ArchiveState::Downloaded => "downloaded",
            ArchiveState::Extracted => "extracted",
            ArchiveState::Converted => "converted",
            ArchiveState::Uploaded => "uploaded",
            ArchiveState::FailedDownload => "failed_download",
            ArchiveState::FailedExtraction => "failed_extraction",
            ArchiveState::FailedConversion => "failed_conversion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ArchiveState::all().into_iter().find(|st| st.as_str() == s)
    }

    pub fn all() -> [ArchiveState; 8] {
        [
            ArchiveState::Pending,
            ArchiveState::Downloaded,
            ArchiveState::Extracted,
            ArchiveState::Converted,
            ArchiveState::Uploaded,
            ArchiveState::FailedDownload,
            ArchiveState::FailedExtraction,
            ArchiveState::FailedConversion,
        ]
    }

    /// At least `other` in the forward lattice. Failed states reach nothing.
    pub fn at_least(self, other: ArchiveState) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Extracted,
    Converted,
    #[serde(rename = "copied_to_destination")]
    Copied,
    Synced,
    FailedConversion,
    FailedUpload,
    FailedVerification,
}

impl FileState {
    pub fn rank(self) -> Option<u8> {
        match self {
            FileState::Pending => Some(0),
            FileState::Extracted => Some(1),
            FileState::Converted => Some(2),
            FileState::Copied => Some(3),
            FileState::Synced => Some(4),
            _ => None,
        }
    }

    pub fn is_failed(self) -> bool {
        self.rank().is_none()
    }

    pub fn is_terminal(self) -> bool {
        self == FileState::Synced
    }

    /// State a failed file returns to when retried
    pub fn retry_predecessor(self) -> Option<FileState> {
        match self {
            FileState::FailedConversion => Some(FileState::Extracted),
            FileState::FailedUpload | FileState::FailedVerification => Some(FileState::Converted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Extracted => "extracted",
            FileState::Converted => "converted",
            FileState::Copied => "copied_to_destination",
            FileState::Synced => "synced",
            FileState::FailedConversion => "failed_conversion",
            FileState::FailedUpload => "failed_upload",
            FileState::FailedVerification => "failed_verification",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared lattice rule for both entity kinds.
pub(crate) fn transition_allowed(
    from_rank: Option<u8>,
    from_terminal: bool,
    to_rank: Option<u8>,
    same: bool,
) -> bool {
    if same {
        return true;
    }
    if from_terminal {
        return false;
    }
    match (from_rank, to_rank) {
        // failure out of any non-terminal state, or retry out of a failure
        (_, None) | (None, _) => true,
        (Some(from), Some(to)) => to >= from,
    }
}
