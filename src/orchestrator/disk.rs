// Disk budget for downloads and extraction

use std::fmt;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::DiskConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskVerdict {
    Fits,
    OverBudget { used: u64, needed: u64, max: u64 },
    InsufficientSpace { needed: u64, available: u64 },
}

impl fmt::Display for DiskVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskVerdict::Fits => write!(f, "fits"),
            DiskVerdict::OverBudget { used, needed, max } => write!(
                f,
                "needs {} bytes on top of {} used, budget is {}",
                needed, used, max
            ),
            DiskVerdict::InsufficientSpace { needed, available } => {
                write!(f, "needs {} bytes, only {} free", needed, available)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiskBudget {
    max_bytes: Option<u64>,
    factor: f64,
}

impl DiskBudget {
    pub fn new(max_bytes: Option<u64>, factor: f64) -> Self {
        Self { max_bytes, factor }
    }

    pub fn from_config(cfg: &DiskConfig) -> Self {
        Self::new(cfg.max_bytes(), cfg.expansion_factor)
    }

    /// Working space a unit of `raw` archive bytes needs once extracted and processed
    pub fn required(&self, raw: u64) -> u64 {
        (raw as f64 * self.factor).ceil() as u64
    }

    /// Can a unit of `raw` bytes, `already_local` of which are downloaded, be processed now?
    pub fn check(&self, work_root: &Path, raw: u64, already_local: u64) -> Result<DiskVerdict> {
        let needed = self.required(raw).saturating_sub(already_local);

        if let Some(max) = self.max_bytes {
            let used = dir_usage(work_root);
            if used.saturating_add(needed) > max {
                return Ok(DiskVerdict::OverBudget { used, needed, max });
            }
        }

        let available = fs2::available_space(work_root)?;
        if available < needed {
            return Ok(DiskVerdict::InsufficientSpace { needed, available });
        }
        Ok(DiskVerdict::Fits)
    }
}

/// Total size of the regular files under `root`
pub fn dir_usage(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
