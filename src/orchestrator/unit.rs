// Per-unit outcomes and the run summary

use serde::Serialize;

/// How processing one archive unit ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed { files: usize },
    /// Converted, but some files are not synced yet; the local archive is kept
    Partial { synced: usize, failed: usize, total: usize },
    FailedDownload { reason: String },
    FailedExtraction { details: String, corrupted: bool },
    FailedConversion { reason: String },
    /// Not enough disk budget right now
    Deferred { reason: String },
    Skipped { reason: String },
    /// Unexpected non-fatal error
    Errored { reason: String },
    UserStopped,
}

impl UnitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Completed { .. } => "completed",
            UnitOutcome::Partial { .. } => "partial",
            UnitOutcome::FailedDownload { .. } => "failed_download",
            UnitOutcome::FailedExtraction { .. } => "failed_extraction",
            UnitOutcome::FailedConversion { .. } => "failed_conversion",
            UnitOutcome::Deferred { .. } => "deferred",
            UnitOutcome::Skipped { .. } => "skipped",
            UnitOutcome::Errored { .. } => "errored",
            UnitOutcome::UserStopped => "stopped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitOutcome::FailedDownload { .. }
                | UnitOutcome::FailedExtraction { .. }
                | UnitOutcome::FailedConversion { .. }
                | UnitOutcome::Errored { .. }
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub stopped: bool,
    pub restarts: usize,
    /// Import calls made against the destination
    pub imports: usize,
    pub outcomes: Vec<(String, UnitOutcome)>,
}

impl RunSummary {
    pub fn record(&mut self, unit: &str, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Completed { .. } => self.completed += 1,
            UnitOutcome::Partial { .. } => self.partial += 1,
            UnitOutcome::Deferred { .. } => self.deferred += 1,
            UnitOutcome::Skipped { .. } => self.skipped += 1,
            UnitOutcome::UserStopped => self.stopped = true,
            ref other if other.is_failure() => self.failed += 1,
            _ => {}
        }
        self.outcomes.push((unit.to_string(), outcome));
    }

    pub fn outcome(&self, unit: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().rev().find(|(name, _)| name == unit).map(|(_, o)| o)
    }
}
