//! Status reporting towards the display layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{StatusCounts, StatusLevel};

/// Status as seen after a completed poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub locked: usize,
    pub total: usize,
    pub status: StatusLevel,
    /// When the poll completed; `None` before the first poll
    pub checked_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// Report shown before any poll has completed
    pub fn initial() -> Self {
        Self {
            locked: 0,
            total: 0,
            status: StatusLevel::Medium,
            checked_at: None,
        }
    }

    pub fn from_counts(counts: StatusCounts, checked_at: DateTime<Utc>) -> Self {
        Self {
            locked: counts.locked,
            total: counts.total,
            status: counts.status,
            checked_at: Some(checked_at),
        }
    }

    /// Whether the indicator should be shown under the given preference
    pub fn indicator_visible(&self, hide_when_locked: bool) -> bool {
        !(hide_when_locked && self.status.is_locked())
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::initial()
    }
}

/// Consumer of status changes, typically a panel indicator.
///
/// Callbacks run on the controller's task and must not block.
pub trait StatusObserver: Send + Sync {
    /// Called when the status level changes
    fn status_changed(&self, report: &StatusReport);

    /// Called when the indicator should be shown or hidden
    fn visibility_changed(&self, _visible: bool) {}
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StatusObserver for NullObserver {
    fn status_changed(&self, _report: &StatusReport) {}
}
