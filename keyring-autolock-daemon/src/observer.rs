//! Status observer that writes to the log.

use keyring_autolock_core::{StatusObserver, StatusReport};
use tracing::info;

/// Logs every status and visibility change
#[derive(Debug, Default)]
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn status_changed(&self, report: &StatusReport) {
        info!(
            status = %report.status,
            icon = report.status.icon_name(),
            locked = report.locked,
            total = report.total,
            "Keyring status: {}/{} collections locked",
            report.locked,
            report.total
        );
    }

    fn visibility_changed(&self, visible: bool) {
        info!(visible, "Indicator visibility changed");
    }
}
