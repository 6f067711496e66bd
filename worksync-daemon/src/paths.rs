use std::path::{Path, PathBuf};
use std::time::Duration;

use worksync_core::config_store;

pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Set to `json` for structured log lines.
pub const LOG_FORMAT_ENV: &str = "WORKSYNC_LOG_FORMAT";

/// How often the scheduler checks which teams are due.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Shortest interval a team may be scheduled at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub fn socket_path(home: &Path) -> PathBuf {
    config_store::root_at(home).join(DAEMON_SOCKET)
}
