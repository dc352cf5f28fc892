use std::time::Duration;

pub const TITLE: &str = "Fleet software upgrade tool";

pub const SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub const FAILED_NODES_FILE: &str = "Upgrade-Failed.session";
pub const ROLLBACK_FILE: &str = "Upgrade-Rollback.session";
pub const DEBUG_LOG_FILE: &str = "Upgrade-debug.log";

pub const STATE_DIR_ENV: &str = "FLEET_UPGRADE_STATE_DIR";
pub const SSH_TIMEOUT_ENV: &str = "FLEET_UPGRADE_SSH_TIMEOUT";

pub const ROLLBACK_SUFFIX_FORMAT: &str = "%Y%m%d-%H%M%S";

// DO NOT LOCALIZE: matched against `stat` output on the remote host.
pub const NO_SUCH_FILE: &str = "No such file or directory";
