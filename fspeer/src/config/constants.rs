pub const TRACKER_HOST: &str = "TRACKER_HOST";
pub const TRACKER_PORT: &str = "TRACKER_PORT";
pub const SHARED_DIRECTORY: &str = "SHARED_DIRECTORY";
pub const CHECK_ALIVE_THRESHOLD_MS: &str = "CHECK_ALIVE_THRESHOLD_MS";
pub const CLEANING_INTERVAL_MS: &str = "CLEANING_INTERVAL_MS";
pub const COOPERATIVE_LOGOUT: &str = "COOPERATIVE_LOGOUT";
