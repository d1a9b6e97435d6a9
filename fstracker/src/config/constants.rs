pub const TCP_PORT: &str = "TCP_PORT";
pub const STORE_PATH: &str = "STORE_PATH";
pub const PEER_REMOTE_HOST: &str = "PEER_REMOTE_HOST";
pub const CLEANING_INTERVAL_MS: &str = "CLEANING_INTERVAL_MS";
pub const PEER_PENALTY_MS: &str = "PEER_PENALTY_MS";
