use std::collections::HashSet;

use wire::payload::{FileDescription, PeerContact};

/// A live association between a logged-in peer and the tracker.
///
/// The registry owns every `Session`; anything handed out to handlers is
/// a defensive copy.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: i32,
    pub username: String,
    pub host: String,
    pub port: u16,
    pub files: HashSet<FileDescription>,
}

impl Session {
    pub fn new(
        session_id: i32,
        username: &str,
        host: &str,
        port: u16,
        files: HashSet<FileDescription>,
    ) -> Self {
        Self {
            session_id,
            username: username.to_string(),
            host: host.to_string(),
            port,
            files,
        }
    }

    /// Copy of the session's contact information for query results.
    pub fn contact(&self) -> PeerContact {
        PeerContact::new(&self.username, &self.host, self.port)
    }
}
