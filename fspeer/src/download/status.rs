use wire::payload::PeerContact;

/// Terminal-state machine of one download, also used for its
/// acknowledgement sub-task: `Unknown` until the scheduler decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    #[default]
    Unknown,
    Success,
    Failed,
}

/// One line of the peer's download log: what was requested, who ended
/// up providing it and how both the download and its acknowledgement
/// went. Kept for test-time statistics.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub filename: String,
    pub provider: Option<PeerContact>,
    pub download_status: DownloadStatus,
    pub ack_status: DownloadStatus,
}

impl DownloadRecord {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            provider: None,
            download_status: DownloadStatus::Unknown,
            ack_status: DownloadStatus::Unknown,
        }
    }
}
