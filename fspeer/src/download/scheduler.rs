use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use wire::payload::PeerContact;

use crate::shared_dir::manager::save_downloaded_file;
use crate::tracker_client::client::{check_alive, simple_download, TrackerClient};

use super::status::{DownloadRecord, DownloadStatus};

// Bound on one SIMPLE_DOWNLOAD round trip against a provider.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives exactly one requested filename from issue to terminal status:
/// ask the tracker who holds it, probe every provider for liveness, try
/// them fastest first, then acknowledge the one that delivered.
///
/// A single pass with no retries; losing one provider never fails the
/// whole download, an empty provider list does.
pub struct DownloadScheduler {
    tracker: TrackerClient,
    session_id: i32,
    filename: String,
    shared_dir: PathBuf,
    check_alive_threshold: Duration,
}

impl DownloadScheduler {
    pub fn new(
        tracker_addr: SocketAddr,
        session_id: i32,
        filename: &str,
        shared_dir: PathBuf,
        check_alive_threshold: Duration,
    ) -> Self {
        Self {
            tracker: TrackerClient::new(tracker_addr),
            session_id,
            filename: filename.to_string(),
            shared_dir,
            check_alive_threshold,
        }
    }

    /// Runs the whole pass and returns the finished log record.
    pub fn run(&self) -> DownloadRecord {
        let mut record = DownloadRecord::new(&self.filename);

        let contacts = match self.tracker.search(self.session_id, &self.filename) {
            Ok(contacts) => contacts,
            Err(err) => {
                warn!("search for {} failed: {:?}", self.filename, err);
                record.download_status = DownloadStatus::Failed;
                return record;
            }
        };
        if contacts.is_empty() {
            info!("no live peer holds {}", self.filename);
            record.download_status = DownloadStatus::Failed;
            return record;
        }

        let ranked = self.rank_providers(contacts);
        if ranked.is_empty() {
            info!("every holder of {} failed the liveness probe", self.filename);
            record.download_status = DownloadStatus::Failed;
            return record;
        }

        for (contact, addr) in ranked {
            match simple_download(&addr, &self.filename, DOWNLOAD_TIMEOUT) {
                Ok(bytes) => {
                    if let Err(err) =
                        save_downloaded_file(&self.shared_dir, &self.filename, &bytes)
                    {
                        warn!("could not save {}: {}", self.filename, err);
                        record.download_status = DownloadStatus::Failed;
                        return record;
                    }
                    info!(
                        "downloaded {} from {} ({}:{})",
                        self.filename, contact.username, contact.host, contact.port
                    );
                    record.download_status = DownloadStatus::Success;
                    record.provider = Some(contact);
                    break;
                }
                Err(err) => {
                    // On to the next provider.
                    warn!(
                        "provider {}:{} did not deliver {}: {:?}",
                        contact.host, contact.port, self.filename, err
                    );
                }
            }
        }

        match &record.provider {
            Some(provider) => {
                record.ack_status = match self.tracker.acknowledge(
                    self.session_id,
                    &provider.username,
                    &self.filename,
                ) {
                    Ok(()) => DownloadStatus::Success,
                    Err(err) => {
                        warn!("acknowledge of {} failed: {:?}", self.filename, err);
                        DownloadStatus::Failed
                    }
                };
            }
            None => record.download_status = DownloadStatus::Failed,
        }
        record
    }

    /// Probes every distinct provider endpoint in parallel, drops the
    /// ones that exceeded the threshold and orders the rest by their
    /// measured round trip, ascending.
    fn rank_providers(&self, contacts: Vec<PeerContact>) -> Vec<(PeerContact, SocketAddr)> {
        let mut endpoints: HashMap<String, Option<SocketAddr>> = HashMap::new();
        for contact in &contacts {
            endpoints
                .entry(endpoint_key(contact))
                .or_insert_with(|| resolve(contact));
        }

        let mut probes = Vec::new();
        for (key, addr) in &endpoints {
            let threshold = self.check_alive_threshold;
            let addr = *addr;
            let key = key.clone();
            probes.push((
                key,
                thread::spawn(move || match addr {
                    Some(addr) => check_alive(&addr, threshold),
                    None => threshold + Duration::from_millis(1),
                }),
            ));
        }

        let mut times: HashMap<String, Duration> = HashMap::new();
        for (key, probe) in probes {
            let time = probe
                .join()
                .unwrap_or(self.check_alive_threshold + Duration::from_millis(1));
            times.insert(key, time);
        }

        let mut ranked: Vec<(PeerContact, SocketAddr)> = contacts
            .into_iter()
            .filter(|contact| {
                times
                    .get(&endpoint_key(contact))
                    .map(|time| *time <= self.check_alive_threshold)
                    .unwrap_or(false)
            })
            .filter_map(|contact| {
                let addr = endpoints.get(&endpoint_key(&contact)).cloned().flatten()?;
                Some((contact, addr))
            })
            .collect();
        ranked.sort_by_key(|(contact, _)| times[&endpoint_key(contact)]);
        ranked
    }
}

fn endpoint_key(contact: &PeerContact) -> String {
    format!("{}:{}", contact.host, contact.port)
}

fn resolve(contact: &PeerContact) -> Option<SocketAddr> {
    (contact.host.as_str(), contact.port)
        .to_socket_addrs()
        .ok()?
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::time::Instant;

    #[test]
    fn test_search_failure_is_terminal_without_acknowledge() {
        // Nothing listens on the tracker address: the search errors out
        // and the scheduler must go FAILED with the ack untouched.
        let scheduler = DownloadScheduler::new(
            "127.0.0.1:1".parse().unwrap(),
            1,
            "a.bin",
            env::temp_dir(),
            Duration::from_millis(100),
        );

        let record = scheduler.run();

        assert_eq!(record.download_status, DownloadStatus::Failed);
        assert_eq!(record.ack_status, DownloadStatus::Unknown);
        assert!(record.provider.is_none());
    }

    #[test]
    fn test_dead_providers_are_discarded() {
        let scheduler = DownloadScheduler::new(
            "127.0.0.1:1".parse().unwrap(),
            1,
            "a.bin",
            env::temp_dir(),
            Duration::from_millis(100),
        );
        let contacts = vec![
            PeerContact::new("u1", "127.0.0.1", 1),
            PeerContact::new("u2", "127.0.0.1", 1),
        ];

        let started = Instant::now();
        let ranked = scheduler.rank_providers(contacts);

        assert!(ranked.is_empty());
        // Probes ran in parallel against one distinct endpoint.
        assert!(started.elapsed() < Duration::from_millis(100) * 4);
    }

    #[test]
    fn test_download_writes_next_to_the_shared_files() {
        let dir = env::temp_dir().join("fspeer_scheduler_save");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        save_downloaded_file(&dir, "got.bin", b"bytes").unwrap();

        assert_eq!(fs::read(dir.join("got.bin")).unwrap(), b"bytes");
        fs::remove_dir_all(dir).unwrap();
    }
}
