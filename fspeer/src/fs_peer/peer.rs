use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use server::server_error::ServerError;
use server::server_manager::ServerManager;
use wire::payload::{Credentials, PeerAnnouncement};

use crate::config::cfg::Cfg;
use crate::download::scheduler::DownloadScheduler;
use crate::download::status::DownloadRecord;
use crate::file_server::handler::FileServerHandler;
use crate::shared_dir::manager::{holds_file, scan_directory};
use crate::tracker_client::client::TrackerClient;
use crate::tracker_client::login::{LoginClient, LoginHandshake};

struct PeerState {
    tracker_addr: Option<SocketAddr>,
    shared_dir: Option<PathBuf>,
    session_id: Option<i32>,
    server: Option<ServerManager>,
}

/// The peer command surface: holds the tracker address, the shared
/// directory, the live session id and the running file server, and
/// exposes the user operations on top of them.
///
/// Every user operation takes the configuration mutex with a try-lock
/// and fails fast on contention, so no user call can deadlock waiting
/// for another one. Every operation returns a bool: false means "this
/// attempt did not complete", the peer stays usable.
pub struct FsPeer {
    config: Cfg,
    state: Mutex<PeerState>,
    download_log: Arc<Mutex<Vec<DownloadRecord>>>,
    active_downloads: Arc<Mutex<HashSet<String>>>,
}

impl FsPeer {
    /// Builds a peer, seeding the tracker address and shared directory
    /// from whatever the config carries.
    pub fn new(config: Cfg) -> Self {
        let tracker_addr = if config.tracker_host.is_empty() {
            None
        } else {
            resolve_endpoint(&config.tracker_host, config.tracker_port)
        };
        let shared_dir = if config.shared_directory.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.shared_directory))
        };

        Self {
            config,
            state: Mutex::new(PeerState {
                tracker_addr,
                shared_dir,
                session_id: None,
                server: None,
            }),
            download_log: Arc::new(Mutex::new(Vec::new())),
            active_downloads: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn set_tracker(&self, host: &str, port: u16) -> bool {
        let mut state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        match resolve_endpoint(host, port) {
            Some(addr) => {
                state.tracker_addr = Some(addr);
                true
            }
            None => {
                warn!("could not resolve tracker endpoint {}:{}", host, port);
                false
            }
        }
    }

    pub fn set_shared_directory(&self, path: &Path) -> bool {
        let mut state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        if !path.is_dir() {
            warn!("shared directory {:?} does not exist", path);
            return false;
        }
        state.shared_dir = Some(path.to_path_buf());
        true
    }

    /// One-shot REGISTER round trip. No other state change.
    pub fn register(&self, credentials: &Credentials) -> bool {
        let state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        let tracker_addr = match state.tracker_addr {
            Some(addr) => addr,
            None => {
                warn!("no tracker configured");
                return false;
            }
        };
        match TrackerClient::new(tracker_addr).register(credentials) {
            Ok(()) => {
                info!("registered user {}", credentials.username);
                true
            }
            Err(err) => {
                warn!("register failed: {:?}", err);
                false
            }
        }
    }

    /// The two-step login. The client thread performs the handshake;
    /// this thread is the only one allowed to start the file server,
    /// and the client cannot announce until the server's bound address
    /// is confirmed back to it.
    pub fn login(&self, credentials: &Credentials) -> bool {
        let mut state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        if state.session_id.is_some() {
            warn!("already logged in");
            return false;
        }
        let tracker_addr = match state.tracker_addr {
            Some(addr) => addr,
            None => {
                warn!("no tracker configured");
                return false;
            }
        };
        let shared_dir = match state.shared_dir.clone() {
            Some(dir) => dir,
            None => {
                warn!("no shared directory configured");
                return false;
            }
        };

        let handshake = Arc::new(LoginHandshake::new());
        let client =
            match LoginClient::spawn(tracker_addr, credentials.clone(), handshake.clone()) {
                Ok(client) => client,
                Err(err) => {
                    warn!("could not spawn the login client: {}", err);
                    return false;
                }
            };

        let step_one = match handshake.wait_step_one() {
            Some(step_one) => step_one,
            None => {
                let _ = client.join();
                warn!("login rejected at step one for {}", credentials.username);
                return false;
            }
        };

        let mut server = match self.spawn_file_server(&shared_dir) {
            Ok(server) => server,
            Err(err) => {
                warn!("could not start the file server: {:?}", err);
                handshake.abort();
                let _ = client.join();
                return false;
            }
        };

        let files = match scan_directory(&shared_dir) {
            Ok(files) => files,
            Err(err) => {
                warn!("could not scan the shared directory: {}", err);
                handshake.abort();
                let _ = client.join();
                let _ = server.stop();
                return false;
            }
        };

        let announcement = PeerAnnouncement::new(
            &step_one.local_ip.to_string(),
            server.local_addr().port(),
            files,
        );
        handshake.server_is_ready(announcement);

        match client.join() {
            Ok(session_id) => {
                info!(
                    "user {} logged in with session {}",
                    credentials.username, session_id
                );
                state.session_id = Some(session_id);
                state.server = Some(server);
                true
            }
            Err(err) => {
                warn!("login failed for {}: {:?}", credentials.username, err);
                let _ = server.stop();
                false
            }
        }
    }

    /// Sends LOGOUT when logged in (or whenever a session id is still
    /// retained, under cooperative logout), and always stops the server
    /// and clears the session id. True only when both the server side
    /// and the local cleanup succeeded.
    pub fn logout(&self) -> bool {
        let mut state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        let session_id = state.session_id.take();
        let had_server = state.server.is_some();
        let server_stopped = match state.server.take() {
            Some(mut server) => server.stop().is_ok(),
            None => true,
        };

        let session_id = match session_id {
            Some(session_id) => session_id,
            None => {
                info!("not logged in");
                return false;
            }
        };
        if !had_server && !self.config.cooperative_logout {
            return false;
        }
        let tracker_addr = match state.tracker_addr {
            Some(addr) => addr,
            None => return false,
        };

        let remote_ok = match TrackerClient::new(tracker_addr).logout(session_id) {
            Ok(()) => true,
            Err(err) => {
                warn!("server side logout failed: {:?}", err);
                false
            }
        };
        remote_ok && server_stopped
    }

    /// Starts a download scheduler for the filename and lets it run on
    /// its own thread. A filename already held, or one with a scheduler
    /// still active, is ignored.
    pub fn add_download(&self, filename: &str) -> bool {
        let state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        let session_id = match state.session_id {
            Some(session_id) => session_id,
            None => {
                warn!("not logged in");
                return false;
            }
        };
        let tracker_addr = match state.tracker_addr {
            Some(addr) => addr,
            None => return false,
        };
        let shared_dir = match state.shared_dir.clone() {
            Some(dir) => dir,
            None => return false,
        };
        if holds_file(&shared_dir, filename) {
            info!("{} is already in the shared directory", filename);
            return false;
        }

        match self.active_downloads.lock() {
            Ok(mut active) => {
                if !active.insert(filename.to_string()) {
                    info!("a download of {} is already running", filename);
                    return false;
                }
            }
            Err(_) => return false,
        }

        let scheduler = DownloadScheduler::new(
            tracker_addr,
            session_id,
            filename,
            shared_dir,
            Duration::from_millis(self.config.check_alive_threshold_ms),
        );
        let download_log = self.download_log.clone();
        let active_downloads = self.active_downloads.clone();
        let filename_owned = filename.to_string();

        let spawned = thread::Builder::new()
            .name(format!("download {}", filename))
            .spawn(move || {
                let record = scheduler.run();
                if let Ok(mut log) = download_log.lock() {
                    log.push(record);
                }
                if let Ok(mut active) = active_downloads.lock() {
                    active.remove(&filename_owned);
                }
            });
        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!("could not spawn the download scheduler: {}", err);
                if let Ok(mut active) = self.active_downloads.lock() {
                    active.remove(filename);
                }
                false
            }
        }
    }

    /// Starts the file server outside of a login, for serving without a
    /// session.
    pub fn start_server(&self) -> bool {
        let mut state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        if state.server.is_some() {
            return false;
        }
        let shared_dir = match state.shared_dir.clone() {
            Some(dir) => dir,
            None => return false,
        };
        match self.spawn_file_server(&shared_dir) {
            Ok(server) => {
                state.server = Some(server);
                true
            }
            Err(err) => {
                warn!("could not start the file server: {:?}", err);
                false
            }
        }
    }

    pub fn stop_server(&self) -> bool {
        let mut state = match self.try_lock_state() {
            Some(state) => state,
            None => return false,
        };
        match state.server.take() {
            Some(mut server) => server.stop().is_ok(),
            None => false,
        }
    }

    pub fn session_id(&self) -> Option<i32> {
        self.state.lock().ok().and_then(|state| state.session_id)
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.server.as_ref().map(|server| server.local_addr()))
    }

    pub fn shared_dir(&self) -> Option<PathBuf> {
        self.state.lock().ok().and_then(|state| state.shared_dir.clone())
    }

    /// Snapshot of the download log, oldest first.
    pub fn download_log(&self) -> Vec<DownloadRecord> {
        match self.download_log.lock() {
            Ok(log) => log.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Whether a scheduler is still running for any filename.
    pub fn has_active_downloads(&self) -> bool {
        match self.active_downloads.lock() {
            Ok(active) => !active.is_empty(),
            Err(_) => false,
        }
    }

    fn spawn_file_server(&self, shared_dir: &Path) -> Result<ServerManager, ServerError> {
        ServerManager::start(
            "0.0.0.0:0",
            Arc::new(FileServerHandler::new(shared_dir.to_path_buf())),
            Duration::from_millis(self.config.cleaning_interval_ms),
        )
    }

    fn try_lock_state(&self) -> Option<MutexGuard<PeerState>> {
        match self.state.try_lock() {
            Ok(state) => Some(state),
            Err(_) => {
                warn!("another peer operation is in progress");
                None
            }
        }
    }
}

fn resolve_endpoint(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}
