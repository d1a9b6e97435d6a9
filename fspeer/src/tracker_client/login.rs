use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

use wire::message::{read_reply, Message, Request, RequestKind};
use wire::payload::{decode_session_id, Credentials, PeerAnnouncement};

use super::client::TrackerClientError;

// Upper bound on every wait of the handshake, so neither the client
// thread nor the peer thread can hang forever on a dead counterpart.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the client thread learned in login step 1.
#[derive(Debug, Clone, Copy)]
pub struct StepOne {
    pub session_id: i32,
    /// Local address of the tracker connection; the host the peer
    /// announces its server under.
    pub local_ip: IpAddr,
}

#[derive(Default)]
struct HandshakeState {
    // Outer None: step 1 still pending. Inner None: step 1 failed.
    step_one: Option<Option<StepOne>>,
    announcement: Option<PeerAnnouncement>,
    aborted: bool,
}

/// The rendezvous between the login client thread and the peer command
/// thread: one lock, two signals. "Step-1 done" travels from client to
/// peer; "server ready" (or "aborted") travels back. The announcement
/// is never sent before the peer thread has confirmed the server's
/// bound address.
pub struct LoginHandshake {
    state: Mutex<HandshakeState>,
    step_one_done: Condvar,
    server_ready: Condvar,
}

impl Default for LoginHandshake {
    fn default() -> Self {
        Self {
            state: Mutex::new(HandshakeState::default()),
            step_one_done: Condvar::new(),
            server_ready: Condvar::new(),
        }
    }
}

impl LoginHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the step-1 outcome. Only the first call wins, so a
    /// late error path cannot clobber a delivered session id.
    fn complete_step_one(&self, result: Option<StepOne>) {
        if let Ok(mut state) = self.state.lock() {
            if state.step_one.is_none() {
                state.step_one = Some(result);
            }
        }
        self.step_one_done.notify_all();
    }

    /// Blocks the peer thread until the client reports step 1, for at
    /// most the handshake timeout. `None` means the login already
    /// failed.
    pub fn wait_step_one(&self) -> Option<StepOne> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return None,
        };
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while state.step_one.is_none() {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return None,
            };
            state = match self.step_one_done.wait_timeout(state, remaining) {
                Ok((state, _)) => state,
                Err(_) => return None,
            };
        }
        state.step_one.flatten()
    }

    /// Called by the peer thread once its server is listening; unblocks
    /// the client so it can send the announcement.
    pub fn server_is_ready(&self, announcement: PeerAnnouncement) {
        if let Ok(mut state) = self.state.lock() {
            state.announcement = Some(announcement);
        }
        self.server_ready.notify_all();
    }

    /// Called by the peer thread when the server could not be started;
    /// the client gives up instead of announcing.
    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.server_ready.notify_all();
    }

    fn wait_server_ready(&self) -> Option<PeerAnnouncement> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return None,
        };
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while state.announcement.is_none() && !state.aborted {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return None,
            };
            state = match self.server_ready.wait_timeout(state, remaining) {
                Ok((state, _)) => state,
                Err(_) => return None,
            };
        }
        if state.aborted {
            return None;
        }
        state.announcement.take()
    }
}

/// The client half of the two-message login handshake, running on its
/// own thread so the peer thread stays free to start the server between
/// the two steps.
pub struct LoginClient {
    thread: JoinHandle<Result<i32, TrackerClientError>>,
}

impl LoginClient {
    pub fn spawn(
        tracker_addr: SocketAddr,
        credentials: Credentials,
        handshake: Arc<LoginHandshake>,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name("login client".to_string())
            .spawn(move || {
                let result = Self::run(tracker_addr, &credentials, &handshake);
                if result.is_err() {
                    // Whatever failed, the peer thread must not be left
                    // waiting on step 1.
                    handshake.complete_step_one(None);
                }
                result
            })?;
        Ok(Self { thread })
    }

    /// Waits for the client to finish and returns the session id the
    /// tracker confirmed.
    pub fn join(self) -> Result<i32, TrackerClientError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => {
                warn!("the login client thread panicked");
                Err(TrackerClientError::HandshakeFailed)
            }
        }
    }

    fn run(
        tracker_addr: SocketAddr,
        credentials: &Credentials,
        handshake: &LoginHandshake,
    ) -> Result<i32, TrackerClientError> {
        let mut stream = TcpStream::connect_timeout(&tracker_addr, HANDSHAKE_TIMEOUT)
            .map_err(TrackerClientError::ConnectError)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(TrackerClientError::SettingTimeoutError)?;

        Message::Request(Request::new(RequestKind::Login, credentials.as_bytes()))
            .write_to(&mut stream)
            .map_err(TrackerClientError::MessageError)?;
        let reply = read_reply(&mut stream).map_err(TrackerClientError::MessageError)?;
        if !reply.is_success() {
            handshake.complete_step_one(None);
            return Err(TrackerClientError::RequestRejected);
        }
        let session_id =
            decode_session_id(&reply.payload).map_err(TrackerClientError::PayloadError)?;
        let local_ip = stream
            .local_addr()
            .map(|addr| addr.ip())
            .map_err(TrackerClientError::ConnectError)?;

        handshake.complete_step_one(Some(StepOne {
            session_id,
            local_ip,
        }));

        let announcement = handshake
            .wait_server_ready()
            .ok_or(TrackerClientError::HandshakeFailed)?;

        Message::Request(Request::new(RequestKind::Login, announcement.as_bytes()))
            .write_to(&mut stream)
            .map_err(TrackerClientError::MessageError)?;
        let final_reply = read_reply(&mut stream).map_err(TrackerClientError::MessageError)?;
        if !final_reply.is_success() {
            return Err(TrackerClientError::RequestRejected);
        }
        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_step_one_signal_reaches_the_peer_thread() {
        let handshake = Arc::new(LoginHandshake::new());
        let handshake_clone = handshake.clone();
        let join = thread::spawn(move || {
            handshake_clone.complete_step_one(Some(StepOne {
                session_id: 7,
                local_ip: "127.0.0.1".parse().unwrap(),
            }));
        });

        let step_one = handshake.wait_step_one().unwrap();

        assert_eq!(step_one.session_id, 7);
        join.join().unwrap();
    }

    #[test]
    fn test_failed_step_one_is_none() {
        let handshake = LoginHandshake::new();

        handshake.complete_step_one(None);

        assert!(handshake.wait_step_one().is_none());
    }

    #[test]
    fn test_first_step_one_result_wins() {
        let handshake = LoginHandshake::new();
        handshake.complete_step_one(Some(StepOne {
            session_id: 7,
            local_ip: "127.0.0.1".parse().unwrap(),
        }));

        handshake.complete_step_one(None);

        assert_eq!(handshake.wait_step_one().unwrap().session_id, 7);
    }

    #[test]
    fn test_announcement_waits_for_server_ready() {
        let handshake = Arc::new(LoginHandshake::new());
        let handshake_clone = handshake.clone();
        let join = thread::spawn(move || handshake_clone.wait_server_ready());

        handshake.server_is_ready(PeerAnnouncement::new("127.0.0.1", 4000, HashSet::new()));

        let announcement = join.join().unwrap().unwrap();
        assert_eq!(announcement.port, 4000);
    }

    #[test]
    fn test_abort_unblocks_the_client() {
        let handshake = Arc::new(LoginHandshake::new());
        let handshake_clone = handshake.clone();
        let join = thread::spawn(move || handshake_clone.wait_server_ready());

        handshake.abort();

        assert!(join.join().unwrap().is_none());
    }
}
