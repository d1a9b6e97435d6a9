use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use wire::message::{
    read_reply, Message, MessageError, Reply, Request, RequestKind,
};
use wire::payload::{
    decode_contacts, encode_session_id, AcknowledgeRequest, Credentials, PayloadError,
    PeerContact, SearchRequest, encode_filename,
};

// How long a one-shot round trip may wait for its reply. Unknown
// request types are never answered, so the client has to fail on its
// own clock.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// Added to the threshold when a probe errors or times out, so dead
// endpoints always sort after every live one.
const PROBE_PENALTY: Duration = Duration::from_millis(1);

/// Possible tracker client errors.
#[derive(Debug)]
pub enum TrackerClientError {
    ConnectError(io::Error),
    SettingTimeoutError(io::Error),
    MessageError(MessageError),
    PayloadError(PayloadError),
    /// The other end answered FAILURE: the operation was rejected, the
    /// connection itself is fine.
    RequestRejected,
    /// The login rendezvous was aborted before the announcement.
    HandshakeFailed,
}

/// One-shot request/reply round trips against the tracker. Every call
/// opens a fresh connection, sends a single request and reads a single
/// reply, which is the protocol's connection discipline for everything
/// but LOGIN.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    tracker_addr: SocketAddr,
}

impl TrackerClient {
    pub fn new(tracker_addr: SocketAddr) -> Self {
        Self { tracker_addr }
    }

    pub fn register(&self, credentials: &Credentials) -> Result<(), TrackerClientError> {
        let request = Request::new(RequestKind::Register, credentials.as_bytes());
        self.round_trip(request).map(|_| ())
    }

    pub fn logout(&self, session_id: i32) -> Result<(), TrackerClientError> {
        let request = Request::new(RequestKind::Logout, encode_session_id(session_id));
        self.round_trip(request).map(|_| ())
    }

    pub fn search(
        &self,
        session_id: i32,
        filename: &str,
    ) -> Result<Vec<PeerContact>, TrackerClientError> {
        let request = Request::new(
            RequestKind::Search,
            SearchRequest::new(session_id, filename).as_bytes(),
        );
        let reply = self.round_trip(request)?;
        decode_contacts(&reply.payload).map_err(TrackerClientError::PayloadError)
    }

    pub fn acknowledge(
        &self,
        session_id: i32,
        provider_username: &str,
        filename: &str,
    ) -> Result<(), TrackerClientError> {
        let request = Request::new(
            RequestKind::Acknowledge,
            AcknowledgeRequest::new(session_id, provider_username, filename).as_bytes(),
        );
        self.round_trip(request).map(|_| ())
    }

    fn round_trip(&self, request: Request) -> Result<Reply, TrackerClientError> {
        request_reply(&self.tracker_addr, request, REPLY_TIMEOUT)
    }
}

/// Connects, sends one request and reads one reply, bounded by the
/// given timeout on both the connect and the read.
pub fn request_reply(
    addr: &SocketAddr,
    request: Request,
    timeout: Duration,
) -> Result<Reply, TrackerClientError> {
    let mut stream =
        TcpStream::connect_timeout(addr, timeout).map_err(TrackerClientError::ConnectError)?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(TrackerClientError::SettingTimeoutError)?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(TrackerClientError::SettingTimeoutError)?;

    Message::Request(request)
        .write_to(&mut stream)
        .map_err(TrackerClientError::MessageError)?;
    let reply = read_reply(&mut stream).map_err(TrackerClientError::MessageError)?;
    if !reply.is_success() {
        return Err(TrackerClientError::RequestRejected);
    }
    Ok(reply)
}

/// Downloads a whole file from another peer.
pub fn simple_download(
    addr: &SocketAddr,
    filename: &str,
    timeout: Duration,
) -> Result<Vec<u8>, TrackerClientError> {
    let request = Request::new(RequestKind::SimpleDownload, encode_filename(filename));
    let reply = request_reply(addr, request, timeout)?;
    Ok(reply.payload)
}

/// Measures the round-trip time of a CHECK_ALIVE probe, bounded by the
/// threshold. Expiry or any error is not an error here, it is the
/// negative liveness signal: a time strictly greater than the
/// threshold.
pub fn check_alive(addr: &SocketAddr, threshold: Duration) -> Duration {
    let started = Instant::now();
    let outcome = request_reply(addr, Request::empty(RequestKind::CheckAlive), threshold);
    let elapsed = started.elapsed();
    match outcome {
        Ok(_) if elapsed <= threshold => elapsed,
        _ => threshold + PROBE_PENALTY,
    }
}
