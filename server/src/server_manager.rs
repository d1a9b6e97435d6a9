use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use wire::message::Request;

use crate::cleaner::Cleaner;
use crate::server_error::ServerError;
use crate::tracked_stream::TrackedStream;
use crate::worker::{attend_connection, ServerGroup, WorkerHandle};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Role-specific side of a connection. The server manager owns the
/// plumbing (accept, spawn, liveness replies, idle cleanup); the handler
/// owns the reply discipline for every other request type.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, stream: &mut TrackedStream);
}

/// One accept loop plus its worker bag and cleaner. The tracker runs
/// one of these for its whole life; a peer starts one per login and
/// stops it on logout.
pub struct ServerManager {
    local_addr: SocketAddr,
    group: Arc<ServerGroup>,
    accepting: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    cleaner: Cleaner,
}

impl ServerManager {
    /// Binds the listener and spawns the accept thread and the cleaner.
    /// Bind to port 0 to let the OS pick a free port; `local_addr`
    /// reports the effective one.
    pub fn start(
        bind_addr: &str,
        handler: Arc<dyn Handler>,
        cleaning_interval: Duration,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(bind_addr).map_err(ServerError::BindError)?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddrError)?;

        let group = Arc::new(ServerGroup::default());
        let accepting = Arc::new(AtomicBool::new(true));

        let cleaner = Cleaner::spawn(group.clone(), cleaning_interval);

        let accept_group = group.clone();
        let accept_flag = accepting.clone();
        let accept_thread = thread::Builder::new()
            .name(format!("accept loop {}", local_addr))
            .spawn(move || {
                Self::accept_loop(listener, accept_group, accept_flag, handler);
            })
            .map_err(ServerError::SpawnError)?;

        info!("serving on {}", local_addr);

        Ok(Self {
            local_addr,
            group,
            accepting,
            accept_thread: Some(accept_thread),
            cleaner,
        })
    }

    fn accept_loop(
        listener: TcpListener,
        group: Arc<ServerGroup>,
        accepting: Arc<AtomicBool>,
        handler: Arc<dyn Handler>,
    ) {
        for stream in listener.incoming() {
            if !accepting.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(err) = Self::spawn_worker(stream, &group, &handler) {
                        warn!("could not attend an incoming connection: {:?}", err);
                    }
                }
                Err(err) => warn!("could not accept an incoming connection: {:?}", err),
            }
        }
    }

    fn spawn_worker(
        stream: TcpStream,
        group: &Arc<ServerGroup>,
        handler: &Arc<dyn Handler>,
    ) -> Result<(), ServerError> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());

        let tracked = TrackedStream::new(stream);
        let socket_clone = tracked
            .try_clone_inner()
            .map_err(ServerError::SpawnError)?;
        let last_active = tracked.last_active();

        let handler_clone = handler.clone();
        let thread = thread::Builder::new()
            .name(format!("connection worker {}", peer))
            .spawn(move || attend_connection(tracked, handler_clone))
            .map_err(ServerError::SpawnError)?;

        group.register(WorkerHandle::new(socket_clone, last_active, thread))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_workers(&self) -> Result<usize, ServerError> {
        self.group.active_workers()
    }

    /// Stops accepting new connections, lets the in-flight workers run
    /// to completion and then interrupts the cleaner.
    pub fn drain(&mut self) -> Result<(), ServerError> {
        self.stop_accepting();
        while self.group.active_workers()? > 0 {
            thread::sleep(DRAIN_POLL);
        }
        self.cleaner.stop();
        self.join_accept_thread();
        info!("server on {} drained", self.local_addr);
        Ok(())
    }

    /// Forced close: every worker has its socket shut down and its
    /// blocked read unwinds with an error.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        self.stop_accepting();
        self.cleaner.stop();
        self.group.shutdown_all()?;
        self.group.join_all()?;
        self.join_accept_thread();
        info!("server on {} stopped", self.local_addr);
        Ok(())
    }

    fn stop_accepting(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        // accept() has no portable interruption; a throwaway connection
        // wakes the loop so it can observe the flag and break.
        let wake_addr = match self.local_addr.ip() {
            ip if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port())
            }
            _ => self.local_addr,
        };
        let _ = TcpStream::connect(wake_addr);
    }

    fn join_accept_thread(&mut self) {
        if let Some(thread) = self.accept_thread.take() {
            if thread.join().is_err() {
                warn!("the accept thread panicked");
            }
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        if self.accepting.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wire::message::{read_reply, Message, Reply, ReplyStatus, RequestKind};

    struct EchoHandler;

    impl Handler for EchoHandler {
        fn handle(&self, request: Request, stream: &mut TrackedStream) {
            let _ = Message::Reply(Reply::success(request.payload)).write_to(stream);
        }
    }

    #[test]
    fn test_check_alive_is_answered_by_the_plumbing() {
        let mut server = start_echo_server(Duration::from_secs(20));

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        Message::Request(Request::empty(RequestKind::CheckAlive))
            .write_to(&mut stream)
            .unwrap();
        let reply = read_reply(&mut stream).unwrap();

        assert_eq!(reply.status, ReplyStatus::Success);
        assert!(reply.payload.is_empty());
        server.stop().unwrap();
    }

    #[test]
    fn test_dispatched_request_reaches_the_handler() {
        let mut server = start_echo_server(Duration::from_secs(20));

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        Message::Request(Request::new(RequestKind::Search, b"payload".to_vec()))
            .write_to(&mut stream)
            .unwrap();
        let reply = read_reply(&mut stream).unwrap();

        assert_eq!(reply.payload, b"payload");
        server.stop().unwrap();
    }

    #[test]
    fn test_unknown_request_type_gets_no_reply() {
        let mut server = start_echo_server(Duration::from_secs(20));

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        // class request, tag 42: not a protocol type.
        stream.write_all(&[0, 0, 0, 2, 0, 42]).unwrap();
        stream.flush().unwrap();

        let result = read_reply(&mut stream);

        // The worker closes the socket without replying.
        assert!(result.is_err());
        server.stop().unwrap();
    }

    #[test]
    fn test_drain_waits_for_quiet_group() {
        let mut server = start_echo_server(Duration::from_secs(20));

        server.drain().unwrap();

        assert_eq!(server.active_workers().unwrap(), 0);
    }

    #[test]
    fn test_idle_connection_is_cleaned() {
        let mut server = start_echo_server(Duration::from_millis(100));

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        // Send nothing: the worker blocks reading the frame length
        // until the cleaner shuts the socket down.
        thread::sleep(Duration::from_millis(400));

        let result = read_reply(&mut stream);

        assert!(result.is_err());
        assert_eq!(server.active_workers().unwrap(), 0);
        server.stop().unwrap();
    }

    // Auxiliary functions

    fn start_echo_server(cleaning_interval: Duration) -> ServerManager {
        ServerManager::start("127.0.0.1:0", Arc::new(EchoHandler), cleaning_interval).unwrap()
    }
}
