use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::{DateTime, Duration, Local};
use tracing::warn;

use wire::message::{read_request, Message, MessageError, Reply, RequestKind};

use crate::server_error::ServerError;
use crate::server_manager::Handler;
use crate::tracked_stream::TrackedStream;

/// Bookkeeping entry for one spawned connection worker: a clone of its
/// socket (the sole way to terminate it), its activity stamp and its
/// join handle.
pub struct WorkerHandle {
    stream: TcpStream,
    last_active: Arc<Mutex<DateTime<Local>>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(
        stream: TcpStream,
        last_active: Arc<Mutex<DateTime<Local>>>,
        thread: JoinHandle<()>,
    ) -> Self {
        Self {
            stream,
            last_active,
            thread: Some(thread),
        }
    }

    fn is_finished(&self) -> bool {
        match &self.thread {
            Some(thread) => thread.is_finished(),
            None => true,
        }
    }

    fn idle_for(&self, now: DateTime<Local>) -> Duration {
        match self.last_active.lock() {
            Ok(last_active) => now.signed_duration_since(*last_active),
            // A worker panicked while stamping; treat it as idle beyond
            // any threshold so the cleaner closes the socket.
            Err(_) => Duration::days(36500),
        }
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// The bag of live workers belonging to one accept loop.
pub struct ServerGroup {
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Default for ServerGroup {
    fn default() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl ServerGroup {
    pub fn register(&self, handle: WorkerHandle) -> Result<(), ServerError> {
        self.lock_workers()?.push(handle);
        Ok(())
    }

    /// Number of workers still running. Finished ones are pruned on the
    /// way, so the count does not grow with connection history.
    pub fn active_workers(&self) -> Result<usize, ServerError> {
        let mut workers = self.lock_workers()?;
        workers.retain(|worker| !worker.is_finished());
        Ok(workers.len())
    }

    /// Closes the socket of every worker idle for longer than the
    /// threshold. The blocked read on the worker side unwinds with an
    /// error, which is the sole termination mechanism.
    pub fn evict_idle(&self, threshold: Duration) -> Result<usize, ServerError> {
        let mut workers = self.lock_workers()?;
        workers.retain(|worker| !worker.is_finished());
        let now = Local::now();
        let mut evicted = 0;
        for worker in workers.iter() {
            if worker.idle_for(now) > threshold {
                worker.shutdown();
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    pub fn shutdown_all(&self) -> Result<(), ServerError> {
        for worker in self.lock_workers()?.iter() {
            worker.shutdown();
        }
        Ok(())
    }

    pub fn join_all(&self) -> Result<(), ServerError> {
        let mut workers = self.lock_workers()?;
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!("a connection worker panicked before shutdown");
                }
            }
        }
        workers.clear();
        Ok(())
    }

    fn lock_workers(&self) -> Result<MutexGuard<Vec<WorkerHandle>>, ServerError> {
        self.workers
            .lock()
            .map_err(|_| ServerError::PoisonedGroupLock)
    }
}

/// Body of a connection worker: reads exactly one request and disposes
/// of it. CHECK_ALIVE is answered here; unknown request types are
/// dropped without a reply; everything else goes to the role handler.
/// Returning closes the socket.
pub fn attend_connection(mut stream: TrackedStream, handler: Arc<dyn Handler>) {
    match read_request(&mut stream) {
        Ok(request) if request.kind == RequestKind::CheckAlive => {
            if let Err(err) = Message::Reply(Reply::success_empty()).write_to(&mut stream) {
                warn!("could not answer a liveness probe: {:?}", err);
            }
        }
        Ok(request) => handler.handle(request, &mut stream),
        Err(MessageError::UnknownRequestKind(tag)) => {
            warn!("ignoring request with unknown type {}", tag);
        }
        Err(MessageError::ConnectionClosed) => (),
        Err(err) => warn!("closing connection after malformed message: {:?}", err),
    }
}
