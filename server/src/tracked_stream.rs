use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

/// A `TcpStream` that stamps a shared activity timestamp on every
/// successful read and write, so the cleaner can tell how long the
/// connection has been idle.
pub struct TrackedStream {
    stream: TcpStream,
    last_active: Arc<Mutex<DateTime<Local>>>,
}

impl TrackedStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            last_active: Arc::new(Mutex::new(Local::now())),
        }
    }

    /// Shared handle to the activity timestamp, held by the worker bag.
    pub fn last_active(&self) -> Arc<Mutex<DateTime<Local>>> {
        self.last_active.clone()
    }

    /// Clone of the underlying socket for the cleaner to shut down.
    pub fn try_clone_inner(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn stamp(&self) {
        if let Ok(mut last_active) = self.last_active.lock() {
            *last_active = Local::now();
        }
    }
}

impl Read for TrackedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.stream.read(buf)?;
        self.stamp();
        Ok(read)
    }
}

impl Write for TrackedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.stream.write(buf)?;
        self.stamp();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn test_read_and_write_stamp_activity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"pong").unwrap();
        });

        let mut tracked = TrackedStream::new(TcpStream::connect(addr).unwrap());
        let before = *tracked.last_active().lock().unwrap();

        let mut buffer = [0u8; 4];
        tracked.read_exact(&mut buffer).unwrap();
        join.join().unwrap();

        let after = *tracked.last_active().lock().unwrap();
        assert!(after >= before);
        assert_eq!(&buffer, b"pong");
    }
}
