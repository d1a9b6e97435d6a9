use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::worker::ServerGroup;

struct CleanerShared {
    stopped: Mutex<bool>,
    signal: Condvar,
}

/// Periodic maintenance thread of a server group. Wakes at a fixed
/// interval and closes every connection that has been idle for longer
/// than that same interval.
pub struct Cleaner {
    shared: Arc<CleanerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Cleaner {
    /// Spawns the cleaning loop for the given group.
    pub fn spawn(group: Arc<ServerGroup>, interval: Duration) -> Self {
        let shared = Arc::new(CleanerShared {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        });
        let shared_clone = shared.clone();
        let threshold = chrono::Duration::milliseconds(interval.as_millis() as i64);

        let thread = thread::spawn(move || loop {
            let stopped = match shared_clone.stopped.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            // wait_timeout instead of sleep so stop() interrupts the
            // cleaner without waiting out the interval.
            let (stopped, _timeout) = match shared_clone.signal.wait_timeout(stopped, interval) {
                Ok(result) => result,
                Err(_) => return,
            };
            if *stopped {
                break;
            }
            drop(stopped);

            match group.evict_idle(threshold) {
                Ok(evicted) if evicted > 0 => info!("cleaner closed {} idle connections", evicted),
                Ok(_) => (),
                Err(err) => warn!("cleaner could not inspect the worker group: {:?}", err),
            }
        });

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Interrupts the cleaning loop and joins it.
    pub fn stop(&mut self) {
        if let Ok(mut stopped) = self.shared.stopped.lock() {
            *stopped = true;
        }
        self.shared.signal.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("the cleaner thread panicked");
            }
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}
