//! Stoppable background threads
//!
//! Accept and discovery loops poll with a short timeout and exit once their
//! `running` flag drops. Stopping waits a bounded time for the thread; a
//! worker that has not exited by then is detached and left to finish on its
//! own.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a bounded join re-checks the thread
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn a named thread running `body` until the flag it is handed drops
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))?;

        Ok(Self {
            name,
            running,
            handle,
        })
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    /// Drop the running flag without waiting
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Signal the loop to exit and wait up to `timeout` for it
    ///
    /// Returns true if the thread exited in time.
    pub fn stop(self, timeout: Duration) -> bool {
        self.request_stop();

        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Worker '{}' did not stop within {:?}, detaching",
                    self.name,
                    timeout
                );
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if self.handle.join().is_err() {
            log::error!("Worker '{}' panicked", self.name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stops_cooperative_loop() {
        let worker = Worker::spawn("test-loop", |running| {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert!(worker.is_running());
        assert!(worker.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_worker_stop_is_bounded() {
        let worker = Worker::spawn("test-stuck", |_| {
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

        let started = Instant::now();
        assert!(!worker.stop(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
