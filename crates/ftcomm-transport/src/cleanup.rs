//! Deferred close of broken links.
//!
//! A broken link may still be referenced by a worker that is in the middle of
//! handling one of its events. Closing the descriptor right away would let the
//! kernel hand the same number to a new connection while that stale reference
//! is still in use, so the fd is released only after a grace period.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TransportError};
use crate::link::Link;

const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct CleanupQueue {
    pending: VecDeque<(Instant, Arc<Link>)>,
    running: bool,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<CleanupQueue>,
    wakeup: Condvar,
}

/// Background closer for broken links.
#[derive(Debug)]
pub struct DelayCleanup {
    delay: Duration,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DelayCleanup {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            shared: Arc::new(Shared::default()),
            thread: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(TransportError::InvalidState("cleanup already started".into()));
        }
        self.shared.queue.lock().running = true;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("ftcomm-cleanup".to_string())
            .spawn(move || run(shared))
            .map_err(|e| {
                self.shared.queue.lock().running = false;
                TransportError::Io(e)
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Queues `link` for close; closes immediately when the thread is not running.
    pub fn schedule(&self, link: Arc<Link>) {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            drop(queue);
            link.close();
            return;
        }
        queue.pending.push_back((Instant::now() + self.delay, link));
        self.shared.wakeup.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Stops the thread and closes everything still queued.
    pub fn stop(&self) {
        self.shared.queue.lock().running = false;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("cleanup thread panicked");
            }
        }
        self.flush();
    }

    /// Like [`DelayCleanup::stop`] without the join.
    pub fn stop_after_fork(&self) {
        self.shared.queue.lock().running = false;
        drop(self.thread.lock().take());
        self.flush();
    }

    fn flush(&self) {
        let drained: Vec<_> = self.shared.queue.lock().pending.drain(..).collect();
        for (_, link) in drained {
            link.close();
        }
    }
}

impl Drop for DelayCleanup {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    tracing::debug!("cleanup thread started");
    let mut queue = shared.queue.lock();
    while queue.running {
        let now = Instant::now();
        match queue.pending.front().map(|(deadline, _)| *deadline) {
            Some(deadline) if deadline <= now => {
                if let Some((_, link)) = queue.pending.pop_front() {
                    drop(queue);
                    link.close();
                    queue = shared.queue.lock();
                }
            }
            Some(deadline) => {
                shared.wakeup.wait_until(&mut queue, deadline);
            }
            None => {
                shared.wakeup.wait_for(&mut queue, IDLE_WAIT);
            }
        }
    }
    tracing::debug!("cleanup thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportOptions;
    use crate::link::PendingLink;
    use std::net::{TcpListener, TcpStream};

    fn link() -> (Arc<Link>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (
            PendingLink::new(stream, peer)
                .establish(&TransportOptions::default())
                .unwrap(),
            remote,
        )
    }

    #[test]
    fn test_closes_after_delay() {
        let cleanup = DelayCleanup::new(Duration::from_millis(50));
        cleanup.start().unwrap();
        let (link, _remote) = link();
        cleanup.schedule(link.clone());
        assert!(link.is_open());
        assert_eq!(cleanup.pending(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while link.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!link.is_open());
        assert_eq!(cleanup.pending(), 0);
        cleanup.stop();
    }

    #[test]
    fn test_stop_flushes_pending() {
        let cleanup = DelayCleanup::new(Duration::from_secs(3600));
        cleanup.start().unwrap();
        let (link, _remote) = link();
        cleanup.schedule(link.clone());
        cleanup.stop();
        assert!(!link.is_open());
    }

    #[test]
    fn test_not_running_closes_now() {
        let cleanup = DelayCleanup::new(Duration::from_secs(3600));
        let (link, _remote) = link();
        cleanup.schedule(link.clone());
        assert!(!link.is_open());
    }
}
