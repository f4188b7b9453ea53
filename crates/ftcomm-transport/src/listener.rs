//! Accept loop for the server side.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, TransportError};

/// Called on the listener thread for every accepted socket.
pub type AcceptHandler = dyn Fn(TcpStream, SocketAddr) + Send + Sync;

/// A bound, non-blocking listening socket and its accept thread.
#[derive(Debug)]
pub struct Listener {
    socket: Arc<TcpListener>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept thread; `poll_timeout` bounds how long stop waits for it.
    pub fn start(&self, handler: Arc<AcceptHandler>, poll_timeout: Duration) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(TransportError::InvalidState("listener already started".into()));
        }
        self.running.store(true, Ordering::Release);
        let socket = self.socket.clone();
        let running = self.running.clone();
        let local_addr = self.local_addr;
        let handle = thread::Builder::new()
            .name("ftcomm-listener".to_string())
            .spawn(move || accept_loop(&socket, &running, &*handler, poll_timeout, local_addr))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                TransportError::Io(e)
            })?;
        *thread = Some(handle);
        tracing::info!(addr = %self.local_addr, "listening");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("listener thread panicked");
            }
        }
    }

    pub fn stop_after_fork(&self) {
        self.running.store(false, Ordering::Release);
        drop(self.thread.lock().take());
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    socket: &TcpListener,
    running: &AtomicBool,
    handler: &AcceptHandler,
    poll_timeout: Duration,
    local_addr: SocketAddr,
) {
    let timeout_ms = poll_timeout.as_millis().min(i32::MAX as u128) as i32;
    while running.load(Ordering::Acquire) {
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                tracing::error!(addr = %local_addr, error = %err, "poll on listener failed");
                thread::sleep(poll_timeout);
            }
            continue;
        }
        if rc == 0 || pfd.revents & libc::POLLIN == 0 {
            continue;
        }
        loop {
            match socket.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    handler(stream, peer);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(addr = %local_addr, error = %err, "accept failed");
                    break;
                }
            }
        }
    }
    tracing::info!(addr = %local_addr, "listener stopped");
}
