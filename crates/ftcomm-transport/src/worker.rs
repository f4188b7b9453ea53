//! Epoll worker: one thread multiplexing many links.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::TransportOptions;
use crate::epoll::{Epoll, ERROR_EVENTS};
use crate::error::{Result, TransportError};
use crate::framing::PollIn;
use crate::link::{Link, LinkId};
use crate::protocol::Frame;
use crate::queue::{PollOut, QueueEntry};

const MAX_EVENTS: usize = 256;

/// Called for every complete inbound frame.
pub type FrameCallback = dyn Fn(&Arc<Link>, Frame) + Send + Sync;
/// Called when a queued message has been fully written.
pub type SentCallback = dyn Fn(&Arc<Link>, QueueEntry) + Send + Sync;
/// Called once, by whoever won `break_link`, after the link left the worker.
pub type BrokenCallback = dyn Fn(&Arc<Link>, &TransportError) + Send + Sync;

/// Owns one epoll instance and the thread that waits on it.
pub struct Worker {
    index: usize,
    epoll: Arc<Epoll>,
    links: Mutex<HashMap<LinkId, Arc<Link>>>,
    // TLS links whose session may already hold decrypted bytes.
    pending_reads: Mutex<Vec<LinkId>>,
    bound: AtomicUsize,
    running: AtomicBool,
    poll_timeout: Duration,
    cpu: Option<usize>,
    on_frame: OnceLock<Box<FrameCallback>>,
    on_sent: OnceLock<Box<SentCallback>>,
    on_broken: OnceLock<Box<BrokenCallback>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("links", &self.link_count())
            .field("bound", &self.bound())
            .finish()
    }
}

impl Worker {
    pub fn new(index: usize, options: &TransportOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            index,
            epoll: Arc::new(Epoll::new()?),
            links: Mutex::new(HashMap::new()),
            pending_reads: Mutex::new(Vec::new()),
            bound: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            poll_timeout: options.poll_timeout(),
            cpu: options.cpu_for_worker(index),
            on_frame: OnceLock::new(),
            on_sent: OnceLock::new(),
            on_broken: OnceLock::new(),
            thread: Mutex::new(None),
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn slot_taken(&self, slot: &str) -> TransportError {
        TransportError::HandlerAlreadyRegistered {
            slot: format!("worker {} {slot}", self.index),
        }
    }

    pub fn register_frame_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Arc<Link>, Frame) + Send + Sync + 'static,
    {
        self.on_frame
            .set(Box::new(handler))
            .map_err(|_| self.slot_taken("new-request"))
    }

    pub fn register_sent_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Arc<Link>, QueueEntry) + Send + Sync + 'static,
    {
        self.on_sent
            .set(Box::new(handler))
            .map_err(|_| self.slot_taken("request-sent"))
    }

    pub fn register_broken_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Arc<Link>, &TransportError) + Send + Sync + 'static,
    {
        self.on_broken
            .set(Box::new(handler))
            .map_err(|_| self.slot_taken("link-broken"))
    }

    /// Spawns the poll thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(TransportError::InvalidState(format!(
                "worker {} already started",
                self.index
            )));
        }
        self.running.store(true, Ordering::Release);
        let worker = self.clone();
        let handle = thread::Builder::new()
            .name(format!("ftcomm-worker-{}", self.index))
            .spawn(move || worker.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                TransportError::Io(e)
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stops the thread, waits for it, and releases every link reference.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Stopped from one of our own callbacks; the loop exits on its own.
                drop(handle);
            } else if handle.join().is_err() {
                tracing::error!(worker = self.index, "worker thread panicked");
            }
        }
        self.release_links();
    }

    /// Drops link references without joining; the thread does not exist in a forked child.
    pub fn stop_after_fork(&self) {
        self.running.store(false, Ordering::Release);
        drop(self.thread.lock().take());
        self.release_links();
    }

    fn release_links(&self) {
        let links: Vec<_> = self.links.lock().drain().map(|(_, link)| link).collect();
        for link in links {
            link.detach();
            link.set_worker_index(None);
            self.release_slot();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Slots reserved through the selector, including in-flight handshakes.
    pub fn bound(&self) -> usize {
        self.bound.load(Ordering::Acquire)
    }

    /// Reserves one link slot if fewer than `capacity` are taken.
    pub fn try_reserve(&self, capacity: usize) -> bool {
        let mut current = self.bound.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                return false;
            }
            match self.bound.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_slot(&self) {
        let _ = self
            .bound
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Registers a link whose slot was already reserved.
    pub fn add_link(&self, link: Arc<Link>) -> Result<()> {
        link.set_worker_index(Some(self.index));
        // Insert first so an event arriving right after registration finds the link.
        self.links.lock().insert(link.id(), link.clone());
        if let Err(err) = link.attach(self.epoll.clone()) {
            self.links.lock().remove(&link.id());
            link.set_worker_index(None);
            return Err(err);
        }
        // The handshake may have pulled application records off the socket,
        // and no new edge will report them.
        if link.is_tls() {
            self.pending_reads.lock().push(link.id());
        }
        tracing::debug!(worker = self.index, link_id = link.id(), rank = link.rank(), "link added");
        Ok(())
    }

    /// Deregisters a link and frees its slot.
    pub fn remove_link(&self, id: LinkId) -> Option<Arc<Link>> {
        let link = self.links.lock().remove(&id)?;
        link.detach();
        link.set_worker_index(None);
        self.release_slot();
        tracing::debug!(worker = self.index, link_id = id, "link removed");
        Some(link)
    }

    /// Re-arms epoll interest for `link`.
    pub fn modify_link(&self, link: &Link) -> Result<()> {
        link.rearm()
    }

    /// Breaks `link`; the winner removes it and runs the broken callback.
    pub fn fail_link(&self, link: &Arc<Link>, reason: &TransportError) {
        if !link.break_link() {
            return;
        }
        tracing::debug!(worker = self.index, link_id = link.id(), rank = link.rank(), error = %reason, "link broken");
        self.remove_link(link.id());
        if let Some(callback) = self.on_broken.get() {
            callback(link, reason);
        }
    }

    fn run(self: Arc<Self>) {
        if let Some(cpu) = self.cpu {
            match pin_to_cpu(cpu) {
                Ok(()) => tracing::debug!(worker = self.index, cpu, "worker pinned"),
                Err(err) => tracing::warn!(worker = self.index, cpu, error = %err, "failed to pin worker"),
            }
        }
        tracing::info!(worker = self.index, "worker started");

        let timeout_ms = self.poll_timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while self.running.load(Ordering::Acquire) {
            let ready = match self.epoll.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(worker = self.index, error = %err, "epoll_wait failed");
                    thread::sleep(self.poll_timeout);
                    continue;
                }
            };
            for event in &events[..ready] {
                let token = event.u64;
                let flags = event.events;
                self.process_event(token, flags);
            }
            let pending = std::mem::take(&mut *self.pending_reads.lock());
            for token in pending {
                self.process_event(token, libc::EPOLLIN as u32);
            }
        }
        tracing::info!(worker = self.index, "worker stopped");
    }

    /// Handles one readiness notification for the link registered as `token`.
    pub fn process_event(&self, token: LinkId, flags: u32) {
        let Some(link) = self.links.lock().get(&token).cloned() else {
            return;
        };

        if flags & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
            loop {
                match link.handle_poll_in() {
                    PollIn::Ready(frame) => {
                        tracing::trace!(worker = self.index, link_id = token, msg_type = frame.header.msg_type, "frame received");
                        if let Some(callback) = self.on_frame.get() {
                            callback(&link, frame);
                        }
                    }
                    PollIn::NeedMore => break,
                    PollIn::Error(err) => {
                        self.fail_link(&link, &err);
                        return;
                    }
                }
            }
        }

        if flags & libc::EPOLLOUT as u32 != 0 {
            loop {
                match link.handle_poll_out() {
                    PollOut::Sent(entry) => {
                        if let Some(callback) = self.on_sent.get() {
                            callback(&link, entry);
                        }
                    }
                    PollOut::NeedMore | PollOut::Idle => break,
                    PollOut::Error(err) => {
                        self.fail_link(&link, &err);
                        return;
                    }
                }
            }
        }

        if flags & ERROR_EVENTS != 0 {
            self.fail_link(&link, &TransportError::LinkBroken);
            return;
        }

        if let Err(err) = self.modify_link(&link) {
            self.fail_link(&link, &err);
        }
    }
}

fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    // SAFETY: cpu_set_t is plain data; CPU_SET stays in bounds because option
    // validation caps cpu ids at CPU_SETSIZE.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
