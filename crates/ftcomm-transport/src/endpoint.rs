//! Machinery shared by the server and the client.
//!
//! An [`Endpoint`] owns the worker pool, the rank-to-link table, the delayed
//! cleanup thread and the handler table. Handlers are registered before
//! [`Endpoint::start`] and frozen afterwards; the workers call back into the
//! endpoint through a weak reference so dropping the owner tears everything
//! down.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::cleanup::DelayCleanup;
use crate::config::TransportOptions;
use crate::error::{Result, TransportError};
use crate::handler::{
    HandlerTable, RequestContext, RequestHandler, SendStatus, SentHandler, SentNotice,
};
use crate::link::{Link, PendingLink};
use crate::protocol::{ConnectRequest, ConnectResponse, ConnectResult, Frame, MessageType};
use crate::queue::QueueEntry;
use crate::selector::WorkerSelector;
use crate::tls::TlsProvider;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Point-in-time counters for an endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub links: usize,
    pub links_per_worker: Vec<usize>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped_frames: u64,
    pub unhandled_frames: u64,
    pub broken_links: u64,
    pub rejected_connects: u64,
    pub pending_cleanup: usize,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    dropped_frames: AtomicU64,
    unhandled_frames: AtomicU64,
    broken_links: AtomicU64,
    rejected_connects: AtomicU64,
}

pub struct Endpoint {
    role: &'static str,
    options: TransportOptions,
    state: Mutex<Lifecycle>,
    handlers: RwLock<HandlerTable>,
    links: Mutex<HashMap<u64, Arc<Link>>>,
    selector: RwLock<Option<WorkerSelector>>,
    cleanup: DelayCleanup,
    counters: Counters,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("state", &*self.state.lock())
            .field("links", &self.links.lock().len())
            .finish()
    }
}

impl Endpoint {
    pub fn new(role: &'static str, options: TransportOptions) -> Arc<Self> {
        let cleanup = DelayCleanup::new(options.cleanup_delay());
        Arc::new(Self {
            role,
            options,
            state: Mutex::new(Lifecycle::Created),
            handlers: RwLock::new(HandlerTable::default()),
            links: Mutex::new(HashMap::new()),
            selector: RwLock::new(None),
            cleanup,
            counters: Counters::default(),
        })
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == Lifecycle::Running
    }

    /// Fails unless the endpoint is still in its created state.
    pub fn ensure_startable(&self) -> Result<()> {
        let state = self.state.lock();
        if *state != Lifecycle::Created {
            return Err(TransportError::InvalidState(format!(
                "{} endpoint cannot start from {:?}",
                self.role, *state
            )));
        }
        Ok(())
    }

    /// Applies `f` to the handler table; fails once the endpoint has started.
    pub fn with_handlers<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HandlerTable) -> Result<()>,
    {
        let state = self.state.lock();
        if *state != Lifecycle::Created {
            return Err(TransportError::InvalidState(format!(
                "{} handlers are frozen after start",
                self.role
            )));
        }
        f(&mut self.handlers.write())
    }

    pub fn register_request_handler<F>(&self, msg_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(RequestContext) + Send + Sync + 'static,
    {
        let handler: Arc<RequestHandler> = Arc::new(handler);
        self.with_handlers(|table| table.register_request(msg_type, handler))
    }

    pub fn register_sent_handler<F>(&self, msg_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(SentNotice) + Send + Sync + 'static,
    {
        let handler: Arc<SentHandler> = Arc::new(handler);
        self.with_handlers(|table| table.register_sent(msg_type, handler))
    }

    /// Starts the cleanup thread and the workers, in that order.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != Lifecycle::Created {
            return Err(TransportError::InvalidState(format!(
                "{} endpoint cannot start from {:?}",
                self.role, *state
            )));
        }
        self.options.validate()?;
        self.cleanup.start()?;

        let mut workers = Vec::with_capacity(self.options.worker_count);
        for index in 0..self.options.worker_count {
            match self.spawn_worker(index) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    tracing::error!(role = self.role, worker = index, error = %err, "worker start failed");
                    for worker in &workers {
                        worker.stop();
                    }
                    self.cleanup.stop();
                    return Err(err);
                }
            }
        }
        *self.selector.write() = Some(WorkerSelector::new(workers, self.options.max_links_per_worker));
        *state = Lifecycle::Running;
        tracing::info!(
            role = self.role,
            workers = self.options.worker_count,
            max_links_per_worker = self.options.max_links_per_worker,
            "endpoint started"
        );
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> Result<Arc<Worker>> {
        let worker = Worker::new(index, &self.options)?;
        let weak = Arc::downgrade(self);
        worker.register_frame_handler(with_endpoint(&weak, |ep, link, frame| ep.dispatch_frame(link, frame)))?;
        worker.register_sent_handler(with_endpoint(&weak, |ep, link, entry| ep.dispatch_sent(link, entry)))?;
        worker.register_broken_handler(move |link, err| {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.on_link_broken(link, err);
            }
        })?;
        worker.start()?;
        Ok(worker)
    }

    /// Stops the workers, breaks every link, and closes what the cleanup thread still holds.
    pub fn stop(&self) {
        let workers = {
            let mut state = self.state.lock();
            if *state != Lifecycle::Running {
                return;
            }
            *state = Lifecycle::Stopped;
            self.selector.write().take()
        };
        if let Some(selector) = workers {
            for worker in selector.workers() {
                worker.stop();
            }
        }
        self.release_all();
        self.cleanup.stop();
        tracing::info!(role = self.role, "endpoint stopped");
    }

    /// Releases resources in a forked child without joining threads that only exist in the parent.
    pub fn stop_after_fork(&self) {
        {
            let mut state = self.state.lock();
            if *state != Lifecycle::Running {
                return;
            }
            *state = Lifecycle::Stopped;
        }
        if let Some(selector) = self.selector.write().take() {
            for worker in selector.workers() {
                worker.stop_after_fork();
            }
        }
        self.release_all();
        self.cleanup.stop_after_fork();
    }

    fn release_all(&self) {
        let links: Vec<_> = self.links.lock().drain().map(|(_, link)| link).collect();
        for link in links {
            if link.break_link() {
                self.fail_pending(&link);
            }
            link.close();
        }
    }

    /// Validates a connect request against magic, version and the connect hook.
    pub fn check_request(&self, request: &ConnectRequest, peer: &str) -> ConnectResult {
        if request.magic != self.options.magic {
            return ConnectResult::BadMagic;
        }
        if request.version != self.options.version {
            return ConnectResult::BadVersion;
        }
        let hook = self.handlers.read().connect_hook().cloned();
        match hook {
            Some(hook) => match hook(request, peer) {
                Ok(()) => ConnectResult::Accepted,
                Err(result) => result,
            },
            None => ConnectResult::Accepted,
        }
    }

    /// Runs the accepting side of the handshake on a freshly accepted socket.
    pub fn accept(&self, stream: TcpStream, peer: SocketAddr, tls: Option<&Arc<dyn TlsProvider>>) -> Result<Arc<Link>> {
        stream.set_nonblocking(false)?;
        let mut pending = PendingLink::new(stream, peer);
        pending.set_timeouts(Some(self.options.handshake_timeout()))?;
        let request = pending.recv_connect_request()?;
        if let Some(provider) = tls {
            let session = provider.accept(pending.stream())?;
            pending.set_tls(session);
        }
        pending.set_rank(request.rank_id);

        let verdict = self.check_request(&request, pending.peer());
        if verdict != ConnectResult::Accepted {
            return Err(self.reject(pending, verdict));
        }
        let Some(worker) = self.select_worker() else {
            return Err(self.reject(pending, ConnectResult::Saturated));
        };
        let established = pending
            .send_connect_response(&ConnectResponse {
                result: ConnectResult::Accepted,
            })
            .and_then(|()| pending.establish(&self.options));
        match established {
            Ok(link) => {
                self.install(link.clone(), &worker)?;
                tracing::info!(role = self.role, peer = %link.peer(), rank = link.rank(), link_id = link.id(), tls = link.is_tls(), "peer connected");
                Ok(link)
            }
            Err(err) => {
                worker.release_slot();
                Err(err)
            }
        }
    }

    fn reject(&self, mut pending: PendingLink, result: ConnectResult) -> TransportError {
        self.counters.rejected_connects.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(role = self.role, peer = %pending.peer(), rank = pending.rank(), result = ?result, "connect rejected");
        if let Err(err) = pending.send_connect_response(&ConnectResponse { result }) {
            tracing::debug!(peer = %pending.peer(), error = %err, "failed to send rejection");
        }
        TransportError::HandshakeRejected {
            peer: pending.peer().to_string(),
            result,
        }
    }

    /// Hands a link whose initiator-side handshake already succeeded to a worker.
    pub fn attach_outbound(&self, pending: PendingLink) -> Result<Arc<Link>> {
        let worker = self.select_worker().ok_or(TransportError::Saturated {
            capacity: self.options.max_links_per_worker,
        })?;
        match pending.establish(&self.options) {
            Ok(link) => {
                self.install(link.clone(), &worker)?;
                Ok(link)
            }
            Err(err) => {
                worker.release_slot();
                Err(err)
            }
        }
    }

    fn select_worker(&self) -> Option<Arc<Worker>> {
        self.selector.read().as_ref().and_then(|s| s.select())
    }

    /// Registers `link` with its reserved worker and publishes it under its rank.
    fn install(&self, link: Arc<Link>, worker: &Arc<Worker>) -> Result<()> {
        if let Err(err) = worker.add_link(link.clone()) {
            worker.release_slot();
            link.close();
            return Err(err);
        }
        let replaced = self.links.lock().insert(link.rank(), link.clone());
        if let Some(old) = replaced.filter(|old| old.id() != link.id()) {
            tracing::info!(role = self.role, rank = link.rank(), old_link = old.id(), new_link = link.id(), "link replaced");
            self.fail_link(&old, &TransportError::LinkBroken);
        }
        if !self.is_running() {
            // Raced with stop; nobody else will release this one.
            self.fail_link(&link, &TransportError::LinkBroken);
            return Err(TransportError::InvalidState(format!("{} endpoint stopped", self.role)));
        }
        Ok(())
    }

    /// Breaks `link` through its owning worker, or directly when it has none.
    pub fn fail_link(&self, link: &Arc<Link>, reason: &TransportError) {
        let owner = link.worker_index().and_then(|index| {
            self.selector
                .read()
                .as_ref()
                .and_then(|s| s.workers().get(index).cloned())
        });
        match owner {
            Some(worker) => worker.fail_link(link, reason),
            None => {
                if link.break_link() {
                    self.on_link_broken(link, reason);
                }
            }
        }
    }

    /// Runs once per link, on the caller that won `break_link`.
    fn on_link_broken(&self, link: &Arc<Link>, reason: &TransportError) {
        self.counters.broken_links.fetch_add(1, Ordering::Relaxed);
        self.counters
            .dropped_frames
            .fetch_add(link.dropped_frames(), Ordering::Relaxed);
        {
            let mut links = self.links.lock();
            if links.get(&link.rank()).is_some_and(|current| current.id() == link.id()) {
                links.remove(&link.rank());
            }
        }
        tracing::warn!(role = self.role, rank = link.rank(), link_id = link.id(), peer = %link.peer(), error = %reason, "link broken");

        self.fail_pending(link);
        let hook = self.handlers.read().broken_hook().cloned();
        if let Some(hook) = hook {
            hook(link.rank(), link.id());
        }
        self.cleanup.schedule(link.clone());
    }

    fn fail_pending(&self, link: &Arc<Link>) {
        for entry in link.drain_queue() {
            self.notify_sent(link, entry, SendStatus::Broken);
        }
    }

    fn dispatch_frame(&self, link: &Arc<Link>, frame: Frame) {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        let Some(msg_type) = frame.message_type() else {
            self.counters.unhandled_frames.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(role = self.role, rank = link.rank(), msg_type = frame.header.msg_type, "unknown message type");
            return;
        };
        let handler = self.handlers.read().request(msg_type).cloned();
        match handler {
            Some(handler) => handler(RequestContext::new(link.clone(), frame)),
            None => {
                self.counters.unhandled_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(role = self.role, rank = link.rank(), msg_type = ?msg_type, "no handler registered");
            }
        }
    }

    fn dispatch_sent(&self, link: &Arc<Link>, entry: QueueEntry) {
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        self.notify_sent(link, entry, SendStatus::Sent);
    }

    fn notify_sent(&self, link: &Arc<Link>, entry: QueueEntry, status: SendStatus) {
        let Some(msg_type) = entry.header().message_type() else {
            return;
        };
        let handler = self.handlers.read().sent(msg_type).cloned();
        if let Some(handler) = handler {
            let seq_no = entry.header().seq_no;
            handler(SentNotice {
                rank: link.rank(),
                link_id: link.id(),
                msg_type,
                seq_no,
                status,
                context: entry.into_context(),
            });
        }
    }

    pub fn link(&self, rank: u64) -> Option<Arc<Link>> {
        self.links.lock().get(&rank).cloned()
    }

    pub fn connected_ranks(&self) -> Vec<u64> {
        let mut ranks: Vec<_> = self.links.lock().keys().copied().collect();
        ranks.sort_unstable();
        ranks
    }

    /// Queues a message for `rank`; returns its sequence number.
    pub fn send(&self, rank: u64, msg_type: MessageType, body: Bytes, context: Option<Bytes>) -> Result<u32> {
        self.send_with_result(rank, msg_type, 0, body, context)
    }

    pub fn send_with_result(
        &self,
        rank: u64,
        msg_type: MessageType,
        result: i16,
        body: Bytes,
        context: Option<Bytes>,
    ) -> Result<u32> {
        let link = self.link(rank).ok_or(TransportError::NotConnected { rank })?;
        link.enqueue(msg_type, result, body, context)
    }

    /// Sends the same body to every rank; `context` builds the per-rank callback context.
    pub fn broadcast<F>(&self, ranks: &[u64], msg_type: MessageType, body: Bytes, context: F) -> Vec<(u64, Result<u32>)>
    where
        F: Fn(u64) -> Option<Bytes>,
    {
        ranks
            .iter()
            .map(|&rank| (rank, self.send(rank, msg_type, body.clone(), context(rank))))
            .collect()
    }

    pub fn stats(&self) -> EndpointStats {
        let links: Vec<_> = self.links.lock().values().cloned().collect();
        let live_dropped: u64 = links.iter().map(|l| l.dropped_frames()).sum();
        let links_per_worker = self
            .selector
            .read()
            .as_ref()
            .map(|s| s.workers().iter().map(|w| w.link_count()).collect())
            .unwrap_or_default();
        EndpointStats {
            links: links.len(),
            links_per_worker,
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed) + live_dropped,
            unhandled_frames: self.counters.unhandled_frames.load(Ordering::Relaxed),
            broken_links: self.counters.broken_links.load(Ordering::Relaxed),
            rejected_connects: self.counters.rejected_connects.load(Ordering::Relaxed),
            pending_cleanup: self.cleanup.pending(),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Adapts an endpoint method into a worker callback holding only a weak reference.
fn with_endpoint<A, F>(weak: &Weak<Endpoint>, f: F) -> impl Fn(&Arc<Link>, A) + Send + Sync + 'static
where
    F: Fn(&Endpoint, &Arc<Link>, A) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |link: &Arc<Link>, arg: A| {
        if let Some(endpoint) = weak.upgrade() {
            f(&endpoint, link, arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEFAULT_MAGIC, DEFAULT_VERSION};

    fn endpoint() -> Arc<Endpoint> {
        Endpoint::new(
            "test",
            TransportOptions {
                worker_count: 2,
                poll_timeout_ms: 10,
                cleanup_delay_ms: 10,
                ..TransportOptions::default()
            },
        )
    }

    #[test]
    fn test_handlers_frozen_after_start() {
        let ep = endpoint();
        ep.register_request_handler(MessageType::Pause, |_| {}).unwrap();
        ep.start().unwrap();
        assert!(matches!(
            ep.register_request_handler(MessageType::Resume, |_| {}),
            Err(TransportError::InvalidState(_))
        ));
        assert!(ep.start().is_err());
        ep.stop();
        assert!(!ep.is_running());
    }

    #[test]
    fn test_check_request() {
        let ep = endpoint();
        ep.with_handlers(|t| {
            t.set_connect_hook(Arc::new(|req: &ConnectRequest, _: &str| {
                if req.rank_id == 13 {
                    Err(ConnectResult::Rejected)
                } else {
                    Ok(())
                }
            }))
        })
        .unwrap();
        let mut req = ConnectRequest {
            magic: DEFAULT_MAGIC,
            version: DEFAULT_VERSION,
            rank_id: 1,
        };
        assert_eq!(ep.check_request(&req, "p"), ConnectResult::Accepted);
        req.rank_id = 13;
        assert_eq!(ep.check_request(&req, "p"), ConnectResult::Rejected);
        req.magic = 1;
        assert_eq!(ep.check_request(&req, "p"), ConnectResult::BadMagic);
        req.magic = DEFAULT_MAGIC;
        req.version = 99;
        assert_eq!(ep.check_request(&req, "p"), ConnectResult::BadVersion);
    }

    #[test]
    fn test_send_to_unknown_rank() {
        let ep = endpoint();
        ep.start().unwrap();
        assert!(matches!(
            ep.send(7, MessageType::Pause, Bytes::new(), None),
            Err(TransportError::NotConnected { rank: 7 })
        ));
        let results = ep.broadcast(&[1, 2], MessageType::Exit, Bytes::new(), |_| None);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_err()));
        let stats = ep.stats();
        assert_eq!(stats.links, 0);
        assert_eq!(stats.links_per_worker, vec![0, 0]);
    }
}
