//! Broadcast of control actions with two-phase acknowledgment.
//!
//! A call to [`ActionEngine::process`] sends one action to a set of ranks and
//! tracks, per rank and serial number, first that the transport wrote the
//! message (delivery) and then, optionally, that the rank answered (reply).
//! Ranks that stay silent are re-sent the action a bounded number of times;
//! ranks that answer with a failure status are never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ftcomm_transport::{SendStatus, SentNotice};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::action::{target_ranks, ActionInfo, Rank};
use crate::config::EngineConfig;
use crate::error::{ActionError, Result};
use crate::opcode::Opcode;
use crate::reply::{CallbackContext, ReplyPayload, ReplyParser};
use crate::status::{AtomicStatusVector, RecordOutcome, Status};
use crate::transport::ActionTransport;

/// Health verdict handed to the fault-tolerance layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankHealth {
    /// No delivery or no reply after every retry.
    NoResponse,
}

pub type RankStatusHandler = dyn Fn(Rank, RankHealth) + Send + Sync;

/// Summary of a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub opcode: Opcode,
    pub serial_number: i64,
    pub targets: Vec<Rank>,
    /// Reply rounds run, the first one included.
    pub rounds: u32,
    /// Messages handed to the transport per rank.
    pub sends: HashMap<Rank, u32>,
}

/// Clears the in-progress flag when dropped.
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InProgressGuard(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    broadcasts: AtomicU64,
    stale_callbacks: AtomicU64,
    malformed_replies: AtomicU64,
}

pub struct ActionEngine {
    transport: Arc<dyn ActionTransport>,
    config: EngineConfig,
    opcodes: RwLock<HashMap<Opcode, Option<Arc<ReplyParser>>>>,
    rank_status: OnceLock<Arc<RankStatusHandler>>,
    in_progress: AtomicBool,
    current: Mutex<Option<Opcode>>,
    delivery: AtomicStatusVector,
    replies: AtomicStatusVector,
    signal: Mutex<()>,
    wakeup: Condvar,
    counters: EngineCounters,
}

impl std::fmt::Debug for ActionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionEngine")
            .field("config", &self.config)
            .field("opcodes", &self.opcodes.read().keys().collect::<Vec<_>>())
            .field("in_progress", &self.in_progress.load(Ordering::Relaxed))
            .finish()
    }
}

impl ActionEngine {
    pub fn new(transport: Arc<dyn ActionTransport>, config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            transport,
            config,
            opcodes: RwLock::new(HashMap::new()),
            rank_status: OnceLock::new(),
            in_progress: AtomicBool::new(false),
            current: Mutex::new(None),
            delivery: AtomicStatusVector::new(),
            replies: AtomicStatusVector::new(),
            signal: Mutex::new(()),
            wakeup: Condvar::new(),
            counters: EngineCounters::default(),
        }))
    }

    /// An engine bound to `server` with every opcode enabled.
    pub fn with_server(server: Arc<ftcomm_transport::Server>, config: EngineConfig) -> Result<Arc<Self>> {
        let engine = Self::new(server.clone(), config)?;
        crate::transport::bind_server(&server, &engine)?;
        for opcode in Opcode::ALL {
            engine.register_opcode(opcode)?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Enables `opcode` with the default reply layout.
    pub fn register_opcode(&self, opcode: Opcode) -> Result<()> {
        let mut opcodes = self.opcodes.write();
        if opcodes.contains_key(&opcode) {
            return Err(ActionError::HandlerAlreadyRegistered {
                slot: format!("opcode {opcode}"),
            });
        }
        opcodes.insert(opcode, None);
        Ok(())
    }

    /// Installs a custom reply parser for an enabled opcode.
    pub fn register_reply_parser<F>(&self, opcode: Opcode, parser: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Option<ReplyPayload> + Send + Sync + 'static,
    {
        let mut opcodes = self.opcodes.write();
        match opcodes.get_mut(&opcode) {
            None => Err(ActionError::UnknownOpcode(opcode.to_string())),
            Some(Some(_)) => Err(ActionError::HandlerAlreadyRegistered {
                slot: format!("reply parser {opcode}"),
            }),
            Some(slot) => {
                *slot = Some(Arc::new(parser));
                Ok(())
            }
        }
    }

    pub fn register_rank_status_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(Rank, RankHealth) + Send + Sync + 'static,
    {
        self.rank_status
            .set(Arc::new(handler))
            .map_err(|_| ActionError::HandlerAlreadyRegistered {
                slot: "rank status".to_string(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Broadcasts `actions` under `serial_number` and waits for the outcome.
    ///
    /// With `wait_reply`, ranks that have not replied when the reply timeout
    /// expires are sent the action again, at most `retry_times` times.
    pub fn process(
        &self,
        opcode: Opcode,
        actions: &[ActionInfo],
        wait_reply: bool,
        serial_number: i64,
        retry_times: u32,
    ) -> Result<ActionReport> {
        let Some(_guard) = InProgressGuard::acquire(&self.in_progress) else {
            tracing::warn!(opcode = %opcode, sn = serial_number, "broadcast rejected, another one is in flight");
            return Err(ActionError::Busy);
        };
        if !self.opcodes.read().contains_key(&opcode) {
            return Err(ActionError::UnknownOpcode(opcode.to_string()));
        }
        let targets = target_ranks(actions);
        if targets.is_empty() {
            return Err(ActionError::NoTargets);
        }
        let expected = opcode.request_type();
        if let Some(action) = actions.iter().find(|a| a.message_type != expected) {
            return Err(ActionError::MessageTypeMismatch {
                opcode: opcode.to_string(),
                expected,
                found: action.message_type,
            });
        }

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(opcode = %opcode, sn = serial_number, ranks = targets.len(), wait_reply, retry_times, "broadcast started");
        *self.current.lock() = Some(opcode);
        self.replies.reset(serial_number, &targets);
        let outcome = self.run(opcode, actions, &targets, wait_reply, serial_number, retry_times);
        *self.current.lock() = None;
        outcome
    }

    fn run(
        &self,
        opcode: Opcode,
        actions: &[ActionInfo],
        targets: &[Rank],
        wait_reply: bool,
        serial_number: i64,
        retry_times: u32,
    ) -> Result<ActionReport> {
        let mut report = ActionReport {
            opcode,
            serial_number,
            targets: targets.to_vec(),
            rounds: 0,
            sends: HashMap::new(),
        };
        let reply_timeout = self.config.reply_timeouts.get(opcode);
        let mut pending = targets.to_vec();

        loop {
            report.rounds += 1;
            let undelivered = self.deliver(opcode, actions, &pending, serial_number, &mut report);
            let none_delivered = undelivered.len() == pending.len();
            pending = if wait_reply {
                // Nothing can answer if nothing arrived.
                if !none_delivered {
                    self.wait_for(reply_timeout, || self.replies.is_complete());
                }
                self.replies.pending()
            } else {
                undelivered
            };
            if pending.is_empty() || report.rounds > retry_times {
                break;
            }
            if none_delivered {
                // Unreachable ranks get one send timeout to reconnect.
                self.wait_for(self.config.send_timeout(), || false);
            }
            tracing::warn!(
                opcode = %opcode,
                sn = serial_number,
                round = report.rounds,
                missing = pending.len(),
                "ranks silent, retrying"
            );
        }

        if !pending.is_empty() {
            tracing::error!(opcode = %opcode, sn = serial_number, ranks = ?pending, "ranks unresponsive after retries");
            if let Some(handler) = self.rank_status.get() {
                for &rank in &pending {
                    handler(rank, RankHealth::NoResponse);
                }
            }
            return Err(ActionError::Unresponsive { ranks: pending });
        }
        if wait_reply {
            let failed = self.replies.failed();
            if !failed.is_empty() {
                tracing::warn!(opcode = %opcode, sn = serial_number, ranks = ?failed, "ranks replied with failure");
                return Err(ActionError::ReplyFailed { ranks: failed });
            }
        }
        tracing::info!(opcode = %opcode, sn = serial_number, rounds = report.rounds, "broadcast complete");
        Ok(report)
    }

    /// Sends to `ranks` until each has a transport completion or send retries run out.
    ///
    /// Returns the ranks whose message was not written.
    fn deliver(
        &self,
        opcode: Opcode,
        actions: &[ActionInfo],
        ranks: &[Rank],
        serial_number: i64,
        report: &mut ActionReport,
    ) -> Vec<Rank> {
        self.delivery.reset(serial_number, ranks);
        let mut to_send = ranks.to_vec();
        let mut round = 0;
        loop {
            self.send_round(opcode, actions, &to_send, serial_number, report);
            if self.wait_for(self.config.send_timeout(), || self.delivery.is_complete()) {
                break;
            }
            to_send = self.delivery.pending();
            if round >= self.config.send_retry_times {
                tracing::warn!(opcode = %opcode, sn = serial_number, ranks = ?to_send, "no send completion");
                break;
            }
            round += 1;
            tracing::debug!(opcode = %opcode, sn = serial_number, round, missing = to_send.len(), "re-sending");
        }
        let mut undelivered = self.delivery.failed();
        undelivered.extend(self.delivery.pending());
        undelivered.sort_unstable();
        undelivered
    }

    fn send_round(&self, opcode: Opcode, actions: &[ActionInfo], ranks: &[Rank], serial_number: i64, report: &mut ActionReport) {
        for action in actions {
            for &rank in action.ranks.iter().filter(|r| ranks.contains(r)) {
                let context = CallbackContext {
                    opcode,
                    rank,
                    serial_number,
                }
                .encode();
                *report.sends.entry(rank).or_default() += 1;
                if let Err(err) = self
                    .transport
                    .send_action(rank, action.message_type, action.payload.clone(), context)
                {
                    tracing::warn!(opcode = %opcode, sn = serial_number, rank, error = %err, "send failed");
                    self.delivery.record(rank, serial_number, Status::Failed);
                }
            }
        }
    }

    /// Waits until `done` holds or `timeout` passes; returns the final `done()`.
    fn wait_for<F: Fn() -> bool>(&self, timeout: Duration, done: F) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.signal.lock();
        loop {
            if done() {
                return true;
            }
            if self.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return done();
            }
        }
    }

    fn notify(&self) {
        let _guard = self.signal.lock();
        self.wakeup.notify_all();
    }

    /// Transport completion for a message sent with a callback context.
    pub fn handle_send_complete(&self, notice: &SentNotice) -> RecordOutcome {
        let Some(ctx) = notice.context.as_deref().and_then(CallbackContext::decode) else {
            return RecordOutcome::UnknownRank;
        };
        let status = match notice.status {
            SendStatus::Sent => Status::Success,
            SendStatus::Broken => Status::Failed,
        };
        let outcome = self.delivery.record(ctx.rank, ctx.serial_number, status);
        match outcome {
            RecordOutcome::Recorded => self.notify(),
            RecordOutcome::Stale => {
                self.counters.stale_callbacks.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(rank = ctx.rank, sn = ctx.serial_number, opcode = %ctx.opcode, "stale send completion dropped");
            }
            _ => {}
        }
        outcome
    }

    /// Application reply for `opcode`; malformed or stale replies are dropped.
    pub fn handle_reply(&self, opcode: Opcode, body: &[u8]) -> RecordOutcome {
        self.record_reply(opcode, None, body)
    }

    /// Like [`ActionEngine::handle_reply`], but drops a reply whose payload
    /// names a rank other than `sender`, the rank of the link it came in on.
    pub fn handle_reply_from(&self, opcode: Opcode, sender: Rank, body: &[u8]) -> RecordOutcome {
        self.record_reply(opcode, Some(sender), body)
    }

    fn record_reply(&self, opcode: Opcode, sender: Option<Rank>, body: &[u8]) -> RecordOutcome {
        if *self.current.lock() != Some(opcode) {
            tracing::debug!(opcode = %opcode, "reply outside its broadcast dropped");
            return RecordOutcome::Stale;
        }
        let parser = self.opcodes.read().get(&opcode).cloned().flatten();
        let parsed = match parser {
            Some(parser) => parser(body),
            None => ReplyPayload::decode(body),
        };
        let Some((payload, rank)) = parsed.and_then(|p| p.rank().map(|rank| (p, rank))) else {
            self.counters.malformed_replies.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(opcode = %opcode, len = body.len(), "malformed reply dropped");
            return RecordOutcome::UnknownRank;
        };
        if sender.is_some_and(|sender| sender != rank) {
            tracing::warn!(opcode = %opcode, rank, sender = ?sender, "reply rank does not match its link");
            return RecordOutcome::SenderMismatch;
        }
        let status = if payload.is_success() {
            Status::Success
        } else {
            Status::Failed
        };
        let outcome = self.replies.record(rank, payload.serial_number, status);
        match outcome {
            RecordOutcome::Recorded => {
                tracing::debug!(opcode = %opcode, rank, sn = payload.serial_number, status = payload.status, "reply recorded");
                self.notify();
            }
            RecordOutcome::Stale => {
                self.counters.stale_callbacks.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(opcode = %opcode, rank, sn = payload.serial_number, "stale reply dropped");
            }
            _ => {}
        }
        outcome
    }

    /// Transport completions recorded for the current serial number.
    pub fn delivered(&self) -> usize {
        self.delivery.completed()
    }

    /// Replies recorded for the current serial number.
    pub fn replied(&self) -> usize {
        self.replies.completed()
    }

    pub fn stale_callbacks(&self) -> u64 {
        self.counters.stale_callbacks.load(Ordering::Relaxed)
    }

    pub fn malformed_replies(&self) -> u64 {
        self.counters.malformed_replies.load(Ordering::Relaxed)
    }

    pub fn broadcasts(&self) -> u64 {
        self.counters.broadcasts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplyTimeouts;
    use ftcomm_transport::{MessageType, TransportError};
    use std::sync::Weak;

    type Behaviour = dyn Fn(&ActionEngine, Rank, MessageType, &Bytes) -> std::result::Result<(), TransportError> + Send + Sync;

    /// Records every send and reacts through `behaviour`.
    struct MockTransport {
        engine: OnceLock<Weak<ActionEngine>>,
        sent: Mutex<Vec<(Rank, MessageType)>>,
        behaviour: Box<Behaviour>,
    }

    impl MockTransport {
        fn new<F>(behaviour: F) -> Arc<Self>
        where
            F: Fn(&ActionEngine, Rank, MessageType, &Bytes) -> std::result::Result<(), TransportError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                engine: OnceLock::new(),
                sent: Mutex::new(Vec::new()),
                behaviour: Box::new(behaviour),
            })
        }

        fn sends_to(&self, rank: Rank) -> usize {
            self.sent.lock().iter().filter(|(r, _)| *r == rank).count()
        }
    }

    impl ActionTransport for MockTransport {
        fn send_action(&self, rank: Rank, msg_type: MessageType, _payload: Bytes, context: Bytes) -> std::result::Result<(), TransportError> {
            self.sent.lock().push((rank, msg_type));
            let Some(engine) = self.engine.get().and_then(Weak::upgrade) else {
                return Ok(());
            };
            (self.behaviour)(&engine, rank, msg_type, &context)
        }
    }

    fn sent(rank: Rank, context: &Bytes, status: SendStatus) -> SentNotice {
        SentNotice {
            rank: u64::from(rank),
            link_id: 1,
            msg_type: MessageType::Pause,
            seq_no: 1,
            status,
            context: Some(context.clone()),
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            send_timeout_ms: 50,
            send_retry_times: 1,
            reply_timeouts: ReplyTimeouts {
                pause: 1,
                checkpoint: 1,
                exit: 1,
                ..ReplyTimeouts::default()
            },
        }
    }

    fn engine(transport: &Arc<MockTransport>) -> Arc<ActionEngine> {
        let engine = ActionEngine::new(transport.clone(), fast_config()).unwrap();
        for op in Opcode::ALL {
            engine.register_opcode(op).unwrap();
        }
        let _ = transport.engine.set(Arc::downgrade(&engine));
        engine
    }

    fn pause(ranks: Vec<Rank>) -> Vec<ActionInfo> {
        vec![ActionInfo::new(MessageType::Pause, Bytes::from_static(b"p"), ranks)]
    }

    #[test]
    fn test_all_reply_success() {
        let transport = MockTransport::new(|engine, rank, _, ctx| {
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            let decoded = CallbackContext::decode(ctx).unwrap();
            engine.handle_reply(Opcode::Pause, &ReplyPayload::new(0, decoded.serial_number, rank).encode());
            Ok(())
        });
        let engine = engine(&transport);
        let report = engine.process(Opcode::Pause, &pause(vec![1, 2, 3]), true, 10, 2).unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(report.targets, vec![1, 2, 3]);
        assert!(report.sends.values().all(|&n| n == 1));
        assert_eq!(engine.replied(), 3);
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_reentrant_call_rejected() {
        let nested = Arc::new(Mutex::new(None));
        let seen = nested.clone();
        let transport = MockTransport::new(move |engine, rank, _, ctx| {
            let mut slot = seen.lock();
            if slot.is_none() {
                let result = engine.process(Opcode::Exit, &pause(vec![9]), false, 99, 0);
                *slot = Some(matches!(result, Err(ActionError::Busy)));
            }
            drop(slot);
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            Ok(())
        });
        let engine = engine(&transport);
        engine.process(Opcode::Pause, &pause(vec![1]), false, 1, 0).unwrap();
        assert_eq!(*nested.lock(), Some(true));
        assert_eq!(transport.sends_to(9), 0);
        assert!(engine.process(Opcode::Pause, &pause(vec![1]), false, 2, 0).is_ok());
    }

    #[test]
    fn test_stale_completion_does_not_count() {
        let transport = MockTransport::new(|engine, rank, _, ctx| {
            if rank == 7 {
                let stale = CallbackContext {
                    opcode: Opcode::Pause,
                    rank,
                    serial_number: 4,
                }
                .encode();
                assert_eq!(engine.handle_send_complete(&sent(rank, &stale, SendStatus::Sent)), RecordOutcome::Stale);
                assert!(engine.delivered() <= 7);
                return Ok(());
            }
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            Ok(())
        });
        let engine = engine(&transport);
        let err = engine
            .process(Opcode::Pause, &pause((0..8).collect()), false, 5, 0)
            .unwrap_err();
        assert_eq!(err.ranks(), &[7]);
        assert_eq!(engine.delivered(), 7);
        assert!(engine.stale_callbacks() >= 1);
    }

    #[test]
    fn test_retry_bound_then_unresponsive() {
        let transport = MockTransport::new(|engine, rank, _, ctx| {
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            Ok(())
        });
        let engine = engine(&transport);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        engine
            .register_rank_status_handler(move |rank, health| sink.lock().push((rank, health)))
            .unwrap();

        let err = engine
            .process(Opcode::Pause, &pause(vec![1, 2]), true, 3, 2)
            .unwrap_err();
        assert!(matches!(err, ActionError::Unresponsive { ref ranks } if ranks == &vec![1, 2]));
        assert_eq!(transport.sends_to(1), 3);
        assert_eq!(transport.sends_to(2), 3);
        let mut reported = reported.lock().clone();
        reported.sort_by_key(|(rank, _)| *rank);
        assert_eq!(reported, vec![(1, RankHealth::NoResponse), (2, RankHealth::NoResponse)]);
    }

    #[test]
    fn test_reply_failure_not_retried() {
        let transport = MockTransport::new(|engine, rank, _, ctx| {
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            let sn = CallbackContext::decode(ctx).unwrap().serial_number;
            let status = if rank == 2 { -1 } else { 0 };
            engine.handle_reply(Opcode::Checkpoint, &ReplyPayload::new(status, sn, rank).encode());
            Ok(())
        });
        let engine = engine(&transport);
        let actions = vec![ActionInfo::new(MessageType::Checkpoint, Bytes::new(), vec![1, 2])];
        let err = engine
            .process(Opcode::Checkpoint, &actions, true, 8, 3)
            .unwrap_err();
        assert!(matches!(err, ActionError::ReplyFailed { ref ranks } if ranks == &vec![2]));
        assert_eq!(transport.sends_to(2), 1);
    }

    #[test]
    fn test_broken_link_retried_in_delivery() {
        let attempts = Arc::new(Mutex::new(HashMap::<Rank, u32>::new()));
        let seen = attempts.clone();
        let transport = MockTransport::new(move |engine, rank, _, ctx| {
            let n = {
                let mut seen = seen.lock();
                let n = seen.entry(rank).or_default();
                *n += 1;
                *n
            };
            if n == 1 {
                return Err(TransportError::NotConnected { rank: u64::from(rank) });
            }
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            Ok(())
        });
        let engine = engine(&transport);
        let actions = vec![ActionInfo::new(MessageType::Exit, Bytes::new(), vec![4])];
        engine.process(Opcode::Exit, &actions, false, 1, 1).unwrap();
        assert_eq!(transport.sends_to(4), 2);
    }

    #[test]
    fn test_unreachable_ranks_wait_between_rounds() {
        let transport = MockTransport::new(|_, rank, _, _| Err(TransportError::NotConnected { rank: u64::from(rank) }));
        let engine = engine(&transport);
        let started = Instant::now();
        let err = engine
            .process(Opcode::Pause, &pause(vec![3]), true, 12, 3)
            .unwrap_err();
        assert_eq!(err.ranks(), &[3]);
        // one send per round, no in-round resend once the send failed outright
        assert_eq!(transport.sends_to(3), 4);
        assert!(started.elapsed() >= Duration::from_millis(3 * 50), "elapsed {:?}", started.elapsed());

        let started = Instant::now();
        engine.process(Opcode::Pause, &pause(vec![3]), false, 13, 2).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(2 * 50));
    }

    #[test]
    fn test_reply_from_other_link_dropped() {
        let transport = MockTransport::new(|engine, rank, _, ctx| {
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            let sn = CallbackContext::decode(ctx).unwrap().serial_number;
            // rank 2 answers on behalf of rank 1 as well
            if rank == 2 {
                let forged = ReplyPayload::new(0, sn, 1).encode();
                assert_eq!(engine.handle_reply_from(Opcode::Pause, 2, &forged), RecordOutcome::SenderMismatch);
            }
            engine.handle_reply_from(Opcode::Pause, rank, &ReplyPayload::new(0, sn, rank).encode());
            Ok(())
        });
        let engine = engine(&transport);
        engine.process(Opcode::Pause, &pause(vec![1, 2]), true, 20, 0).unwrap();
        assert_eq!(engine.replied(), 2);
    }

    #[test]
    fn test_preconditions() {
        let transport = MockTransport::new(|_, _, _, _| Ok(()));
        let engine = ActionEngine::new(transport.clone(), fast_config()).unwrap();
        assert!(matches!(
            engine.process(Opcode::Pause, &pause(vec![1]), false, 1, 0),
            Err(ActionError::UnknownOpcode(_))
        ));
        engine.register_opcode(Opcode::Pause).unwrap();
        assert!(engine.register_opcode(Opcode::Pause).is_err());
        assert!(matches!(
            engine.process(Opcode::Pause, &[], false, 1, 0),
            Err(ActionError::NoTargets)
        ));
        engine.register_opcode(Opcode::Exit).unwrap();
        assert!(matches!(
            engine.process(Opcode::Exit, &pause(vec![1]), false, 1, 0),
            Err(ActionError::MessageTypeMismatch {
                expected: MessageType::Exit,
                found: MessageType::Pause,
                ..
            })
        ));
        assert!(transport.sent.lock().is_empty());
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_custom_reply_parser() {
        let transport = MockTransport::new(|engine, rank, _, ctx| {
            engine.handle_send_complete(&sent(rank, ctx, SendStatus::Sent));
            let sn = CallbackContext::decode(ctx).unwrap().serial_number;
            // "ok:<rank>:<sn>"
            engine.handle_reply(Opcode::Rename, format!("ok:{rank}:{sn}").as_bytes());
            Ok(())
        });
        let engine = engine(&transport);
        engine
            .register_reply_parser(Opcode::Rename, |body| {
                let text = std::str::from_utf8(body).ok()?;
                let mut parts = text.split(':');
                let status = if parts.next()? == "ok" { 0 } else { 1 };
                let rank: Rank = parts.next()?.parse().ok()?;
                let sn: i64 = parts.next()?.parse().ok()?;
                Some(ReplyPayload::new(status, sn, rank))
            })
            .unwrap();
        let actions = vec![ActionInfo::new(MessageType::Rename, Bytes::new(), vec![5, 6])];
        engine.process(Opcode::Rename, &actions, true, 77, 0).unwrap();
        assert_eq!(engine.handle_reply(Opcode::Rename, b"garbage"), RecordOutcome::Stale);
    }
}
