//! # Message Dispatcher
//!
//! Routes every inbound envelope through at most one validator for its kind
//! and then through that kind's handlers, in registration order.
//!
//! ```text
//! inbound queue ─► validator(kind)? ──false──► dropped
//!                        │ true / none
//!                        ▼
//!                  handler₁ ─► handler₂ ─► … (a `false` stops the chain)
//! ```
//!
//! A kind with no validator is implicitly valid. A handler that returns
//! `false` stops the handlers after it; whatever the earlier ones did stays
//! done.
//!
//! ## Ordering
//!
//! [`Dispatcher::run`] keeps one lane per source peer. A lane is a task that
//! dispatches that peer's envelopes one at a time, in arrival order, so a
//! block announcement is never overtaken by a later one from the same peer.
//! Different peers do not wait on each other.
//!
//! Responses skip the lanes and are dispatched straight away. A handler that
//! sends a correlated request and waits for the answer would otherwise be
//! sitting in front of that answer in its own lane.
//!
//! ```text
//!              ┌── response ──────────────► dispatch (own task)
//! inbound ─────┤
//!              └── lane[source_ip] ───────► dispatch, one at a time
//! ```
//!
//! A lane holds at most `DISPATCH_LANE_CAPACITY` envelopes; a peer that
//! overruns it has the excess dropped. Idle lanes close after
//! `DISPATCH_LANE_IDLE`, and a lane reopened for the same peer waits for
//! the old one to drain first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::message::{MessageEnvelope, MessageKind};
use crate::config;

/// Admission check run before any handler sees an envelope.
pub trait MessageValidator: Send + Sync {
    fn check(&self, envelope: &MessageEnvelope) -> bool;
}

/// One step of a kind's handler chain. Return `false` to stop the chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool;
}

/// What happened to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The validator said no. No handler ran.
    Rejected,
    /// Every handler ran and returned `true`.
    Completed { handlers: usize },
    /// Handler number `at` (0-based) returned `false`.
    Stopped { at: usize },
    /// Valid, but nothing is registered for the kind.
    Unhandled,
}

#[derive(Default)]
pub struct Dispatcher {
    validators: RwLock<HashMap<MessageKind, Arc<dyn MessageValidator>>>,
    handlers: RwLock<HashMap<MessageKind, Vec<Arc<dyn MessageHandler>>>>,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    shed: AtomicU64,
}

/// The serial queue for one source peer.
struct Lane {
    tx: mpsc::Sender<MessageEnvelope>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the validator for `kind`, replacing any previous one.
    pub fn set_validator(&self, kind: MessageKind, validator: Arc<dyn MessageValidator>) {
        if self.validators.write().insert(kind, validator).is_some() {
            debug!(%kind, "validator replaced");
        }
    }

    /// Appends `handler` to the chain for `kind`.
    pub fn add_handler(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn has_validator(&self, kind: MessageKind) -> bool {
        self.validators.read().contains_key(&kind)
    }

    pub async fn dispatch(&self, envelope: MessageEnvelope) -> DispatchOutcome {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let kind = envelope.kind();

        let validator = self.validators.read().get(&kind).cloned();
        if let Some(validator) = validator {
            if !validator.check(&envelope) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(%kind, peer = %envelope.source_ip(), "envelope rejected by validator");
                return DispatchOutcome::Rejected;
            }
        }

        // Clone the chain so no lock is held across handler awaits.
        let chain = self.handlers.read().get(&kind).cloned().unwrap_or_default();
        if chain.is_empty() {
            trace!(%kind, "no handler registered");
            return DispatchOutcome::Unhandled;
        }
        for (at, handler) in chain.iter().enumerate() {
            if !handler.handle(&envelope).await {
                trace!(%kind, at, "handler chain stopped");
                return DispatchOutcome::Stopped { at };
            }
        }
        DispatchOutcome::Completed {
            handlers: chain.len(),
        }
    }

    /// Drains `inbound` until the queue closes or `shutdown` flips to
    /// `true`. Responses are dispatched at once; everything else goes
    /// through its source peer's lane.
    pub fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<MessageEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lanes: HashMap<String, Lane> = HashMap::new();
            loop {
                tokio::select! {
                    next = inbound.recv() => {
                        let Some(envelope) = next else { break };
                        if envelope.kind().is_response() {
                            let dispatcher = self.clone();
                            tokio::spawn(async move {
                                dispatcher.dispatch(envelope).await;
                            });
                        } else {
                            self.enqueue(&mut lanes, envelope);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            // Dropping the senders lets each lane finish what it holds.
            info!(lanes = lanes.len(), "dispatcher stopped");
        })
    }

    fn enqueue(self: &Arc<Self>, lanes: &mut HashMap<String, Lane>, envelope: MessageEnvelope) {
        let envelope = match lanes.get(envelope.source_ip()) {
            Some(lane) => match lane.tx.try_send(envelope) {
                Ok(()) => return,
                Err(TrySendError::Full(envelope)) => {
                    self.shed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        peer = %envelope.source_ip(),
                        kind = %envelope.kind(),
                        "dispatch lane full, envelope dropped"
                    );
                    return;
                }
                Err(TrySendError::Closed(envelope)) => envelope,
            },
            None => envelope,
        };

        let source = envelope.source_ip().to_string();
        let previous = lanes.remove(&source).map(|lane| lane.worker);
        lanes.retain(|_, lane| !lane.worker.is_finished());
        trace!(peer = %source, "dispatch lane opened");
        let lane = self.clone().spawn_lane(source.clone(), envelope, previous);
        lanes.insert(source, lane);
    }

    /// Starts the lane for `source` with `first` as its first envelope. If
    /// `previous` is the lane it replaces, that one is drained first.
    fn spawn_lane(
        self: Arc<Self>,
        source: String,
        first: MessageEnvelope,
        previous: Option<JoinHandle<()>>,
    ) -> Lane {
        let (tx, mut rx) = mpsc::channel(config::DISPATCH_LANE_CAPACITY.max(1));
        let worker = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    debug!(peer = %source, error = %e, "previous dispatch lane failed");
                }
            }
            self.dispatch(first).await;
            loop {
                match tokio::time::timeout(config::DISPATCH_LANE_IDLE, rx.recv()).await {
                    Ok(Some(envelope)) => {
                        self.dispatch(envelope).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // Refuse new envelopes, then finish the ones that
                        // slipped in before the close.
                        rx.close();
                        while let Ok(envelope) = rx.try_recv() {
                            self.dispatch(envelope).await;
                        }
                        trace!(peer = %source, "idle dispatch lane closed");
                        break;
                    }
                }
            }
        });
        Lane { tx, worker }
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Envelopes dropped because their source's lane was full.
    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Accept(bool);

    impl MessageValidator for Accept {
        fn check(&self, _envelope: &MessageEnvelope) -> bool {
            self.0
        }
    }

    /// Records its name into a shared log and returns a fixed verdict.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        verdict: bool,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, _envelope: &MessageEnvelope) -> bool {
            self.log.lock().push(self.name);
            self.verdict
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        verdict: bool,
    ) -> Arc<dyn MessageHandler> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            verdict,
        })
    }

    fn env(kind: MessageKind) -> MessageEnvelope {
        MessageEnvelope::empty(kind).from_ip("10.0.0.2")
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::BlockArrived, recorder("relay", &log, true));
        dispatcher.add_handler(MessageKind::BlockArrived, recorder("commit", &log, true));

        let outcome = dispatcher.dispatch(env(MessageKind::BlockArrived)).await;
        assert_eq!(outcome, DispatchOutcome::Completed { handlers: 2 });
        assert_eq!(*log.lock(), vec!["relay", "commit"]);
    }

    #[tokio::test]
    async fn false_validator_blocks_every_handler() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.set_validator(MessageKind::Transaction, Arc::new(Accept(false)));
        dispatcher.add_handler(MessageKind::Transaction, recorder("tx", &log, true));

        let outcome = dispatcher.dispatch(env(MessageKind::Transaction)).await;
        assert_eq!(outcome, DispatchOutcome::Rejected);
        assert!(log.lock().is_empty());
        assert_eq!(dispatcher.rejected_count(), 1);
    }

    #[tokio::test]
    async fn false_handler_stops_chain_without_rollback() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::NodeJoin, recorder("first", &log, true));
        dispatcher.add_handler(MessageKind::NodeJoin, recorder("stop", &log, false));
        dispatcher.add_handler(MessageKind::NodeJoin, recorder("never", &log, true));

        let outcome = dispatcher.dispatch(env(MessageKind::NodeJoin)).await;
        assert_eq!(outcome, DispatchOutcome::Stopped { at: 1 });
        assert_eq!(*log.lock(), vec!["first", "stop"]);
    }

    #[tokio::test]
    async fn missing_validator_is_implicitly_valid() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::HeartbeatReq, recorder("hb", &log, true));
        assert!(!dispatcher.has_validator(MessageKind::HeartbeatReq));
        let outcome = dispatcher.dispatch(env(MessageKind::HeartbeatReq)).await;
        assert_eq!(outcome, DispatchOutcome::Completed { handlers: 1 });
    }

    #[tokio::test]
    async fn set_validator_replaces() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_validator(MessageKind::NodeExit, Arc::new(Accept(false)));
        dispatcher.set_validator(MessageKind::NodeExit, Arc::new(Accept(true)));
        assert_eq!(
            dispatcher.dispatch(env(MessageKind::NodeExit)).await,
            DispatchOutcome::Unhandled
        );
    }

    #[tokio::test]
    async fn run_loop_dispatches_and_stops() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::HeartbeatReq, recorder("hb", &log, true));

        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = dispatcher.clone().run(rx, stop_rx);

        tx.send(env(MessageKind::HeartbeatReq)).await.unwrap();
        tx.send(env(MessageKind::HeartbeatReq)).await.unwrap();
        for _ in 0..500 {
            if log.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(log.lock().len(), 2);
        assert_eq!(dispatcher.dispatched_count(), 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Records `source:payload` after sleeping `payload` milliseconds.
    struct Sleepy {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler for Sleepy {
        async fn handle(&self, envelope: &MessageEnvelope) -> bool {
            let millis: u64 = envelope.payload_str().parse().unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            self.log
                .lock()
                .push(format!("{}:{}", envelope.source_ip(), millis));
            true
        }
    }

    async fn wait_for(log: &Arc<Mutex<Vec<String>>>, len: usize) {
        let waited = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while log.lock().len() < len {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "only {:?} handled", log.lock());
    }

    fn timed(millis: u64, from: &str) -> MessageEnvelope {
        MessageEnvelope::new(MessageKind::BlockArrived, millis.to_string()).from_ip(from)
    }

    #[tokio::test]
    async fn one_peer_is_handled_in_arrival_order() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::BlockArrived, Arc::new(Sleepy { log: log.clone() }));

        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        dispatcher.clone().run(rx, stop_rx);

        // Earlier envelopes take longer; a task per envelope would finish
        // them last.
        for millis in [40, 30, 20, 10, 0] {
            tx.send(timed(millis, "10.0.0.2")).await.unwrap();
        }
        wait_for(&log, 5).await;
        assert_eq!(
            *log.lock(),
            vec!["10.0.0.2:40", "10.0.0.2:30", "10.0.0.2:20", "10.0.0.2:10", "10.0.0.2:0"]
        );
    }

    #[tokio::test]
    async fn a_slow_peer_does_not_hold_up_another() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::BlockArrived, Arc::new(Sleepy { log: log.clone() }));

        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        dispatcher.clone().run(rx, stop_rx);

        tx.send(timed(300, "10.0.0.2")).await.unwrap();
        tx.send(timed(0, "10.0.0.3")).await.unwrap();
        wait_for(&log, 2).await;
        assert_eq!(*log.lock(), vec!["10.0.0.3:0", "10.0.0.2:300"]);
    }

    /// Handles a request by waiting for the matching response, the way a
    /// handler awaiting a correlated reply does.
    struct AwaitsReply {
        reply: Arc<tokio::sync::Notify>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler for AwaitsReply {
        async fn handle(&self, envelope: &MessageEnvelope) -> bool {
            self.reply.notified().await;
            self.log.lock().push(format!("{}:answered", envelope.kind()));
            true
        }
    }

    struct DeliversReply {
        reply: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl MessageHandler for DeliversReply {
        async fn handle(&self, _envelope: &MessageEnvelope) -> bool {
            self.reply.notify_one();
            true
        }
    }

    #[tokio::test]
    async fn responses_are_not_queued_behind_a_waiting_handler() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let reply = Arc::new(tokio::sync::Notify::new());
        dispatcher.add_handler(
            MessageKind::HeartbeatReq,
            Arc::new(AwaitsReply {
                reply: reply.clone(),
                log: log.clone(),
            }),
        );
        dispatcher.add_handler(MessageKind::HeartbeatResp, Arc::new(DeliversReply { reply }));

        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        dispatcher.clone().run(rx, stop_rx);

        // Same peer: the response must not wait for the request's lane.
        tx.send(env(MessageKind::HeartbeatReq)).await.unwrap();
        tx.send(env(MessageKind::HeartbeatResp)).await.unwrap();
        wait_for(&log, 1).await;
        assert_eq!(dispatcher.dispatched_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lane_closes_and_reopens() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_handler(MessageKind::BlockArrived, Arc::new(Sleepy { log: log.clone() }));

        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = dispatcher.clone().run(rx, stop_rx);

        tx.send(timed(0, "10.0.0.2")).await.unwrap();
        wait_for(&log, 1).await;
        tokio::time::sleep(config::DISPATCH_LANE_IDLE * 2).await;

        tx.send(timed(0, "10.0.0.2")).await.unwrap();
        wait_for(&log, 2).await;
        assert_eq!(dispatcher.shed_count(), 0);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
