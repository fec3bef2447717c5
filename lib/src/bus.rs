//! In-memory message bus.
//!
//! The bus owns one mailbox sender per registered worker, the table of
//! requests waiting for a correlated reply, and a bounded history ring used
//! for audit and debugging. Messages between any two workers are delivered in
//! send order because each worker has exactly one FIFO mailbox.

use crate::error::{BusError, BusResult, FaultKind, RouteFailure};
use crate::id::MessageId;
use crate::message::{IntentKind, Message, Target};
use crate::worker::WorkerStatus;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default number of messages kept in the history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

struct Route<I> {
    sender: mpsc::UnboundedSender<Message<I>>,
    status: WorkerStatus,
}

struct BusInner<I> {
    routes: RwLock<HashMap<String, Route<I>>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message<I>>>>,
    history: Mutex<VecDeque<Message<I>>>,
    history_capacity: usize,
}

/// Thread-safe point-to-point and broadcast routing between named workers.
///
/// Cloning the bus is cheap; all clones share the same routing table.
pub struct MessageBus<I> {
    inner: Arc<BusInner<I>>,
}

impl<I> Clone for MessageBus<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: IntentKind> fmt::Debug for MessageBus<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("workers", &self.workers())
            .field("history_capacity", &self.inner.history_capacity)
            .finish()
    }
}

impl<I: IntentKind> Default for MessageBus<I> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Receiving end of a worker's mailbox
pub struct Mailbox<I> {
    name: String,
    receiver: mpsc::UnboundedReceiver<Message<I>>,
}

impl<I> Mailbox<I> {
    /// Name of the worker this mailbox belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<Message<I>> {
        self.receiver.recv().await
    }

    /// Take the next message without waiting
    pub fn try_recv(&mut self) -> Option<Message<I>> {
        self.receiver.try_recv().ok()
    }

    /// Refuse further messages while keeping the buffered ones readable
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl<I: IntentKind> MessageBus<I> {
    /// Create a bus keeping at most `history_capacity` messages of history
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                routes: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                history_capacity,
            }),
        }
    }

    /// Register a worker and hand back its mailbox.
    ///
    /// The worker starts out `Stopped`; it receives nothing until its status
    /// is set to `Running`. A stopped registration may be replaced.
    pub fn subscribe(&self, name: impl Into<String>) -> BusResult<Mailbox<I>> {
        let name = name.into();
        let mut routes = self
            .inner
            .routes
            .write()
            .map_err(|_| BusError::Poisoned("routes"))?;

        if let Some(existing) = routes.get(&name) {
            if existing.status != WorkerStatus::Stopped {
                return Err(BusError::DuplicateWorker(name));
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        routes.insert(
            name.clone(),
            Route {
                sender,
                status: WorkerStatus::Stopped,
            },
        );
        tracing::debug!(worker = %name, "Worker subscribed");
        Ok(Mailbox { name, receiver })
    }

    /// Remove a worker from the routing table
    pub fn unsubscribe(&self, name: &str) -> BusResult<()> {
        let mut routes = self
            .inner
            .routes
            .write()
            .map_err(|_| BusError::Poisoned("routes"))?;
        routes.remove(name);
        Ok(())
    }

    /// Update a worker's lifecycle status
    pub fn set_status(&self, name: &str, status: WorkerStatus) -> BusResult<()> {
        let mut routes = self
            .inner
            .routes
            .write()
            .map_err(|_| BusError::Poisoned("routes"))?;
        let route = routes
            .get_mut(name)
            .ok_or_else(|| BusError::routing(name, RouteFailure::UnknownWorker))?;
        route.status = status;
        Ok(())
    }

    /// Current status of a worker, if registered
    pub fn status(&self, name: &str) -> Option<WorkerStatus> {
        self.inner
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(name).map(|r| r.status))
    }

    /// Names of all registered workers, sorted
    pub fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .routes
            .read()
            .map(|routes| routes.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Enqueue a message and return immediately.
    ///
    /// Replies are matched against pending requests first. Point-to-point
    /// messages fail with a routing error when the target is unknown or not
    /// running; the bus never retries.
    pub fn send(&self, message: Message<I>) -> BusResult<()> {
        if message.is_reply() {
            return self.deliver_reply(message);
        }

        match message.target.clone() {
            Target::Worker(name) => self.route(&name, message),
            Target::Broadcast => self.broadcast(message).map(|_| ()),
        }
    }

    /// Deliver a message to every running worker except its sender.
    ///
    /// Returns the number of mailboxes reached.
    pub fn broadcast(&self, message: Message<I>) -> BusResult<usize> {
        let delivered = {
            let routes = self
                .inner
                .routes
                .read()
                .map_err(|_| BusError::Poisoned("routes"))?;
            let mut delivered = 0;
            for (name, route) in routes.iter() {
                if route.status != WorkerStatus::Running || *name == message.source {
                    continue;
                }
                if route.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
            delivered
        };

        self.record(message)?;
        Ok(delivered)
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// Fails with `HandlerTimeout` when no reply arrives within `timeout`,
    /// and with `HandlerFault` when the worker replies with a fault.
    pub async fn request(&self, message: Message<I>, timeout: Duration) -> BusResult<Message<I>> {
        let target = message.target.to_string();
        let id = message.id;
        let (tx, rx) = oneshot::channel();

        self.inner
            .pending
            .lock()
            .map_err(|_| BusError::Poisoned("pending"))?
            .insert(id, tx);

        if let Err(err) = self.send(message) {
            self.forget_pending(id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => match reply.fault {
                Some(fault) => Err(BusError::HandlerFault {
                    target,
                    kind: fault.kind,
                    reason: fault.reason,
                }),
                None => Ok(reply),
            },
            Ok(Err(_)) => Err(BusError::ReplyDropped { target }),
            Err(_) => {
                self.forget_pending(id);
                tracing::debug!(worker = %target, message_id = %id, "Request timed out");
                Err(BusError::HandlerTimeout { target, timeout })
            }
        }
    }

    /// The most recent `limit` messages, oldest first
    pub fn history(&self, limit: usize) -> Vec<Message<I>> {
        self.inner
            .history
            .lock()
            .map(|history| {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drop every pending reply slot; waiting requesters fail with `ReplyDropped`
    pub fn cancel_pending(&self) -> usize {
        match self.inner.pending.lock() {
            Ok(mut pending) => {
                let cancelled = pending.len();
                pending.clear();
                cancelled
            }
            Err(_) => 0,
        }
    }

    fn route(&self, name: &str, message: Message<I>) -> BusResult<()> {
        {
            let routes = self
                .inner
                .routes
                .read()
                .map_err(|_| BusError::Poisoned("routes"))?;
            let route = routes
                .get(name)
                .ok_or_else(|| BusError::routing(name, RouteFailure::UnknownWorker))?;

            match route.status {
                WorkerStatus::Running => {}
                WorkerStatus::Stopped => {
                    return Err(BusError::routing(name, RouteFailure::Stopped));
                }
                WorkerStatus::Draining => {
                    return Err(BusError::routing(name, RouteFailure::Draining));
                }
            }

            route
                .sender
                .send(message.clone())
                .map_err(|_| BusError::routing(name, RouteFailure::MailboxClosed))?;
        }

        self.record(message)
    }

    fn deliver_reply(&self, message: Message<I>) -> BusResult<()> {
        let waiting = message.reply_to.and_then(|id| {
            self.inner
                .pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&id))
        });

        if let Some(slot) = waiting {
            self.record(message.clone())?;
            if slot.send(message).is_err() {
                tracing::debug!("Reply arrived after the requester gave up");
            }
            return Ok(());
        }

        match message.target.worker_name().map(str::to_owned) {
            Some(name) if self.status(&name) == Some(WorkerStatus::Running) => {
                self.route(&name, message)
            }
            _ => {
                tracing::debug!(message_id = %message.id, "Dropping reply with no waiting requester");
                Ok(())
            }
        }
    }

    fn forget_pending(&self, id: MessageId) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&id);
        }
    }

    fn record(&self, message: Message<I>) -> BusResult<()> {
        if self.inner.history_capacity == 0 {
            return Ok(());
        }
        let mut history = self
            .inner
            .history
            .lock()
            .map_err(|_| BusError::Poisoned("history"))?;
        if history.len() == self.inner.history_capacity {
            history.pop_front();
        }
        history.push_back(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::CorrelationId;
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestIntent {
        Ping,
        Notice,
    }

    impl fmt::Display for TestIntent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn running(bus: &MessageBus<TestIntent>, name: &str) -> Mailbox<TestIntent> {
        let mailbox = bus.subscribe(name).unwrap();
        bus.set_status(name, WorkerStatus::Running).unwrap();
        mailbox
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let bus = MessageBus::new(16);
        let mut mailbox = running(&bus, "rules");

        for n in 0..5 {
            let msg = Message::to("orchestrator", "rules", TestIntent::Ping, json!(n), CorrelationId::new());
            bus.send(msg).unwrap();
        }

        for n in 0..5 {
            let msg = mailbox.recv().await.unwrap();
            assert_eq!(msg.payload, json!(n));
        }
    }

    #[test]
    fn test_unknown_and_stopped_targets_fail() {
        let bus: MessageBus<TestIntent> = MessageBus::new(16);
        let _mailbox = bus.subscribe("policy").unwrap();

        let unknown = Message::to("a", "nobody", TestIntent::Ping, Value::Null, CorrelationId::new());
        assert!(matches!(
            bus.send(unknown),
            Err(BusError::Routing {
                reason: RouteFailure::UnknownWorker,
                ..
            })
        ));

        let stopped = Message::to("a", "policy", TestIntent::Ping, Value::Null, CorrelationId::new());
        assert!(matches!(
            bus.send(stopped),
            Err(BusError::Routing {
                reason: RouteFailure::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_subscription_rejected() {
        let bus: MessageBus<TestIntent> = MessageBus::new(4);
        let _first = running(&bus, "rules");
        assert!(matches!(
            bus.subscribe("rules"),
            Err(BusError::DuplicateWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_stopped() {
        let bus = MessageBus::new(16);
        let mut a = running(&bus, "a");
        let mut b = running(&bus, "b");
        let mut sender = running(&bus, "sender");
        let mut idle = bus.subscribe("idle").unwrap();

        let msg = Message::new(
            "sender",
            Target::Broadcast,
            TestIntent::Notice,
            Value::Null,
            CorrelationId::new(),
        );
        let delivered = bus.broadcast(msg).unwrap();

        assert_eq!(delivered, 2);
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert!(sender.try_recv().is_none());
        assert!(idle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_request_receives_correlated_reply() {
        let bus = MessageBus::new(16);
        let mut mailbox = running(&bus, "rules");

        let responder = bus.clone();
        tokio::spawn(async move {
            let request = mailbox.recv().await.unwrap();
            responder.send(request.reply("rules", json!({"ok": true}))).unwrap();
        });

        let request = Message::to("orchestrator", "rules", TestIntent::Ping, Value::Null, CorrelationId::new());
        let reply = bus.request(request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload, json!({"ok": true}));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let bus = MessageBus::new(16);
        let _mailbox = running(&bus, "slow");

        let request = Message::to("orchestrator", "slow", TestIntent::Ping, Value::Null, CorrelationId::new());
        let result = bus.request(request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BusError::HandlerTimeout { .. })));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_wakes_requesters() {
        let bus = MessageBus::new(16);
        let _mailbox = running(&bus, "slow");

        let requester = bus.clone();
        let waiting = tokio::spawn(async move {
            let request = Message::to("orchestrator", "slow", TestIntent::Ping, Value::Null, CorrelationId::new());
            requester.request(request, Duration::from_secs(5)).await
        });
        while bus.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(bus.cancel_pending(), 1);
        assert!(matches!(waiting.await.unwrap(), Err(BusError::ReplyDropped { .. })));
    }

    #[tokio::test]
    async fn test_fault_reply_becomes_error() {
        let bus = MessageBus::new(16);
        let mut mailbox = running(&bus, "rules");

        let responder = bus.clone();
        tokio::spawn(async move {
            let request = mailbox.recv().await.unwrap();
            responder
                .send(request.fault_reply("rules", FaultKind::Rejected, "illegal move"))
                .unwrap();
        });

        let request = Message::to("orchestrator", "rules", TestIntent::Ping, Value::Null, CorrelationId::new());
        let result = bus.request(request, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(BusError::HandlerFault { kind: FaultKind::Rejected, reason, .. }) if reason == "illegal move"
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = MessageBus::new(3);
        let _mailbox = running(&bus, "rules");

        for n in 0..5 {
            let msg = Message::to("a", "rules", TestIntent::Ping, json!(n), CorrelationId::new());
            bus.send(msg).unwrap();
        }

        let history = bus.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload, json!(2));
        assert_eq!(history[2].payload, json!(4));
        assert_eq!(bus.history(1)[0].payload, json!(4));
    }
}
