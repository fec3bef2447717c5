//! Workers: named units with a mailbox and a handler per intent.
//!
//! Each worker runs as one sequential task. It only ever sees the bus through
//! its [`WorkerContext`], so a worker cannot hold or call another worker.

use crate::bus::{Mailbox, MessageBus};
use crate::error::{BusResult, HandlerError, HandlerResult};
use crate::message::{IntentKind, Message};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Not processing; sends are refused
    Stopped,
    /// Processing its mailbox
    Running,
    /// Finishing buffered messages; new sends are refused
    Draining,
}

/// Handler for one intent
#[async_trait]
pub trait Handler<I: IntentKind>: Send + Sync {
    /// Process a message and produce the reply payload
    async fn handle(&self, message: &Message<I>, ctx: &WorkerContext<I>) -> HandlerResult<Value>;
}

/// Adapter turning an async closure into a [`Handler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler(f)
}

#[async_trait]
impl<I, F, Fut> Handler<I> for FnHandler<F>
where
    I: IntentKind,
    F: Fn(Message<I>, WorkerContext<I>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<Value>> + Send,
{
    async fn handle(&self, message: &Message<I>, ctx: &WorkerContext<I>) -> HandlerResult<Value> {
        (self.0)(message.clone(), ctx.clone()).await
    }
}

/// What a handler can reach: its own name and the bus
#[derive(Clone)]
pub struct WorkerContext<I> {
    name: String,
    bus: MessageBus<I>,
}

impl<I: IntentKind> WorkerContext<I> {
    /// Name of the worker running the handler
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget send through the bus
    pub fn send(&self, message: Message<I>) -> BusResult<()> {
        self.bus.send(message)
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, message: Message<I>, timeout: Duration) -> BusResult<Message<I>> {
        self.bus.request(message, timeout).await
    }

    /// Deliver a message to every other running worker
    pub fn broadcast(&self, message: Message<I>) -> BusResult<usize> {
        self.bus.broadcast(message)
    }
}

/// A named worker definition, not yet running
pub struct Worker<I> {
    name: String,
    handlers: HashMap<I, Arc<dyn Handler<I>>>,
}

impl<I: IntentKind> fmt::Debug for Worker<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("intents", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<I: IntentKind> Worker<I> {
    /// Create a worker with no handlers
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler for an intent, replacing any previous one
    pub fn on<H: Handler<I> + 'static>(mut self, intent: I, handler: H) -> Self {
        self.handlers.insert(intent, Arc::new(handler));
        self
    }

    /// Register a shared handler for an intent
    pub fn on_arc(mut self, intent: I, handler: Arc<dyn Handler<I>>) -> Self {
        self.handlers.insert(intent, handler);
        self
    }

    /// Whether a handler is registered for the intent
    pub fn handles(&self, intent: I) -> bool {
        self.handlers.contains_key(&intent)
    }

    /// Subscribe to the bus and start processing the mailbox
    pub fn spawn(self, bus: &MessageBus<I>) -> BusResult<WorkerHandle> {
        let mailbox = bus.subscribe(self.name.clone())?;
        bus.set_status(&self.name, WorkerStatus::Running)?;

        let (drain_tx, drain_rx) = watch::channel(false);
        let name = self.name.clone();
        let ctx = WorkerContext {
            name: self.name.clone(),
            bus: bus.clone(),
        };

        tracing::info!(worker = %name, "Worker started");
        let join = tokio::spawn(self.run(mailbox, drain_rx, ctx));

        Ok(WorkerHandle {
            name,
            drain: drain_tx,
            join,
        })
    }

    async fn run(
        self,
        mut mailbox: Mailbox<I>,
        mut drain: watch::Receiver<bool>,
        ctx: WorkerContext<I>,
    ) -> WorkerReport {
        let mut processed = 0u64;

        loop {
            tokio::select! {
                biased;
                changed = drain.changed() => {
                    if changed.is_err() || *drain.borrow() {
                        break;
                    }
                }
                next = mailbox.recv() => match next {
                    Some(message) => {
                        self.dispatch(message, &ctx).await;
                        processed += 1;
                    }
                    None => break,
                },
            }
        }

        if let Err(err) = ctx.bus.set_status(&self.name, WorkerStatus::Draining) {
            tracing::debug!(worker = %self.name, error = %err, "Could not mark worker draining");
        }
        mailbox.close();
        while let Some(message) = mailbox.recv().await {
            self.dispatch(message, &ctx).await;
            processed += 1;
        }

        if let Err(err) = ctx.bus.set_status(&self.name, WorkerStatus::Stopped) {
            tracing::debug!(worker = %self.name, error = %err, "Could not mark worker stopped");
        }
        tracing::info!(worker = %self.name, processed, "Worker stopped");

        WorkerReport {
            name: self.name,
            processed,
        }
    }

    async fn dispatch(&self, message: Message<I>, ctx: &WorkerContext<I>) {
        if message.is_expired(chrono::Utc::now()) {
            tracing::debug!(worker = %self.name, message_id = %message.id, "Dropping expired message");
            return;
        }
        if message.is_reply() {
            tracing::debug!(worker = %self.name, message_id = %message.id, "Ignoring unsolicited reply");
            return;
        }

        let reply = match self.handlers.get(&message.intent) {
            Some(handler) => match run_guarded(handler.as_ref(), &message, ctx).await {
                Ok(payload) => message.reply(&self.name, payload),
                Err(err) => {
                    tracing::warn!(
                        worker = %self.name,
                        intent = %message.intent,
                        correlation_id = %message.correlation_id,
                        error = %err,
                        "Handler failed"
                    );
                    message.fault_reply(&self.name, err.fault_kind(), err.to_string())
                }
            },
            None => {
                let err = HandlerError::rejected(format!("no handler for intent {}", message.intent));
                message.fault_reply(&self.name, err.fault_kind(), err.to_string())
            }
        };

        if let Err(err) = ctx.bus.send(reply) {
            tracing::debug!(worker = %self.name, error = %err, "Reply could not be delivered");
        }
    }
}

/// Run a handler, turning a panic into a `failed` fault so the worker task
/// survives it.
async fn run_guarded<I: IntentKind>(
    handler: &dyn Handler<I>,
    message: &Message<I>,
    ctx: &WorkerContext<I>,
) -> HandlerResult<Value> {
    match AssertUnwindSafe(handler.handle(message, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                worker = %ctx.name(),
                intent = %message.intent,
                correlation_id = %message.correlation_id,
                reason = %reason,
                "Handler panicked"
            );
            Err(HandlerError::failed(format!("handler panicked: {reason}")))
        }
    }
}

/// Summary returned by a worker task when it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker name
    pub name: String,
    /// Messages processed over the worker's lifetime
    pub processed: u64,
}

/// Control handle for a running worker
pub struct WorkerHandle {
    name: String,
    drain: watch::Sender<bool>,
    join: JoinHandle<WorkerReport>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("finished", &self.join.is_finished())
            .finish()
    }
}

impl WorkerHandle {
    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to finish its buffered messages and exit
    pub fn drain(&self) {
        // Receiver gone means the task already exited.
        let _ = self.drain.send(true);
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker task to exit
    pub async fn join(self) -> Option<WorkerReport> {
        self.join.await.ok()
    }

    /// Terminate the worker task without draining
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Wait until `deadline` for the task to exit, aborting it otherwise
    pub async fn join_until(mut self, deadline: tokio::time::Instant) -> StopOutcome {
        match tokio::time::timeout_at(deadline, &mut self.join).await {
            Ok(Ok(report)) => StopOutcome::Drained(report),
            Ok(Err(_)) => StopOutcome::Forced(self.name),
            Err(_) => {
                self.join.abort();
                StopOutcome::Forced(self.name)
            }
        }
    }
}

/// How a worker ended during shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker finished its mailbox and exited
    Drained(WorkerReport),
    /// The worker was terminated before it finished
    Forced(String),
}
