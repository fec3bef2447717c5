//! The single path through which workers reach each other.
//!
//! The orchestrator owns the bus, the worker registry and the saga table. It
//! is the only writer of the registry: workers are registered, started and
//! stopped here, and every cross-worker exchange it initiates goes through
//! [`MessageBus::request`] with a bounded timeout.

use crate::bus::MessageBus;
use crate::error::{BusError, BusResult, SagaError, SagaResult};
use crate::id::{CorrelationId, SagaId};
use crate::message::{IntentKind, Message};
use crate::saga::{
    Advance, RetryDecision, Saga, SagaFailure, SagaManager, SagaStatus, StepDef, StepRequest,
};
use crate::worker::{StopOutcome, Worker, WorkerHandle, WorkerReport};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Name the orchestrator uses as message source.
pub const ORCHESTRATOR: &str = "orchestrator";

/// Default budget for a one-shot route-and-wait.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time workers and sagas get to settle on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const SAGA_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig<I> {
    /// Timeout for intents without an override
    pub default_timeout: Duration,
    /// Per-intent timeout overrides
    pub intent_timeouts: HashMap<I, Duration>,
    /// Messages kept in the bus history
    pub history_capacity: usize,
}

impl<I: IntentKind> Default for OrchestratorConfig<I> {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            intent_timeouts: HashMap::new(),
            history_capacity: crate::bus::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl<I: IntentKind> OrchestratorConfig<I> {
    /// Timeout for intents without an override
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Give one intent its own timeout
    pub fn with_intent_timeout(mut self, intent: I, timeout: Duration) -> Self {
        self.intent_timeouts.insert(intent, timeout);
        self
    }

    /// Bound the bus history
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Timeout applied to a request carrying `intent`
    pub fn timeout_for(&self, intent: I) -> Duration {
        self.intent_timeouts
            .get(&intent)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Final state of a driven saga
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome {
    /// Every step produced a result
    Completed {
        /// The saga that finished
        saga_id: SagaId,
        /// Correlation id shared by the saga's messages
        correlation_id: CorrelationId,
        /// Initial context merged with every step result
        context: Map<String, Value>,
    },
    /// A step could not succeed and no fallback was supplied
    Aborted(SagaFailure),
}

impl SagaOutcome {
    /// Whether the saga ran to the end
    pub fn is_completed(&self) -> bool {
        matches!(self, SagaOutcome::Completed { .. })
    }

    fn settled<I: IntentKind>(saga: &Saga<I>) -> Self {
        match (saga.status, &saga.failure) {
            (SagaStatus::Completed, _) => SagaOutcome::Completed {
                saga_id: saga.id,
                correlation_id: saga.correlation_id,
                context: saga.context.clone(),
            },
            (_, Some(failure)) => SagaOutcome::Aborted(failure.clone()),
            (_, None) => SagaOutcome::Aborted(saga.failure("aborted")),
        }
    }
}

/// What happened during [`Orchestrator::stop`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Sagas still active at the drain deadline
    pub aborted_sagas: Vec<SagaFailure>,
    /// Workers that finished their mailbox
    pub drained: Vec<WorkerReport>,
    /// Workers terminated before they finished
    pub forced: Vec<String>,
}

struct Registry<I> {
    pending: Vec<Worker<I>>,
    running: Vec<WorkerHandle>,
    started: bool,
}

impl<I: IntentKind> Registry<I> {
    fn contains(&self, name: &str) -> bool {
        self.pending.iter().any(|w| w.name() == name) || self.running.iter().any(|h| h.name() == name)
    }
}

/// Owner of the bus, the worker registry and the saga table
pub struct Orchestrator<I> {
    bus: MessageBus<I>,
    config: OrchestratorConfig<I>,
    registry: Mutex<Registry<I>>,
    sagas: Mutex<SagaManager<I>>,
    shutting_down: AtomicBool,
}

impl<I: IntentKind> Orchestrator<I> {
    /// An orchestrator with no workers and no saga templates
    pub fn new(config: OrchestratorConfig<I>) -> Self {
        Self {
            bus: MessageBus::new(config.history_capacity),
            config,
            registry: Mutex::new(Registry {
                pending: Vec::new(),
                running: Vec::new(),
                started: false,
            }),
            sagas: Mutex::new(SagaManager::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The bus, for inspection such as [`MessageBus::history`]
    pub fn bus(&self) -> &MessageBus<I> {
        &self.bus
    }

    /// Settings the orchestrator was built with
    pub fn config(&self) -> &OrchestratorConfig<I> {
        &self.config
    }

    /// Add a worker; it is spawned immediately if the orchestrator already started
    pub fn register_worker(&self, worker: Worker<I>) -> BusResult<()> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let mut registry = self.registry()?;
        if registry.contains(worker.name()) {
            return Err(BusError::DuplicateWorker(worker.name().to_string()));
        }
        if registry.started {
            let handle = worker.spawn(&self.bus)?;
            registry.running.push(handle);
        } else {
            registry.pending.push(worker);
        }
        Ok(())
    }

    /// Spawn every registered worker
    pub fn start(&self) -> BusResult<()> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let mut registry = self.registry()?;
        let pending = std::mem::take(&mut registry.pending);
        for worker in pending {
            let handle = worker.spawn(&self.bus)?;
            registry.running.push(handle);
        }
        registry.started = true;
        tracing::info!(workers = registry.running.len(), "Orchestrator started");
        Ok(())
    }

    /// Whether `start` has run and `stop` has not
    pub fn is_running(&self) -> bool {
        !self.is_shutting_down() && self.registry.lock().map(|r| r.started).unwrap_or(false)
    }

    /// Whether `stop` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Send a request to one worker and wait for its reply
    pub async fn request(
        &self,
        target: &str,
        intent: I,
        payload: Value,
        correlation_id: CorrelationId,
    ) -> BusResult<Message<I>> {
        let timeout = self.config.timeout_for(intent);
        self.request_with_timeout(target, intent, payload, correlation_id, timeout)
            .await
    }

    /// Send a request with an explicit timeout
    pub async fn request_with_timeout(
        &self,
        target: &str,
        intent: I,
        payload: Value,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> BusResult<Message<I>> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let message = Message::to(ORCHESTRATOR, target, intent, payload, correlation_id);
        self.bus.request(message, timeout).await
    }

    /// Fire-and-forget send on behalf of the orchestrator
    pub fn send(&self, message: Message<I>) -> BusResult<()> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        self.bus.send(message)
    }

    /// Register the ordered steps of a saga type
    pub fn register_saga_template(
        &self,
        saga_type: impl Into<String>,
        steps: Vec<StepDef<I>>,
    ) -> SagaResult<()> {
        self.sagas()?.register_template(saga_type, steps)
    }

    /// Open a saga whose messages and decisions share `correlation_id`
    pub fn start_saga(
        &self,
        saga_type: &str,
        context: Value,
        correlation_id: CorrelationId,
    ) -> SagaResult<SagaId> {
        self.sagas()?.start_correlated(saga_type, context, correlation_id)
    }

    /// Snapshot of a saga
    pub fn saga(&self, saga_id: SagaId) -> Option<Saga<I>> {
        self.sagas.lock().ok().and_then(|s| s.get(saga_id).cloned())
    }

    /// Ids of sagas still in progress
    pub fn active_sagas(&self) -> Vec<SagaId> {
        self.sagas.lock().map(|s| s.active()).unwrap_or_default()
    }

    /// Drive a saga to a terminal state.
    ///
    /// Each step is routed to its worker with the step's timeout. Timeouts
    /// and handler faults are retried up to the step's budget. When a step
    /// cannot succeed, `fallback` may supply a substitute result; otherwise
    /// the saga is aborted. Never returns a step failure as `Err`.
    pub async fn run_saga<F>(&self, saga_id: SagaId, fallback: F) -> SagaResult<SagaOutcome>
    where
        F: Fn(&StepDef<I>, &StepRequest, &BusError) -> Option<Value>,
    {
        loop {
            let (step, request, correlation_id, retries_left) = {
                let mut sagas = self.sagas()?;
                let saga = sagas.get(saga_id).ok_or(SagaError::NotFound(saga_id))?;
                if saga.status.is_terminal() {
                    let outcome = SagaOutcome::settled(saga);
                    sagas.remove_finished(saga_id);
                    return Ok(outcome);
                }
                let (Some(step), Some(request)) = (saga.current_step(), saga.step_request()) else {
                    return Err(SagaError::NotActive {
                        saga_id,
                        status: saga.status,
                    });
                };
                (
                    step.clone(),
                    request,
                    saga.correlation_id,
                    saga.attempts < step.max_retries,
                )
            };

            let payload = match serde_json::to_value(&request) {
                Ok(payload) => payload,
                Err(err) => {
                    let failure = self.sagas()?.abort(saga_id, format!("unencodable step request: {err}"))?;
                    return Ok(SagaOutcome::Aborted(failure));
                }
            };
            let message = Message::to(ORCHESTRATOR, &step.target, step.intent, payload, correlation_id)
                .with_saga(saga_id);

            let err = match self.bus.request(message, step.timeout).await {
                Ok(reply) => {
                    self.advance_or_settle(saga_id, reply.payload)?;
                    continue;
                }
                Err(err) => err,
            };

            // Aborted while the step was in flight; the loop reports it.
            if !self.saga_is_active(saga_id) {
                continue;
            }

            if err.is_transient() && retries_left {
                match self.sagas()?.record_failure(saga_id, err.to_string()) {
                    Ok(_) | Err(SagaError::NotActive { .. }) => continue,
                    Err(other) => return Err(other),
                }
            }

            if let Some(substitute) = fallback(&step, &request, &err) {
                tracing::warn!(
                    saga_id = %saga_id,
                    step = %step.step_type,
                    error = %err,
                    "Saga step failed, using fallback result"
                );
                self.advance_or_settle(saga_id, substitute)?;
                continue;
            }

            let result = {
                let mut sagas = self.sagas()?;
                if err.is_transient() {
                    sagas.record_failure(saga_id, err.to_string()).map(|decision| match decision {
                        RetryDecision::Aborted(failure) => Some(failure),
                        RetryDecision::Retry { .. } => None,
                    })
                } else {
                    sagas.abort(saga_id, err.to_string()).map(Some)
                }
            };
            match result {
                Ok(Some(failure)) => return Ok(SagaOutcome::Aborted(failure)),
                Ok(None) | Err(SagaError::NotActive { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
    }

    /// Stop accepting work, let sagas and workers settle, then force the rest.
    ///
    /// Sagas get `drain_timeout` to reach a terminal state and are aborted
    /// after that. Workers are then asked to drain and get another
    /// `drain_timeout` before they are terminated.
    pub async fn stop(&self, drain_timeout: Duration) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        tracing::info!(?drain_timeout, "Orchestrator stopping");
        let mut report = ShutdownReport::default();

        let deadline = Instant::now() + drain_timeout;
        while !self.active_sagas().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(SAGA_POLL_INTERVAL).await;
        }
        if let Ok(mut sagas) = self.sagas.lock() {
            for saga_id in sagas.active() {
                if let Ok(failure) = sagas.abort(saga_id, "shutdown: drain timeout elapsed") {
                    report.aborted_sagas.push(failure);
                }
            }
        }

        let handles = match self.registry.lock() {
            Ok(mut registry) => {
                registry.pending.clear();
                std::mem::take(&mut registry.running)
            }
            Err(_) => Vec::new(),
        };
        for handle in &handles {
            handle.drain();
        }

        let deadline = Instant::now() + drain_timeout;
        let outcomes = join_all(handles.into_iter().map(|h| h.join_until(deadline))).await;
        for outcome in outcomes {
            match outcome {
                StopOutcome::Drained(worker) => report.drained.push(worker),
                StopOutcome::Forced(name) => {
                    tracing::warn!(worker = %name, ?drain_timeout, "Worker did not drain in time, terminated");
                    if let Err(err) = self.bus.set_status(&name, crate::worker::WorkerStatus::Stopped) {
                        tracing::debug!(worker = %name, error = %err, "Could not mark terminated worker stopped");
                    }
                    report.forced.push(name);
                }
            }
        }

        let cancelled = self.bus.cancel_pending();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled requests still waiting for a reply");
        }

        tracing::info!(
            drained = report.drained.len(),
            forced = report.forced.len(),
            aborted_sagas = report.aborted_sagas.len(),
            "Orchestrator stopped"
        );
        report
    }

    fn advance_or_settle(&self, saga_id: SagaId, result: Value) -> SagaResult<()> {
        match self.sagas()?.advance(saga_id, result) {
            Ok(Advance::Next(_)) | Ok(Advance::Completed(_)) => Ok(()),
            // Aborted underneath us; the loop reports it.
            Err(SagaError::NotActive { .. }) => Ok(()),
            Err(other) => Err(other),
        }
    }

    fn saga_is_active(&self, saga_id: SagaId) -> bool {
        self.sagas
            .lock()
            .ok()
            .and_then(|s| s.get(saga_id).map(|saga| saga.status == SagaStatus::Active))
            .unwrap_or(false)
    }

    fn registry(&self) -> BusResult<std::sync::MutexGuard<'_, Registry<I>>> {
        self.registry.lock().map_err(|_| BusError::Poisoned("registry"))
    }

    fn sagas(&self) -> SagaResult<std::sync::MutexGuard<'_, SagaManager<I>>> {
        self.sagas.lock().map_err(|_| SagaError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandlerError, HandlerResult};
    use crate::worker::{handler_fn, WorkerContext, WorkerStatus};
    use serde_json::json;
    use std::fmt;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Op {
        Echo,
        Flaky,
        Broken,
        Slow,
    }

    impl fmt::Display for Op {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    async fn echo(msg: Message<Op>, _ctx: WorkerContext<Op>) -> HandlerResult<Value> {
        let request: StepRequest = msg.decode()?;
        Ok(json!({ request.step_type: "done" }))
    }

    fn orchestrator(flaky_failures: u32) -> Orchestrator<Op> {
        let config = OrchestratorConfig::default().with_intent_timeout(Op::Slow, Duration::from_millis(30));
        let orchestrator = Orchestrator::new(config);
        let calls = Arc::new(AtomicU32::new(0));

        let worker = Worker::new("steps")
            .on(Op::Echo, handler_fn(echo))
            .on(
                Op::Flaky,
                handler_fn(move |_msg: Message<Op>, _ctx: WorkerContext<Op>| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < flaky_failures {
                            Err(HandlerError::failed("transient"))
                        } else {
                            Ok(json!({"flaky": "ok"}))
                        }
                    }
                }),
            )
            .on(
                Op::Broken,
                handler_fn(|_msg: Message<Op>, _ctx: WorkerContext<Op>| async move {
                    Err::<Value, _>(HandlerError::failed("broken"))
                }),
            )
            .on(
                Op::Slow,
                handler_fn(|_msg: Message<Op>, _ctx: WorkerContext<Op>| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }),
            );
        orchestrator.register_worker(worker).unwrap();
        orchestrator
    }

    fn no_fallback(_: &StepDef<Op>, _: &StepRequest, _: &BusError) -> Option<Value> {
        None
    }

    #[tokio::test]
    async fn test_request_uses_intent_timeout() {
        let orchestrator = orchestrator(0);
        orchestrator.start().unwrap();

        let result = orchestrator
            .request("steps", Op::Slow, Value::Null, CorrelationId::new())
            .await;
        assert!(matches!(result, Err(BusError::HandlerTimeout { .. })));

        let result = orchestrator
            .request("nobody", Op::Echo, Value::Null, CorrelationId::new())
            .await;
        assert!(matches!(result, Err(BusError::Routing { .. })));
    }

    #[tokio::test]
    async fn test_saga_completes_with_retries() {
        let orchestrator = orchestrator(2);
        orchestrator
            .register_saga_template(
                "trial",
                vec![
                    StepDef::new("first", "steps", Op::Echo),
                    StepDef::new("second", "steps", Op::Flaky),
                ],
            )
            .unwrap();
        orchestrator.start().unwrap();

        let correlation = CorrelationId::new();
        let id = orchestrator.start_saga("trial", json!({"seed": 1}), correlation).unwrap();
        let outcome = orchestrator.run_saga(id, no_fallback).await.unwrap();

        match outcome {
            SagaOutcome::Completed { context, correlation_id, .. } => {
                assert_eq!(correlation_id, correlation);
                assert_eq!(context["first"], json!("done"));
                assert_eq!(context["flaky"], json!("ok"));
                assert_eq!(context["seed"], json!(1));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(orchestrator.saga(id).is_none());
        assert!(orchestrator.active_sagas().is_empty());

        let saga_messages = orchestrator
            .bus()
            .history(64)
            .into_iter()
            .filter(|m| m.saga_id == Some(id))
            .count();
        assert!(saga_messages >= 4);
    }

    #[tokio::test]
    async fn test_saga_aborts_after_retry_budget() {
        let orchestrator = orchestrator(0);
        orchestrator
            .register_saga_template(
                "doomed",
                vec![StepDef::new("break", "steps", Op::Broken).with_max_retries(2)],
            )
            .unwrap();
        orchestrator.start().unwrap();

        let id = orchestrator.start_saga("doomed", Value::Null, CorrelationId::new()).unwrap();
        match orchestrator.run_saga(id, no_fallback).await.unwrap() {
            SagaOutcome::Aborted(failure) => {
                assert_eq!(failure.attempts, 3);
                assert_eq!(failure.step_type.as_deref(), Some("break"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_replaces_failed_step() {
        let orchestrator = orchestrator(0);
        orchestrator
            .register_saga_template(
                "soft",
                vec![
                    StepDef::new("narrate", "steps", Op::Broken).with_max_retries(0),
                    StepDef::new("finish", "steps", Op::Echo),
                ],
            )
            .unwrap();
        orchestrator.start().unwrap();

        let id = orchestrator.start_saga("soft", Value::Null, CorrelationId::new()).unwrap();
        let outcome = orchestrator
            .run_saga(id, |step, _, _| Some(json!({ step.step_type.clone(): "canned" })))
            .await
            .unwrap();

        match outcome {
            SagaOutcome::Completed { context, .. } => {
                assert_eq!(context["narrate"], json!("canned"));
                assert_eq!(context["finish"], json!("done"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_drains_workers_and_refuses_work() {
        let orchestrator = orchestrator(0);
        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());

        let report = orchestrator.stop(Duration::from_secs(1)).await;
        assert_eq!(report.drained.len(), 1);
        assert!(report.forced.is_empty());
        assert_eq!(orchestrator.bus().status("steps"), Some(WorkerStatus::Stopped));

        let result = orchestrator
            .request("steps", Op::Echo, Value::Null, CorrelationId::new())
            .await;
        assert!(matches!(result, Err(BusError::ShuttingDown)));
        assert!(matches!(
            orchestrator.register_worker(Worker::new("late")),
            Err(BusError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_stop_forces_stuck_worker_and_sagas() {
        let orchestrator = Arc::new(orchestrator(0));
        orchestrator
            .register_saga_template(
                "stuck",
                vec![StepDef::new("wait", "steps", Op::Slow).with_timeout(Duration::from_secs(10))],
            )
            .unwrap();
        orchestrator.start().unwrap();

        let id = orchestrator.start_saga("stuck", Value::Null, CorrelationId::new()).unwrap();
        let driver = Arc::clone(&orchestrator);
        let running = tokio::spawn(async move { driver.run_saga(id, no_fallback).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = orchestrator.stop(Duration::from_millis(50)).await;
        assert_eq!(report.aborted_sagas.len(), 1);
        assert_eq!(report.forced, vec!["steps".to_string()]);

        let outcome = running.await.unwrap().unwrap();
        assert!(!outcome.is_completed());
        assert!(orchestrator.saga(id).is_none());
    }

    #[test]
    fn test_duplicate_registration() {
        let orchestrator = orchestrator(0);
        assert!(matches!(
            orchestrator.register_worker(Worker::new("steps")),
            Err(BusError::DuplicateWorker(_))
        ));
    }
}
