//! Multi-step interactions tracked under one correlation id.
//!
//! A saga is instantiated from a fixed template and advanced strictly in
//! declared order. Step failures are counted against the step's retry budget;
//! once it is spent the saga is aborted with a structured [`SagaFailure`].

use crate::error::{SagaError, SagaResult};
use crate::id::{CorrelationId, SagaId};
use crate::message::IntentKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of resubmissions after a step's first failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle of a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps remain to be run
    Active,
    /// Every step produced a result
    Completed,
    /// Stopped before the last step
    Aborted,
}

impl SagaStatus {
    /// Whether the saga can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SagaStatus::Active)
    }
}

/// One step of a saga template
#[derive(Debug, Clone, PartialEq)]
pub struct StepDef<I> {
    /// What the step does, e.g. `present_choice`
    pub step_type: String,
    /// Worker that handles the step
    pub target: String,
    /// Intent sent to the worker
    pub intent: I,
    /// Budget for a single attempt
    pub timeout: Duration,
    /// Resubmissions allowed after the first failure
    pub max_retries: u32,
}

impl<I: IntentKind> StepDef<I> {
    /// Create a step with default timeout and retry budget
    pub fn new(step_type: impl Into<String>, target: impl Into<String>, intent: I) -> Self {
        Self {
            step_type: step_type.into(),
            target: target.into(),
            intent,
            timeout: DEFAULT_STEP_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Payload sent to the worker handling a saga step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// Saga the step belongs to
    pub saga_id: SagaId,
    /// Position of the step in its saga. With `saga_id` this names one
    /// unit of work however many times it is sent.
    #[serde(default)]
    pub step_index: usize,
    /// Template the saga was started from
    pub saga_type: String,
    /// What the step does, e.g. `resolve_check`
    pub step_type: String,
    /// Results accumulated by earlier steps
    pub context: Map<String, Value>,
}

/// Structured description of why a saga was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailure {
    /// The aborted saga
    pub saga_id: SagaId,
    /// Template it was started from
    pub saga_type: String,
    /// Correlation id shared by its messages
    pub correlation_id: CorrelationId,
    /// Step that was executing, if any
    pub step_type: Option<String>,
    /// Attempts made on that step
    pub attempts: u32,
    /// Last error seen, or the reason given for the abort
    pub reason: String,
}

/// A tracked multi-step interaction
#[derive(Debug, Clone)]
pub struct Saga<I> {
    /// Unique id
    pub id: SagaId,
    /// Template it was started from
    pub saga_type: String,
    /// Next step to run; equals `steps.len()` once completed
    pub step_index: usize,
    /// Copy of the template's steps
    pub steps: Vec<StepDef<I>>,
    /// Initial context merged with each step's result
    pub context: Map<String, Value>,
    /// Correlation id shared by every message the saga sends
    pub correlation_id: CorrelationId,
    /// Where the saga is in its lifecycle
    pub status: SagaStatus,
    /// When the saga was started
    pub started_at: DateTime<Utc>,
    /// Failed attempts on the current step
    pub attempts: u32,
    /// Why the saga was aborted, once it has been
    pub failure: Option<SagaFailure>,
}

impl<I: IntentKind> Saga<I> {
    /// Step currently awaiting execution
    pub fn current_step(&self) -> Option<&StepDef<I>> {
        match self.status {
            SagaStatus::Active => self.steps.get(self.step_index),
            _ => None,
        }
    }

    /// Build the payload for the current step
    pub fn step_request(&self) -> Option<StepRequest> {
        self.current_step().map(|step| StepRequest {
            saga_id: self.id,
            step_index: self.step_index,
            saga_type: self.saga_type.clone(),
            step_type: step.step_type.clone(),
            context: self.context.clone(),
        })
    }

    pub(crate) fn failure(&self, reason: impl Into<String>) -> SagaFailure {
        SagaFailure {
            saga_id: self.id,
            saga_type: self.saga_type.clone(),
            correlation_id: self.correlation_id,
            step_type: self.steps.get(self.step_index).map(|s| s.step_type.clone()),
            attempts: self.attempts,
            reason: reason.into(),
        }
    }
}

/// Result of advancing a saga
#[derive(Debug, Clone, PartialEq)]
pub enum Advance<I> {
    /// The next step to execute
    Next(StepDef<I>),
    /// All steps done; the accumulated context is the final result
    Completed(Map<String, Value>),
}

/// What to do after a step attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision<I> {
    /// Resubmit the same step
    Retry { step: StepDef<I>, attempt: u32 },
    /// Retry budget spent; the saga is aborted
    Aborted(SagaFailure),
}

/// Owns saga templates and every saga instance
#[derive(Debug)]
pub struct SagaManager<I> {
    templates: HashMap<String, Vec<StepDef<I>>>,
    sagas: HashMap<SagaId, Saga<I>>,
}

impl<I: IntentKind> Default for SagaManager<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: IntentKind> SagaManager<I> {
    /// An empty manager with no templates
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            sagas: HashMap::new(),
        }
    }

    /// Register the fixed step list for a saga type
    pub fn register_template(
        &mut self,
        saga_type: impl Into<String>,
        steps: Vec<StepDef<I>>,
    ) -> SagaResult<()> {
        let saga_type = saga_type.into();
        if steps.is_empty() {
            return Err(SagaError::EmptyTemplate(saga_type));
        }
        self.templates.insert(saga_type, steps);
        Ok(())
    }

    /// Whether a template exists for the saga type
    pub fn has_template(&self, saga_type: &str) -> bool {
        self.templates.contains_key(saga_type)
    }

    /// Start a saga under a fresh correlation id
    pub fn start(&mut self, saga_type: &str, context: Value) -> SagaResult<SagaId> {
        self.start_correlated(saga_type, context, CorrelationId::new())
    }

    /// Start a saga under an existing correlation id
    pub fn start_correlated(
        &mut self,
        saga_type: &str,
        context: Value,
        correlation_id: CorrelationId,
    ) -> SagaResult<SagaId> {
        let steps = self
            .templates
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownTemplate(saga_type.to_string()))?;

        let context = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };

        let saga = Saga {
            id: SagaId::new(),
            saga_type: saga_type.to_string(),
            step_index: 0,
            steps,
            context,
            correlation_id,
            status: SagaStatus::Active,
            started_at: Utc::now(),
            attempts: 0,
            failure: None,
        };
        let id = saga.id;

        tracing::info!(
            saga_id = %id,
            saga_type,
            correlation_id = %correlation_id,
            steps = saga.steps.len(),
            "Saga started"
        );
        self.sagas.insert(id, saga);
        Ok(id)
    }

    /// Merge a step result into the context and move to the next step.
    ///
    /// Object results are merged key by key; any other value is stored under
    /// the step's type.
    pub fn advance(&mut self, saga_id: SagaId, step_result: Value) -> SagaResult<Advance<I>> {
        let saga = self.active_mut(saga_id)?;

        let step_type = saga.steps[saga.step_index].step_type.clone();
        match step_result {
            Value::Object(fields) => saga.context.extend(fields),
            Value::Null => {}
            other => {
                saga.context.insert(step_type.clone(), other);
            }
        }
        saga.step_index += 1;
        saga.attempts = 0;

        if saga.step_index == saga.steps.len() {
            saga.status = SagaStatus::Completed;
            tracing::info!(saga_id = %saga_id, saga_type = %saga.saga_type, "Saga completed");
            return Ok(Advance::Completed(saga.context.clone()));
        }

        let next = saga.steps[saga.step_index].clone();
        tracing::debug!(saga_id = %saga_id, completed = %step_type, next = %next.step_type, "Saga advanced");
        Ok(Advance::Next(next))
    }

    /// Count a failed attempt on the current step.
    ///
    /// Returns `Retry` while the step's budget allows another attempt,
    /// otherwise aborts the saga.
    pub fn record_failure(
        &mut self,
        saga_id: SagaId,
        reason: impl Into<String>,
    ) -> SagaResult<RetryDecision<I>> {
        let reason = reason.into();
        let saga = self.active_mut(saga_id)?;
        saga.attempts += 1;

        let step = saga.steps[saga.step_index].clone();
        if saga.attempts <= step.max_retries {
            tracing::warn!(
                saga_id = %saga_id,
                step = %step.step_type,
                attempt = saga.attempts,
                max_retries = step.max_retries,
                reason = %reason,
                "Saga step failed, retrying"
            );
            return Ok(RetryDecision::Retry {
                attempt: saga.attempts,
                step,
            });
        }

        let failure = saga.failure(reason);
        saga.status = SagaStatus::Aborted;
        saga.failure = Some(failure.clone());
        tracing::error!(
            saga_id = %saga_id,
            step = %step.step_type,
            attempts = failure.attempts,
            reason = %failure.reason,
            "Saga aborted"
        );
        Ok(RetryDecision::Aborted(failure))
    }

    /// Abort an active saga regardless of its retry budget
    pub fn abort(&mut self, saga_id: SagaId, reason: impl Into<String>) -> SagaResult<SagaFailure> {
        let saga = self.active_mut(saga_id)?;
        let failure = saga.failure(reason);
        saga.status = SagaStatus::Aborted;
        saga.failure = Some(failure.clone());
        tracing::error!(saga_id = %saga_id, reason = %failure.reason, "Saga aborted");
        Ok(failure)
    }

    /// Look up a saga
    pub fn get(&self, saga_id: SagaId) -> Option<&Saga<I>> {
        self.sagas.get(&saga_id)
    }

    /// Ids of sagas still in progress, oldest first
    pub fn active(&self) -> Vec<SagaId> {
        let mut active: Vec<&Saga<I>> = self
            .sagas
            .values()
            .filter(|s| s.status == SagaStatus::Active)
            .collect();
        active.sort_by_key(|s| (s.started_at, s.id));
        active.into_iter().map(|s| s.id).collect()
    }

    /// Take a settled saga out of the table. Active sagas are left in place.
    pub fn remove_finished(&mut self, saga_id: SagaId) -> Option<Saga<I>> {
        match self.sagas.get(&saga_id) {
            Some(saga) if saga.status.is_terminal() => self.sagas.remove(&saga_id),
            _ => None,
        }
    }

    fn active_mut(&mut self, saga_id: SagaId) -> SagaResult<&mut Saga<I>> {
        let saga = self
            .sagas
            .get_mut(&saga_id)
            .ok_or(SagaError::NotFound(saga_id))?;
        if saga.status != SagaStatus::Active {
            return Err(SagaError::NotActive {
                saga_id,
                status: saga.status,
            });
        }
        Ok(saga)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        Present,
        Resolve,
        Apply,
    }

    impl fmt::Display for Step {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn manager() -> SagaManager<Step> {
        let mut manager = SagaManager::new();
        manager
            .register_template(
                "challenge",
                vec![
                    StepDef::new("present_choice", "scenario", Step::Present),
                    StepDef::new("resolve_check", "rules", Step::Resolve).with_max_retries(1),
                    StepDef::new("apply_consequence", "rules", Step::Apply),
                ],
            )
            .unwrap();
        manager
    }

    #[test]
    fn test_unknown_and_empty_templates() {
        let mut manager = manager();
        assert!(matches!(manager.start("heist", Value::Null), Err(SagaError::UnknownTemplate(_))));
        assert!(matches!(
            manager.register_template("empty", Vec::new()),
            Err(SagaError::EmptyTemplate(_))
        ));
    }

    #[test]
    fn test_advance_runs_steps_in_order() {
        let mut manager = manager();
        let id = manager.start("challenge", json!({"actor": "pc-1"})).unwrap();
        assert_eq!(manager.get(id).unwrap().current_step().unwrap().step_type, "present_choice");

        let next = manager.advance(id, json!({"choices": ["climb", "swim"]})).unwrap();
        assert!(matches!(next, Advance::Next(ref s) if s.step_type == "resolve_check"));
        let request = manager.get(id).unwrap().step_request().unwrap();
        assert_eq!((request.saga_id, request.step_index), (id, 1));

        manager.advance(id, json!({"total": 17})).unwrap();
        let done = manager.advance(id, json!("applied")).unwrap();

        match done {
            Advance::Completed(context) => {
                assert_eq!(context["actor"], json!("pc-1"));
                assert_eq!(context["total"], json!(17));
                assert_eq!(context["apply_consequence"], json!("applied"));
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let saga = manager.get(id).unwrap();
        assert_eq!(saga.status, SagaStatus::Completed);
        assert_eq!(saga.step_index, saga.steps.len());
        assert!(matches!(manager.advance(id, Value::Null), Err(SagaError::NotActive { .. })));
    }

    #[test]
    fn test_step_index_never_exceeds_step_count() {
        let mut manager = manager();
        let id = manager.start("challenge", Value::Null).unwrap();
        let mut last = 0;
        for _ in 0..10 {
            let _ = manager.advance(id, Value::Null);
            let saga = manager.get(id).unwrap();
            assert!(saga.step_index >= last);
            assert!(saga.step_index <= saga.steps.len());
            assert_eq!(saga.status == SagaStatus::Completed, saga.step_index == saga.steps.len());
            last = saga.step_index;
        }
    }

    #[test]
    fn test_retry_budget_then_abort() {
        let mut manager = manager();
        let id = manager.start("challenge", Value::Null).unwrap();
        manager.advance(id, Value::Null).unwrap();

        assert!(matches!(
            manager.record_failure(id, "timeout").unwrap(),
            RetryDecision::Retry { attempt: 1, .. }
        ));
        match manager.record_failure(id, "timeout").unwrap() {
            RetryDecision::Aborted(failure) => {
                assert_eq!(failure.step_type.as_deref(), Some("resolve_check"));
                assert_eq!(failure.attempts, 2);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(manager.get(id).unwrap().status, SagaStatus::Aborted);
        assert!(manager.active().is_empty());
    }

    #[test]
    fn test_successful_step_resets_attempts() {
        let mut manager = manager();
        let id = manager.start("challenge", Value::Null).unwrap();
        manager.record_failure(id, "flaky").unwrap();
        manager.advance(id, Value::Null).unwrap();
        assert_eq!(manager.get(id).unwrap().attempts, 0);
    }

    #[test]
    fn test_correlated_start_and_remove() {
        let mut manager = manager();
        let correlation = CorrelationId::new();
        let id = manager.start_correlated("challenge", Value::Null, correlation).unwrap();
        assert_eq!(manager.get(id).unwrap().correlation_id, correlation);
        assert!(manager.remove_finished(id).is_none());
        assert!(manager.get(id).is_some());

        manager.abort(id, "shutdown").unwrap();
        let removed = manager.remove_finished(id).unwrap();
        assert_eq!(removed.status, SagaStatus::Aborted);
        assert!(manager.get(id).is_none());
        assert!(manager.remove_finished(id).is_none());
    }
}
