//! Append-only audit log of every probabilistic decision.
//!
//! Records are never mutated once written. `get_chain` answers "why did
//! this happen" for one correlation id, in insertion order.

use crate::combat::{ActionOutcome, CombatAction, InitiativeEntry};
use crate::engine::SkillCheckOutcome;
use agent_bus::{CorrelationId, SagaFailure, SagaId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// What a record explains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionDetail {
    SkillCheck(SkillCheckOutcome),
    CombatAction {
        round: u32,
        action: CombatAction,
        outcome: ActionOutcome,
    },
    Initiative {
        order: Vec<InitiativeEntry>,
    },
    /// An illegal request, refused before any state changed
    Rejection {
        action: Value,
        reason: String,
    },
    SagaAborted(SagaFailure),
    /// Content was replaced by a canned reply or repaired with defaults
    Fallback {
        step: String,
        reason: String,
        repaired: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub sequence: u64,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub detail: DecisionDetail,
}

impl DecisionRecord {
    pub fn kind(&self) -> &'static str {
        match self.detail {
            DecisionDetail::SkillCheck(_) => "skill_check",
            DecisionDetail::CombatAction { .. } => "combat_action",
            DecisionDetail::Initiative { .. } => "initiative",
            DecisionDetail::Rejection { .. } => "rejection",
            DecisionDetail::SagaAborted(_) => "saga_aborted",
            DecisionDetail::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Default)]
struct LoggerInner {
    records: Vec<DecisionRecord>,
    by_correlation: HashMap<CorrelationId, Vec<usize>>,
    aborted: HashSet<SagaId>,
    next_sequence: u64,
}

impl LoggerInner {
    fn rebuild(records: Vec<DecisionRecord>) -> Self {
        let mut inner = LoggerInner {
            next_sequence: records.iter().map(|r| r.sequence + 1).max().unwrap_or(0),
            ..Default::default()
        };
        for (index, record) in records.iter().enumerate() {
            inner
                .by_correlation
                .entry(record.correlation_id)
                .or_default()
                .push(index);
            if let DecisionDetail::SagaAborted(failure) = &record.detail {
                inner.aborted.insert(failure.saga_id);
            }
        }
        inner.records = records;
        inner
    }
}

/// Session-wide decision log
#[derive(Debug, Default)]
pub struct DecisionLogger {
    inner: Mutex<LoggerInner>,
}

impl DecisionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic elsewhere must not cost us the audit trail.
    fn lock(&self) -> MutexGuard<'_, LoggerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, correlation_id: CorrelationId, actor: Option<String>, detail: DecisionDetail) -> DecisionRecord {
        let mut inner = self.lock();
        let record = DecisionRecord {
            sequence: inner.next_sequence,
            correlation_id,
            actor,
            timestamp: Utc::now(),
            detail,
        };
        inner.next_sequence += 1;
        let index = inner.records.len();
        inner.records.push(record.clone());
        inner.by_correlation.entry(correlation_id).or_default().push(index);

        tracing::debug!(
            correlation_id = %correlation_id,
            sequence = record.sequence,
            kind = record.kind(),
            "Decision recorded"
        );
        record
    }

    pub fn log_skill_check(&self, outcome: SkillCheckOutcome) -> DecisionRecord {
        let actor = Some(outcome.actor_id.clone());
        self.append(outcome.correlation_id, actor, DecisionDetail::SkillCheck(outcome))
    }

    pub fn log_combat_action(
        &self,
        correlation_id: CorrelationId,
        round: u32,
        action: CombatAction,
        outcome: ActionOutcome,
    ) -> DecisionRecord {
        let actor = Some(action.actor().to_string());
        self.append(
            correlation_id,
            actor,
            DecisionDetail::CombatAction { round, action, outcome },
        )
    }

    pub fn log_initiative(&self, correlation_id: CorrelationId, order: Vec<InitiativeEntry>) -> DecisionRecord {
        self.append(correlation_id, None, DecisionDetail::Initiative { order })
    }

    pub fn log_rejection(
        &self,
        correlation_id: CorrelationId,
        actor: Option<String>,
        action: Value,
        reason: impl Into<String>,
    ) -> DecisionRecord {
        self.append(
            correlation_id,
            actor,
            DecisionDetail::Rejection {
                action,
                reason: reason.into(),
            },
        )
    }

    /// Record a saga abort; a second report for the same saga is ignored.
    pub fn log_saga_aborted(&self, failure: SagaFailure) -> Option<DecisionRecord> {
        {
            let mut inner = self.lock();
            if !inner.aborted.insert(failure.saga_id) {
                return None;
            }
        }
        tracing::error!(
            saga_id = %failure.saga_id,
            saga_type = %failure.saga_type,
            step = ?failure.step_type,
            reason = %failure.reason,
            "Saga aborted"
        );
        Some(self.append(failure.correlation_id, None, DecisionDetail::SagaAborted(failure)))
    }

    pub fn log_fallback(
        &self,
        correlation_id: CorrelationId,
        step: impl Into<String>,
        reason: impl Into<String>,
        repaired: bool,
    ) -> DecisionRecord {
        self.append(
            correlation_id,
            None,
            DecisionDetail::Fallback {
                step: step.into(),
                reason: reason.into(),
                repaired,
            },
        )
    }

    /// Every record for a correlation id, in insertion order
    pub fn get_chain(&self, correlation_id: CorrelationId) -> Vec<DecisionRecord> {
        let inner = self.lock();
        inner
            .by_correlation
            .get(&correlation_id)
            .map(|indices| indices.iter().map(|&i| inner.records[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the log wholesale, as when loading a session
    pub fn restore(&self, records: Vec<DecisionRecord>) {
        *self.lock() = LoggerInner::rebuild(records);
    }
}
