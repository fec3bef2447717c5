//! Message envelopes exchanged between workers.
//!
//! Messages are the only means of communication between workers. Once sent a
//! message is never mutated; replies are new messages that point back at the
//! request through `reply_to`.

use crate::error::{FaultKind, HandlerError};
use crate::id::{CorrelationId, MessageId, SagaId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

/// Default time-to-live for a message.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Name used as `source` for messages injected from outside the worker set.
pub const EXTERNAL_SOURCE: &str = "external";

/// Marker trait for intent types carried by messages.
///
/// Intents are a closed set defined by the application; workers register one
/// handler per intent.
pub trait IntentKind: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> IntentKind for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Where a message is delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// Exactly one named worker
    Worker(String),
    /// Every worker registered when the message is sent
    Broadcast,
}

impl Target {
    /// Target a single worker by name
    pub fn worker(name: impl Into<String>) -> Self {
        Target::Worker(name.into())
    }

    /// Name of the target worker, if point-to-point
    pub fn worker_name(&self) -> Option<&str> {
        match self {
            Target::Worker(name) => Some(name),
            Target::Broadcast => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Worker(name) => write!(f, "{name}"),
            Target::Broadcast => write!(f, "*"),
        }
    }
}

/// Failure carried on a reply in place of a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Class of failure
    pub kind: FaultKind,
    /// Human-readable reason
    pub reason: String,
}

/// An immutable envelope routed by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<I> {
    /// Unique message ID
    pub id: MessageId,
    /// Name of the sending worker
    pub source: String,
    /// Delivery target
    pub target: Target,
    /// What the receiver is asked to do
    pub intent: I,
    /// Intent-specific payload
    pub payload: Value,
    /// Logical player action this message belongs to
    pub correlation_id: CorrelationId,
    /// Saga this message belongs to, for multi-step flows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<SagaId>,
    /// The request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Handler failure, set only on replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    /// When the message was created
    pub created_at: DateTime<Utc>,
    /// How long the message stays deliverable
    pub ttl: Duration,
}

impl<I: IntentKind> Message<I> {
    /// Create a new point-to-point message
    pub fn new(
        source: impl Into<String>,
        target: Target,
        intent: I,
        payload: Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id: MessageId::new(),
            source: source.into(),
            target,
            intent,
            payload,
            correlation_id,
            saga_id: None,
            reply_to: None,
            fault: None,
            created_at: Utc::now(),
            ttl: DEFAULT_TTL,
        }
    }

    /// Create a message addressed to one worker
    pub fn to(
        source: impl Into<String>,
        target: impl Into<String>,
        intent: I,
        payload: Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self::new(source, Target::worker(target), intent, payload, correlation_id)
    }

    /// Attach the message to a saga
    pub fn with_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Override the time-to-live
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build a successful reply to this message
    pub fn reply(&self, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: MessageId::new(),
            source: source.into(),
            target: Target::Worker(self.source.clone()),
            intent: self.intent,
            payload,
            correlation_id: self.correlation_id,
            saga_id: self.saga_id,
            reply_to: Some(self.id),
            fault: None,
            created_at: Utc::now(),
            ttl: self.ttl,
        }
    }

    /// Build a failed reply to this message
    pub fn fault_reply(
        &self,
        source: impl Into<String>,
        kind: FaultKind,
        reason: impl Into<String>,
    ) -> Self {
        let mut reply = self.reply(source, Value::Null);
        reply.fault = Some(Fault {
            kind,
            reason: reason.into(),
        });
        reply
    }

    /// Whether this message answers an earlier request
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Whether the message has outlived its ttl
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now > self.created_at + ttl,
            Err(_) => false,
        }
    }

    /// Decode the payload into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl<I: IntentKind> fmt::Display for Message<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} -> {}] {} ({})",
            self.source, self.target, self.intent, self.correlation_id
        )
    }
}
