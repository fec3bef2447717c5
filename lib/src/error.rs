//! Error types for the message substrate.
//!
//! Uses thiserror for ergonomic error definition.

use crate::id::SagaId;
use crate::saga::SagaStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a message could not be routed to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFailure {
    /// No worker with that name is registered
    UnknownWorker,
    /// The worker is registered but not running
    Stopped,
    /// The worker is draining its mailbox and accepts no new messages
    Draining,
    /// The worker's mailbox has been closed
    MailboxClosed,
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteFailure::UnknownWorker => write!(f, "unknown"),
            RouteFailure::Stopped => write!(f, "stopped"),
            RouteFailure::Draining => write!(f, "draining"),
            RouteFailure::MailboxClosed => write!(f, "closed"),
        }
    }
}

/// Bus-specific errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Target worker is unknown or not accepting messages
    #[error("Routing error: worker '{target}' is {reason}")]
    Routing {
        /// Target worker name
        target: String,
        /// Why routing failed
        reason: RouteFailure,
    },

    /// A worker did not respond within its budget
    #[error("Worker '{target}' did not respond within {timeout:?}")]
    HandlerTimeout {
        /// Target worker name
        target: String,
        /// The budget that elapsed
        timeout: Duration,
    },

    /// The worker replied with a fault
    #[error("Worker '{target}' failed: {reason}")]
    HandlerFault {
        /// Target worker name
        target: String,
        /// Class of handler failure
        kind: FaultKind,
        /// Fault text from the reply
        reason: String,
    },

    /// A worker with this name is already registered
    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    /// The pending reply slot was dropped before a reply arrived
    #[error("Reply channel for worker '{target}' closed before a reply arrived")]
    ReplyDropped {
        /// Target worker name
        target: String,
    },

    /// The bus is shutting down and accepts no new requests
    #[error("Bus is shutting down")]
    ShuttingDown,

    /// An internal lock was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl BusError {
    /// Create a routing error
    pub fn routing(target: impl Into<String>, reason: RouteFailure) -> Self {
        BusError::Routing {
            target: target.into(),
            reason,
        }
    }

    /// Whether retrying the same request could succeed.
    ///
    /// Rejections and undecodable payloads fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::HandlerTimeout { .. }
                | BusError::HandlerFault {
                    kind: FaultKind::Failed,
                    ..
                }
        )
    }
}

/// Class of a handler failure carried on a fault reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The request was understood but refused
    Rejected,
    /// The payload could not be decoded
    InvalidPayload,
    /// The handler failed while processing
    Failed,
}

/// Errors returned by worker handlers
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Payload could not be decoded into the handler's input type
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The request was understood but refused
    #[error("Rejected: {reason}")]
    Rejected {
        /// Why the request was refused
        reason: String,
    },

    /// The handler failed while processing
    #[error("Handler failed: {reason}")]
    Failed {
        /// Failure description
        reason: String,
    },

    /// A bus operation issued by the handler failed
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl HandlerError {
    /// Create a rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected {
            reason: reason.into(),
        }
    }

    /// Create a failure
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed {
            reason: reason.into(),
        }
    }

    /// Fault class reported to the requester
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            HandlerError::Rejected { .. } => FaultKind::Rejected,
            HandlerError::InvalidPayload(_) => FaultKind::InvalidPayload,
            HandlerError::Failed { .. } | HandlerError::Bus(_) => FaultKind::Failed,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

/// Saga-specific errors
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// No template registered for the saga type
    #[error("Unknown saga type: {0}")]
    UnknownTemplate(String),

    /// A template must contain at least one step
    #[error("Saga template '{0}' has no steps")]
    EmptyTemplate(String),

    /// Saga not found
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Saga is already in a terminal state
    #[error("Saga {saga_id} is not active (status: {status:?})")]
    NotActive {
        /// The saga
        saga_id: SagaId,
        /// Its terminal status
        status: SagaStatus,
    },

    /// The saga table lock was poisoned by a panicking thread
    #[error("Saga table lock poisoned")]
    Poisoned,
}

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Result type for handler operations
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Result type for saga operations
pub type SagaResult<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::routing("rules", RouteFailure::UnknownWorker);
        assert_eq!(err.to_string(), "Routing error: worker 'rules' is unknown");
    }

    #[test]
    fn test_transient_classification() {
        let timeout = BusError::HandlerTimeout {
            target: "lore".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        assert!(!BusError::routing("lore", RouteFailure::Stopped).is_transient());

        let rejected = BusError::HandlerFault {
            target: "rules".to_string(),
            kind: HandlerError::rejected("not your turn").fault_kind(),
            reason: "not your turn".to_string(),
        };
        assert!(!rejected.is_transient());
    }
}
