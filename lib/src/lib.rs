//! # Agent Bus
//!
//! An in-process message substrate for orchestrating independent, stateful
//! workers.
//!
//! ## Core Concepts
//!
//! - **Message**: immutable envelope carrying an intent, a payload and a correlation id
//! - **MessageBus**: thread-safe point-to-point and broadcast routing with bounded history
//! - **Worker**: a named unit with a mailbox and one handler per intent
//! - **SagaManager**: deterministic progression of multi-step flows with retry budgets
//! - **Orchestrator**: owns the bus, the worker registry and the saga table
//!
//! Workers never hold references to each other. A handler only receives a
//! [`worker::WorkerContext`], which exposes bus operations and nothing else.
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_bus::prelude::*;
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default());
//! orchestrator.register_worker(
//!     Worker::new("rules").on(Intent::SkillCheck, handler_fn(resolve_check)),
//! )?;
//! orchestrator.start()?;
//!
//! let reply = orchestrator
//!     .request("rules", Intent::SkillCheck, payload, CorrelationId::new())
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bus;
pub mod error;
pub mod id;
pub mod message;
pub mod orchestrator;
pub mod saga;
pub mod worker;

pub use error::{BusError, FaultKind, HandlerError, HandlerResult, SagaError};
pub use id::{CorrelationId, MessageId, SagaId};
pub use message::{IntentKind, Message};
pub use saga::{SagaFailure, StepRequest};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bus::{Mailbox, MessageBus};
    pub use crate::error::{
        BusError, BusResult, FaultKind, HandlerError, HandlerResult, RouteFailure, SagaError,
        SagaResult,
    };
    pub use crate::id::*;
    pub use crate::message::*;
    pub use crate::orchestrator::{
        Orchestrator, OrchestratorConfig, SagaOutcome, ShutdownReport, ORCHESTRATOR,
    };
    pub use crate::saga::{
        Advance, RetryDecision, Saga, SagaFailure, SagaManager, SagaStatus, StepDef, StepRequest,
    };
    pub use crate::worker::{
        handler_fn, Handler, StopOutcome, Worker, WorkerContext, WorkerHandle, WorkerReport,
        WorkerStatus,
    };
}
