//! D&D 5e rules core orchestrated over a message bus.
//!
//! This crate provides:
//! - A deterministic skill-check pipeline and combat state machine
//! - House-rule policy profiles (advantage sources, DC adjustment, crit range)
//! - An append-only decision log answering "why did this happen"
//! - Sagas for multi-step flows with canned fallbacks for creative content
//! - Session snapshots
//!
//! # Quick Start
//!
//! ```ignore
//! use dnd_core::{CommandEnvelope, CommandIntent, Conductor, EngineConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conductor = Conductor::builder()
//!         .with_config(EngineConfig::from_env()?)
//!         .build()?;
//!
//!     let result = conductor
//!         .handle_command(CommandEnvelope::new(
//!             CommandIntent::SkillCheck,
//!             "pc-1",
//!             json!({ "check": { "type": "skill", "value": "stealth" }, "dc": 15 }),
//!         ))
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!
//!     let why = conductor.decision_chain(result.correlation_id);
//!     println!("{} decision(s)", why.len());
//!
//!     conductor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod character;
pub mod chronicle;
pub mod combat;
pub mod command;
pub mod conductor;
pub mod config;
pub mod content;
pub mod decisions;
pub mod dice;
pub mod engine;
pub mod policy;
pub mod rules;
pub mod session;
pub mod testing;
pub mod workers;

// Primary public API
pub use command::{CommandEnvelope, CommandError, CommandIntent, CommandResult};
pub use conductor::{Conductor, ConductorBuilder, StartupError};
pub use config::{ConfigError, EngineConfig};
pub use content::{ContentAgent, ContentReply, ContentRequest};
pub use decisions::{DecisionDetail, DecisionLogger, DecisionRecord};
pub use engine::RuleResolutionEngine;
pub use session::{PersistError, SessionSnapshot};
pub use testing::TestHarness;

pub use agent_bus::CorrelationId;
