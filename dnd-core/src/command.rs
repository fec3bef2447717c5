//! The public command boundary: envelopes in, structured results out.

use agent_bus::{BusError, CorrelationId, FaultKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Closed set of commands the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandIntent {
    SkillCheck,
    CombatAction,
    StartCombat,
    NextTurn,
    EndCombat,
    RuleQuery,
    ScenarioChoice,
    SkillChallenge,
    SocialEncounter,
    PassiveScore,
}

impl CommandIntent {
    pub const ALL: [CommandIntent; 10] = [
        CommandIntent::SkillCheck,
        CommandIntent::CombatAction,
        CommandIntent::StartCombat,
        CommandIntent::NextTurn,
        CommandIntent::EndCombat,
        CommandIntent::RuleQuery,
        CommandIntent::ScenarioChoice,
        CommandIntent::SkillChallenge,
        CommandIntent::SocialEncounter,
        CommandIntent::PassiveScore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandIntent::SkillCheck => "SKILL_CHECK",
            CommandIntent::CombatAction => "COMBAT_ACTION",
            CommandIntent::StartCombat => "START_COMBAT",
            CommandIntent::NextTurn => "NEXT_TURN",
            CommandIntent::EndCombat => "END_COMBAT",
            CommandIntent::RuleQuery => "RULE_QUERY",
            CommandIntent::ScenarioChoice => "SCENARIO_CHOICE",
            CommandIntent::SkillChallenge => "SKILL_CHALLENGE",
            CommandIntent::SocialEncounter => "SOCIAL_ENCOUNTER",
            CommandIntent::PassiveScore => "PASSIVE_SCORE",
        }
    }

    /// Saga template opened for multi-step intents
    pub fn saga_type(&self) -> Option<&'static str> {
        match self {
            CommandIntent::SkillChallenge => Some("skill_challenge"),
            CommandIntent::SocialEncounter => Some("social_encounter"),
            CommandIntent::StartCombat => Some("combat_encounter"),
            _ => None,
        }
    }
}

impl fmt::Display for CommandIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandIntent {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        CommandIntent::ALL
            .into_iter()
            .find(|intent| intent.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CommandError::UnknownIntent(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandActor {
    pub id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "player".to_string()
}

/// An external command.
///
/// `intent` stays a string on the wire so an unknown intent is reported as
/// `UnknownIntent` rather than a parse failure of the whole envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub intent: String,
    #[serde(default)]
    pub actor: CommandActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub body: Value,
}

impl CommandEnvelope {
    pub fn new(intent: CommandIntent, actor_id: impl Into<String>, body: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            intent: intent.as_str().to_string(),
            actor: CommandActor {
                id: actor_id.into(),
                role: default_role(),
            },
            correlation_id: None,
            body,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// The body as an object, with `key` defaulted to the acting player
    pub(crate) fn body_with_actor(&self, key: &str) -> Result<Map<String, Value>, CommandError> {
        let mut body = match &self.body {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(CommandError::InvalidCommand(format!(
                    "body must be an object, got {other}"
                )))
            }
        };
        if !body.contains_key(key) && !self.actor.id.is_empty() {
            body.insert(key.to_string(), Value::String(self.actor.id.clone()));
        }
        Ok(body)
    }
}

/// Every failure a caller can see
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("Unknown intent: {0}")]
    UnknownIntent(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("Handler failed: {0}")]
    HandlerFailure(String),

    #[error("State invariant violation: {0}")]
    StateInvariantViolation(String),

    #[error("Saga aborted: {0}")]
    SagaAborted(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl CommandError {
    /// Stable machine-readable code
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::UnknownIntent(_) => "unknown_intent",
            CommandError::InvalidCommand(_) => "invalid_command",
            CommandError::Routing(_) => "routing_error",
            CommandError::HandlerTimeout(_) => "handler_timeout",
            CommandError::HandlerFailure(_) => "handler_failure",
            CommandError::StateInvariantViolation(_) => "state_invariant_violation",
            CommandError::SagaAborted(_) => "saga_aborted",
            CommandError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<BusError> for CommandError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Routing { target, reason } => {
                CommandError::Routing(format!("worker '{target}' is {reason}"))
            }
            BusError::HandlerTimeout { timeout, .. } => CommandError::HandlerTimeout(timeout),
            BusError::HandlerFault { kind, reason, .. } => match kind {
                FaultKind::Rejected => CommandError::StateInvariantViolation(reason),
                FaultKind::InvalidPayload => CommandError::InvalidCommand(reason),
                FaultKind::Failed => CommandError::HandlerFailure(reason),
            },
            BusError::ShuttingDown => CommandError::ShuttingDown,
            other => CommandError::HandlerFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&CommandError> for ErrorInfo {
    fn from(err: &CommandError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// What every command returns, success or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub correlation_id: CorrelationId,
    pub intent: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Set when creative content was replaced by a fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl CommandResult {
    pub fn ok(correlation_id: CorrelationId, intent: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            correlation_id,
            intent: intent.into(),
            data,
            error: None,
            degraded: None,
        }
    }

    pub fn failed(
        correlation_id: CorrelationId,
        intent: impl Into<String>,
        error: &CommandError,
    ) -> Self {
        Self {
            success: false,
            correlation_id,
            intent: intent.into(),
            data: Value::Null,
            error: Some(error.into()),
            degraded: None,
        }
    }

    pub fn with_degraded(mut self, notice: impl Into<String>) -> Self {
        self.degraded = Some(notice.into());
        self
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}
