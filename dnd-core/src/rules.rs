//! Rule data consumed by the skill-check pipeline, and rule errors.
//!
//! Whether a check is needed at all, and its base DC, come from a
//! [`RulesCatalog`]. The catalog is read-only; it never sees game state.

use crate::character::CheckKind;
use crate::combat::CombatPhase;
use crate::dice::DiceError;
use crate::policy::SituationalContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors raised while resolving checks and combat actions.
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("Combat is not active (state: {0})")]
    CombatNotActive(CombatPhase),

    #[error("Combat is already in progress")]
    CombatAlreadyActive,

    #[error("Not {actor}'s turn; current turn belongs to {current}")]
    NotYourTurn { actor: String, current: String },

    #[error("Unknown combatant: {0}")]
    UnknownCombatant(String),

    #[error("Combatant {0} appears more than once")]
    DuplicateCombatant(String),

    #[error("Target {0} is already dead")]
    TargetDown(String),

    #[error("{0} is incapacitated and cannot act")]
    ActorIncapacitated(String),

    #[error("Combat needs at least one participant")]
    NoParticipants,

    #[error("Unknown actor: {0}")]
    UnknownActor(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Dice(#[from] DiceError),

    #[error("Game state lock poisoned")]
    StatePoisoned,
}

impl RulesError {
    /// Whether the error is an illegal move against the current game state.
    ///
    /// These are rejected before any mutation and recorded as rejections.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            RulesError::CombatNotActive(_)
                | RulesError::CombatAlreadyActive
                | RulesError::NotYourTurn { .. }
                | RulesError::UnknownCombatant(_)
                | RulesError::TargetDown(_)
                | RulesError::ActorIncapacitated(_)
        )
    }
}

/// Largest flat bonus a check request may carry
pub const MAX_FLAT_BONUS: i32 = 100;
/// Largest DC a check request may name
pub const MAX_REQUESTED_DC: i32 = 100;
/// Largest single resource adjustment, either direction
pub const MAX_RESOURCE_DELTA: i64 = 1_000_000;

pub(crate) fn check_bonus(bonus: i32) -> Result<(), RulesError> {
    if bonus.unsigned_abs() > MAX_FLAT_BONUS.unsigned_abs() {
        return Err(RulesError::InvalidRequest(format!(
            "bonus {bonus} is outside -{MAX_FLAT_BONUS}..={MAX_FLAT_BONUS}"
        )));
    }
    Ok(())
}

/// Named difficulty tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    VeryEasy,
    Easy,
    Medium,
    Hard,
    VeryHard,
    NearlyImpossible,
}

impl Difficulty {
    pub fn dc(&self) -> i32 {
        match self {
            Difficulty::VeryEasy => 5,
            Difficulty::Easy => 10,
            Difficulty::Medium => 15,
            Difficulty::Hard => 20,
            Difficulty::VeryHard => 25,
            Difficulty::NearlyImpossible => 30,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Difficulty::VeryEasy => "very easy",
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::VeryHard => "very hard",
            Difficulty::NearlyImpossible => "nearly impossible",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A mutation of authoritative scene state requested by a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateChange {
    /// Set a scene flag to a value
    SetFlag { flag: String, value: Value },
    /// Add `delta` to an actor's resource; defaults to the acting character
    AdjustResource {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
        resource: String,
        delta: i64,
    },
}

/// A request to resolve one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCheckRequest {
    pub actor_id: String,
    pub check: CheckKind,
    /// Explicit DC; wins over `difficulty`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    /// Task is trivial and needs no roll
    #[serde(default)]
    pub trivial: bool,
    #[serde(default)]
    pub situation: SituationalContext,
    /// Flat bonus on top of the character's modifier
    #[serde(default)]
    pub bonus: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StateChange {
    pub fn validate(&self) -> Result<(), RulesError> {
        match self {
            StateChange::AdjustResource { resource, delta, .. }
                if delta.unsigned_abs() > MAX_RESOURCE_DELTA.unsigned_abs() =>
            {
                Err(RulesError::InvalidRequest(format!(
                    "adjustment of {resource} by {delta} exceeds {MAX_RESOURCE_DELTA}"
                )))
            }
            _ => Ok(()),
        }
    }
}

impl SkillCheckRequest {
    /// Refuse numbers no rule could produce before any stage runs
    pub fn validate(&self) -> Result<(), RulesError> {
        check_bonus(self.bonus)?;
        if let Some(dc) = self.dc {
            if !(0..=MAX_REQUESTED_DC).contains(&dc) {
                return Err(RulesError::InvalidRequest(format!(
                    "dc {dc} is outside 0..={MAX_REQUESTED_DC}"
                )));
            }
        }
        self.on_success
            .iter()
            .chain(&self.on_failure)
            .try_for_each(StateChange::validate)
    }

    pub fn new(actor_id: impl Into<String>, check: CheckKind) -> Self {
        Self {
            actor_id: actor_id.into(),
            check,
            dc: None,
            difficulty: None,
            trivial: false,
            situation: SituationalContext::default(),
            bonus: 0,
            on_success: Vec::new(),
            on_failure: Vec::new(),
            description: None,
        }
    }

    pub fn with_dc(mut self, dc: i32) -> Self {
        self.dc = Some(dc);
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    pub fn trivial(mut self) -> Self {
        self.trivial = true;
        self
    }

    pub fn with_situation(mut self, situation: SituationalContext) -> Self {
        self.situation = situation;
        self
    }

    pub fn with_bonus(mut self, bonus: i32) -> Self {
        self.bonus = bonus;
        self
    }

    pub fn on_success(mut self, change: StateChange) -> Self {
        self.on_success.push(change);
        self
    }

    pub fn on_failure(mut self, change: StateChange) -> Self {
        self.on_failure.push(change);
        self
    }
}

/// Whether a check is needed, and at what base DC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckRequirement {
    NotRequired { reason: String },
    Required { base_dc: i32, dc_source: String },
}

/// External rules data
pub trait RulesCatalog: Send + Sync {
    fn requirement(&self, request: &SkillCheckRequest) -> CheckRequirement;
}

/// Standard difficulty table.
///
/// An explicit DC wins, then a named difficulty; trivial tasks need no
/// roll; anything else defaults to medium.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl RulesCatalog for StandardRules {
    fn requirement(&self, request: &SkillCheckRequest) -> CheckRequirement {
        if let Some(dc) = request.dc {
            return CheckRequirement::Required {
                base_dc: dc,
                dc_source: "requested DC".to_string(),
            };
        }
        if let Some(difficulty) = request.difficulty {
            return CheckRequirement::Required {
                base_dc: difficulty.dc(),
                dc_source: format!("difficulty: {difficulty}"),
            };
        }
        if request.trivial {
            return CheckRequirement::NotRequired {
                reason: "trivial task".to_string(),
            };
        }
        CheckRequirement::Required {
            base_dc: Difficulty::Medium.dc(),
            dc_source: "default difficulty: medium".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::Skill;

    fn request() -> SkillCheckRequest {
        SkillCheckRequest::new("pc-1", CheckKind::Skill(Skill::Athletics))
    }

    #[test]
    fn test_requested_dc_wins() {
        let req = request().with_dc(12).with_difficulty(Difficulty::Hard);
        assert_eq!(
            StandardRules.requirement(&req),
            CheckRequirement::Required {
                base_dc: 12,
                dc_source: "requested DC".to_string()
            }
        );
    }

    #[test]
    fn test_named_difficulty() {
        let req = request().with_difficulty(Difficulty::Hard);
        assert_eq!(
            StandardRules.requirement(&req),
            CheckRequirement::Required {
                base_dc: 20,
                dc_source: "difficulty: hard".to_string()
            }
        );
    }

    #[test]
    fn test_trivial_and_default() {
        assert!(matches!(
            StandardRules.requirement(&request().trivial()),
            CheckRequirement::NotRequired { .. }
        ));
        assert!(matches!(
            StandardRules.requirement(&request()),
            CheckRequirement::Required { base_dc: 15, .. }
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::json!({
            "actor_id": "pc-1",
            "check": {"type": "skill", "value": "stealth"},
            "difficulty": "hard",
            "situation": {"sources": ["hidden"]},
            "on_success": [{"op": "set_flag", "flag": "gate_open", "value": true}]
        });
        let req: SkillCheckRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.check, CheckKind::Skill(Skill::Stealth));
        assert_eq!(req.difficulty, Some(Difficulty::Hard));
        assert!(req.situation.sources.contains("hidden"));
        assert_eq!(req.on_success.len(), 1);
    }

    #[test]
    fn test_out_of_range_numbers_are_refused() {
        assert!(request().with_bonus(5).with_dc(20).validate().is_ok());
        assert!(matches!(
            request().with_bonus(i32::MAX).validate(),
            Err(RulesError::InvalidRequest(_))
        ));
        assert!(request().with_bonus(i32::MIN).validate().is_err());
        assert!(request().with_dc(i32::MIN).validate().is_err());
        assert!(request().with_dc(MAX_REQUESTED_DC + 1).validate().is_err());

        let drain = StateChange::AdjustResource {
            actor: None,
            resource: "gold".to_string(),
            delta: i64::MIN,
        };
        assert!(request().on_failure(drain).validate().is_err());
    }

    #[test]
    fn test_invariant_classification() {
        assert!(RulesError::NotYourTurn {
            actor: "a".into(),
            current: "b".into()
        }
        .is_invariant_violation());
        assert!(!RulesError::UnknownActor("x".into()).is_invariant_violation());
    }
}
