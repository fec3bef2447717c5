//! The rule resolution engine.
//!
//! Sole owner of authoritative game state. Skill checks run through a fixed
//! seven-stage pipeline; combat goes through the [`CombatEncounter`] state
//! machine. Every mutation happens under one session lock, and every
//! probabilistic outcome is handed to the [`DecisionLogger`].

use crate::character::{CharacterSnapshot, CharacterStore, CheckKind};
use crate::combat::{
    ActionOutcome, CombatAction, CombatEncounter, CombatPhase, CombatantSpec, EncounterSnapshot, EndCheck,
    InitiativeEntry, TurnAdvance,
};
use crate::decisions::DecisionLogger;
use crate::dice::{roll_d20, D20Roll, DieSource};
use crate::policy::{AdvantageAssessment, DifficultyAdjustment, PolicyEngine};
use crate::rules::{
    check_bonus, CheckRequirement, RulesCatalog, RulesError, SkillCheckRequest, StateChange,
};
use agent_bus::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Authoritative mutable state of one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub encounter: CombatEncounter,
    #[serde(default)]
    pub scene_flags: BTreeMap<String, Value>,
    /// actor -> resource -> amount
    #[serde(default)]
    pub resources: BTreeMap<String, BTreeMap<String, i64>>,
}

impl GameState {
    fn apply(&mut self, actor_id: &str, changes: &[StateChange]) -> Vec<StateChange> {
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                StateChange::SetFlag { flag, value } => {
                    self.scene_flags.insert(flag.clone(), value.clone());
                    applied.push(change.clone());
                }
                StateChange::AdjustResource { actor, resource, delta } => {
                    let owner = actor.clone().unwrap_or_else(|| actor_id.to_string());
                    let amount = self
                        .resources
                        .entry(owner.clone())
                        .or_default()
                        .entry(resource.clone())
                        .or_insert(0);
                    *amount = amount.saturating_add(*delta);
                    applied.push(StateChange::AdjustResource {
                        actor: Some(owner),
                        resource: resource.clone(),
                        delta: *delta,
                    });
                }
            }
        }
        applied
    }
}

/// Every stage result of one skill check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCheckOutcome {
    pub correlation_id: CorrelationId,
    pub actor_id: String,
    pub check: CheckKind,
    /// No roll was needed
    pub auto_success: bool,
    /// Why this DC, or why no check
    pub dc_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc_breakdown: Option<DifficultyAdjustment>,
    /// Character modifier plus the request's flat bonus
    pub modifier: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advantage: Option<AdvantageAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<D20Roll>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i32>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied: Vec<StateChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatStart {
    pub initiative: Vec<InitiativeEntry>,
    pub encounter: EncounterSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatActionReport {
    pub round: u32,
    pub outcome: ActionOutcome,
    pub end: EndCheck,
    pub encounter: EncounterSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassiveScore {
    pub actor_id: String,
    pub check: CheckKind,
    pub score: i32,
}

/// Owner of authoritative state for one session
pub struct RuleResolutionEngine {
    state: Mutex<GameState>,
    dice: Mutex<Box<dyn DieSource>>,
    policy: PolicyEngine,
    rules: Arc<dyn RulesCatalog>,
    characters: Arc<dyn CharacterStore>,
    decisions: Arc<DecisionLogger>,
}

impl std::fmt::Debug for RuleResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleResolutionEngine")
            .field("profile", &self.policy.profile().name)
            .field("decisions", &self.decisions.len())
            .finish_non_exhaustive()
    }
}

impl RuleResolutionEngine {
    pub fn new(
        policy: PolicyEngine,
        dice: Box<dyn DieSource>,
        rules: Arc<dyn RulesCatalog>,
        characters: Arc<dyn CharacterStore>,
        decisions: Arc<DecisionLogger>,
    ) -> Self {
        Self {
            state: Mutex::new(GameState::default()),
            dice: Mutex::new(dice),
            policy,
            rules,
            characters,
            decisions,
        }
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn decisions(&self) -> &Arc<DecisionLogger> {
        &self.decisions
    }

    fn state(&self) -> Result<MutexGuard<'_, GameState>, RulesError> {
        self.state.lock().map_err(|_| RulesError::StatePoisoned)
    }

    fn dice(&self) -> Result<MutexGuard<'_, Box<dyn DieSource>>, RulesError> {
        self.dice.lock().map_err(|_| RulesError::StatePoisoned)
    }

    fn character(&self, actor_id: &str) -> Result<CharacterSnapshot, RulesError> {
        self.characters
            .snapshot(actor_id)
            .ok_or_else(|| RulesError::UnknownActor(actor_id.to_string()))
    }

    /// Resolve one skill, ability or saving-throw check.
    ///
    /// Stages run strictly in order: requirement and DC, capability lookup,
    /// policy mediation, roll, comparison, state application, logging.
    /// Only stage six touches game state, and only the returned outcome is
    /// recorded, so the log always matches what the caller sees.
    pub fn resolve_skill_check(
        &self,
        correlation_id: CorrelationId,
        request: &SkillCheckRequest,
    ) -> Result<SkillCheckOutcome, RulesError> {
        request.validate()?;

        // 1. Need / DC derivation
        let (base_dc, dc_source) = match self.rules.requirement(request) {
            CheckRequirement::NotRequired { reason } => {
                let applied = {
                    let mut state = self.state()?;
                    state.apply(&request.actor_id, &request.on_success)
                };
                let outcome = SkillCheckOutcome {
                    correlation_id,
                    actor_id: request.actor_id.clone(),
                    check: request.check,
                    auto_success: true,
                    dc_source: reason,
                    base_dc: None,
                    dc: None,
                    dc_breakdown: None,
                    modifier: 0,
                    conditions: Vec::new(),
                    advantage: None,
                    roll: None,
                    total: None,
                    success: true,
                    applied,
                };
                tracing::info!(
                    correlation_id = %correlation_id,
                    actor = %request.actor_id,
                    check = %request.check,
                    "Check not required, auto-success"
                );
                self.decisions.log_skill_check(outcome.clone());
                return Ok(outcome);
            }
            CheckRequirement::Required { base_dc, dc_source } => (base_dc, dc_source),
        };

        // 2. Actor capability
        let character = self.character(&request.actor_id)?;
        let modifier = character.check_modifier(request.check).saturating_add(request.bonus);
        let conditions: Vec<String> = character.conditions.iter().cloned().collect();

        // 3. Policy mediation
        let situation = request.situation.clone().with_sources(conditions.iter().cloned());
        let advantage = self.policy.compute_advantage_state(&situation);
        let breakdown = self.policy.difficulty_breakdown(base_dc, &situation);
        let dc = breakdown.adjusted_dc;

        // 4. Randomization
        let roll = {
            let mut dice = self.dice()?;
            roll_d20(&mut **dice, modifier, advantage.state)
        };

        // 5. Comparison
        let success = roll.total >= dc;

        // 6. State application
        let applied = {
            let mut state = self.state()?;
            let changes = if success { &request.on_success } else { &request.on_failure };
            state.apply(&request.actor_id, changes)
        };

        // 7. Decision logging
        let outcome = SkillCheckOutcome {
            correlation_id,
            actor_id: request.actor_id.clone(),
            check: request.check,
            auto_success: false,
            dc_source,
            base_dc: Some(base_dc),
            dc: Some(dc),
            dc_breakdown: Some(breakdown),
            modifier,
            conditions,
            advantage: Some(advantage),
            total: Some(roll.total),
            roll: Some(roll),
            success,
            applied,
        };
        tracing::info!(
            correlation_id = %correlation_id,
            actor = %outcome.actor_id,
            check = %outcome.check,
            dc,
            total = ?outcome.total,
            success,
            "Skill check resolved"
        );
        self.decisions.log_skill_check(outcome.clone());
        Ok(outcome)
    }

    /// Roll initiative and make combat active
    pub fn start_combat(
        &self,
        correlation_id: CorrelationId,
        participants: Vec<CombatantSpec>,
    ) -> Result<CombatStart, RulesError> {
        let mut state = self.state()?;
        let mut dice = self.dice()?;
        match state.encounter.start(participants, &mut **dice) {
            Ok(initiative) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    combatants = initiative.len(),
                    first = ?state.encounter.current_actor(),
                    "Combat started"
                );
                self.decisions.log_initiative(correlation_id, initiative.clone());
                Ok(CombatStart {
                    initiative,
                    encounter: state.encounter.snapshot(),
                })
            }
            Err(err) => {
                self.reject(correlation_id, None, json!({"type": "start_combat"}), &err);
                Err(err)
            }
        }
    }

    /// Validate and resolve one combat action, then check for the end of
    /// combat. An illegal action leaves state untouched and is recorded as
    /// a single rejection.
    pub fn process_action(
        &self,
        correlation_id: CorrelationId,
        action: CombatAction,
    ) -> Result<CombatActionReport, RulesError> {
        let mut state = self.state()?;
        let mut dice = self.dice()?;

        let outcome = match state.encounter.process_action(&action, &mut **dice, &self.policy) {
            Ok(outcome) => outcome,
            Err(err) => {
                let action_value = serde_json::to_value(&action).unwrap_or(Value::Null);
                self.reject(correlation_id, Some(action.actor().to_string()), action_value, &err);
                return Err(err);
            }
        };
        let end = state.encounter.check_end();
        let round = state.encounter.round;

        if let ActionOutcome::Attack(attack) = &outcome {
            tracing::info!(
                correlation_id = %correlation_id,
                attacker = %attack.attacker,
                target = %attack.target,
                total = attack.attack_roll.total,
                ac = attack.target_ac,
                hit = attack.hit,
                damage = attack.damage_dealt,
                "Attack resolved"
            );
        }
        if let Some(result) = end.result {
            tracing::info!(correlation_id = %correlation_id, ?result, "Combat ended");
        }

        self.decisions
            .log_combat_action(correlation_id, round, action, outcome.clone());
        Ok(CombatActionReport {
            round,
            outcome,
            end,
            encounter: state.encounter.snapshot(),
        })
    }

    fn reject(
        &self,
        correlation_id: CorrelationId,
        actor: Option<String>,
        action: Value,
        err: &RulesError,
    ) {
        if err.is_invariant_violation() {
            tracing::warn!(
                correlation_id = %correlation_id,
                actor = ?actor,
                error = %err,
                "Rejected illegal action"
            );
        } else {
            tracing::debug!(correlation_id = %correlation_id, error = %err, "Rejected invalid action");
        }
        self.decisions
            .log_rejection(correlation_id, actor, action, err.to_string());
    }

    pub fn next_turn(&self) -> Result<TurnAdvance, RulesError> {
        let mut state = self.state()?;
        let advance = state.encounter.next_turn()?;
        tracing::debug!(round = advance.round, actor = %advance.current_actor, "Next turn");
        Ok(advance)
    }

    pub fn check_end(&self) -> Result<EndCheck, RulesError> {
        Ok(self.state()?.encounter.check_end())
    }

    pub fn end_combat(&self) -> Result<EndCheck, RulesError> {
        let end = self.state()?.encounter.end()?;
        tracing::info!(result = ?end.result, "Combat ended by request");
        Ok(end)
    }

    pub fn encounter(&self) -> Result<EncounterSnapshot, RulesError> {
        Ok(self.state()?.encounter.snapshot())
    }

    pub fn combat_phase(&self) -> Result<CombatPhase, RulesError> {
        Ok(self.state()?.encounter.state)
    }

    pub fn scene_flag(&self, flag: &str) -> Result<Option<Value>, RulesError> {
        Ok(self.state()?.scene_flags.get(flag).cloned())
    }

    pub fn resource(&self, actor_id: &str, resource: &str) -> Result<i64, RulesError> {
        Ok(self
            .state()?
            .resources
            .get(actor_id)
            .and_then(|r| r.get(resource))
            .copied()
            .unwrap_or(0))
    }

    /// Apply scene changes outside a check, such as a saga's consequence
    pub fn apply_changes(&self, actor_id: &str, changes: &[StateChange]) -> Result<Vec<StateChange>, RulesError> {
        changes.iter().try_for_each(StateChange::validate)?;
        Ok(self.state()?.apply(actor_id, changes))
    }

    /// `10 + modifier + proficiency + bonus` for an actor's check
    pub fn passive_score(&self, actor_id: &str, check: CheckKind, bonus: i32) -> Result<PassiveScore, RulesError> {
        check_bonus(bonus)?;
        let character = self.character(actor_id)?;
        let score = self.policy.passive_score(
            character.ability_modifier(check.ability()),
            character.proficiency_contribution(check),
            bonus,
        );
        Ok(PassiveScore {
            actor_id: actor_id.to_string(),
            check,
            score,
        })
    }

    /// Copy of the full state, for session snapshots
    pub fn game_state(&self) -> Result<GameState, RulesError> {
        Ok(self.state()?.clone())
    }

    /// Replace the state wholesale
    pub fn restore(&self, game_state: GameState) -> Result<(), RulesError> {
        *self.state()? = game_state;
        Ok(())
    }
}
