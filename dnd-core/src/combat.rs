//! Turn-based combat state machine.
//!
//! `Inactive -> RollingInitiative -> Active -> Ended`. The encounter is
//! plain data; the engine owns it behind the session lock and passes in the
//! die source and policy for every operation that rolls.

use crate::dice::{roll_d20, D20Roll, DiceExpression, DieSource, RollResult};
use crate::policy::{AdvantageAssessment, PolicyEngine, SituationalContext};
use crate::rules::{check_bonus, RulesError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Death-save failures that kill an unconscious player.
pub const DEATH_SAVE_LIMIT: u8 = 3;

/// Condition applied by the dodge action.
pub const DODGING: &str = "dodging";

/// Condition applied to a player dropped to 0 HP.
pub const UNCONSCIOUS: &str = "unconscious";

fn default_damage() -> String {
    "1d4".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombatPhase {
    #[default]
    Inactive,
    RollingInitiative,
    Active,
    Ended,
}

impl fmt::Display for CombatPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombatPhase::Inactive => write!(f, "inactive"),
            CombatPhase::RollingInitiative => write!(f, "rolling_initiative"),
            CombatPhase::Active => write!(f, "active"),
            CombatPhase::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Party,
    Hostile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombatResult {
    Victory,
    Defeat,
}

/// Participant description used to start combat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatantSpec {
    pub id: String,
    pub name: String,
    pub max_hp: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hp: Option<i32>,
    pub armor_class: i32,
    #[serde(default)]
    pub dex_modifier: i32,
    #[serde(default)]
    pub is_player_controlled: bool,
    /// Defaults to `Party` for player-controlled combatants, `Hostile` otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default)]
    pub attack_bonus: i32,
    #[serde(default = "default_damage")]
    pub damage: String,
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// Largest hit point maximum a combatant may start with
pub const MAX_HIT_POINTS: i32 = 10_000;
/// Largest armor class a combatant may have
pub const MAX_ARMOR_CLASS: i32 = 50;

impl CombatantSpec {
    pub fn validate(&self) -> Result<(), RulesError> {
        let invalid = |what: String| -> Result<(), RulesError> {
            Err(RulesError::InvalidRequest(format!("{}: {what}", self.id)))
        };
        if !(1..=MAX_HIT_POINTS).contains(&self.max_hp) {
            return invalid(format!("max_hp {} is outside 1..={MAX_HIT_POINTS}", self.max_hp));
        }
        if let Some(hp) = self.current_hp {
            if !(0..=self.max_hp).contains(&hp) {
                return invalid(format!("current_hp {hp} is outside 0..={}", self.max_hp));
            }
        }
        if !(0..=MAX_ARMOR_CLASS).contains(&self.armor_class) {
            return invalid(format!("armor_class {} is outside 0..={MAX_ARMOR_CLASS}", self.armor_class));
        }
        check_bonus(self.dex_modifier)?;
        check_bonus(self.attack_bonus)?;
        DiceExpression::parse(&self.damage)?;
        Ok(())
    }

    pub fn player(id: impl Into<String>, name: impl Into<String>, max_hp: i32, armor_class: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            max_hp,
            current_hp: None,
            armor_class,
            dex_modifier: 0,
            is_player_controlled: true,
            side: None,
            attack_bonus: 0,
            damage: default_damage(),
            conditions: Vec::new(),
        }
    }

    pub fn monster(id: impl Into<String>, name: impl Into<String>, max_hp: i32, armor_class: i32) -> Self {
        Self {
            is_player_controlled: false,
            ..Self::player(id, name, max_hp, armor_class)
        }
    }

    pub fn with_dex(mut self, dex_modifier: i32) -> Self {
        self.dex_modifier = dex_modifier;
        self
    }

    pub fn with_attack(mut self, attack_bonus: i32, damage: impl Into<String>) -> Self {
        self.attack_bonus = attack_bonus;
        self.damage = damage.into();
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCondition {
    pub name: String,
    /// Rounds left; `None` lasts until removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds_remaining: Option<u32>,
    /// Ends when its bearer's next turn starts
    #[serde(default)]
    pub until_own_turn: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combatant {
    pub id: String,
    pub name: String,
    pub max_hp: i32,
    pub current_hp: i32,
    pub armor_class: i32,
    pub initiative: i32,
    pub dex_modifier: i32,
    pub is_player_controlled: bool,
    pub side: Side,
    pub attack_bonus: i32,
    pub damage: String,
    pub conditions: Vec<ActiveCondition>,
    pub death_save_failures: u8,
    pub dead: bool,
}

impl Combatant {
    fn from_spec(spec: CombatantSpec, initiative: i32) -> Self {
        let side = spec.side.unwrap_or(if spec.is_player_controlled {
            Side::Party
        } else {
            Side::Hostile
        });
        Self {
            current_hp: spec.current_hp.unwrap_or(spec.max_hp),
            conditions: spec
                .conditions
                .into_iter()
                .map(|name| ActiveCondition {
                    name,
                    rounds_remaining: None,
                    until_own_turn: false,
                })
                .collect(),
            id: spec.id,
            name: spec.name,
            max_hp: spec.max_hp,
            armor_class: spec.armor_class,
            initiative,
            dex_modifier: spec.dex_modifier,
            is_player_controlled: spec.is_player_controlled,
            side,
            attack_bonus: spec.attack_bonus,
            damage: spec.damage,
            death_save_failures: 0,
            dead: false,
        }
    }

    /// Player at 0 HP who is still alive
    pub fn is_unconscious(&self) -> bool {
        self.is_player_controlled && self.current_hp <= 0 && !self.dead
    }

    pub fn can_act(&self) -> bool {
        !self.dead && self.current_hp > 0
    }

    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.iter().any(|c| c.name == name)
    }

    fn add_condition(&mut self, condition: ActiveCondition) {
        self.conditions.retain(|c| c.name != condition.name);
        self.conditions.push(condition);
    }

    fn remove_condition(&mut self, name: &str) {
        self.conditions.retain(|c| c.name != name);
    }
}

/// An action taken on a combatant's turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CombatAction {
    Attack {
        actor: String,
        target: String,
        /// Overrides the attacker's default attack bonus
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attack_bonus: Option<i32>,
        /// Overrides the attacker's default damage dice
        #[serde(default, skip_serializing_if = "Option::is_none")]
        damage: Option<String>,
        /// Extra situational sources, e.g. `flanking`
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sources: Vec<String>,
    },
    Dodge {
        actor: String,
    },
    Pass {
        actor: String,
    },
}

impl CombatAction {
    pub fn attack(actor: impl Into<String>, target: impl Into<String>) -> Self {
        CombatAction::Attack {
            actor: actor.into(),
            target: target.into(),
            attack_bonus: None,
            damage: None,
            sources: Vec::new(),
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            CombatAction::Attack { actor, .. }
            | CombatAction::Dodge { actor }
            | CombatAction::Pass { actor } => actor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeEntry {
    pub id: String,
    pub roll: u32,
    pub dex_modifier: i32,
    pub total: i32,
    /// Position in the participant list
    pub order: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackOutcome {
    pub attacker: String,
    pub target: String,
    pub advantage: AdvantageAssessment,
    pub attack_roll: D20Roll,
    pub target_ac: i32,
    pub hit: bool,
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage_roll: Option<RollResult>,
    pub damage_dealt: i32,
    pub target_hp_before: i32,
    pub target_hp_after: i32,
    pub target_unconscious: bool,
    pub target_dead: bool,
    pub death_save_failures_added: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOutcome {
    Attack(AttackOutcome),
    Dodge { actor: String },
    Pass { actor: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredCondition {
    pub combatant: String,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnAdvance {
    pub round: u32,
    pub current_turn_index: usize,
    pub current_actor: String,
    pub new_round: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expired: Vec<ExpiredCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndCheck {
    pub combat_ended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CombatResult>,
}

/// Read-only view of an encounter handed out in message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterSnapshot {
    pub state: CombatPhase,
    pub round: u32,
    pub current_turn_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_actor: Option<String>,
    pub turn_order: Vec<String>,
    /// Combatants in turn order
    pub combatants: Vec<Combatant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CombatResult>,
}

struct DamageReport {
    hp_after: i32,
    unconscious: bool,
    dead: bool,
    death_save_failures_added: u8,
}

/// The single authoritative encounter of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombatEncounter {
    pub state: CombatPhase,
    pub combatants: BTreeMap<String, Combatant>,
    pub turn_order: Vec<String>,
    pub current_turn_index: usize,
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CombatResult>,
}

impl CombatEncounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll initiative and enter `Active`.
    ///
    /// Turn order is descending initiative; ties go to the higher Dexterity
    /// modifier, then to whoever was listed first. Dice are consumed in
    /// participant order.
    pub fn start(
        &mut self,
        participants: Vec<CombatantSpec>,
        dice: &mut dyn DieSource,
    ) -> Result<Vec<InitiativeEntry>, RulesError> {
        if matches!(self.state, CombatPhase::RollingInitiative | CombatPhase::Active) {
            return Err(RulesError::CombatAlreadyActive);
        }
        if participants.is_empty() {
            return Err(RulesError::NoParticipants);
        }
        let mut seen = HashSet::new();
        for spec in &participants {
            if !seen.insert(spec.id.as_str()) {
                return Err(RulesError::DuplicateCombatant(spec.id.clone()));
            }
            spec.validate()?;
        }

        self.state = CombatPhase::RollingInitiative;
        let mut entries: Vec<InitiativeEntry> = participants
            .iter()
            .enumerate()
            .map(|(order, spec)| {
                let roll = dice.roll_die(20);
                InitiativeEntry {
                    id: spec.id.clone(),
                    roll,
                    dex_modifier: spec.dex_modifier,
                    total: (roll as i32).saturating_add(spec.dex_modifier),
                    order,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.total
                .cmp(&a.total)
                .then(b.dex_modifier.cmp(&a.dex_modifier))
                .then(a.order.cmp(&b.order))
        });

        let totals: BTreeMap<&str, i32> = entries.iter().map(|e| (e.id.as_str(), e.total)).collect();
        self.combatants = participants
            .into_iter()
            .map(|spec| {
                let initiative = totals.get(spec.id.as_str()).copied().unwrap_or_default();
                (spec.id.clone(), Combatant::from_spec(spec, initiative))
            })
            .collect();
        self.turn_order = entries.iter().map(|e| e.id.clone()).collect();
        self.current_turn_index = 0;
        self.round = 1;
        self.result = None;
        self.state = CombatPhase::Active;

        Ok(entries)
    }

    /// Id of the combatant whose turn it is
    pub fn current_actor(&self) -> Option<&str> {
        match self.state {
            CombatPhase::Active => self.turn_order.get(self.current_turn_index).map(String::as_str),
            _ => None,
        }
    }

    pub fn combatant(&self, id: &str) -> Option<&Combatant> {
        self.combatants.get(id)
    }

    /// Check legality without mutating anything
    pub fn validate(&self, action: &CombatAction) -> Result<(), RulesError> {
        if self.state != CombatPhase::Active {
            return Err(RulesError::CombatNotActive(self.state));
        }
        let actor_id = action.actor();
        let actor = self
            .combatants
            .get(actor_id)
            .ok_or_else(|| RulesError::UnknownCombatant(actor_id.to_string()))?;
        let current = self.current_actor().unwrap_or_default();
        if actor_id != current {
            return Err(RulesError::NotYourTurn {
                actor: actor_id.to_string(),
                current: current.to_string(),
            });
        }
        if !actor.can_act() {
            return Err(RulesError::ActorIncapacitated(actor_id.to_string()));
        }

        if let CombatAction::Attack {
            target,
            damage,
            attack_bonus,
            ..
        } = action
        {
            if let Some(bonus) = attack_bonus {
                check_bonus(*bonus)?;
            }
            let target_combatant = self
                .combatants
                .get(target)
                .ok_or_else(|| RulesError::UnknownCombatant(target.clone()))?;
            if target_combatant.dead {
                return Err(RulesError::TargetDown(target.clone()));
            }
            DiceExpression::parse(damage.as_deref().unwrap_or(actor.damage.as_str()))?;
        }
        Ok(())
    }

    /// Validate and resolve an action for the current turn-holder
    pub fn process_action(
        &mut self,
        action: &CombatAction,
        dice: &mut dyn DieSource,
        policy: &PolicyEngine,
    ) -> Result<ActionOutcome, RulesError> {
        self.validate(action)?;

        match action {
            CombatAction::Attack {
                actor,
                target,
                attack_bonus,
                damage,
                sources,
            } => {
                let outcome = self.resolve_attack(
                    actor,
                    target,
                    *attack_bonus,
                    damage.as_deref(),
                    sources,
                    dice,
                    policy,
                )?;
                Ok(ActionOutcome::Attack(outcome))
            }
            CombatAction::Dodge { actor } => {
                if let Some(combatant) = self.combatants.get_mut(actor) {
                    combatant.add_condition(ActiveCondition {
                        name: DODGING.to_string(),
                        rounds_remaining: None,
                        until_own_turn: true,
                    });
                }
                Ok(ActionOutcome::Dodge { actor: actor.clone() })
            }
            CombatAction::Pass { actor } => Ok(ActionOutcome::Pass { actor: actor.clone() }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_attack(
        &mut self,
        attacker_id: &str,
        target_id: &str,
        attack_bonus: Option<i32>,
        damage: Option<&str>,
        sources: &[String],
        dice: &mut dyn DieSource,
        policy: &PolicyEngine,
    ) -> Result<AttackOutcome, RulesError> {
        let attacker = self
            .combatants
            .get(attacker_id)
            .ok_or_else(|| RulesError::UnknownCombatant(attacker_id.to_string()))?;
        let target = self
            .combatants
            .get(target_id)
            .ok_or_else(|| RulesError::UnknownCombatant(target_id.to_string()))?;

        let mut context = SituationalContext::new().with_sources(sources.iter().cloned());
        context = context.with_sources(attacker.conditions.iter().map(|c| c.name.clone()));
        context = context.with_sources(target.conditions.iter().map(|c| format!("target_{}", c.name)));
        let advantage = policy.compute_advantage_state(&context);

        let bonus = attack_bonus.unwrap_or(attacker.attack_bonus);
        let damage_expr = DiceExpression::parse(damage.unwrap_or(attacker.damage.as_str()))?;
        let target_ac = target.armor_class;
        let hp_before = target.current_hp;

        let attack_roll = roll_d20(dice, bonus, advantage.state);
        let critical = attack_roll.kept >= policy.critical_range();
        let hit = !attack_roll.natural_1() && (critical || attack_roll.total >= target_ac);

        let mut outcome = AttackOutcome {
            attacker: attacker_id.to_string(),
            target: target_id.to_string(),
            advantage,
            attack_roll,
            target_ac,
            hit,
            critical: hit && critical,
            damage_roll: None,
            damage_dealt: 0,
            target_hp_before: hp_before,
            target_hp_after: hp_before,
            target_unconscious: false,
            target_dead: false,
            death_save_failures_added: 0,
        };

        if hit {
            let expr = if critical { damage_expr.doubled_dice() } else { damage_expr };
            let damage_roll = expr.roll(dice);
            let dealt = damage_roll.total.max(0);
            let report = self.apply_damage(target_id, dealt, critical)?;

            outcome.damage_dealt = dealt;
            outcome.damage_roll = Some(damage_roll);
            outcome.target_hp_after = report.hp_after;
            outcome.target_unconscious = report.unconscious;
            outcome.target_dead = report.dead;
            outcome.death_save_failures_added = report.death_save_failures_added;
        }

        Ok(outcome)
    }

    fn apply_damage(&mut self, target_id: &str, dealt: i32, critical: bool) -> Result<DamageReport, RulesError> {
        let target = self
            .combatants
            .get_mut(target_id)
            .ok_or_else(|| RulesError::UnknownCombatant(target_id.to_string()))?;
        let mut failures_added = 0;

        if target.is_unconscious() {
            if dealt >= target.max_hp {
                target.dead = true;
            } else {
                failures_added = if critical { 2 } else { 1 };
                target.death_save_failures = (target.death_save_failures + failures_added).min(DEATH_SAVE_LIMIT);
                target.dead = target.death_save_failures >= DEATH_SAVE_LIMIT;
            }
        } else {
            let remaining = target.current_hp.saturating_sub(dealt);
            if remaining > 0 {
                target.current_hp = remaining;
            } else {
                target.current_hp = 0;
                if !target.is_player_controlled || remaining.saturating_neg() >= target.max_hp {
                    target.dead = true;
                } else {
                    target.add_condition(ActiveCondition {
                        name: UNCONSCIOUS.to_string(),
                        rounds_remaining: None,
                        until_own_turn: false,
                    });
                }
            }
        }

        Ok(DamageReport {
            hp_after: target.current_hp,
            unconscious: target.is_unconscious(),
            dead: target.dead,
            death_save_failures_added: failures_added,
        })
    }

    /// Move to the next turn; wrapping around starts a new round.
    ///
    /// Downed combatants keep their slot so a full cycle of turns is always
    /// exactly one round.
    pub fn next_turn(&mut self) -> Result<TurnAdvance, RulesError> {
        if self.state != CombatPhase::Active || self.turn_order.is_empty() {
            return Err(RulesError::CombatNotActive(self.state));
        }

        let mut expired = Vec::new();
        self.current_turn_index += 1;
        let new_round = self.current_turn_index >= self.turn_order.len();
        if new_round {
            self.current_turn_index = 0;
            self.round += 1;
            expired.extend(self.start_of_round());
        }

        let current = self.turn_order[self.current_turn_index].clone();
        if let Some(combatant) = self.combatants.get_mut(&current) {
            let ending: Vec<String> = combatant
                .conditions
                .iter()
                .filter(|c| c.until_own_turn)
                .map(|c| c.name.clone())
                .collect();
            for name in ending {
                combatant.remove_condition(&name);
                expired.push(ExpiredCondition {
                    combatant: current.clone(),
                    condition: name,
                });
            }
        }

        Ok(TurnAdvance {
            round: self.round,
            current_turn_index: self.current_turn_index,
            current_actor: current,
            new_round,
            expired,
        })
    }

    fn start_of_round(&mut self) -> Vec<ExpiredCondition> {
        let mut expired = Vec::new();
        for combatant in self.combatants.values_mut() {
            for condition in combatant.conditions.iter_mut() {
                if let Some(rounds) = condition.rounds_remaining.as_mut() {
                    *rounds = rounds.saturating_sub(1);
                }
            }
            let id = combatant.id.clone();
            combatant.conditions.retain(|c| {
                let done = c.rounds_remaining == Some(0);
                if done {
                    expired.push(ExpiredCondition {
                        combatant: id.clone(),
                        condition: c.name.clone(),
                    });
                }
                !done
            });
        }
        expired
    }

    /// Apply a condition with an optional round duration
    pub fn apply_condition(
        &mut self,
        combatant_id: &str,
        name: impl Into<String>,
        rounds: Option<u32>,
    ) -> Result<(), RulesError> {
        let combatant = self
            .combatants
            .get_mut(combatant_id)
            .ok_or_else(|| RulesError::UnknownCombatant(combatant_id.to_string()))?;
        combatant.add_condition(ActiveCondition {
            name: name.into(),
            rounds_remaining: rounds,
            until_own_turn: false,
        });
        Ok(())
    }

    /// End combat when one side is out of the fight.
    ///
    /// A side is out when every member is at 0 HP and none is an unconscious
    /// player, who can still be saved.
    pub fn check_end(&mut self) -> EndCheck {
        match self.state {
            CombatPhase::Ended => {
                return EndCheck {
                    combat_ended: true,
                    result: self.result,
                }
            }
            CombatPhase::Active => {}
            _ => {
                return EndCheck {
                    combat_ended: false,
                    result: None,
                }
            }
        }

        let result = if self.side_defeated(Side::Hostile) {
            Some(CombatResult::Victory)
        } else if self.side_defeated(Side::Party) {
            Some(CombatResult::Defeat)
        } else {
            None
        };

        if result.is_some() {
            self.state = CombatPhase::Ended;
            self.result = result;
        }
        EndCheck {
            combat_ended: result.is_some(),
            result,
        }
    }

    fn side_defeated(&self, side: Side) -> bool {
        let mut members = self.combatants.values().filter(|c| c.side == side).peekable();
        members.peek().is_some() && members.all(|c| c.current_hp <= 0 && !c.is_unconscious())
    }

    /// Force the encounter into `Ended`
    pub fn end(&mut self) -> Result<EndCheck, RulesError> {
        if self.state == CombatPhase::Inactive {
            return Err(RulesError::CombatNotActive(self.state));
        }
        self.state = CombatPhase::Ended;
        Ok(EndCheck {
            combat_ended: true,
            result: self.result,
        })
    }

    pub fn snapshot(&self) -> EncounterSnapshot {
        EncounterSnapshot {
            state: self.state,
            round: self.round,
            current_turn_index: self.current_turn_index,
            current_actor: self.current_actor().map(str::to_string),
            turn_order: self.turn_order.clone(),
            combatants: self
                .turn_order
                .iter()
                .filter_map(|id| self.combatants.get(id).cloned())
                .collect(),
            result: self.result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::{AdvantageState, ScriptedDice};

    fn policy() -> PolicyEngine {
        PolicyEngine::default()
    }

    fn skirmish(dice: &mut ScriptedDice) -> CombatEncounter {
        let mut encounter = CombatEncounter::new();
        encounter
            .start(
                vec![
                    CombatantSpec::player("hero", "Hero", 20, 14).with_dex(2).with_attack(5, "1d8+3"),
                    CombatantSpec::monster("goblin", "Goblin", 7, 13).with_dex(2).with_attack(4, "1d6+2"),
                    CombatantSpec::monster("wolf", "Wolf", 11, 13).with_dex(2),
                ],
                dice,
            )
            .unwrap();
        encounter
    }

    #[test]
    fn test_start_orders_by_initiative_with_ties() {
        // Hero and goblin tie at 14 with equal dex: listing order wins.
        let mut dice = ScriptedDice::new([12, 12, 15]);
        let encounter = skirmish(&mut dice);

        assert_eq!(encounter.state, CombatPhase::Active);
        assert_eq!(encounter.turn_order, vec!["wolf", "hero", "goblin"]);
        assert_eq!(encounter.current_turn_index, 0);
        assert_eq!(encounter.round, 1);
        assert_eq!(encounter.turn_order.len(), 3);
    }

    #[test]
    fn test_dex_breaks_initiative_ties() {
        let mut encounter = CombatEncounter::new();
        let mut dice = ScriptedDice::new([14, 12]);
        encounter
            .start(
                vec![
                    CombatantSpec::player("slow", "Slow", 10, 10).with_dex(0),
                    CombatantSpec::monster("quick", "Quick", 10, 10).with_dex(2),
                ],
                &mut dice,
            )
            .unwrap();
        assert_eq!(encounter.turn_order, vec!["quick", "slow"]);
    }

    #[test]
    fn test_start_rejects_bad_rosters() {
        let mut encounter = CombatEncounter::new();
        let mut dice = ScriptedDice::new(Vec::<u32>::new());
        assert!(matches!(encounter.start(vec![], &mut dice), Err(RulesError::NoParticipants)));
        let twice = vec![
            CombatantSpec::player("a", "A", 5, 10),
            CombatantSpec::monster("a", "A again", 5, 10),
        ];
        assert!(matches!(encounter.start(twice, &mut dice), Err(RulesError::DuplicateCombatant(_))));

        let huge = vec![CombatantSpec::player("a", "A", i32::MAX, 10)];
        assert!(matches!(encounter.start(huge, &mut dice), Err(RulesError::InvalidRequest(_))));
        let swarm = vec![CombatantSpec::monster("b", "B", 5, 10).with_attack(2, "3000000000d4")];
        assert!(matches!(encounter.start(swarm, &mut dice), Err(RulesError::Dice(_))));
        assert_eq!(encounter.state, CombatPhase::Inactive);
    }

    #[test]
    fn test_full_cycle_is_one_round() {
        let mut dice = ScriptedDice::new([12, 12, 15]);
        let mut encounter = skirmish(&mut dice);
        let len = encounter.turn_order.len();
        for _ in 0..len {
            encounter.next_turn().unwrap();
        }
        assert_eq!(encounter.current_turn_index, 0);
        assert_eq!(encounter.round, 2);
    }

    #[test]
    fn test_out_of_turn_action_is_rejected_without_mutation() {
        let mut dice = ScriptedDice::new([12, 12, 15, 20, 8]);
        let mut encounter = skirmish(&mut dice);
        let before = encounter.clone();

        let result = encounter.process_action(&CombatAction::attack("hero", "goblin"), &mut dice, &policy());
        assert!(matches!(result, Err(RulesError::NotYourTurn { .. })));
        assert_eq!(encounter, before);
        assert_eq!(dice.remaining(), 2);
    }

    #[test]
    fn test_natural_one_misses_and_crit_doubles_dice() {
        let mut dice = ScriptedDice::new([12, 12, 15]);
        let mut encounter = skirmish(&mut dice);
        encounter.next_turn().unwrap(); // hero

        dice.push([1]);
        let miss = encounter
            .process_action(&CombatAction::attack("hero", "wolf"), &mut dice, &policy())
            .unwrap();
        assert!(matches!(miss, ActionOutcome::Attack(ref a) if !a.hit));

        let mut dice = ScriptedDice::new([12, 12, 15, 20, 1, 1]);
        let mut encounter = skirmish(&mut dice);
        encounter.next_turn().unwrap();
        let crit = encounter
            .process_action(&CombatAction::attack("hero", "wolf"), &mut dice, &policy())
            .unwrap();
        match crit {
            ActionOutcome::Attack(a) => {
                assert!(a.critical);
                assert_eq!(a.damage_roll.unwrap().rolls.len(), 2);
                assert_eq!(a.damage_dealt, 5);
                assert_eq!(a.target_hp_after, 6);
            }
            other => panic!("expected attack, got {other:?}"),
        }
    }

    #[test]
    fn test_dodge_imposes_disadvantage_until_own_turn() {
        let mut encounter = CombatEncounter::new();
        let mut dice = ScriptedDice::new([15, 10]);
        encounter
            .start(
                vec![
                    CombatantSpec::player("hero", "Hero", 20, 14),
                    CombatantSpec::monster("goblin", "Goblin", 7, 13).with_attack(4, "1d6"),
                ],
                &mut dice,
            )
            .unwrap();

        encounter
            .process_action(&CombatAction::Dodge { actor: "hero".into() }, &mut dice, &policy())
            .unwrap();
        encounter.next_turn().unwrap();

        dice.push([18, 3, 4]);
        let outcome = encounter
            .process_action(&CombatAction::attack("goblin", "hero"), &mut dice, &policy())
            .unwrap();
        match outcome {
            ActionOutcome::Attack(a) => {
                assert_eq!(a.advantage.state, AdvantageState::Disadvantage);
                assert_eq!(a.attack_roll.kept, 3);
                assert!(!a.hit);
            }
            other => panic!("expected attack, got {other:?}"),
        }

        let advance = encounter.next_turn().unwrap();
        assert!(advance.new_round);
        assert!(advance.expired.iter().any(|e| e.condition == DODGING));
        assert!(!encounter.combatant("hero").unwrap().has_condition(DODGING));
    }

    #[test]
    fn test_unconscious_player_takes_death_save_failures() {
        let mut encounter = CombatEncounter::new();
        let mut dice = ScriptedDice::new([15, 10, 5]);
        encounter
            .start(
                vec![
                    CombatantSpec::monster("ogre", "Ogre", 30, 11).with_attack(6, "1d4"),
                    CombatantSpec::player("hero", "Hero", 12, 14).with_dex(1),
                    CombatantSpec::player("cleric", "Cleric", 12, 16),
                ],
                &mut dice,
            )
            .unwrap();
        assert_eq!(encounter.current_actor(), Some("ogre"));
        let mut hero = encounter.combatants["hero"].clone();
        hero.current_hp = 2;
        encounter.combatants.insert("hero".into(), hero);

        dice.push([15, 4]);
        encounter
            .process_action(&CombatAction::attack("ogre", "hero"), &mut dice, &policy())
            .unwrap();
        let hero = encounter.combatant("hero").unwrap();
        assert!(hero.is_unconscious());
        assert!(hero.has_condition(UNCONSCIOUS));
        assert!(!encounter.check_end().combat_ended);

        // Unconscious targets are attacked with advantage.
        dice.push([20, 1, 1, 1]);
        let outcome = encounter
            .process_action(&CombatAction::attack("ogre", "hero"), &mut dice, &policy())
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Attack(ref a) if a.death_save_failures_added == 2));

        dice.push([15, 1, 1]);
        encounter
            .process_action(&CombatAction::attack("ogre", "hero"), &mut dice, &policy())
            .unwrap();
        assert!(encounter.combatant("hero").unwrap().dead);
    }

    #[test]
    fn test_massive_damage_kills_outright() {
        let mut encounter = CombatEncounter::new();
        let mut dice = ScriptedDice::new([20, 1]);
        encounter
            .start(
                vec![
                    CombatantSpec::monster("giant", "Giant", 50, 12).with_attack(9, "3d10"),
                    CombatantSpec::player("hero", "Hero", 10, 12),
                ],
                &mut dice,
            )
            .unwrap();
        dice.push([15, 10, 10, 10]);
        let outcome = encounter
            .process_action(&CombatAction::attack("giant", "hero"), &mut dice, &policy())
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Attack(ref a) if a.target_dead));
        assert_eq!(encounter.check_end().result, Some(CombatResult::Defeat));
    }

    #[test]
    fn test_incapacitated_actor_and_dead_target() {
        let mut dice = ScriptedDice::new([12, 12, 15]);
        let mut encounter = skirmish(&mut dice);
        encounter.combatants.get_mut("wolf").unwrap().dead = true;
        encounter.combatants.get_mut("wolf").unwrap().current_hp = 0;

        assert!(matches!(
            encounter.validate(&CombatAction::Pass { actor: "wolf".into() }),
            Err(RulesError::ActorIncapacitated(_))
        ));
        encounter.next_turn().unwrap();
        assert!(matches!(
            encounter.validate(&CombatAction::attack("hero", "wolf")),
            Err(RulesError::TargetDown(_))
        ));
    }

    #[test]
    fn test_condition_durations_tick_each_round() {
        let mut dice = ScriptedDice::new([12, 12, 15]);
        let mut encounter = skirmish(&mut dice);
        encounter.apply_condition("goblin", "frightened", Some(1)).unwrap();
        for _ in 0..3 {
            encounter.next_turn().unwrap();
        }
        assert!(!encounter.combatant("goblin").unwrap().has_condition("frightened"));
    }

    #[test]
    fn test_forced_end() {
        let mut encounter = CombatEncounter::new();
        assert!(encounter.end().is_err());
        let mut dice = ScriptedDice::new([12, 12, 15]);
        let mut encounter = skirmish(&mut dice);
        let end = encounter.end().unwrap();
        assert!(end.combat_ended);
        assert!(end.result.is_none());
        assert!(matches!(encounter.next_turn(), Err(RulesError::CombatNotActive(CombatPhase::Ended))));
    }
}
