//! Read-only character capability snapshots.
//!
//! The character store is an external collaborator: the engine only ever
//! reads a [`CharacterSnapshot`] from it, it never writes back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

// ============================================================================
// Abilities and skills
// ============================================================================

/// The six ability scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ability {
    Strength,
    Dexterity,
    Constitution,
    Intelligence,
    Wisdom,
    Charisma,
}

impl Ability {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Ability::Strength => "STR",
            Ability::Dexterity => "DEX",
            Ability::Constitution => "CON",
            Ability::Intelligence => "INT",
            Ability::Wisdom => "WIS",
            Ability::Charisma => "CHA",
        }
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.abbreviation())
    }
}

/// Ability scores container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityScores {
    pub strength: u8,
    pub dexterity: u8,
    pub constitution: u8,
    pub intelligence: u8,
    pub wisdom: u8,
    pub charisma: u8,
}

impl AbilityScores {
    pub fn new(str: u8, dex: u8, con: u8, int: u8, wis: u8, cha: u8) -> Self {
        Self {
            strength: str,
            dexterity: dex,
            constitution: con,
            intelligence: int,
            wisdom: wis,
            charisma: cha,
        }
    }

    pub fn get(&self, ability: Ability) -> u8 {
        match ability {
            Ability::Strength => self.strength,
            Ability::Dexterity => self.dexterity,
            Ability::Constitution => self.constitution,
            Ability::Intelligence => self.intelligence,
            Ability::Wisdom => self.wisdom,
            Ability::Charisma => self.charisma,
        }
    }

    /// Score 8-9 = -1, 10-11 = 0, 12-13 = +1.
    pub fn modifier(&self, ability: Ability) -> i32 {
        (self.get(ability) as i32 - 10).div_euclid(2)
    }
}

impl Default for AbilityScores {
    fn default() -> Self {
        Self::new(10, 10, 10, 10, 10, 10)
    }
}

/// Skills, each keyed to one ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skill {
    Athletics,
    Acrobatics,
    SleightOfHand,
    Stealth,
    Arcana,
    History,
    Investigation,
    Nature,
    Religion,
    AnimalHandling,
    Insight,
    Medicine,
    Perception,
    Survival,
    Deception,
    Intimidation,
    Performance,
    Persuasion,
}

impl Skill {
    pub fn ability(&self) -> Ability {
        match self {
            Skill::Athletics => Ability::Strength,
            Skill::Acrobatics | Skill::SleightOfHand | Skill::Stealth => Ability::Dexterity,
            Skill::Arcana
            | Skill::History
            | Skill::Investigation
            | Skill::Nature
            | Skill::Religion => Ability::Intelligence,
            Skill::AnimalHandling
            | Skill::Insight
            | Skill::Medicine
            | Skill::Perception
            | Skill::Survival => Ability::Wisdom,
            Skill::Deception | Skill::Intimidation | Skill::Performance | Skill::Persuasion => {
                Ability::Charisma
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Skill::Athletics => "Athletics",
            Skill::Acrobatics => "Acrobatics",
            Skill::SleightOfHand => "Sleight of Hand",
            Skill::Stealth => "Stealth",
            Skill::Arcana => "Arcana",
            Skill::History => "History",
            Skill::Investigation => "Investigation",
            Skill::Nature => "Nature",
            Skill::Religion => "Religion",
            Skill::AnimalHandling => "Animal Handling",
            Skill::Insight => "Insight",
            Skill::Medicine => "Medicine",
            Skill::Perception => "Perception",
            Skill::Survival => "Survival",
            Skill::Deception => "Deception",
            Skill::Intimidation => "Intimidation",
            Skill::Performance => "Performance",
            Skill::Persuasion => "Persuasion",
        }
    }
}

impl fmt::Display for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Skill {
    type Err = String;

    /// Accepts display names and snake_case, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let skill = match key.as_str() {
            "athletics" => Skill::Athletics,
            "acrobatics" => Skill::Acrobatics,
            "sleightofhand" => Skill::SleightOfHand,
            "stealth" => Skill::Stealth,
            "arcana" => Skill::Arcana,
            "history" => Skill::History,
            "investigation" => Skill::Investigation,
            "nature" => Skill::Nature,
            "religion" => Skill::Religion,
            "animalhandling" => Skill::AnimalHandling,
            "insight" => Skill::Insight,
            "medicine" => Skill::Medicine,
            "perception" => Skill::Perception,
            "survival" => Skill::Survival,
            "deception" => Skill::Deception,
            "intimidation" => Skill::Intimidation,
            "performance" => Skill::Performance,
            "persuasion" => Skill::Persuasion,
            _ => return Err(format!("unknown skill: {s}")),
        };
        Ok(skill)
    }
}

/// Proficiency level for skills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProficiencyLevel {
    #[default]
    None,
    Half,
    Proficient,
    Expertise,
}

impl ProficiencyLevel {
    pub fn bonus(&self, proficiency_bonus: i32) -> i32 {
        match self {
            ProficiencyLevel::None => 0,
            ProficiencyLevel::Half => proficiency_bonus / 2,
            ProficiencyLevel::Proficient => proficiency_bonus,
            ProficiencyLevel::Expertise => proficiency_bonus * 2,
        }
    }
}

/// Proficiency bonus for a character level, capped at +6.
pub fn proficiency_for_level(level: u8) -> i32 {
    match level {
        0..=4 => 2,
        5..=8 => 3,
        9..=12 => 4,
        13..=16 => 5,
        _ => 6,
    }
}

/// What a check rolls against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CheckKind {
    Skill(Skill),
    Ability(Ability),
    SavingThrow(Ability),
}

impl CheckKind {
    pub fn ability(&self) -> Ability {
        match self {
            CheckKind::Skill(skill) => skill.ability(),
            CheckKind::Ability(ability) | CheckKind::SavingThrow(ability) => *ability,
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Skill(skill) => write!(f, "{skill} ({})", skill.ability()),
            CheckKind::Ability(ability) => write!(f, "{ability} check"),
            CheckKind::SavingThrow(ability) => write!(f, "{ability} save"),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only view of one character's capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub id: String,
    pub name: String,
    pub level: u8,
    pub ability_scores: AbilityScores,
    pub proficiency_bonus: i32,
    #[serde(default)]
    pub skills: HashMap<Skill, ProficiencyLevel>,
    #[serde(default)]
    pub saving_throws: HashSet<Ability>,
    /// Active condition tags, e.g. `poisoned`
    #[serde(default)]
    pub conditions: BTreeSet<String>,
}

impl CharacterSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>, level: u8) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level,
            ability_scores: AbilityScores::default(),
            proficiency_bonus: proficiency_for_level(level),
            skills: HashMap::new(),
            saving_throws: HashSet::new(),
            conditions: BTreeSet::new(),
        }
    }

    pub fn with_scores(mut self, scores: AbilityScores) -> Self {
        self.ability_scores = scores;
        self
    }

    pub fn with_skill(mut self, skill: Skill, level: ProficiencyLevel) -> Self {
        self.skills.insert(skill, level);
        self
    }

    pub fn with_save(mut self, ability: Ability) -> Self {
        self.saving_throws.insert(ability);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.insert(condition.into());
        self
    }

    pub fn ability_modifier(&self, ability: Ability) -> i32 {
        self.ability_scores.modifier(ability)
    }

    /// Proficiency contribution to a check
    pub fn proficiency_contribution(&self, kind: CheckKind) -> i32 {
        match kind {
            CheckKind::Skill(skill) => self
                .skills
                .get(&skill)
                .copied()
                .unwrap_or_default()
                .bonus(self.proficiency_bonus),
            CheckKind::Ability(_) => 0,
            CheckKind::SavingThrow(ability) => {
                if self.saving_throws.contains(&ability) {
                    self.proficiency_bonus
                } else {
                    0
                }
            }
        }
    }

    /// Total modifier added to the d20
    pub fn check_modifier(&self, kind: CheckKind) -> i32 {
        self.ability_modifier(kind.ability()) + self.proficiency_contribution(kind)
    }
}

/// Source of character snapshots
pub trait CharacterStore: Send + Sync {
    fn snapshot(&self, actor_id: &str) -> Option<CharacterSnapshot>;
}

/// Character store backed by a map, for sessions and tests
#[derive(Debug, Default)]
pub struct InMemoryCharacterStore {
    characters: RwLock<HashMap<String, CharacterSnapshot>>,
}

impl InMemoryCharacterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a character
    pub fn insert(&self, character: CharacterSnapshot) {
        if let Ok(mut characters) = self.characters.write() {
            characters.insert(character.id.clone(), character);
        }
    }

    pub fn with(self, character: CharacterSnapshot) -> Self {
        self.insert(character);
        self
    }

    pub fn len(&self) -> usize {
        self.characters.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CharacterStore for InMemoryCharacterStore {
    fn snapshot(&self, actor_id: &str) -> Option<CharacterSnapshot> {
        self.characters
            .read()
            .ok()
            .and_then(|characters| characters.get(actor_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ability_modifier() {
        let scores = AbilityScores::new(8, 9, 10, 11, 12, 20);
        assert_eq!(scores.modifier(Ability::Strength), -1);
        assert_eq!(scores.modifier(Ability::Dexterity), -1);
        assert_eq!(scores.modifier(Ability::Constitution), 0);
        assert_eq!(scores.modifier(Ability::Wisdom), 1);
        assert_eq!(scores.modifier(Ability::Charisma), 5);
        assert_eq!(AbilityScores::new(1, 10, 10, 10, 10, 10).modifier(Ability::Strength), -5);
    }

    #[test]
    fn test_check_modifier_with_proficiency() {
        let rogue = CharacterSnapshot::new("pc-1", "Vex", 5)
            .with_scores(AbilityScores::new(10, 16, 12, 10, 14, 10))
            .with_skill(Skill::Stealth, ProficiencyLevel::Expertise)
            .with_skill(Skill::Perception, ProficiencyLevel::Half)
            .with_save(Ability::Dexterity);

        assert_eq!(rogue.proficiency_bonus, 3);
        assert_eq!(rogue.check_modifier(CheckKind::Skill(Skill::Stealth)), 3 + 6);
        assert_eq!(rogue.check_modifier(CheckKind::Skill(Skill::Perception)), 2 + 1);
        assert_eq!(rogue.check_modifier(CheckKind::Skill(Skill::Athletics)), 0);
        assert_eq!(rogue.check_modifier(CheckKind::SavingThrow(Ability::Dexterity)), 6);
        assert_eq!(rogue.check_modifier(CheckKind::Ability(Ability::Dexterity)), 3);
    }

    #[test]
    fn test_skill_from_str() {
        assert_eq!("Sleight of Hand".parse::<Skill>().unwrap(), Skill::SleightOfHand);
        assert_eq!("animal_handling".parse::<Skill>().unwrap(), Skill::AnimalHandling);
        assert!("cooking".parse::<Skill>().is_err());
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryCharacterStore::new().with(CharacterSnapshot::new("pc-1", "Vex", 1));
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot("pc-1").unwrap().name, "Vex");
        assert!(store.snapshot("pc-2").is_none());
    }
}
