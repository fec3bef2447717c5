//! Dice notation and the randomness seam.
//!
//! Every roll the engine makes goes through a [`DieSource`]. Production code
//! uses [`RandomDice`]; tests and replays use [`ScriptedDice`], which makes
//! every outcome a pure function of its inputs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for dice parsing.
#[derive(Debug, Error)]
pub enum DiceError {
    #[error("Invalid dice notation: {0}")]
    InvalidNotation(String),
    #[error("Invalid die size: {0}")]
    InvalidDieSize(u32),
    #[error("No dice specified")]
    NoDice,
    #[error("Cannot keep {keep} dice when only rolling {count} (in {notation})")]
    InvalidKeepCount {
        keep: u32,
        count: u32,
        notation: String,
    },
    #[error("Too many dice: {count} (at most {MAX_DICE})")]
    TooManyDice { count: u64 },
    #[error("Modifier {0} is outside ±{MAX_MODIFIER}")]
    ModifierTooLarge(i64),
}

/// Most dice one expression may roll, before crit doubling
pub const MAX_DICE: u64 = 100;
/// Largest flat modifier one expression may carry
pub const MAX_MODIFIER: i64 = 1_000;

/// Source of individual die results.
pub trait DieSource: Send {
    /// Roll one die with `sides` faces, returning a value in `1..=sides`.
    fn roll_die(&mut self, sides: u32) -> u32;
}

/// Pseudo-random dice, optionally seeded for reproducible sessions.
#[derive(Debug, Clone)]
pub struct RandomDice {
    rng: StdRng,
}

impl RandomDice {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomDice {
    fn default() -> Self {
        Self::new()
    }
}

impl DieSource for RandomDice {
    fn roll_die(&mut self, sides: u32) -> u32 {
        self.rng.gen_range(1..=sides.max(1))
    }
}

/// Dice that replay a fixed sequence of results.
///
/// Values are clamped to the die being rolled. Once the script runs out,
/// rolls continue from a fixed-seed generator so the sequence stays
/// reproducible.
#[derive(Debug, Clone)]
pub struct ScriptedDice {
    script: VecDeque<u32>,
    overflow: StdRng,
}

impl ScriptedDice {
    pub fn new(values: impl IntoIterator<Item = u32>) -> Self {
        Self {
            script: values.into_iter().collect(),
            overflow: StdRng::seed_from_u64(0),
        }
    }

    /// Append more results to the end of the script
    pub fn push(&mut self, values: impl IntoIterator<Item = u32>) {
        self.script.extend(values);
    }

    /// Results not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl DieSource for ScriptedDice {
    fn roll_die(&mut self, sides: u32) -> u32 {
        let sides = sides.max(1);
        match self.script.pop_front() {
            Some(value) => value.clamp(1, sides),
            None => {
                tracing::debug!(sides, "Dice script exhausted, rolling from fixed seed");
                self.overflow.gen_range(1..=sides)
            }
        }
    }
}

/// Advantage state for d20 tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdvantageState {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
}

impl fmt::Display for AdvantageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvantageState::Normal => write!(f, "normal"),
            AdvantageState::Advantage => write!(f, "advantage"),
            AdvantageState::Disadvantage => write!(f, "disadvantage"),
        }
    }
}

/// Result of a d20 test: raw dice, the kept die, modifier and total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct D20Roll {
    /// Every d20 rolled; two under advantage or disadvantage
    pub rolls: Vec<u32>,
    pub kept: u32,
    pub modifier: i32,
    pub total: i32,
    pub advantage: AdvantageState,
}

impl D20Roll {
    pub fn natural_20(&self) -> bool {
        self.kept == 20
    }

    pub fn natural_1(&self) -> bool {
        self.kept == 1
    }
}

/// Roll a d20, consuming two dice under advantage or disadvantage.
pub fn roll_d20(source: &mut dyn DieSource, modifier: i32, advantage: AdvantageState) -> D20Roll {
    let first = source.roll_die(20);
    let (rolls, kept) = match advantage {
        AdvantageState::Normal => (vec![first], first),
        AdvantageState::Advantage => {
            let second = source.roll_die(20);
            (vec![first, second], first.max(second))
        }
        AdvantageState::Disadvantage => {
            let second = source.roll_die(20);
            (vec![first, second], first.min(second))
        }
    };

    D20Roll {
        rolls,
        kept,
        modifier,
        total: (kept as i32).saturating_add(modifier),
        advantage,
    }
}

/// A single die component of a dice expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceComponent {
    pub count: u32,
    pub sides: u32,
    pub keep_highest: Option<u32>,
    pub keep_lowest: Option<u32>,
}

const VALID_SIDES: [u32; 7] = [4, 6, 8, 10, 12, 20, 100];

/// A complete dice expression (e.g., 2d6+3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceExpression {
    pub components: Vec<DiceComponent>,
    pub modifier: i32,
    pub original: String,
}

impl DiceExpression {
    /// Parse a dice notation string.
    pub fn parse(notation: &str) -> Result<Self, DiceError> {
        let notation = notation.trim().to_lowercase();
        if notation.is_empty() {
            return Err(DiceError::NoDice);
        }

        let mut components = Vec::new();
        let mut modifier: i32 = 0;
        let mut current = String::new();
        let mut sign: i32 = 1;

        for ch in notation.chars() {
            match ch {
                '+' | '-' => {
                    if !current.is_empty() {
                        Self::parse_term(&current, sign, &mut components, &mut modifier)?;
                        current.clear();
                    }
                    sign = if ch == '+' { 1 } else { -1 };
                }
                ' ' => continue,
                _ => current.push(ch),
            }
        }

        if !current.is_empty() {
            Self::parse_term(&current, sign, &mut components, &mut modifier)?;
        }

        if components.is_empty() && modifier == 0 {
            return Err(DiceError::NoDice);
        }
        let count: u64 = components.iter().map(|c| u64::from(c.count)).sum();
        if count > MAX_DICE {
            return Err(DiceError::TooManyDice { count });
        }

        Ok(DiceExpression {
            components,
            modifier,
            original: notation,
        })
    }

    fn parse_term(
        term: &str,
        sign: i32,
        components: &mut Vec<DiceComponent>,
        modifier: &mut i32,
    ) -> Result<(), DiceError> {
        let invalid = || DiceError::InvalidNotation(term.to_string());

        let Some((count, rest)) = term.split_once('d') else {
            let value: i64 = term.parse().map_err(|_| invalid())?;
            if value > MAX_MODIFIER {
                return Err(DiceError::ModifierTooLarge(value));
            }
            let total = i64::from(*modifier) + i64::from(sign) * value;
            if total.abs() > MAX_MODIFIER {
                return Err(DiceError::ModifierTooLarge(total));
            }
            // Bounded by MAX_MODIFIER above
            *modifier = total as i32;
            return Ok(());
        };

        let count: u64 = if count.is_empty() {
            1
        } else {
            count.parse().map_err(|_| invalid())?
        };
        if count > MAX_DICE {
            return Err(DiceError::TooManyDice { count });
        }
        let count = count as u32;

        let (sides, keep_highest, keep_lowest) = if let Some((sides, keep)) = rest.split_once("kh") {
            (sides, Some(keep.parse::<u32>().map_err(|_| invalid())?), None)
        } else if let Some((sides, keep)) = rest.split_once("kl") {
            (sides, None, Some(keep.parse::<u32>().map_err(|_| invalid())?))
        } else {
            (rest, None, None)
        };

        let sides: u32 = sides.parse().map_err(|_| invalid())?;
        if !VALID_SIDES.contains(&sides) {
            return Err(DiceError::InvalidDieSize(sides));
        }

        if let Some(keep) = keep_highest.or(keep_lowest) {
            if keep > count {
                return Err(DiceError::InvalidKeepCount {
                    keep,
                    count,
                    notation: term.to_string(),
                });
            }
        }

        components.push(DiceComponent {
            count,
            sides,
            keep_highest,
            keep_lowest,
        });
        Ok(())
    }

    /// Same expression with every die count doubled, as for critical hits.
    pub fn doubled_dice(&self) -> Self {
        let components = self
            .components
            .iter()
            .map(|c| DiceComponent {
                count: c.count.saturating_mul(2),
                keep_highest: c.keep_highest.map(|k| k.saturating_mul(2)),
                keep_lowest: c.keep_lowest.map(|k| k.saturating_mul(2)),
                ..c.clone()
            })
            .collect();
        DiceExpression {
            components,
            modifier: self.modifier,
            original: format!("{} (doubled dice)", self.original),
        }
    }

    /// Roll the expression against a die source.
    pub fn roll(&self, source: &mut dyn DieSource) -> RollResult {
        let mut rolls = Vec::new();
        let mut dice_total: i32 = 0;

        for component in &self.components {
            let mut rolled: Vec<u32> = (0..component.count)
                .map(|_| source.roll_die(component.sides))
                .collect();
            rolls.extend(rolled.iter().copied());

            if let Some(keep) = component.keep_highest {
                rolled.sort_by(|a, b| b.cmp(a));
                rolled.truncate(keep as usize);
            } else if let Some(keep) = component.keep_lowest {
                rolled.sort();
                rolled.truncate(keep as usize);
            }
            dice_total = dice_total.saturating_add(rolled.iter().sum::<u32>() as i32);
        }

        RollResult {
            notation: self.original.clone(),
            rolls,
            modifier: self.modifier,
            total: dice_total.saturating_add(self.modifier),
        }
    }
}

impl FromStr for DiceExpression {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiceExpression::parse(s)
    }
}

impl fmt::Display for DiceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Result of rolling a dice expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    pub notation: String,
    /// Every die rolled, including dropped ones
    pub rolls: Vec<u32>,
    pub modifier: i32,
    pub total: i32,
}

impl fmt::Display for RollResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dice = self
            .rolls
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match self.modifier {
            0 => write!(f, "[{dice}] = {}", self.total),
            m if m > 0 => write!(f, "[{dice}] + {m} = {}", self.total),
            m => write!(f, "[{dice}] - {} = {}", m.abs(), self.total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let expr = DiceExpression::parse("1d20").unwrap();
        assert_eq!(expr.components.len(), 1);
        assert_eq!(expr.components[0].count, 1);
        assert_eq!(expr.components[0].sides, 20);
        assert_eq!(expr.modifier, 0);
    }

    #[test]
    fn test_parse_with_modifier() {
        assert_eq!(DiceExpression::parse("1d20+5").unwrap().modifier, 5);
        assert_eq!(DiceExpression::parse("2d6-2").unwrap().modifier, -2);
        assert_eq!(DiceExpression::parse("2d6+1d4+3").unwrap().components.len(), 2);
    }

    #[test]
    fn test_invalid_notation() {
        assert!(matches!(DiceExpression::parse(""), Err(DiceError::NoDice)));
        assert!(matches!(DiceExpression::parse("1d7"), Err(DiceError::InvalidDieSize(7))));
        assert!(matches!(DiceExpression::parse("xd6"), Err(DiceError::InvalidNotation(_))));
        assert!(matches!(
            DiceExpression::parse("4d6kh5"),
            Err(DiceError::InvalidKeepCount { keep: 5, count: 4, .. })
        ));
        assert!(DiceExpression::parse("4d6kh4").is_ok());
    }

    #[test]
    fn test_oversized_expressions_are_refused() {
        assert!(DiceExpression::parse("100d4").is_ok());
        assert!(matches!(
            DiceExpression::parse("101d4"),
            Err(DiceError::TooManyDice { count: 101 })
        ));
        assert!(matches!(
            DiceExpression::parse("3000000000d4"),
            Err(DiceError::TooManyDice { .. })
        ));
        assert!(matches!(
            DiceExpression::parse("60d6+60d6"),
            Err(DiceError::TooManyDice { count: 120 })
        ));
        assert!(matches!(
            DiceExpression::parse("1d6+2147483647"),
            Err(DiceError::ModifierTooLarge(_))
        ));
        assert!(matches!(
            DiceExpression::parse("1d6+900+900"),
            Err(DiceError::ModifierTooLarge(1800))
        ));
    }

    #[test]
    fn test_largest_expression_doubles_safely() {
        let expr = DiceExpression::parse("100d4+1000").unwrap().doubled_dice();
        assert_eq!(expr.components[0].count, 200);
        let result = expr.roll(&mut ScriptedDice::new(std::iter::repeat(4).take(200)));
        assert_eq!(result.total, 1800);
    }

    #[test]
    fn test_scripted_roll_keep_highest() {
        let expr = DiceExpression::parse("4d6kh3+1").unwrap();
        let mut dice = ScriptedDice::new([1, 5, 3, 6]);
        let result = expr.roll(&mut dice);
        assert_eq!(result.rolls, vec![1, 5, 3, 6]);
        assert_eq!(result.total, 15);
        assert_eq!(dice.remaining(), 0);
    }

    #[test]
    fn test_doubled_dice_keeps_modifier() {
        let expr = DiceExpression::parse("1d8+3").unwrap().doubled_dice();
        assert_eq!(expr.components[0].count, 2);
        let result = expr.roll(&mut ScriptedDice::new([4, 6]));
        assert_eq!(result.total, 13);
    }

    #[test]
    fn test_d20_advantage_consumes_two_dice() {
        let mut dice = ScriptedDice::new([7, 15, 7, 15]);
        let adv = roll_d20(&mut dice, 2, AdvantageState::Advantage);
        assert_eq!(adv.rolls, vec![7, 15]);
        assert_eq!(adv.kept, 15);
        assert_eq!(adv.total, 17);

        let dis = roll_d20(&mut dice, 2, AdvantageState::Disadvantage);
        assert_eq!(dis.kept, 7);
        assert_eq!(dis.total, 9);
    }

    #[test]
    fn test_scripted_values_are_clamped() {
        let mut dice = ScriptedDice::new([25, 0]);
        assert_eq!(dice.roll_die(20), 20);
        assert_eq!(dice.roll_die(6), 1);
    }

    #[test]
    fn test_seeded_dice_repeat() {
        let expr = DiceExpression::parse("3d6+2").unwrap();
        let a = expr.roll(&mut RandomDice::seeded(42));
        let b = expr.roll(&mut RandomDice::seeded(42));
        assert_eq!(a, b);
        for _ in 0..100 {
            let r = roll_d20(&mut RandomDice::new(), 5, AdvantageState::Normal);
            assert!((6..=25).contains(&r.total));
        }
    }
}
