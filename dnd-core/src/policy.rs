//! House-rule policy: advantage tallying and difficulty adjustment.
//!
//! Everything here is a pure function of the active [`PolicyProfile`], the
//! configured [`DifficultyLimits`] and the situational context passed in.

use crate::dice::AdvantageState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Advantage sources recognized by the built-in profiles.
pub const ADVANTAGE_SOURCES: &[&str] = &[
    "flanking",
    "hidden",
    "helped",
    "inspired",
    "high_ground",
    "target_prone",
    "target_restrained",
    "target_blinded",
    "target_stunned",
    "target_unconscious",
    "target_paralyzed",
];

/// Disadvantage sources recognized by the built-in profiles.
pub const DISADVANTAGE_SOURCES: &[&str] = &[
    "blinded",
    "poisoned",
    "frightened",
    "prone",
    "restrained",
    "exhausted",
    "difficult_terrain",
    "heavily_obscured",
    "long_range",
    "target_dodging",
    "target_hidden",
    "armor_stealth",
];

/// Names of the built-in profiles.
pub const BUILTIN_PROFILES: &[&str] = &["raw", "easy", "hard", "heroic"];

/// Immutable bundle of house-rule toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub name: String,
    /// Fixed delta applied to every base DC
    pub dc_delta: i32,
    /// Lowest natural d20 that scores a critical hit
    pub crit_min: u32,
    pub advantage_sources: BTreeSet<String>,
    pub disadvantage_sources: BTreeSet<String>,
}

impl PolicyProfile {
    fn builtin(name: &str, dc_delta: i32, crit_min: u32) -> Self {
        Self {
            name: name.to_string(),
            dc_delta,
            crit_min,
            advantage_sources: ADVANTAGE_SOURCES.iter().map(|s| s.to_string()).collect(),
            disadvantage_sources: DISADVANTAGE_SOURCES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Rules as written
    pub fn raw() -> Self {
        Self::builtin("raw", 0, 20)
    }

    pub fn easy() -> Self {
        Self::builtin("easy", -2, 20)
    }

    pub fn hard() -> Self {
        Self::builtin("hard", 2, 20)
    }

    /// Slightly easier checks and a wider critical range
    pub fn heroic() -> Self {
        Self::builtin("heroic", -1, 19)
    }

    /// Resolve a built-in profile by name, case-insensitively
    pub fn named(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(Self::raw()),
            "easy" => Some(Self::easy()),
            "hard" => Some(Self::hard()),
            "heroic" => Some(Self::heroic()),
            _ => None,
        }
    }
}

impl Default for PolicyProfile {
    fn default() -> Self {
        Self::raw()
    }
}

/// DC floor/ceiling and the party-level outlier thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyLimits {
    pub min_dc: i32,
    pub max_dc: i32,
    /// Party levels below this lower the DC by one
    pub low_level_threshold: u8,
    /// Party levels above this raise the DC by one
    pub high_level_threshold: u8,
}

impl Default for DifficultyLimits {
    fn default() -> Self {
        Self {
            min_dc: 5,
            max_dc: 30,
            low_level_threshold: 3,
            high_level_threshold: 15,
        }
    }
}

/// Situational tags present for one roll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SituationalContext {
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_level: Option<u8>,
}

impl SituationalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.insert(source.into());
        self
    }

    pub fn with_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn with_party_level(mut self, level: u8) -> Self {
        self.party_level = Some(level);
        self
    }
}

/// Advantage state plus the sources that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvantageAssessment {
    pub state: AdvantageState,
    pub advantage_sources: Vec<String>,
    pub disadvantage_sources: Vec<String>,
    /// Tags the profile does not recognize
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored: Vec<String>,
}

/// Breakdown of a difficulty adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyAdjustment {
    pub base_dc: i32,
    pub profile_delta: i32,
    pub level_adjustment: i32,
    pub adjusted_dc: i32,
    pub clamped: bool,
}

/// Policy mediation for one session
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    profile: PolicyProfile,
    limits: DifficultyLimits,
}

impl PolicyEngine {
    pub fn new(profile: PolicyProfile, limits: DifficultyLimits) -> Self {
        Self { profile, limits }
    }

    pub fn profile(&self) -> &PolicyProfile {
        &self.profile
    }

    pub fn limits(&self) -> &DifficultyLimits {
        &self.limits
    }

    /// Tally advantage against disadvantage sources by count.
    ///
    /// More advantage sources gives advantage, more disadvantage sources
    /// gives disadvantage, equal counts (including none) give a normal roll.
    pub fn compute_advantage_state(&self, context: &SituationalContext) -> AdvantageAssessment {
        let mut advantage_sources = Vec::new();
        let mut disadvantage_sources = Vec::new();
        let mut ignored = Vec::new();

        for source in &context.sources {
            if self.profile.advantage_sources.contains(source) {
                advantage_sources.push(source.clone());
            } else if self.profile.disadvantage_sources.contains(source) {
                disadvantage_sources.push(source.clone());
            } else {
                ignored.push(source.clone());
            }
        }

        if !ignored.is_empty() {
            tracing::debug!(profile = %self.profile.name, ?ignored, "Ignoring unrecognized situational sources");
        }

        let state = match advantage_sources.len().cmp(&disadvantage_sources.len()) {
            std::cmp::Ordering::Greater => AdvantageState::Advantage,
            std::cmp::Ordering::Less => AdvantageState::Disadvantage,
            std::cmp::Ordering::Equal => AdvantageState::Normal,
        };

        AdvantageAssessment {
            state,
            advantage_sources,
            disadvantage_sources,
            ignored,
        }
    }

    /// Final DC after profile delta, level outliers and clamping
    pub fn adjust_difficulty(&self, base_dc: i32, context: &SituationalContext) -> i32 {
        self.difficulty_breakdown(base_dc, context).adjusted_dc
    }

    pub fn difficulty_breakdown(&self, base_dc: i32, context: &SituationalContext) -> DifficultyAdjustment {
        let level_adjustment = match context.party_level {
            Some(level) if level < self.limits.low_level_threshold => -1,
            Some(level) if level > self.limits.high_level_threshold => 1,
            _ => 0,
        };
        let unclamped = base_dc
            .saturating_add(self.profile.dc_delta)
            .saturating_add(level_adjustment);
        let adjusted_dc = unclamped.clamp(self.limits.min_dc, self.limits.max_dc);

        DifficultyAdjustment {
            base_dc,
            profile_delta: self.profile.dc_delta,
            level_adjustment,
            adjusted_dc,
            clamped: adjusted_dc != unclamped,
        }
    }

    /// `10 + ability modifier + proficiency bonus + bonus`
    pub fn passive_score(&self, ability_modifier: i32, proficiency_bonus: i32, bonus: i32) -> i32 {
        10i32
            .saturating_add(ability_modifier)
            .saturating_add(proficiency_bonus)
            .saturating_add(bonus)
    }

    /// Lowest natural roll that counts as a critical hit
    pub fn critical_range(&self) -> u32 {
        self.profile.crit_min
    }
}
