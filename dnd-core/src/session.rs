//! Session snapshots for save/load.
//!
//! A snapshot is loaded and saved wholesale: the encounter (if any), the
//! policy profile the session runs under, scene state, and every decision
//! record so far.

use crate::combat::{CombatEncounter, CombatPhase};
use crate::decisions::DecisionRecord;
use crate::engine::GameState;
use crate::rules::RulesError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Snapshot was taken under policy profile '{found}', session uses '{expected}'")]
    ProfileMismatch { expected: String, found: String },

    #[error("Game state error: {0}")]
    State(RulesError),
}

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Format version for compatibility checking.
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// `None` when no combat has been started
    pub encounter: Option<CombatEncounter>,
    pub policy_profile: String,
    #[serde(default)]
    pub scene_flags: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: BTreeMap<String, BTreeMap<String, i64>>,
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
}

impl SessionSnapshot {
    pub fn new(policy_profile: &str, state: GameState, decisions: Vec<DecisionRecord>) -> Self {
        let encounter = (state.encounter.state != CombatPhase::Inactive).then_some(state.encounter);
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            encounter,
            policy_profile: policy_profile.to_string(),
            scene_flags: state.scene_flags,
            resources: state.resources,
            decisions,
        }
    }

    /// The engine state this snapshot describes
    pub fn into_game_state(self) -> GameState {
        GameState {
            encounter: self.encounter.unwrap_or_default(),
            scene_flags: self.scene_flags,
            resources: self.resources,
        }
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let snapshot: Self = serde_json::from_str(&content)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: snapshot.version,
            });
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::CombatantSpec;
    use crate::dice::ScriptedDice;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{name}-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_idle_session_has_no_encounter() {
        let mut state = GameState::default();
        state.scene_flags.insert("gate.open".into(), Value::Bool(true));

        let snapshot = SessionSnapshot::new("raw", state.clone(), Vec::new());
        assert!(snapshot.encounter.is_none());
        assert_eq!(snapshot.into_game_state(), state);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let mut state = GameState::default();
        let mut dice = ScriptedDice::new([15, 5]);
        state
            .encounter
            .start(
                vec![
                    CombatantSpec::player("pc", "Vex", 20, 14),
                    CombatantSpec::monster("gob", "Goblin", 7, 13),
                ],
                &mut dice,
            )
            .unwrap();
        state
            .resources
            .entry("pc".into())
            .or_default()
            .insert("inspiration".into(), 1);

        let path = temp_path("dnd-session");
        let snapshot = SessionSnapshot::new("heroic", state.clone(), Vec::new());
        snapshot.save_json(&path).await.expect("Save should succeed");

        let loaded = SessionSnapshot::load_json(&path).await.expect("Load should succeed");
        fs::remove_file(&path).await.unwrap();

        assert_eq!(loaded.policy_profile, "heroic");
        assert_eq!(loaded.encounter.as_ref().map(|e| e.state), Some(CombatPhase::Active));
        assert_eq!(loaded.into_game_state(), state);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let mut snapshot = SessionSnapshot::new("raw", GameState::default(), Vec::new());
        snapshot.version = SNAPSHOT_VERSION + 1;

        let path = temp_path("dnd-session-old");
        snapshot.save_json(&path).await.unwrap();
        let result = SessionSnapshot::load_json(&path).await;
        fs::remove_file(&path).await.unwrap();

        assert!(matches!(
            result,
            Err(PersistError::VersionMismatch { expected: 1, found: 2 })
        ));
    }
}
