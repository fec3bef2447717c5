//! Creative content at the message boundary.
//!
//! Scenario, NPC and lore text comes from external agents the engine never
//! looks inside. Replies are checked for a usable payload; structured
//! choice sets get one repair pass, and anything still unusable is replaced
//! by a canned deterministic reply.

use crate::character::{Ability, CheckKind, Skill};
use crate::rules::{Difficulty, StateChange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use thiserror::Error;

/// Notice attached to results built from fallback content
pub const DEGRADED_NOTICE: &str = "creative generation unavailable, using fallback";

/// Reply used when lore lookup fails
pub const RULES_REFERENCE_UNAVAILABLE: &str = "rules reference unavailable";

/// Most choices offered at once
pub const MAX_CHOICES: usize = 6;

const DEFAULT_PROMPT: &str = "What do you do?";

/// Payload sent to a content agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub query: String,
    #[serde(default)]
    pub context_snapshot: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

/// What a content agent sends back
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Text of a successful, non-empty reply
    pub fn usable_text(&self) -> Result<&str, ContentError> {
        if !self.success {
            return Err(ContentError::Unsuccessful(
                self.error.clone().unwrap_or_else(|| "no error given".to_string()),
            ));
        }
        match self.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(ContentError::Empty),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ContentError {
    #[error("Content agent unavailable: {0}")]
    Unavailable(String),

    #[error("Content agent reported failure: {0}")]
    Unsuccessful(String),

    #[error("Content agent returned no usable text")]
    Empty,

    #[error("Content failed validation: {0}")]
    Invalid(String),
}

/// External producer of creative text
#[async_trait]
pub trait ContentAgent: Send + Sync {
    async fn generate(&self, request: ContentRequest) -> Result<ContentReply, ContentError>;
}

/// Stand-in when no collaborator is configured; every step falls back.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineContent;

#[async_trait]
impl ContentAgent for OfflineContent {
    async fn generate(&self, _request: ContentRequest) -> Result<ContentReply, ContentError> {
        Err(ContentError::Unavailable("no content agent configured".to_string()))
    }
}

/// One option presented to the player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
    pub check: CheckKind,
    pub difficulty: Difficulty,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<StateChange>,
}

impl Choice {
    fn canned(id: &str, label: &str, check: CheckKind) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            check,
            difficulty: Difficulty::Medium,
            on_success: Vec::new(),
            on_failure: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceSet {
    pub prompt: String,
    pub choices: Vec<Choice>,
}

impl ChoiceSet {
    fn check(&self) -> Result<(), ContentError> {
        if self.choices.is_empty() {
            return Err(ContentError::Invalid("no choices offered".to_string()));
        }
        if self.choices.len() > MAX_CHOICES {
            return Err(ContentError::Invalid(format!(
                "{} choices offered, at most {MAX_CHOICES} allowed",
                self.choices.len()
            )));
        }
        let mut ids = HashSet::new();
        for choice in &self.choices {
            if choice.id.trim().is_empty() || choice.label.trim().is_empty() {
                return Err(ContentError::Invalid("choice without id or label".to_string()));
            }
            if !ids.insert(choice.id.as_str()) {
                return Err(ContentError::Invalid(format!("duplicate choice id {}", choice.id)));
            }
        }
        Ok(())
    }
}

/// A choice set that passed validation, possibly after repair
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChoices {
    pub choice_set: ChoiceSet,
    /// What the repair pass filled in; empty when the reply was valid as sent
    pub repairs: Vec<String>,
}

impl ValidatedChoices {
    pub fn repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}

/// Validate a choice set, with one default-filling repair pass
pub fn validate_choice_set(text: &str) -> Result<ValidatedChoices, ContentError> {
    if let Ok(choice_set) = serde_json::from_str::<ChoiceSet>(text) {
        if choice_set.check().is_ok() {
            return Ok(ValidatedChoices {
                choice_set,
                repairs: Vec::new(),
            });
        }
    }

    let (choice_set, repairs) = repair_choice_set(text)?;
    choice_set.check()?;
    tracing::debug!(?repairs, "Repaired content choice set");
    Ok(ValidatedChoices { choice_set, repairs })
}

fn extract_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn parse_check(value: Option<&Value>) -> Option<CheckKind> {
    let value = value?;
    if let Ok(check) = serde_json::from_value::<CheckKind>(value.clone()) {
        return Some(check);
    }
    let name = value.as_str()?;
    if let Ok(skill) = name.parse::<Skill>() {
        return Some(CheckKind::Skill(skill));
    }
    serde_json::from_value::<Ability>(Value::String(name.trim().to_ascii_lowercase()))
        .ok()
        .map(CheckKind::Ability)
}

fn repair_choice_set(text: &str) -> Result<(ChoiceSet, Vec<String>), ContentError> {
    let object = extract_object(text).ok_or_else(|| ContentError::Invalid("reply is not a JSON object".to_string()))?;
    let mut repairs = Vec::new();

    let prompt = match object.get("prompt").and_then(Value::as_str) {
        Some(prompt) if !prompt.trim().is_empty() => prompt.to_string(),
        _ => {
            repairs.push("prompt".to_string());
            DEFAULT_PROMPT.to_string()
        }
    };

    let raw_choices = object
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| ContentError::Invalid("no choices array".to_string()))?;

    let mut seen = HashSet::new();
    let mut choices = Vec::new();
    for (index, raw) in raw_choices.iter().enumerate() {
        let raw = match raw {
            Value::Object(map) => map.clone(),
            Value::String(label) => {
                let mut map = Map::new();
                map.insert("label".to_string(), Value::String(label.clone()));
                map
            }
            _ => continue,
        };
        let Some(label) = raw
            .get("label")
            .and_then(Value::as_str)
            .filter(|l| !l.trim().is_empty())
        else {
            repairs.push(format!("choices[{index}] dropped: no label"));
            continue;
        };

        let mut id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        if id.trim().is_empty() || seen.contains(&id) {
            id = format!("choice_{}", index + 1);
            repairs.push(format!("choices[{index}].id"));
        }
        seen.insert(id.clone());

        let check = parse_check(raw.get("check").or_else(|| raw.get("skill"))).unwrap_or_else(|| {
            repairs.push(format!("choices[{index}].check"));
            CheckKind::Ability(Ability::Wisdom)
        });
        let difficulty = raw
            .get("difficulty")
            .and_then(|d| serde_json::from_value::<Difficulty>(d.clone()).ok())
            .unwrap_or_else(|| {
                repairs.push(format!("choices[{index}].difficulty"));
                Difficulty::Medium
            });
        let changes = |key: &str| {
            raw.get(key)
                .and_then(|v| serde_json::from_value::<Vec<StateChange>>(v.clone()).ok())
                .unwrap_or_default()
        };

        choices.push(Choice {
            id,
            label: label.to_string(),
            check,
            difficulty,
            on_success: changes("on_success"),
            on_failure: changes("on_failure"),
        });
    }

    if choices.len() > MAX_CHOICES {
        repairs.push(format!("truncated to {MAX_CHOICES} choices"));
        choices.truncate(MAX_CHOICES);
    }
    Ok((ChoiceSet { prompt, choices }, repairs))
}

/// Canned choices for when generation fails
pub fn fallback_choices(saga_type: &str) -> ChoiceSet {
    let choices = if saga_type == "social_encounter" {
        vec![
            Choice::canned("persuade", "Make a reasoned appeal", CheckKind::Skill(Skill::Persuasion)),
            Choice::canned("read", "Study their intentions", CheckKind::Skill(Skill::Insight)),
            Choice::canned("press", "Press them with threats", CheckKind::Skill(Skill::Intimidation)),
        ]
    } else {
        vec![
            Choice::canned("force", "Force your way through", CheckKind::Skill(Skill::Athletics)),
            Choice::canned("search", "Search for another way", CheckKind::Skill(Skill::Investigation)),
            Choice::canned("sneak", "Slip past unnoticed", CheckKind::Skill(Skill::Stealth)),
        ]
    };
    ChoiceSet {
        prompt: DEFAULT_PROMPT.to_string(),
        choices,
    }
}

/// Canned narration for a step
pub fn fallback_narration(step_type: &str) -> String {
    match step_type {
        "describe_opening" => "Steel is drawn and the fight begins.".to_string(),
        _ => "The moment passes.".to_string(),
    }
}

/// Substitute step result for a failed content step
pub fn fallback_step_result(saga_type: &str, step_type: &str) -> Value {
    match step_type {
        "present_choice" => json!({
            "choice_set": fallback_choices(saga_type),
            "narration": DEGRADED_NOTICE,
        }),
        "lore" => json!({ "text": RULES_REFERENCE_UNAVAILABLE, "sources": [] }),
        _ => json!({ "narration": fallback_narration(step_type) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_choice_set_passes_untouched() {
        let text = serde_json::to_string(&fallback_choices("skill_challenge")).unwrap();
        let validated = validate_choice_set(&text).unwrap();
        assert!(!validated.repaired());
        assert_eq!(validated.choice_set.choices.len(), 3);
    }

    #[test]
    fn test_repair_fills_defaults() {
        let text = r#"Here you go:
        {"choices": [
            {"label": "Climb the wall", "skill": "athletics"},
            {"id": "talk", "label": "Bluff the guard", "check": "Deception", "difficulty": "hard"},
            {"id": "talk", "label": "Wait for nightfall"},
            {"note": "no label"}
        ]}"#;
        let validated = validate_choice_set(text).unwrap();
        assert!(validated.repaired());
        let set = validated.choice_set;
        assert_eq!(set.prompt, DEFAULT_PROMPT);
        assert_eq!(set.choices.len(), 3);
        assert_eq!(set.choices[0].id, "choice_1");
        assert_eq!(set.choices[0].check, CheckKind::Skill(Skill::Athletics));
        assert_eq!(set.choices[0].difficulty, Difficulty::Medium);
        assert_eq!(set.choices[1].check, CheckKind::Skill(Skill::Deception));
        assert_eq!(set.choices[1].difficulty, Difficulty::Hard);
        assert_eq!(set.choices[2].id, "choice_3");
        assert_eq!(set.choices[2].check, CheckKind::Ability(Ability::Wisdom));
    }

    #[test]
    fn test_unrepairable_reply_is_invalid() {
        assert!(matches!(validate_choice_set("The door creaks."), Err(ContentError::Invalid(_))));
        assert!(matches!(
            validate_choice_set(r#"{"choices": []}"#),
            Err(ContentError::Invalid(_))
        ));
    }

    #[test]
    fn test_usable_text() {
        assert_eq!(ContentReply::text(" lore ").usable_text().unwrap(), "lore");
        assert!(matches!(ContentReply::text("  ").usable_text(), Err(ContentError::Empty)));
        assert!(matches!(
            ContentReply::failure("quota").usable_text(),
            Err(ContentError::Unsuccessful(_))
        ));
    }

    #[test]
    fn test_fallbacks_are_deterministic() {
        assert_eq!(fallback_choices("social_encounter"), fallback_choices("social_encounter"));
        let value = fallback_step_result("skill_challenge", "present_choice");
        let set: ChoiceSet = serde_json::from_value(value["choice_set"].clone()).unwrap();
        assert_eq!(set.choices[0].id, "force");
    }
}
