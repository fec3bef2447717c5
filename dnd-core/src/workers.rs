//! The game's workers and the intents they answer.
//!
//! Each worker holds only its own collaborator (the rules engine, the
//! policy engine, a content agent) and reaches everything else through the
//! bus. Handlers decode the payload, call their collaborator, and encode
//! the reply; failures become faults classified by [`HandlerError`].

use crate::character::CheckKind;
use crate::chronicle::{Chronicle, EventId};
use crate::combat::{CombatAction, CombatantSpec};
use crate::content::{validate_choice_set, Choice, ChoiceSet, ContentAgent, ContentRequest};
use crate::decisions::DecisionLogger;
use crate::engine::{RuleResolutionEngine, SkillCheckOutcome};
use crate::policy::{PolicyEngine, SituationalContext};
use crate::rules::{RulesError, SkillCheckRequest, StateChange};
use agent_bus::prelude::*;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RULES: &str = "rules";
pub const POLICY: &str = "policy";
pub const SCENARIO: &str = "scenario";
pub const NPC: &str = "npc";
pub const LORE: &str = "lore";
pub const INTERPRETER: &str = "interpreter";

/// Recent chronicle events sent along with each content request
const CONTEXT_EVENTS: usize = 8;
/// Events a content worker keeps before trimming the oldest
const CHRONICLE_RETAIN: u64 = 128;
/// Saga step replies the rules worker remembers
const SETTLED_STEPS_RETAIN: usize = 256;

/// Intents routed on the game bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameIntent {
    SkillCheck,
    ResolveCheck,
    ApplyConsequence,
    RollInitiative,
    CombatAction,
    NextTurn,
    EndCombat,
    PassiveScore,
    PolicyQuery,
    PresentChoice,
    Narrate,
    LoreLookup,
    InterpretChoice,
}

impl fmt::Display for GameIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameIntent::SkillCheck => "skill_check",
            GameIntent::ResolveCheck => "resolve_check",
            GameIntent::ApplyConsequence => "apply_consequence",
            GameIntent::RollInitiative => "roll_initiative",
            GameIntent::CombatAction => "combat_action",
            GameIntent::NextTurn => "next_turn",
            GameIntent::EndCombat => "end_combat",
            GameIntent::PassiveScore => "passive_score",
            GameIntent::PolicyQuery => "policy_query",
            GameIntent::PresentChoice => "present_choice",
            GameIntent::Narrate => "narrate",
            GameIntent::LoreLookup => "lore_lookup",
            GameIntent::InterpretChoice => "interpret_choice",
        };
        f.write_str(name)
    }
}

fn to_json<T: Serialize>(value: &T) -> HandlerResult<Value> {
    serde_json::to_value(value).map_err(|e| HandlerError::failed(format!("unencodable reply: {e}")))
}

/// Decode one field of a saga context
fn context_field<T: DeserializeOwned>(context: &Map<String, Value>, key: &str) -> HandlerResult<T> {
    let value = context
        .get(key)
        .cloned()
        .ok_or_else(|| HandlerError::InvalidPayload(format!("missing '{key}' in saga context")))?;
    serde_json::from_value(value).map_err(|e| HandlerError::InvalidPayload(format!("'{key}': {e}")))
}

/// Illegal moves are rejections; bad input is an invalid payload.
fn rules_fault(err: RulesError) -> HandlerError {
    if err.is_invariant_violation() {
        HandlerError::rejected(err.to_string())
    } else if matches!(err, RulesError::StatePoisoned) {
        HandlerError::failed(err.to_string())
    } else {
        HandlerError::InvalidPayload(err.to_string())
    }
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Deserialize)]
struct PassiveQuery {
    actor_id: String,
    check: CheckKind,
    #[serde(default)]
    bonus: i32,
}

/// Replies to saga steps already carried out, keyed by saga and step index.
///
/// A step that timed out is sent again while the first attempt may still be
/// queued behind it. The worker takes one message at a time, so the repeat
/// finds the first reply here and nothing is rolled or applied twice.
#[derive(Debug, Default)]
struct SettledSteps {
    replies: HashMap<(SagaId, usize), Value>,
    order: VecDeque<(SagaId, usize)>,
}

impl SettledSteps {
    fn get(&self, key: &(SagaId, usize)) -> Option<Value> {
        self.replies.get(key).cloned()
    }

    fn insert(&mut self, key: (SagaId, usize), reply: Value) {
        if self.replies.insert(key, reply).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > SETTLED_STEPS_RETAIN {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
    }
}

/// Front door to the rule resolution engine
pub struct RulesHandler {
    engine: Arc<RuleResolutionEngine>,
    settled: Mutex<SettledSteps>,
}

impl RulesHandler {
    pub fn new(engine: Arc<RuleResolutionEngine>) -> Self {
        Self {
            engine,
            settled: Mutex::new(SettledSteps::default()),
        }
    }

    /// Run a saga step once; repeats of the same step get the first reply
    fn settle_step<F>(&self, message: &Message<GameIntent>, run: F) -> HandlerResult<Value>
    where
        F: FnOnce(&StepRequest) -> HandlerResult<Value>,
    {
        let step: StepRequest = message.decode()?;
        let key = (step.saga_id, step.step_index);
        if let Some(reply) = self.settled.lock().ok().and_then(|s| s.get(&key)) {
            tracing::debug!(
                saga_id = %step.saga_id,
                step = %step.step_type,
                "Saga step already settled, repeating its reply"
            );
            return Ok(reply);
        }
        let reply = run(&step)?;
        if let Ok(mut settled) = self.settled.lock() {
            settled.insert(key, reply.clone());
        }
        Ok(reply)
    }

    fn resolve_step(&self, correlation_id: CorrelationId, step: &StepRequest) -> HandlerResult<Value> {
        let request: SkillCheckRequest = context_field(&step.context, "check_request")?;
        let outcome = self
            .engine
            .resolve_skill_check(correlation_id, &request)
            .map_err(rules_fault)?;
        Ok(json!({ "check": to_json(&outcome)? }))
    }

    fn consequence_step(&self, step: &StepRequest) -> HandlerResult<Value> {
        let outcome: SkillCheckOutcome = context_field(&step.context, "check")?;
        let choice: Option<Choice> = step
            .context
            .get("selected_choice")
            .and_then(|c| serde_json::from_value(c.clone()).ok());

        let subject = choice.as_ref().map(|c| c.id.as_str()).unwrap_or("check");
        let flag = format!("{}.{}", step.saga_type, subject);
        let applied = self
            .engine
            .apply_changes(
                &outcome.actor_id,
                &[StateChange::SetFlag {
                    flag: flag.clone(),
                    value: Value::Bool(outcome.success),
                }],
            )
            .map_err(rules_fault)?;

        let label = choice.as_ref().map(|c| c.label.as_str()).unwrap_or("The attempt");
        let summary = match (outcome.auto_success, outcome.success) {
            (true, _) => format!("{label}: succeeds without a roll"),
            (false, true) => format!(
                "{label}: success ({} vs DC {})",
                outcome.total.unwrap_or_default(),
                outcome.dc.unwrap_or_default()
            ),
            (false, false) => format!(
                "{label}: failure ({} vs DC {})",
                outcome.total.unwrap_or_default(),
                outcome.dc.unwrap_or_default()
            ),
        };
        Ok(json!({
            "consequence": {
                "flag": flag,
                "success": outcome.success,
                "summary": summary,
                "applied": to_json(&applied)?,
            }
        }))
    }

    fn initiative_step(&self, correlation_id: CorrelationId, step: &StepRequest) -> HandlerResult<Value> {
        let participants: Vec<CombatantSpec> = context_field(&step.context, "participants")?;
        let start = self
            .engine
            .start_combat(correlation_id, participants)
            .map_err(rules_fault)?;
        Ok(json!({ "combat": to_json(&start)? }))
    }
}

#[async_trait]
impl Handler<GameIntent> for RulesHandler {
    async fn handle(&self, message: &Message<GameIntent>, _ctx: &WorkerContext<GameIntent>) -> HandlerResult<Value> {
        let correlation_id = message.correlation_id;
        match message.intent {
            GameIntent::SkillCheck => {
                let request: SkillCheckRequest = message.decode()?;
                let outcome = self
                    .engine
                    .resolve_skill_check(correlation_id, &request)
                    .map_err(rules_fault)?;
                to_json(&outcome)
            }
            GameIntent::ResolveCheck => {
                self.settle_step(message, |step| self.resolve_step(correlation_id, step))
            }
            GameIntent::ApplyConsequence => self.settle_step(message, |step| self.consequence_step(step)),
            GameIntent::RollInitiative => {
                self.settle_step(message, |step| self.initiative_step(correlation_id, step))
            }
            GameIntent::CombatAction => {
                let action: CombatAction = message.decode()?;
                let report = self
                    .engine
                    .process_action(correlation_id, action)
                    .map_err(rules_fault)?;
                to_json(&report)
            }
            GameIntent::NextTurn => to_json(&self.engine.next_turn().map_err(rules_fault)?),
            GameIntent::EndCombat => {
                let end = self.engine.end_combat().map_err(rules_fault)?;
                let encounter = self.engine.encounter().map_err(rules_fault)?;
                Ok(json!({ "end": to_json(&end)?, "encounter": to_json(&encounter)? }))
            }
            GameIntent::PassiveScore => {
                let query: PassiveQuery = message.decode()?;
                let score = self
                    .engine
                    .passive_score(&query.actor_id, query.check, query.bonus)
                    .map_err(rules_fault)?;
                to_json(&score)
            }
            other => Err(HandlerError::rejected(format!("rules worker does not handle {other}"))),
        }
    }
}

pub fn rules_worker(engine: Arc<RuleResolutionEngine>) -> Worker<GameIntent> {
    let handler: Arc<dyn Handler<GameIntent>> = Arc::new(RulesHandler::new(engine));
    [
        GameIntent::SkillCheck,
        GameIntent::ResolveCheck,
        GameIntent::ApplyConsequence,
        GameIntent::RollInitiative,
        GameIntent::CombatAction,
        GameIntent::NextTurn,
        GameIntent::EndCombat,
        GameIntent::PassiveScore,
    ]
    .into_iter()
    .fold(Worker::new(RULES), |worker, intent| worker.on_arc(intent, handler.clone()))
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct PolicyQuery {
    #[serde(default)]
    situation: SituationalContext,
    #[serde(default)]
    base_dc: Option<i32>,
}

/// Answers house-rule questions without touching game state
pub fn policy_worker(policy: PolicyEngine) -> Worker<GameIntent> {
    let policy = Arc::new(policy);
    Worker::new(POLICY).on(
        GameIntent::PolicyQuery,
        handler_fn(move |message: Message<GameIntent>, _ctx: WorkerContext<GameIntent>| {
            let policy = policy.clone();
            async move {
                let query: PolicyQuery = message.decode()?;
                let advantage = policy.compute_advantage_state(&query.situation);
                let difficulty = query
                    .base_dc
                    .map(|dc| policy.difficulty_breakdown(dc, &query.situation));
                Ok(json!({
                    "profile": policy.profile().name,
                    "advantage": to_json(&advantage)?,
                    "difficulty": to_json(&difficulty)?,
                    "critical_range": policy.critical_range(),
                }))
            }
        }),
    )
}

// ============================================================================
// Interpreter
// ============================================================================

/// Pick the option a selection refers to: a 1-based number, an id, or a
/// label. Anything else falls back to the first option; `None` only when
/// there are no options at all.
fn select_choice<'a>(choice_set: &'a ChoiceSet, selection: Option<&Value>) -> Option<(&'a Choice, bool)> {
    let found = match selection {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| choice_set.choices.get(i)),
        Some(Value::String(s)) => {
            let wanted = s.trim().to_lowercase();
            choice_set
                .choices
                .iter()
                .find(|c| c.id.to_lowercase() == wanted || c.label.to_lowercase() == wanted)
                .or_else(|| {
                    choice_set
                        .choices
                        .iter()
                        .find(|c| !wanted.is_empty() && c.label.to_lowercase().contains(&wanted))
                })
        }
        _ => None,
    };
    match found {
        Some(choice) => Some((choice, false)),
        None => choice_set.choices.first().map(|first| (first, true)),
    }
}

/// Deterministic mapping from the player's pick to a check request
pub fn interpreter_worker() -> Worker<GameIntent> {
    Worker::new(INTERPRETER).on(
        GameIntent::InterpretChoice,
        handler_fn(|message: Message<GameIntent>, _ctx: WorkerContext<GameIntent>| async move {
            let step: StepRequest = message.decode()?;
            let choice_set: ChoiceSet = context_field(&step.context, "choice_set")?;
            let actor_id: String = context_field(&step.context, "actor_id")?;
            let mut situation: SituationalContext = step
                .context
                .get("situation")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
                .unwrap_or_default();
            if let Some(level) = step
                .context
                .get("party_level")
                .and_then(Value::as_u64)
                .and_then(|l| u8::try_from(l).ok())
            {
                situation = situation.with_party_level(level);
            }

            let (choice, defaulted) = select_choice(&choice_set, step.context.get("selection"))
                .ok_or_else(|| HandlerError::InvalidPayload("no choices to pick from".to_string()))?;
            let mut request = SkillCheckRequest::new(actor_id, choice.check)
                .with_difficulty(choice.difficulty)
                .with_situation(situation);
            request.on_success = choice.on_success.clone();
            request.on_failure = choice.on_failure.clone();
            request.description = Some(choice.label.clone());

            Ok(json!({
                "selected_choice": to_json(choice)?,
                "selection_defaulted": defaulted,
                "check_request": to_json(&request)?,
            }))
        }),
    )
}

// ============================================================================
// Content adapters
// ============================================================================

/// Which creative collaborator a content worker fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRole {
    Scenario,
    Npc,
    Lore,
}

impl ContentRole {
    pub fn worker_name(&self) -> &'static str {
        match self {
            ContentRole::Scenario => SCENARIO,
            ContentRole::Npc => NPC,
            ContentRole::Lore => LORE,
        }
    }
}

/// Payload of every content intent: a saga step request, or `{context}`
/// for one-shot commands
#[derive(Debug, Default, Deserialize)]
struct ContentInput {
    #[serde(default)]
    saga_type: Option<String>,
    #[serde(default)]
    step_type: Option<String>,
    #[serde(default)]
    context: Map<String, Value>,
}

pub struct ContentHandler {
    role: ContentRole,
    agent: Arc<dyn ContentAgent>,
    chronicle: Mutex<Chronicle>,
    decisions: Arc<DecisionLogger>,
    call_timeout: Duration,
}

impl ContentHandler {
    fn query(&self, intent: GameIntent, input: &ContentInput) -> String {
        let topic = ["prompt", "query", "scene", "topic"]
            .iter()
            .find_map(|key| input.context.get(*key).and_then(Value::as_str))
            .unwrap_or("the current scene");
        match intent {
            GameIntent::PresentChoice => format!(
                "Offer the player choices as JSON \
                 {{prompt, choices: [{{id, label, check, difficulty}}]}} for {}: {topic}",
                input.saga_type.as_deref().unwrap_or("a scene")
            ),
            GameIntent::LoreLookup => format!("Rules reference: {topic}"),
            _ => format!("Narrate {}: {topic}", input.step_type.as_deref().unwrap_or("the moment")),
        }
    }

    fn remember(&self, summary: &str, subject: Option<&str>) {
        let Ok(mut chronicle) = self.chronicle.lock() else {
            return;
        };
        let previous = chronicle.recent(1).first().map(|e| e.id);
        let subjects = subject.map(|s| vec![s.to_string()]).unwrap_or_default();
        let references: Vec<EventId> = previous.into_iter().collect();
        let summary: String = summary.chars().take(160).collect();
        match chronicle.record(summary, subjects, references) {
            Ok(EventId(id)) if id >= CHRONICLE_RETAIN => {
                chronicle.trim_before(EventId(id + 1 - CHRONICLE_RETAIN));
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "Chronicle rejected event"),
        }
    }
}

#[async_trait]
impl Handler<GameIntent> for ContentHandler {
    async fn handle(&self, message: &Message<GameIntent>, ctx: &WorkerContext<GameIntent>) -> HandlerResult<Value> {
        let input: ContentInput = message.decode()?;
        let recent = match self.chronicle.lock() {
            Ok(chronicle) => chronicle.context(CONTEXT_EVENTS),
            Err(_) => Value::Array(Vec::new()),
        };
        let request = ContentRequest {
            query: self.query(message.intent, &input),
            context_snapshot: json!({
                "step": input.step_type,
                "context": input.context,
                "recent_events": recent,
            }),
            max_results: match message.intent {
                GameIntent::LoreLookup => Some(3),
                _ => None,
            },
        };

        let reply = match tokio::time::timeout(self.call_timeout, self.agent.generate(request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(HandlerError::failed(err.to_string())),
            Err(_) => {
                return Err(HandlerError::failed(format!(
                    "content agent did not answer within {:?}",
                    self.call_timeout
                )))
            }
        };
        let text = reply.usable_text().map_err(|e| HandlerError::failed(e.to_string()))?;
        let subject = input.context.get("actor_id").and_then(Value::as_str);

        match message.intent {
            GameIntent::PresentChoice => {
                let validated = validate_choice_set(text).map_err(|e| HandlerError::rejected(e.to_string()))?;
                if validated.repaired() {
                    let step = input.step_type.as_deref().unwrap_or("present_choice");
                    self.decisions.log_fallback(
                        message.correlation_id,
                        step,
                        format!("repaired {}", validated.repairs.join(", ")),
                        true,
                    );
                    tracing::warn!(worker = ctx.name(), step, "Content repaired with defaults");
                }
                self.remember(&validated.choice_set.prompt, subject);
                Ok(json!({ "choice_set": to_json(&validated.choice_set)? }))
            }
            GameIntent::LoreLookup => Ok(json!({ "text": text, "sources": reply.sources })),
            GameIntent::Narrate => {
                self.remember(text, subject);
                Ok(json!({ "narration": text }))
            }
            other => Err(HandlerError::rejected(format!("{} does not handle {other}", ctx.name()))),
        }
    }
}

/// Worker fronting one external content agent
pub fn content_worker(
    role: ContentRole,
    agent: Arc<dyn ContentAgent>,
    decisions: Arc<DecisionLogger>,
    call_timeout: Duration,
) -> Worker<GameIntent> {
    let handler: Arc<dyn Handler<GameIntent>> = Arc::new(ContentHandler {
        role,
        agent,
        chronicle: Mutex::new(Chronicle::new()),
        decisions,
        call_timeout,
    });
    let intents: &[GameIntent] = match role {
        ContentRole::Lore => &[GameIntent::LoreLookup],
        ContentRole::Scenario | ContentRole::Npc => &[GameIntent::PresentChoice, GameIntent::Narrate],
    };
    intents
        .iter()
        .fold(Worker::new(role.worker_name()), |worker, intent| {
            worker.on_arc(*intent, handler.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::Skill;
    use crate::content::fallback_choices;

    #[test]
    fn test_select_choice() {
        let set = fallback_choices("skill_challenge");
        let pick = |selection: Value| select_choice(&set, Some(&selection)).map(|(c, _)| c.id.clone());
        assert_eq!(pick(json!(2)).as_deref(), Some("search"));
        assert_eq!(pick(json!("SNEAK")).as_deref(), Some("sneak"));
        assert_eq!(pick(json!("another way")).as_deref(), Some("search"));

        let (choice, defaulted) = select_choice(&set, Some(&json!(9))).unwrap();
        assert_eq!(choice.id, "force");
        assert!(defaulted);
        assert!(select_choice(&set, None).unwrap().1);
        assert_eq!(set.choices[2].check, CheckKind::Skill(Skill::Stealth));
    }

    #[test]
    fn test_empty_choice_set_selects_nothing() {
        let empty = ChoiceSet {
            prompt: "Nothing to do.".to_string(),
            choices: Vec::new(),
        };
        assert!(select_choice(&empty, Some(&json!(1))).is_none());
        assert!(select_choice(&empty, None).is_none());
    }

    #[test]
    fn test_rules_fault_classification() {
        let rejected = rules_fault(RulesError::TargetDown("gob".into()));
        assert_eq!(rejected.fault_kind(), FaultKind::Rejected);
        let invalid = rules_fault(RulesError::UnknownActor("ghost".into()));
        assert_eq!(invalid.fault_kind(), FaultKind::InvalidPayload);
        assert_eq!(rules_fault(RulesError::StatePoisoned).fault_kind(), FaultKind::Failed);
    }

    #[test]
    fn test_worker_intent_registration() {
        let lore = content_worker(
            ContentRole::Lore,
            Arc::new(crate::testing::ScriptedContent::new(vec![])),
            Arc::new(DecisionLogger::new()),
            Duration::from_secs(1),
        );
        assert_eq!(lore.name(), LORE);
        assert!(lore.handles(GameIntent::LoreLookup));
        assert!(!lore.handles(GameIntent::PresentChoice));
        assert!(interpreter_worker().handles(GameIntent::InterpretChoice));
    }
}
