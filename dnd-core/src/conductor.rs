//! The game-level orchestrator.
//!
//! A [`Conductor`] owns one session: the rule resolution engine, the
//! decision log and an [`Orchestrator`] with the game's workers and saga
//! templates registered. Commands enter through [`Conductor::handle_command`]
//! and always leave as a [`CommandResult`]; nothing below this boundary
//! reaches the caller as an error.

use crate::character::{CharacterStore, InMemoryCharacterStore};
use crate::config::{ConfigError, EngineConfig};
use crate::content::{fallback_step_result, ContentAgent, OfflineContent, DEGRADED_NOTICE};
use crate::decisions::{DecisionLogger, DecisionRecord};
use crate::dice::{DieSource, RandomDice};
use crate::engine::RuleResolutionEngine;
use crate::command::{CommandEnvelope, CommandError, CommandIntent, CommandResult};
use crate::rules::{RulesCatalog, StandardRules};
use crate::session::{PersistError, SessionSnapshot};
use crate::workers::{
    content_worker, interpreter_worker, policy_worker, rules_worker, ContentRole, GameIntent, INTERPRETER, LORE,
    NPC, POLICY, RULES, SCENARIO,
};
use agent_bus::prelude::*;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const SKILL_CHALLENGE: &str = "skill_challenge";
pub const SOCIAL_ENCOUNTER: &str = "social_encounter";
pub const COMBAT_ENCOUNTER: &str = "combat_encounter";

/// Errors while assembling a conductor
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),
}

/// Content workers are the only steps allowed to fall back
fn is_content_worker(target: &str) -> bool {
    matches!(target, SCENARIO | NPC | LORE)
}

fn saga_templates(config: &EngineConfig) -> Vec<(&'static str, Vec<StepDef<GameIntent>>)> {
    let rules = |step: &str, intent: GameIntent| {
        StepDef::new(step, RULES, intent)
            .with_timeout(config.step_timeout)
            .with_max_retries(config.step_max_retries)
    };
    let content = |step: &str, target: &str, intent: GameIntent| {
        StepDef::new(step, target, intent)
            .with_timeout(config.step_timeout)
            .with_max_retries(config.content_max_retries)
    };
    let interpret = || {
        StepDef::new("resolve_player_input", INTERPRETER, GameIntent::InterpretChoice)
            .with_timeout(config.step_timeout)
            .with_max_retries(config.step_max_retries)
    };

    vec![
        (
            SKILL_CHALLENGE,
            vec![
                content("present_choice", SCENARIO, GameIntent::PresentChoice),
                interpret(),
                rules("resolve_check", GameIntent::ResolveCheck),
                rules("apply_consequence", GameIntent::ApplyConsequence),
            ],
        ),
        (
            SOCIAL_ENCOUNTER,
            vec![
                content("present_choice", NPC, GameIntent::PresentChoice),
                interpret(),
                rules("resolve_check", GameIntent::ResolveCheck),
                rules("apply_consequence", GameIntent::ApplyConsequence),
            ],
        ),
        (
            COMBAT_ENCOUNTER,
            vec![
                rules("roll_initiative", GameIntent::RollInitiative),
                content("describe_opening", SCENARIO, GameIntent::Narrate),
            ],
        ),
    ]
}

/// Builder for a [`Conductor`]
pub struct ConductorBuilder {
    config: EngineConfig,
    characters: Arc<dyn CharacterStore>,
    rules: Arc<dyn RulesCatalog>,
    dice: Option<Box<dyn DieSource>>,
    scenario: Arc<dyn ContentAgent>,
    npc: Arc<dyn ContentAgent>,
    lore: Arc<dyn ContentAgent>,
}

impl Default for ConductorBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            characters: Arc::new(InMemoryCharacterStore::new()),
            rules: Arc::new(StandardRules),
            dice: None,
            scenario: Arc::new(OfflineContent),
            npc: Arc::new(OfflineContent),
            lore: Arc::new(OfflineContent),
        }
    }
}

impl ConductorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_characters(mut self, characters: Arc<dyn CharacterStore>) -> Self {
        self.characters = characters;
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn RulesCatalog>) -> Self {
        self.rules = rules;
        self
    }

    /// Dice for this session; seeded from the config when unset
    pub fn with_dice(mut self, dice: Box<dyn DieSource>) -> Self {
        self.dice = Some(dice);
        self
    }

    pub fn with_scenario_agent(mut self, agent: Arc<dyn ContentAgent>) -> Self {
        self.scenario = agent;
        self
    }

    pub fn with_npc_agent(mut self, agent: Arc<dyn ContentAgent>) -> Self {
        self.npc = agent;
        self
    }

    pub fn with_lore_agent(mut self, agent: Arc<dyn ContentAgent>) -> Self {
        self.lore = agent;
        self
    }

    /// Register the workers and saga templates and start them.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Conductor, StartupError> {
        let config = self.config;
        config.validate()?;
        let policy = config.policy_engine()?;

        let dice: Box<dyn DieSource> = match (self.dice, config.rng_seed) {
            (Some(dice), _) => dice,
            (None, Some(seed)) => Box::new(RandomDice::seeded(seed)),
            (None, None) => Box::new(RandomDice::new()),
        };
        let decisions = Arc::new(DecisionLogger::new());
        let engine = Arc::new(RuleResolutionEngine::new(
            policy.clone(),
            dice,
            self.rules,
            self.characters,
            decisions.clone(),
        ));

        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default()
                .with_default_timeout(config.default_timeout)
                .with_history_capacity(config.history_capacity),
        );

        orchestrator.register_worker(rules_worker(engine.clone()))?;
        orchestrator.register_worker(policy_worker(policy))?;
        orchestrator.register_worker(interpreter_worker())?;
        for (role, agent) in [
            (ContentRole::Scenario, self.scenario),
            (ContentRole::Npc, self.npc),
            (ContentRole::Lore, self.lore),
        ] {
            orchestrator.register_worker(content_worker(role, agent, decisions.clone(), config.step_timeout))?;
        }

        for (saga_type, steps) in saga_templates(&config) {
            orchestrator.register_saga_template(saga_type, steps)?;
        }
        orchestrator.start()?;

        tracing::info!(
            profile = %engine.policy().profile().name,
            workers = orchestrator.bus().workers().len(),
            "Conductor ready"
        );
        Ok(Conductor {
            orchestrator,
            engine,
            decisions,
            config,
        })
    }
}

/// Successful dispatch before it is wrapped in a [`CommandResult`]
struct Reply {
    data: Value,
    degraded: bool,
}

impl Reply {
    fn plain(data: Value) -> Self {
        Self { data, degraded: false }
    }
}

/// One game session behind the command boundary
pub struct Conductor {
    orchestrator: Orchestrator<GameIntent>,
    engine: Arc<RuleResolutionEngine>,
    decisions: Arc<DecisionLogger>,
    config: EngineConfig,
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("engine", &self.engine)
            .field("shutting_down", &self.orchestrator.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Conductor {
    pub fn builder() -> ConductorBuilder {
        ConductorBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<RuleResolutionEngine> {
        &self.engine
    }

    pub fn decisions(&self) -> &Arc<DecisionLogger> {
        &self.decisions
    }

    pub fn orchestrator(&self) -> &Orchestrator<GameIntent> {
        &self.orchestrator
    }

    /// Ordered decision records for one command
    pub fn decision_chain(&self, correlation_id: CorrelationId) -> Vec<DecisionRecord> {
        self.decisions.get_chain(correlation_id)
    }

    /// Route one command and wait for its result.
    ///
    /// Never fails: routing errors, timeouts, rejections and aborted sagas
    /// all come back as an unsuccessful result with a structured error.
    pub async fn handle_command(&self, envelope: CommandEnvelope) -> CommandResult {
        let correlation_id = envelope.correlation_id.unwrap_or_default();

        if self.orchestrator.is_shutting_down() {
            return CommandResult::failed(correlation_id, envelope.intent, &CommandError::ShuttingDown);
        }
        let intent = match envelope.intent.parse::<CommandIntent>() {
            Ok(intent) => intent,
            Err(err) => {
                tracing::warn!(correlation_id = %correlation_id, intent = %envelope.intent, "Unknown intent rejected");
                return CommandResult::failed(correlation_id, envelope.intent, &err);
            }
        };
        tracing::debug!(correlation_id = %correlation_id, %intent, actor = %envelope.actor.id, "Command received");

        match self.dispatch(intent, &envelope, correlation_id).await {
            Ok(reply) => {
                let result = CommandResult::ok(correlation_id, intent.as_str(), reply.data);
                if reply.degraded {
                    result.with_degraded(DEGRADED_NOTICE)
                } else {
                    result
                }
            }
            Err(err) => {
                self.record_unlogged_rejection(intent, &envelope, correlation_id, &err);
                tracing::info!(correlation_id = %correlation_id, %intent, error = %err, "Command failed");
                CommandResult::failed(correlation_id, intent.as_str(), &err)
            }
        }
    }

    /// Checks and combat actions always leave at least one record
    fn record_unlogged_rejection(
        &self,
        intent: CommandIntent,
        envelope: &CommandEnvelope,
        correlation_id: CorrelationId,
        err: &CommandError,
    ) {
        if !matches!(intent, CommandIntent::SkillCheck | CommandIntent::CombatAction) {
            return;
        }
        if matches!(err, CommandError::ShuttingDown) || !self.decisions.get_chain(correlation_id).is_empty() {
            return;
        }
        let actor = (!envelope.actor.id.is_empty()).then(|| envelope.actor.id.clone());
        self.decisions
            .log_rejection(correlation_id, actor, envelope.body.clone(), err.to_string());
    }

    async fn dispatch(
        &self,
        intent: CommandIntent,
        envelope: &CommandEnvelope,
        correlation_id: CorrelationId,
    ) -> Result<Reply, CommandError> {
        let timeout = self.config.timeout_for(intent);
        match intent {
            CommandIntent::SkillCheck => {
                let body = envelope.body_with_actor("actor_id")?;
                self.ask(RULES, GameIntent::SkillCheck, Value::Object(body), correlation_id, timeout)
                    .await
                    .map(Reply::plain)
            }
            CommandIntent::CombatAction => {
                let body = envelope.body_with_actor("actor")?;
                self.ask(RULES, GameIntent::CombatAction, Value::Object(body), correlation_id, timeout)
                    .await
                    .map(Reply::plain)
            }
            CommandIntent::NextTurn => self
                .ask(RULES, GameIntent::NextTurn, Value::Null, correlation_id, timeout)
                .await
                .map(Reply::plain),
            CommandIntent::EndCombat => self
                .ask(RULES, GameIntent::EndCombat, Value::Null, correlation_id, timeout)
                .await
                .map(Reply::plain),
            CommandIntent::PassiveScore => {
                let body = envelope.body_with_actor("actor_id")?;
                self.ask(RULES, GameIntent::PassiveScore, Value::Object(body), correlation_id, timeout)
                    .await
                    .map(Reply::plain)
            }
            CommandIntent::RuleQuery => self.rule_query(envelope, correlation_id, timeout).await,
            CommandIntent::ScenarioChoice => {
                let body = envelope.body_with_actor("actor_id")?;
                let saga_type = body
                    .get("saga_type")
                    .and_then(Value::as_str)
                    .unwrap_or(SKILL_CHALLENGE)
                    .to_string();
                let payload = json!({
                    "saga_type": saga_type,
                    "step_type": "present_choice",
                    "context": body,
                });
                self.ask_content(SCENARIO, GameIntent::PresentChoice, payload, correlation_id, timeout, |step| {
                    fallback_step_result(&saga_type, step)
                })
                .await
            }
            CommandIntent::StartCombat => {
                let body = envelope.body_with_actor("actor_id")?;
                if !body.get("participants").is_some_and(Value::is_array) {
                    return Err(CommandError::InvalidCommand("START_COMBAT needs a participants list".to_string()));
                }
                self.run_saga(COMBAT_ENCOUNTER, body, correlation_id).await
            }
            CommandIntent::SkillChallenge | CommandIntent::SocialEncounter => {
                let body = envelope.body_with_actor("actor_id")?;
                let saga_type = intent.saga_type().unwrap_or(SKILL_CHALLENGE);
                self.run_saga(saga_type, body, correlation_id).await
            }
        }
    }

    async fn ask(
        &self,
        target: &str,
        intent: GameIntent,
        payload: Value,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<Value, CommandError> {
        let reply = self
            .orchestrator
            .request_with_timeout(target, intent, payload, correlation_id, timeout)
            .await?;
        Ok(reply.payload)
    }

    /// One-shot content request with the canned reply on any failure
    async fn ask_content<F>(
        &self,
        target: &str,
        intent: GameIntent,
        payload: Value,
        correlation_id: CorrelationId,
        timeout: Duration,
        fallback: F,
    ) -> Result<Reply, CommandError>
    where
        F: FnOnce(&str) -> Value,
    {
        let step = payload
            .get("step_type")
            .and_then(Value::as_str)
            .unwrap_or("lore")
            .to_string();
        match self.ask(target, intent, payload, correlation_id, timeout).await {
            Ok(data) => Ok(Reply::plain(data)),
            Err(CommandError::ShuttingDown) => Err(CommandError::ShuttingDown),
            Err(err) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    worker = target,
                    %step,
                    error = %err,
                    "Content unavailable, using fallback"
                );
                self.decisions.log_fallback(correlation_id, step.as_str(), err.to_string(), false);
                Ok(Reply {
                    data: fallback(&step),
                    degraded: true,
                })
            }
        }
    }

    async fn rule_query(
        &self,
        envelope: &CommandEnvelope,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<Reply, CommandError> {
        let body = match &envelope.body {
            Value::Object(map) => map.clone(),
            Value::String(query) => {
                let mut map = Map::new();
                map.insert("query".to_string(), Value::String(query.clone()));
                map
            }
            _ => Map::new(),
        };
        let wants_policy = body.contains_key("situation") || body.contains_key("base_dc");
        let query = body.get("query").and_then(Value::as_str).map(str::to_string);
        if !wants_policy && query.is_none() {
            return Err(CommandError::InvalidCommand(
                "RULE_QUERY needs a query, a situation or a base_dc".to_string(),
            ));
        }

        let mut data = Map::new();
        let mut degraded = false;
        if wants_policy {
            let payload = json!({
                "situation": body.get("situation").cloned().unwrap_or_else(|| json!({})),
                "base_dc": body.get("base_dc").cloned().unwrap_or(Value::Null),
            });
            let policy = self
                .ask(POLICY, GameIntent::PolicyQuery, payload, correlation_id, timeout)
                .await?;
            data.insert("policy".to_string(), policy);
        }
        if let Some(query) = query {
            let payload = json!({ "context": { "query": query } });
            let lore = self
                .ask_content(LORE, GameIntent::LoreLookup, payload, correlation_id, timeout, |_| {
                    fallback_step_result("", "lore")
                })
                .await?;
            degraded = lore.degraded;
            data.insert("lore".to_string(), lore.data);
        }
        Ok(Reply {
            data: Value::Object(data),
            degraded,
        })
    }

    /// Open a saga and drive it to the end.
    ///
    /// Failed content steps are replaced by canned results and mark the
    /// reply degraded. Failed rules steps abort the saga after their retry
    /// budget.
    async fn run_saga(
        &self,
        saga_type: &str,
        context: Map<String, Value>,
        correlation_id: CorrelationId,
    ) -> Result<Reply, CommandError> {
        let saga_id = self
            .orchestrator
            .start_saga(saga_type, Value::Object(context), correlation_id)
            .map_err(|e| CommandError::HandlerFailure(e.to_string()))?;
        tracing::info!(correlation_id = %correlation_id, saga_id = %saga_id, saga_type, "Saga started");

        let degraded = AtomicBool::new(false);
        let decisions = &self.decisions;
        let outcome = self
            .orchestrator
            .run_saga(saga_id, |step, request, err| {
                if !is_content_worker(&step.target) {
                    return None;
                }
                decisions.log_fallback(correlation_id, step.step_type.as_str(), err.to_string(), false);
                degraded.store(true, Ordering::SeqCst);
                Some(fallback_step_result(&request.saga_type, &request.step_type))
            })
            .await
            .map_err(|e| CommandError::HandlerFailure(e.to_string()))?;

        match outcome {
            SagaOutcome::Completed { saga_id, mut context, .. } => {
                tracing::info!(correlation_id = %correlation_id, saga_id = %saga_id, saga_type, "Saga completed");
                context.insert("saga_id".to_string(), json!(saga_id));
                context.insert("saga_type".to_string(), json!(saga_type));
                Ok(Reply {
                    data: Value::Object(context),
                    degraded: degraded.load(Ordering::SeqCst),
                })
            }
            SagaOutcome::Aborted(failure) => {
                let message = format!(
                    "{} stopped at {}: {}",
                    failure.saga_type,
                    failure.step_type.as_deref().unwrap_or("start"),
                    failure.reason
                );
                self.decisions.log_saga_aborted(failure);
                Err(CommandError::SagaAborted(message))
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.orchestrator.is_shutting_down()
    }

    /// Stop taking commands, let in-flight work settle, then stop workers.
    ///
    /// Sagas still open after `drain_timeout` are aborted and each leaves
    /// one `saga_aborted` record.
    pub async fn stop(&self, drain_timeout: Duration) -> ShutdownReport {
        let report = self.orchestrator.stop(drain_timeout).await;
        for failure in &report.aborted_sagas {
            self.decisions.log_saga_aborted(failure.clone());
        }
        tracing::info!(
            aborted_sagas = report.aborted_sagas.len(),
            drained = report.drained.len(),
            forced = report.forced.len(),
            "Conductor stopped"
        );
        report
    }

    /// Stop with the configured drain timeout
    pub async fn shutdown(&self) -> ShutdownReport {
        self.stop(self.config.drain_timeout).await
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, PersistError> {
        let state = self.engine.game_state().map_err(PersistError::State)?;
        Ok(SessionSnapshot::new(
            &self.engine.policy().profile().name,
            state,
            self.decisions.records(),
        ))
    }

    /// Load a snapshot taken under the same policy profile
    pub fn restore(&self, snapshot: SessionSnapshot) -> Result<(), PersistError> {
        let active = &self.engine.policy().profile().name;
        if &snapshot.policy_profile != active {
            return Err(PersistError::ProfileMismatch {
                expected: active.clone(),
                found: snapshot.policy_profile,
            });
        }
        let decisions = snapshot.decisions.clone();
        self.engine.restore(snapshot.into_game_state()).map_err(PersistError::State)?;
        self.decisions.restore(decisions);
        Ok(())
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        self.snapshot()?.save_json(path).await
    }

    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let snapshot = SessionSnapshot::load_json(path).await?;
        self.restore(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_cover_saga_intents() {
        let templates = saga_templates(&EngineConfig::default());
        let names: Vec<&str> = templates.iter().map(|(name, _)| *name).collect();
        for intent in CommandIntent::ALL {
            if let Some(saga_type) = intent.saga_type() {
                assert!(names.contains(&saga_type), "missing template {saga_type}");
            }
        }

        let (_, challenge) = &templates[0];
        let targets: Vec<&str> = challenge.iter().map(|s| s.target.as_str()).collect();
        assert_eq!(targets, vec![SCENARIO, INTERPRETER, RULES, RULES]);
        assert_eq!(challenge[0].max_retries, 1);
        assert_eq!(challenge[2].max_retries, 3);
    }

    #[test]
    fn test_only_content_falls_back() {
        assert!(is_content_worker(SCENARIO));
        assert!(is_content_worker(LORE));
        assert!(!is_content_worker(RULES));
        assert!(!is_content_worker(INTERPRETER));
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_profile() {
        let result = Conductor::builder()
            .with_config(EngineConfig::new().with_profile("grimdark"))
            .build();
        assert!(matches!(result, Err(StartupError::Config(ConfigError::UnknownProfile(_)))));
    }
}
