//! Testing utilities for the game engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedContent`, `FailingContent` and `SilentContent` stand in for
//!   external content agents
//! - `SharedDice` lets a test queue rolls after the engine owns the dice
//! - `TestHarness` builds a running `Conductor` with scripted dice

use crate::character::{
    Ability, AbilityScores, CharacterSnapshot, InMemoryCharacterStore, ProficiencyLevel, Skill,
};
use crate::command::{CommandEnvelope, CommandIntent, CommandResult};
use crate::conductor::{Conductor, ConductorBuilder, StartupError};
use crate::config::EngineConfig;
use crate::content::{ContentAgent, ContentError, ContentReply, ContentRequest};
use crate::dice::{DieSource, ScriptedDice};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A content agent that returns scripted replies in order.
///
/// Once the script runs out every call fails as unavailable.
#[derive(Debug, Default)]
pub struct ScriptedContent {
    replies: Mutex<VecDeque<Result<ContentReply, ContentError>>>,
    /// Every request received, in order.
    requests: Mutex<Vec<ContentRequest>>,
}

impl ScriptedContent {
    /// Create an agent with successful replies queued.
    pub fn new(replies: Vec<ContentReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create an agent that answers each call with the given text.
    pub fn texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(ContentReply::text).collect())
    }

    /// Queue another reply or error.
    pub fn push(&self, reply: Result<ContentReply, ContentError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ContentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ContentAgent for ScriptedContent {
    async fn generate(&self, request: ContentRequest) -> Result<ContentReply, ContentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| Err(ContentError::Unavailable("script exhausted".to_string())))
    }
}

/// A content agent that always answers `success: false`.
#[derive(Debug, Default)]
pub struct FailingContent {
    calls: AtomicUsize,
}

impl FailingContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the agent was asked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentAgent for FailingContent {
    async fn generate(&self, _request: ContentRequest) -> Result<ContentReply, ContentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ContentReply::failure("generation quota exhausted"))
    }
}

/// A content agent that never answers, for exercising timeouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentContent;

#[async_trait]
impl ContentAgent for SilentContent {
    async fn generate(&self, _request: ContentRequest) -> Result<ContentReply, ContentError> {
        std::future::pending().await
    }
}

/// Scripted dice shared between a test and the engine that rolls them.
#[derive(Debug, Clone)]
pub struct SharedDice(Arc<Mutex<ScriptedDice>>);

impl SharedDice {
    pub fn new(rolls: impl IntoIterator<Item = u32>) -> Self {
        Self(Arc::new(Mutex::new(ScriptedDice::new(rolls))))
    }

    /// Queue more results.
    pub fn push(&self, rolls: impl IntoIterator<Item = u32>) {
        if let Ok(mut dice) = self.0.lock() {
            dice.push(rolls);
        }
    }

    /// Results not yet consumed.
    pub fn remaining(&self) -> usize {
        self.0.lock().map(|d| d.remaining()).unwrap_or(0)
    }
}

impl DieSource for SharedDice {
    fn roll_die(&mut self, sides: u32) -> u32 {
        match self.0.lock() {
            Ok(mut dice) => dice.roll_die(sides),
            Err(poisoned) => poisoned.into_inner().roll_die(sides),
        }
    }
}

/// Level 5 rogue used by most tests: DEX 16, WIS 14, stealth expertise,
/// perception proficiency.
pub fn sample_rogue(id: &str) -> CharacterSnapshot {
    CharacterSnapshot::new(id, "Vex", 5)
        .with_scores(AbilityScores::new(10, 16, 12, 10, 14, 12))
        .with_skill(Skill::Stealth, ProficiencyLevel::Expertise)
        .with_skill(Skill::Perception, ProficiencyLevel::Proficient)
        .with_skill(Skill::Persuasion, ProficiencyLevel::Proficient)
        .with_save(Ability::Dexterity)
}

/// Configuration with short budgets so failure paths finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_default_timeout(Duration::from_secs(2))
        .with_step_timeout(Duration::from_millis(200))
        .with_step_retries(1, 1)
        .with_drain_timeout(Duration::from_millis(200))
}

/// A running conductor with scripted dice and an in-memory party.
pub struct TestHarness {
    pub conductor: Conductor,
    pub dice: SharedDice,
    pub characters: Arc<InMemoryCharacterStore>,
}

impl TestHarness {
    /// Harness with `pc-1` (see [`sample_rogue`]) and offline content.
    pub fn new(rolls: impl IntoIterator<Item = u32>) -> Result<Self, StartupError> {
        Self::with(rolls, |builder| builder)
    }

    /// Harness whose conductor builder is adjusted by `customize`.
    ///
    /// Dice, characters and [`fast_config`] are set first, so `customize`
    /// can override any of them.
    pub fn with(
        rolls: impl IntoIterator<Item = u32>,
        customize: impl FnOnce(ConductorBuilder) -> ConductorBuilder,
    ) -> Result<Self, StartupError> {
        let dice = SharedDice::new(rolls);
        let characters = Arc::new(InMemoryCharacterStore::new().with(sample_rogue("pc-1")));
        let builder = Conductor::builder()
            .with_config(fast_config())
            .with_dice(Box::new(dice.clone()))
            .with_characters(characters.clone());
        let conductor = customize(builder).build()?;
        Ok(Self {
            conductor,
            dice,
            characters,
        })
    }

    /// Send a command as `actor_id`.
    pub async fn send(&self, intent: CommandIntent, actor_id: &str, body: Value) -> CommandResult {
        self.conductor
            .handle_command(CommandEnvelope::new(intent, actor_id, body))
            .await
    }

    /// Queue more dice results.
    pub fn push_rolls(&self, rolls: impl IntoIterator<Item = u32>) {
        self.dice.push(rolls);
    }
}
