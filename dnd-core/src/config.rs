//! Engine configuration.
//!
//! Defaults, then an optional JSON file, then `DND_*` environment
//! variables. The binary loads `.env` before reading the environment.

use crate::command::CommandIntent;
use crate::policy::{DifficultyLimits, PolicyEngine, PolicyProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown policy profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durations are written as (fractional) seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }

    pub mod map {
        use serde::ser::SerializeMap;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::collections::BTreeMap;
        use std::time::Duration;

        pub fn serialize<K, S>(value: &BTreeMap<K, Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            K: serde::Serialize,
            S: Serializer,
        {
            let mut map = serializer.serialize_map(Some(value.len()))?;
            for (key, duration) in value {
                map.serialize_entry(key, &duration.as_secs_f64())?;
            }
            map.end()
        }

        pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, Duration>, D::Error>
        where
            K: Deserialize<'de> + Ord,
            D: Deserializer<'de>,
        {
            let raw = BTreeMap::<K, f64>::deserialize(deserializer)?;
            raw.into_iter()
                .map(|(key, secs)| {
                    Duration::try_from_secs_f64(secs)
                        .map(|d| (key, d))
                        .map_err(serde::de::Error::custom)
                })
                .collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Route-and-wait budget for one-shot commands
    #[serde(with = "secs")]
    pub default_timeout: Duration,
    /// Per-intent overrides of `default_timeout`
    #[serde(with = "secs::map")]
    pub intent_timeouts: BTreeMap<CommandIntent, Duration>,
    pub history_capacity: usize,
    #[serde(with = "secs")]
    pub drain_timeout: Duration,
    pub policy_profile: String,
    pub min_dc: i32,
    pub max_dc: i32,
    pub low_level_threshold: u8,
    pub high_level_threshold: u8,
    /// Retry budget for rules saga steps
    pub step_max_retries: u32,
    /// Retry budget for content saga steps before falling back
    pub content_max_retries: u32,
    #[serde(with = "secs")]
    pub step_timeout: Duration,
    /// Seed for reproducible dice; entropy when unset
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = DifficultyLimits::default();
        Self {
            default_timeout: Duration::from_secs(30),
            intent_timeouts: BTreeMap::new(),
            history_capacity: 256,
            drain_timeout: Duration::from_secs(5),
            policy_profile: "raw".to_string(),
            min_dc: limits.min_dc,
            max_dc: limits.max_dc,
            low_level_threshold: limits.low_level_threshold,
            high_level_threshold: limits.high_level_threshold,
            step_max_retries: 3,
            content_max_retries: 1,
            step_timeout: Duration::from_secs(30),
            rng_seed: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.policy_profile = profile.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_intent_timeout(mut self, intent: CommandIntent, timeout: Duration) -> Self {
        self.intent_timeouts.insert(intent, timeout);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_step_retries(mut self, rules: u32, content: u32) -> Self {
        self.step_max_retries = rules;
        self.content_max_retries = content;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Defaults overridden by `DND_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Override fields from `DND_*` environment variables
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(profile) = parse_env::<String>("DND_POLICY_PROFILE")? {
            self.policy_profile = profile;
        }
        if let Some(secs) = parse_env::<u64>("DND_COMMAND_TIMEOUT_SECS")? {
            self.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("DND_DRAIN_TIMEOUT_SECS")? {
            self.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_env::<usize>("DND_HISTORY_CAPACITY")? {
            self.history_capacity = capacity;
        }
        if let Some(seed) = parse_env::<u64>("DND_RNG_SEED")? {
            self.rng_seed = Some(seed);
        }
        self.validate()?;
        Ok(self)
    }

    /// Read a JSON config file; missing fields keep their defaults
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.profile()?;
        if self.min_dc > self.max_dc {
            return Err(ConfigError::Invalid(format!(
                "min_dc {} is above max_dc {}",
                self.min_dc, self.max_dc
            )));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn profile(&self) -> Result<PolicyProfile, ConfigError> {
        PolicyProfile::named(&self.policy_profile)
            .ok_or_else(|| ConfigError::UnknownProfile(self.policy_profile.clone()))
    }

    pub fn limits(&self) -> DifficultyLimits {
        DifficultyLimits {
            min_dc: self.min_dc,
            max_dc: self.max_dc,
            low_level_threshold: self.low_level_threshold,
            high_level_threshold: self.high_level_threshold,
        }
    }

    pub fn policy_engine(&self) -> Result<PolicyEngine, ConfigError> {
        Ok(PolicyEngine::new(self.profile()?, self.limits()))
    }

    pub fn timeout_for(&self, intent: CommandIntent) -> Duration {
        self.intent_timeouts
            .get(&intent)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}
