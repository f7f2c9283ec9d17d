//! Configuration types.
//!
//! `ScoringConfig` holds the tunables the pipeline reads on every job
//! (threshold, smoothing factor, throttle window, feature flags).
//! `SharedConfig` is the handle passed into the components; updates are
//! validated as a whole and swapped in atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::pipeline::types::{EntityType, MAX_SCORE, MIN_SCORE};

pub const DEFAULT_ALERT_THRESHOLD: f64 = 2.5;
pub const DEFAULT_EMA_ALPHA: f64 = 0.1;
pub const DEFAULT_ALERT_THROTTLE_MINUTES: u32 = 60;

/// Per-entity-type ingestion switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeMap<EntityType, bool>);

impl FeatureFlags {
    /// Whether feedback for `entity_type` is accepted. Unlisted types are off.
    pub fn is_enabled(&self, entity_type: EntityType) -> bool {
        self.0.get(&entity_type).copied().unwrap_or(false)
    }

    pub fn set(&mut self, entity_type: EntityType, enabled: bool) {
        self.0.insert(entity_type, enabled);
    }

    /// Parse `"DRIVER=true,MARSHAL=false"`. Listed keys override the defaults.
    pub fn parse_overrides(&mut self, raw: &str) -> Result<(), ConfigError> {
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ConfigError::ParseError(format!("feature flag '{pair}' is not KEY=BOOL"))
            })?;
            let entity_type: EntityType =
                key.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SENTIMENT_FEATURE_FLAGS".into(),
                    message: format!("unknown entity type '{}'", key.trim()),
                })?;
            let enabled: bool = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SENTIMENT_FEATURE_FLAGS".into(),
                message: format!("'{}' is not a boolean", value.trim()),
            })?;
            self.set(entity_type, enabled);
        }
        Ok(())
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self(BTreeMap::from([
            (EntityType::Driver, true),
            (EntityType::Trip, true),
            (EntityType::App, true),
            (EntityType::Marshal, false),
        ]))
    }
}

/// Tunables read by the aggregator, throttler and ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Averages strictly below this fire an alert.
    pub alert_threshold: f64,
    /// EMA smoothing factor, `0 < alpha <= 1`.
    pub ema_alpha: f64,
    /// Minimum gap between two alerts for the same entity.
    pub alert_throttle_minutes: u32,
    pub feature_flags: FeatureFlags,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            ema_alpha: DEFAULT_EMA_ALPHA,
            alert_throttle_minutes: DEFAULT_ALERT_THROTTLE_MINUTES,
            feature_flags: FeatureFlags::default(),
        }
    }
}

impl ScoringConfig {
    /// Load from `SENTIMENT_*` environment variables, defaulting unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SENTIMENT_ALERT_THRESHOLD") {
            config.alert_threshold = parse_value("SENTIMENT_ALERT_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("SENTIMENT_EMA_ALPHA") {
            config.ema_alpha = parse_value("SENTIMENT_EMA_ALPHA", &raw)?;
        }
        if let Some(raw) = lookup("SENTIMENT_ALERT_THROTTLE_MINUTES") {
            config.alert_throttle_minutes = parse_value("SENTIMENT_ALERT_THROTTLE_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("SENTIMENT_FEATURE_FLAGS") {
            config.feature_flags.parse_overrides(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "ema_alpha".into(),
                message: format!("must satisfy 0 < alpha <= 1, got {}", self.ema_alpha),
            });
        }
        if !(MIN_SCORE..=MAX_SCORE).contains(&self.alert_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "alert_threshold".into(),
                message: format!(
                    "must lie within [{MIN_SCORE}, {MAX_SCORE}], got {}",
                    self.alert_threshold
                ),
            });
        }
        Ok(())
    }

    pub fn throttle_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.alert_throttle_minutes))
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{raw}'"),
    })
}

/// Partial configuration change. Absent fields keep their current value;
/// feature flags are merged per entity type.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigUpdate {
    pub alert_threshold: Option<f64>,
    pub ema_alpha: Option<f64>,
    pub alert_throttle_minutes: Option<u32>,
    pub feature_flags: Option<BTreeMap<EntityType, bool>>,
}

/// Cloneable handle to the live scoring configuration.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ScoringConfig>>,
}

impl SharedConfig {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// The configuration in effect right now.
    pub fn snapshot(&self) -> ScoringConfig {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply a partial update. Invalid updates leave the configuration untouched.
    pub fn apply(&self, update: ConfigUpdate) -> Result<ScoringConfig, ConfigError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();

        if let Some(threshold) = update.alert_threshold {
            next.alert_threshold = threshold;
        }
        if let Some(alpha) = update.ema_alpha {
            next.ema_alpha = alpha;
        }
        if let Some(minutes) = update.alert_throttle_minutes {
            next.alert_throttle_minutes = minutes;
        }
        if let Some(flags) = update.feature_flags {
            for (entity_type, enabled) in flags {
                next.feature_flags.set(entity_type, enabled);
            }
        }

        next.validate()?;
        *guard = next.clone();
        info!(
            alert_threshold = next.alert_threshold,
            ema_alpha = next.ema_alpha,
            alert_throttle_minutes = next.alert_throttle_minutes,
            "Scoring configuration updated"
        );
        Ok(next)
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// How long `stop` waits for the in-flight job before aborting the worker.
    pub shutdown_grace: Duration,
    /// How long a job waits for an entity lock before giving up.
    pub lock_timeout: Duration,
    /// When set, logs are also written to a daily file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/sentiment-engine.db"),
            shutdown_grace: Duration::from_secs(10),
            lock_timeout: Duration::from_millis(5000),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup("SENTIMENT_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("SENTIMENT_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace =
                Duration::from_secs(parse_value("SENTIMENT_SHUTDOWN_GRACE_SECS", &raw)?);
        }
        if let Some(raw) = lookup("SENTIMENT_LOCK_TIMEOUT_MS") {
            config.lock_timeout =
                Duration::from_millis(parse_value("SENTIMENT_LOCK_TIMEOUT_MS", &raw)?);
        }
        config.log_dir = lookup("SENTIMENT_LOG_DIR").map(PathBuf::from);
        Ok(config)
    }
}
