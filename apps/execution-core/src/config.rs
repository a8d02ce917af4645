//! Configuration for the execution core.
//!
//! Loads a YAML file, applies per-field defaults, interpolates `${ENV_VAR}`
//! references in path-like fields, and validates the result before any
//! component is constructed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use execution_core::config::load_config;
//!
//! // Load from default path (config.yaml)
//! let config = load_config(None)?;
//!
//! // Load from custom path
//! let config = load_config(Some("custom/config.yaml"))?;
//! ```

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("config validation failed: {0}")]
    ValidationError(String),

    /// Missing required environment variable.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Capital and position sizing.
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Trade intent gate behavior.
    #[serde(default)]
    pub intents: IntentsConfig,
    /// Reconciliation loop scheduling.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Exchange session window.
    #[serde(default)]
    pub session: SessionConfig,
    /// Venue interaction limits.
    #[serde(default)]
    pub venue: VenueConfig,
    /// Position store location.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Capital allocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Deployable base capital.
    #[serde(default = "default_base_capital")]
    pub base_capital: Decimal,
    /// Leverage multiplier; buying power = base_capital * leverage.
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// Notional ceiling committed to any single trade. Sizing uses the
    /// lesser of this and the remaining buying power.
    #[serde(default = "default_per_trade_allocation")]
    pub per_trade_allocation: Decimal,
    /// Distance of the protective stop from entry, percent of entry price.
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: Decimal,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            base_capital: default_base_capital(),
            leverage: default_leverage(),
            per_trade_allocation: default_per_trade_allocation(),
            risk_per_trade_pct: default_risk_per_trade_pct(),
        }
    }
}

fn default_base_capital() -> Decimal {
    Decimal::new(100_000, 0)
}
fn default_leverage() -> Decimal {
    Decimal::new(5, 0)
}
fn default_per_trade_allocation() -> Decimal {
    Decimal::new(200_000, 0)
}
fn default_risk_per_trade_pct() -> Decimal {
    // 0.50%
    Decimal::new(50, 2)
}

/// Trade intent gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentsConfig {
    /// Minutes a pending intent may wait before timing out.
    #[serde(default = "default_intent_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Price poll cadence for pending intents, seconds.
    #[serde(default = "default_intent_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Park triggered intents for operator approval instead of entering.
    #[serde(default)]
    pub manual_confirmation: bool,
    /// Maximum intents accepted per trading day.
    #[serde(default = "default_max_intents_per_day")]
    pub max_per_day: u32,
    /// Minutes before the same instrument may submit another intent.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    /// Consecutive losing trades before the gate pauses for the day.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
}

impl Default for IntentsConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_intent_timeout_minutes(),
            poll_interval_secs: default_intent_poll_interval_secs(),
            manual_confirmation: false,
            max_per_day: default_max_intents_per_day(),
            cooldown_minutes: default_cooldown_minutes(),
            max_consecutive_losses: default_max_consecutive_losses(),
        }
    }
}

const fn default_intent_timeout_minutes() -> u64 {
    15
}
const fn default_intent_poll_interval_secs() -> u64 {
    2
}
const fn default_max_intents_per_day() -> u32 {
    5
}
const fn default_cooldown_minutes() -> i64 {
    45
}
const fn default_max_consecutive_losses() -> u32 {
    3
}

impl IntentsConfig {
    /// Intent timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Cycle interval during market hours, seconds.
    #[serde(default = "default_market_hours_interval_secs")]
    pub market_hours_interval_secs: u64,
    /// Cycle interval off-hours while positions are open, seconds.
    #[serde(default = "default_off_hours_interval_secs")]
    pub off_hours_interval_secs: u64,
    /// Cycle interval off-hours while flat, seconds.
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,
    /// Consecutive store refresh failures before a high-priority alert.
    #[serde(default = "default_max_refresh_failures")]
    pub max_refresh_failures: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            market_hours_interval_secs: default_market_hours_interval_secs(),
            off_hours_interval_secs: default_off_hours_interval_secs(),
            idle_interval_secs: default_idle_interval_secs(),
            max_refresh_failures: default_max_refresh_failures(),
        }
    }
}

const fn default_market_hours_interval_secs() -> u64 {
    6
}
const fn default_off_hours_interval_secs() -> u64 {
    30
}
const fn default_idle_interval_secs() -> u64 {
    300
}
const fn default_max_refresh_failures() -> u32 {
    3
}

/// Exchange session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session open, exchange-local `HH:MM`.
    #[serde(default = "default_session_open")]
    pub open: String,
    /// Session close, exchange-local `HH:MM`.
    #[serde(default = "default_session_close")]
    pub close: String,
    /// Exchange UTC offset in minutes (IST = 330).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: default_session_open(),
            close: default_session_close(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

fn default_session_open() -> String {
    "09:15".to_string()
}
fn default_session_close() -> String {
    "15:30".to_string()
}
const fn default_utc_offset_minutes() -> i32 {
    330
}

/// Venue interaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Seconds to wait for an order fill before treating it as failed.
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,
    /// Bounded retry attempts for protective stop placement.
    #[serde(default = "default_stop_retry_attempts")]
    pub stop_retry_attempts: u32,
    /// Minimum price increment for stop rounding.
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            fill_timeout_secs: default_fill_timeout_secs(),
            stop_retry_attempts: default_stop_retry_attempts(),
            tick_size: default_tick_size(),
        }
    }
}

const fn default_fill_timeout_secs() -> u64 {
    10
}
const fn default_stop_retry_attempts() -> u32 {
    3
}
fn default_tick_size() -> Decimal {
    Decimal::new(5, 2)
}

impl VenueConfig {
    /// Fill wait deadline as a duration.
    #[must_use]
    pub const fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_secs)
    }
}

/// Position store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `${ENV_VAR}` references are interpolated;
    /// `:memory:` opens an in-memory store.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "positions.db".to_string()
}

impl Config {
    /// Validate cross-field constraints after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capital.base_capital <= Decimal::ZERO {
            return Err(ConfigError::ValidationError(
                "capital.base_capital must be positive".to_string(),
            ));
        }
        if self.capital.leverage < Decimal::ONE {
            return Err(ConfigError::ValidationError(
                "capital.leverage must be >= 1".to_string(),
            ));
        }
        if self.capital.per_trade_allocation <= Decimal::ZERO {
            return Err(ConfigError::ValidationError(
                "capital.per_trade_allocation must be positive".to_string(),
            ));
        }
        if self.capital.risk_per_trade_pct <= Decimal::ZERO
            || self.capital.risk_per_trade_pct >= Decimal::new(100, 0)
        {
            return Err(ConfigError::ValidationError(
                "capital.risk_per_trade_pct must be in (0, 100)".to_string(),
            ));
        }
        if self.venue.tick_size <= Decimal::ZERO {
            return Err(ConfigError::ValidationError(
                "venue.tick_size must be positive".to_string(),
            ));
        }
        if self.venue.stop_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "venue.stop_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.intents.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "intents.poll_interval_secs must be positive".to_string(),
            ));
        }
        let intervals = [
            self.reconciliation.market_hours_interval_secs,
            self.reconciliation.off_hours_interval_secs,
            self.reconciliation.idle_interval_secs,
        ];
        if intervals.iter().any(|&v| v == 0) {
            return Err(ConfigError::ValidationError(
                "reconciliation intervals must be positive".to_string(),
            ));
        }
        if self.store.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and validate configuration.
///
/// When `path` is `None`, reads `config.yaml` from the working directory.
/// Missing file falls back to defaults.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let mut config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml_bw::from_str(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path, "config file not found, using defaults");
            Config::default()
        }
        Err(source) => {
            return Err(ConfigError::ReadError {
                path: path.to_string(),
                source,
            });
        }
    };

    config.store.path = interpolate_env(&config.store.path)?;
    config.validate()?;
    Ok(config)
}

/// Replace `${VAR}` references with environment variable values.
fn interpolate_env(value: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference, keep literal text
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let resolved =
            std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        out.push_str(&resolved);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
