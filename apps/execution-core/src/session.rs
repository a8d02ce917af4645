//! Exchange session clock.
//!
//! Answers "is the market open right now" for the reconciliation engine's
//! adaptive interval. Session times are exchange-local over a fixed UTC
//! offset; weekends are closed. Exchange holidays are out of scope and
//! treated as ordinary weekdays.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};

use crate::config::{ConfigError, SessionConfig};

/// Exchange open/close window over a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct MarketSession {
    open: NaiveTime,
    close: NaiveTime,
    offset: FixedOffset,
}

impl MarketSession {
    /// Build a session clock from validated configuration.
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        let open = parse_session_time(&config.open)?;
        let close = parse_session_time(&config.close)?;
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "session.utc_offset_minutes out of range: {}",
                config.utc_offset_minutes
            ))
        })?;

        if open >= close {
            return Err(ConfigError::ValidationError(format!(
                "session open {open} must precede close {close}"
            )));
        }

        Ok(Self {
            open,
            close,
            offset,
        })
    }

    /// Whether the exchange is open at `now`.
    ///
    /// Open on weekdays within `[open, close)` exchange-local time.
    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        let weekday = local.weekday();
        if weekday == chrono::Weekday::Sat || weekday == chrono::Weekday::Sun {
            return false;
        }

        let t = local.time();
        t >= self.open && t < self.close
    }
}

fn parse_session_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
        ConfigError::ValidationError(format!("invalid session time '{value}': {e}"))
    })
}
