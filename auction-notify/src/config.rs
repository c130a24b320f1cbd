//! Application configuration loaded from the environment.
//!
//! | Env Var                           | Default                             |
//! |-----------------------------------|-------------------------------------|
//! | `DATABASE_URL`                    | `sqlite:auction-notify.db?mode=rwc` |
//! | `DATABASE_POOL_SIZE`              | `min(2 × cores, 10)`                |
//! | `LOG_DIR`                         | `logs`                              |
//! | `TELEGRAM_BOT_TOKEN`              | empty (Telegram disabled)           |
//! | `TELEGRAM_BOT_NAME`               | `AuctionAlertBot`                   |
//! | `TELEGRAM_API_BASE`               | `https://api.telegram.org`          |
//! | `NOTIFY_MAX_ATTEMPTS`             | `3`                                 |
//! | `NOTIFY_INITIAL_RETRY_DELAY_MS`   | `1000`                              |
//! | `NOTIFY_MAX_RETRY_DELAY_MS`       | `30000`                             |
//! | `NOTIFY_HTTP_TIMEOUT_SECS`        | `10`                                |
//! | `CIRCUIT_BREAKER_THRESHOLD`       | `5`                                 |
//! | `CIRCUIT_BREAKER_COOLDOWN_SECS`   | `120`                               |
//! | `PIPELINE_MAX_CONCURRENT_EVENTS`  | `8`                                 |
//! | `PIPELINE_MAX_CONCURRENT_RULES`   | `16`                                |
//! | `PIPELINE_MAX_CONCURRENT_SENDS`   | `4`                                 |
//! | `PIPELINE_EVENT_TIMEOUT_SECS`     | `60`                                |
//! | `PIPELINE_MAX_EVENT_ATTEMPTS`     | `3`                                 |
//! | `KEYWORD_FIELD`                   | `either`                            |
//! | `LINK_TOKEN_TTL_SECS`             | `900`                               |
//! | `STATS_TIMEZONE`                  | `Asia/Seoul`                        |
//! | `DELIVERY_FAILURE_RETENTION_DAYS` | `30`                                |

use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::database::default_pool_size;
use crate::domain::KeywordField;
use crate::notification::channels::{DiscordConfig, TelegramConfig};
use crate::notification::{NotifierConfig, RetryPolicy};
use crate::scheduler::{IngestConfig, PipelineConfig};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:auction-notify.db?mode=rwc";
pub const DEFAULT_STATS_TIMEZONE: &str = "Asia/Seoul";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub database_pool_size: u32,
    pub log_dir: String,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    pub notifier: NotifierConfig,
    /// Timeout for one transport HTTP request, in seconds. 0 disables it.
    pub http_timeout_secs: u64,
    pub pipeline: PipelineConfig,
    pub ingest: IngestConfig,
    pub keyword_field: KeywordField,
    pub link_token_ttl_secs: u64,
    /// IANA zone name; weekly stats start on Monday 00:00 here.
    pub stats_timezone: String,
    pub delivery_failure_retention_days: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_pool_size: default_pool_size(),
            log_dir: "logs".to_string(),
            telegram: TelegramConfig::default(),
            discord: DiscordConfig::default(),
            notifier: NotifierConfig::default(),
            http_timeout_secs: 10,
            pipeline: PipelineConfig::default(),
            ingest: IngestConfig::default(),
            keyword_field: KeywordField::default(),
            link_token_ttl_secs: 900,
            stats_timezone: DEFAULT_STATS_TIMEZONE.to_string(),
            delivery_failure_retention_days: 30,
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup. Unset or blank keys
    /// keep their defaults; values that fail to parse are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        parse_into(&get, "DATABASE_POOL_SIZE", &mut config.database_pool_size)?;
        if let Some(dir) = get("LOG_DIR") {
            config.log_dir = dir;
        }

        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            config.telegram.bot_token = token;
        }
        if let Some(name) = get("TELEGRAM_BOT_NAME") {
            config.telegram.bot_name = name.trim_start_matches('@').to_string();
        }
        if let Some(base) = get("TELEGRAM_API_BASE") {
            config.telegram.api_base = base.trim_end_matches('/').to_string();
        }

        let retry = &mut config.notifier.retry;
        parse_into(&get, "NOTIFY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        parse_into(&get, "NOTIFY_INITIAL_RETRY_DELAY_MS", &mut retry.initial_delay_ms)?;
        parse_into(&get, "NOTIFY_MAX_RETRY_DELAY_MS", &mut retry.max_delay_ms)?;
        parse_into(&get, "NOTIFY_HTTP_TIMEOUT_SECS", &mut config.http_timeout_secs)?;
        parse_into(
            &get,
            "CIRCUIT_BREAKER_THRESHOLD",
            &mut config.notifier.circuit_breaker_threshold,
        )?;
        parse_into(
            &get,
            "CIRCUIT_BREAKER_COOLDOWN_SECS",
            &mut config.notifier.circuit_breaker_cooldown_secs,
        )?;

        parse_into(
            &get,
            "PIPELINE_MAX_CONCURRENT_EVENTS",
            &mut config.ingest.max_concurrent_events,
        )?;
        parse_into(
            &get,
            "PIPELINE_MAX_CONCURRENT_RULES",
            &mut config.pipeline.max_concurrent_rules,
        )?;
        parse_into(
            &get,
            "PIPELINE_MAX_CONCURRENT_SENDS",
            &mut config.pipeline.max_concurrent_sends,
        )?;
        parse_into(
            &get,
            "PIPELINE_EVENT_TIMEOUT_SECS",
            &mut config.pipeline.event_timeout_secs,
        )?;
        parse_into(
            &get,
            "PIPELINE_MAX_EVENT_ATTEMPTS",
            &mut config.ingest.max_event_attempts,
        )?;

        if let Some(raw) = get("KEYWORD_FIELD") {
            config.keyword_field = KeywordField::parse(&raw).ok_or_else(|| {
                Error::config(format!(
                    "KEYWORD_FIELD: expected address, building_name or either, got '{raw}'"
                ))
            })?;
        }
        parse_into(&get, "LINK_TOKEN_TTL_SECS", &mut config.link_token_ttl_secs)?;
        if let Some(tz) = get("STATS_TIMEZONE") {
            config.stats_timezone = tz;
        }
        parse_into(
            &get,
            "DELIVERY_FAILURE_RETENTION_DAYS",
            &mut config.delivery_failure_retention_days,
        )?;

        // Event replays back off on the same schedule as deliveries.
        config.ingest.replay_backoff = RetryPolicy {
            max_attempts: config.ingest.max_event_attempts,
            ..config.notifier.retry.clone()
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.database_pool_size == 0 {
            return Err(Error::config("DATABASE_POOL_SIZE must be at least 1"));
        }
        if self.notifier.retry.max_attempts == 0 {
            return Err(Error::config("NOTIFY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.notifier.retry.initial_delay_ms > self.notifier.retry.max_delay_ms {
            return Err(Error::config(
                "NOTIFY_INITIAL_RETRY_DELAY_MS must not exceed NOTIFY_MAX_RETRY_DELAY_MS",
            ));
        }
        for (key, value) in [
            (
                "PIPELINE_MAX_CONCURRENT_EVENTS",
                self.ingest.max_concurrent_events,
            ),
            (
                "PIPELINE_MAX_CONCURRENT_RULES",
                self.pipeline.max_concurrent_rules,
            ),
            (
                "PIPELINE_MAX_CONCURRENT_SENDS",
                self.pipeline.max_concurrent_sends,
            ),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{key} must be at least 1")));
            }
        }
        if self.pipeline.event_timeout_secs == 0 {
            return Err(Error::config("PIPELINE_EVENT_TIMEOUT_SECS must be at least 1"));
        }
        if self.ingest.max_event_attempts == 0 {
            return Err(Error::config("PIPELINE_MAX_EVENT_ATTEMPTS must be at least 1"));
        }
        self.stats_tz()?;
        Ok(())
    }

    /// The parsed stats time zone.
    pub fn stats_tz(&self) -> Result<Tz> {
        Tz::from_str(&self.stats_timezone).map_err(|_| {
            Error::config(format!(
                "STATS_TIMEZONE: unknown time zone '{}'",
                self.stats_timezone
            ))
        })
    }
}

fn parse_into<T, G>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw
            .parse()
            .map_err(|e| Error::config(format!("{key}: invalid value '{raw}': {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert!(!config.telegram.is_configured());
        assert_eq!(config.notifier.retry.max_attempts, 3);
        assert_eq!(config.pipeline.max_concurrent_rules, 16);
        assert_eq!(config.ingest.max_concurrent_events, 8);
        assert_eq!(config.keyword_field, KeywordField::Either);
        assert_eq!(config.stats_tz().unwrap(), chrono_tz::Asia::Seoul);
        assert_eq!(config.delivery_failure_retention_days, 30);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_BOT_NAME", "@MyBot"),
            ("NOTIFY_MAX_ATTEMPTS", "5"),
            ("PIPELINE_MAX_EVENT_ATTEMPTS", "4"),
            ("KEYWORD_FIELD", "building_name"),
            ("STATS_TIMEZONE", "UTC"),
            ("DATABASE_POOL_SIZE", " "),
        ])
        .unwrap();

        assert!(config.telegram.is_configured());
        assert_eq!(config.telegram.bot_name, "MyBot");
        assert_eq!(config.notifier.retry.max_attempts, 5);
        assert_eq!(config.ingest.max_event_attempts, 4);
        assert_eq!(config.ingest.replay_backoff.max_attempts, 4);
        assert_eq!(config.keyword_field, KeywordField::BuildingName);
        assert_eq!(config.stats_tz().unwrap(), chrono_tz::UTC);
        assert_eq!(config.database_pool_size, default_pool_size());
    }

    #[test]
    fn test_invalid_values() {
        for vars in [
            [("NOTIFY_MAX_ATTEMPTS", "three")],
            [("NOTIFY_MAX_ATTEMPTS", "0")],
            [("KEYWORD_FIELD", "title")],
            [("STATS_TIMEZONE", "Mars/Olympus")],
            [("PIPELINE_MAX_CONCURRENT_SENDS", "-1")],
        ] {
            assert!(
                matches!(load(&vars), Err(Error::Configuration(_))),
                "{vars:?} should be rejected"
            );
        }
    }
}
