//! Environment-backed cache configuration.

use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::{DEFAULT_PROXIMITY_MS, DedupFilter};

const DEFAULT_PAGE_SIZE: usize = 10;
const DEFAULT_EVENT_BUFFER: usize = 256;

const PAGE_SIZE_KEY: &str = "CHAT_CACHE_PAGE_SIZE";
const DEDUP_PROXIMITY_KEY: &str = "CHAT_CACHE_DEDUP_PROXIMITY_MS";
const EVENT_BUFFER_KEY: &str = "CHAT_CACHE_EVENT_BUFFER";

/// Session tuning for the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Messages requested per backward page.
    pub page_size: usize,
    /// Timestamp tolerance when matching an optimistic message to its authoritative copy.
    pub dedup_proximity_ms: u64,
    /// Capacity of the `SyncEvent` broadcast buffer.
    pub event_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            dedup_proximity_ms: DEFAULT_PROXIMITY_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl CacheConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through `lookup`; unset keys fall back to defaults.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let page_size = parse_positive(PAGE_SIZE_KEY, DEFAULT_PAGE_SIZE as u64, &mut lookup)?;
        let dedup_proximity_ms =
            parse_positive(DEDUP_PROXIMITY_KEY, DEFAULT_PROXIMITY_MS, &mut lookup)?;
        let event_buffer =
            parse_positive(EVENT_BUFFER_KEY, DEFAULT_EVENT_BUFFER as u64, &mut lookup)?;

        Ok(Self {
            page_size: to_usize(PAGE_SIZE_KEY, page_size)?,
            dedup_proximity_ms,
            event_buffer: to_usize(EVENT_BUFFER_KEY, event_buffer)?,
        })
    }

    /// Identity filter built from `dedup_proximity_ms`.
    pub fn dedup_filter(&self) -> DedupFilter {
        DedupFilter::new(self.dedup_proximity_ms)
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_positive<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(default);
    }
    let parsed = value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: err.to_string(),
        })?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(parsed)
}

fn to_usize(key: &'static str, value: u64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<CacheConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        CacheConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg, CacheConfig::default());
        assert_eq!(cfg.page_size, 10);
        assert_eq!(cfg.dedup_proximity_ms, 30_000);
        assert_eq!(cfg.dedup_filter().proximity_ms(), 30_000);
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("CHAT_CACHE_PAGE_SIZE", "25"),
            ("CHAT_CACHE_DEDUP_PROXIMITY_MS", " 5000 "),
            ("CHAT_CACHE_EVENT_BUFFER", "8"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.page_size, 25);
        assert_eq!(cfg.dedup_proximity_ms, 5_000);
        assert_eq!(cfg.event_buffer, 8);
    }

    #[test]
    fn rejects_zero_page_size() {
        let err = config_from_pairs(&[("CHAT_CACHE_PAGE_SIZE", "0")])
            .expect_err("zero page size should be rejected");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_CACHE_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
        );
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = config_from_pairs(&[("CHAT_CACHE_EVENT_BUFFER", "lots")])
            .expect_err("invalid buffer should be rejected");
        assert!(err.to_string().starts_with("invalid CHAT_CACHE_EVENT_BUFFER='lots'"));
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let cfg: CacheConfig =
            serde_json::from_str(r#"{"page_size": 3}"#).expect("partial config should parse");
        assert_eq!(cfg.page_size, 3);
        assert_eq!(cfg.event_buffer, DEFAULT_EVENT_BUFFER);
    }
}
