//! Log output for the smoke session.

use std::env;

use tracing_subscriber::EnvFilter;

/// Client and binary at debug so page merges and settles show up in the run.
const DEFAULT_FILTER: &str = "info,cache_smoke=debug,cache_client=debug,cache_core=info";

/// Variable read when `RUST_LOG` is unset or unparsable.
const CACHE_LOG_VAR: &str = "CHAT_CACHE_LOG";

/// Install the fmt subscriber. A subscriber installed earlier wins.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(session_filter())
        .try_init();
}

fn session_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| parse_directives(env::var(CACHE_LOG_VAR).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn parse_directives(raw: Option<String>) -> Option<EnvFilter> {
    let raw = raw?;
    if raw.trim().is_empty() {
        return None;
    }
    EnvFilter::try_new(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_or_invalid_directives_fall_through() {
        assert!(parse_directives(None).is_none());
        assert!(parse_directives(Some("  ".into())).is_none());
        assert!(parse_directives(Some("cache_core=loud".into())).is_none());
        assert!(parse_directives(Some("cache_core=trace".into())).is_some());
    }
}
