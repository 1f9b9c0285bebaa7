//! Logging setup using tracing
//!
//! The engine only emits `tracing` events. Hosts with their own subscriber
//! need nothing from here; everyone else can call [`init`].
//!
//! Event levels used across the crate:
//! - `debug`: per chunk, per diff, per lookup
//! - `info`: one line per merge round, eviction and table creation
//! - `warn`: retried storage work and failed chunks

use crate::{CacheError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directives used when `RUST_LOG` is unset
///
/// Quiet apart from round summaries, which agents usually want to see.
pub const DEFAULT_DIRECTIVES: &str = "warn,cachegraph::merge=info,cachegraph::eviction=info";

/// Build the filter, preferring `RUST_LOG` over `fallback`
fn filter(fallback: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => parse_directives(fallback),
    }
}

fn parse_directives(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| CacheError::Configuration(format!("Invalid log directives '{directives}': {e}")))
}

/// Install a stderr subscriber with [`DEFAULT_DIRECTIVES`]
///
/// # Example RUST_LOG values
/// - `RUST_LOG=cachegraph=debug` - per-chunk merge and eviction detail
/// - `RUST_LOG=cachegraph::retry=debug,warn` - only retry decisions
///
/// # Errors
/// Returns an error if a global subscriber is already installed
pub fn init() -> Result<()> {
    init_with(DEFAULT_DIRECTIVES)
}

/// Install a stderr subscriber, falling back to `directives` without `RUST_LOG`
///
/// Thread ids are on because storage work runs on the blocking pool, away
/// from the task that issued it.
pub fn init_with(directives: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(directives)?)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| CacheError::Other(format!("Failed to initialize tracing: {}", e)))
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init_with("cachegraph=debug");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        assert!(parse_directives(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn test_bad_directives_are_a_config_error() {
        assert!(matches!(
            parse_directives("cachegraph=loudest"),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        init_test();
        assert!(matches!(init(), Err(CacheError::Other(_))));
    }

    #[test]
    fn test_init_test_helper() {
        init_test();
        init_test();
        tracing::debug!(cache_type = "vpcs", chunk = 0, "Structured event after init");
    }
}
