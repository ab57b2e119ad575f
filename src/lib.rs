/*!
 * Bulwark - resilience policies for fallible operations
 *
 * Wraps calls to unreliable dependencies with composable policies:
 * - Retry with constant, linear or exponential backoff and jitter
 * - Circuit breakers (consecutive-failure and failure-rate)
 * - Optimistic and pessimistic timeouts
 * - Fallback values and producers
 * - Bulkhead isolation with a bounded wait queue
 * - TTL result caching with single-flight misses
 * - Policy wraps and a keyed policy registry
 *
 * The policies live in `bulwark-core-policy` and are re-exported here.
 * This crate adds TOML configuration, logging setup and a small CLI.
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod simulate;

// Re-export commonly used types
pub use bulwark_core_policy::*;
pub use config::{EngineConfig, LayerConfig, LogLevel, LoggingConfig, PolicyConfig};
pub use error::{BulwarkError, Result};
pub use simulate::{run_scenario, CallReport, Scenario};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
