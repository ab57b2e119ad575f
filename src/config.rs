/*!
 * Declarative policy configuration for Bulwark
 *
 * A TOML file names policies and lists their layers outermost first:
 *
 * ```toml
 * [logging]
 * level = "debug"
 *
 * [[policies.catalog.layers]]
 * type = "retry"
 * max_retries = 3
 * backoff = { kind = "exponential", base_ms = 200, factor = 2.0 }
 *
 * [[policies.catalog.layers]]
 * type = "circuit_breaker"
 * failure_threshold = 5
 * break_ms = 30000
 * ```
 *
 * Fallback and cache layers need code (a producer, a provider) and are
 * composed around registry entries in code instead.
 */

use bulwark_core_policy::{
    Backoff, BulkheadPolicy, CircuitBreaker, CircuitBreakerConfig, ConfigError, Jitter, Policy,
    PolicyRegistry, PolicyWrap, RetryPolicy, TimeoutPolicy, TimeoutStrategy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{BulwarkError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named policies, each becoming one registry entry
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout); file output is JSON
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One named policy: its layers, outermost first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
}

/// A single policy layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    /// Retry handled faults
    Retry {
        max_retries: u32,
        #[serde(default)]
        backoff: Backoff,
        /// Random extra delay in `[0, jitter_ms)`
        #[serde(default)]
        jitter_ms: u64,
    },

    /// Break after consecutive failures
    CircuitBreaker {
        failure_threshold: u32,
        #[serde(default = "default_break_ms")]
        break_ms: u64,
    },

    /// Break on failure ratio over a sampling window
    AdvancedCircuitBreaker {
        failure_rate: f64,
        sampling_ms: u64,
        minimum_throughput: u32,
        #[serde(default = "default_break_ms")]
        break_ms: u64,
    },

    /// Bound execution time
    Timeout {
        timeout_ms: u64,
        #[serde(default)]
        strategy: TimeoutStrategy,
    },

    /// Bound concurrency
    Bulkhead {
        max_concurrency: usize,
        #[serde(default)]
        max_queue: usize,
    },
}

// Default value functions for serde
fn default_break_ms() -> u64 {
    30_000
}

impl LayerConfig {
    /// Short layer name used in generated policy keys
    pub fn kind(&self) -> &'static str {
        match self {
            LayerConfig::Retry { .. } => "retry",
            LayerConfig::CircuitBreaker { .. } => "circuit_breaker",
            LayerConfig::AdvancedCircuitBreaker { .. } => "advanced_circuit_breaker",
            LayerConfig::Timeout { .. } => "timeout",
            LayerConfig::Bulkhead { .. } => "bulkhead",
        }
    }

    /// Build the layer as a policy for result type `T` and error type `E`
    pub fn build<T, E>(
        &self,
        key: &str,
    ) -> std::result::Result<Arc<dyn Policy<T, E>>, ConfigError>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let policy: Arc<dyn Policy<T, E>> = match *self {
            LayerConfig::Retry {
                max_retries,
                backoff,
                jitter_ms,
            } => {
                backoff.validate()?;
                Arc::new(
                    RetryPolicy::<T, E>::builder()
                        .policy_key(key)
                        .max_retries(max_retries)
                        .backoff_with_jitter(backoff, Jitter { max_ms: jitter_ms })
                        .build(),
                )
            }
            LayerConfig::CircuitBreaker {
                failure_threshold,
                break_ms,
            } => Arc::new(
                CircuitBreaker::<T, E>::builder()
                    .policy_key(key)
                    .config(CircuitBreakerConfig::consecutive(
                        failure_threshold,
                        Duration::from_millis(break_ms),
                    ))
                    .build()?,
            ),
            LayerConfig::AdvancedCircuitBreaker {
                failure_rate,
                sampling_ms,
                minimum_throughput,
                break_ms,
            } => Arc::new(
                CircuitBreaker::<T, E>::builder()
                    .policy_key(key)
                    .config(CircuitBreakerConfig::failure_rate(
                        failure_rate,
                        Duration::from_millis(sampling_ms),
                        minimum_throughput,
                        Duration::from_millis(break_ms),
                    ))
                    .build()?,
            ),
            LayerConfig::Timeout {
                timeout_ms,
                strategy,
            } => Arc::new(
                TimeoutPolicy::builder(Duration::from_millis(timeout_ms))
                    .policy_key(key)
                    .strategy(strategy)
                    .build()?,
            ),
            LayerConfig::Bulkhead {
                max_concurrency,
                max_queue,
            } => Arc::new(
                BulkheadPolicy::builder(max_concurrency, max_queue)
                    .policy_key(key)
                    .build()?,
            ),
        };
        Ok(policy)
    }
}

impl PolicyConfig {
    /// Build this policy: a single layer directly, several as a wrap keyed `name`
    pub fn build<T, E>(&self, name: &str) -> Result<Arc<dyn Policy<T, E>>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let invalid = |source| BulwarkError::Policy {
            policy: name.to_string(),
            source,
        };

        match self.layers.as_slice() {
            [] => Err(BulwarkError::Config(format!(
                "policy '{}' has no layers",
                name
            ))),
            [only] => only.build(name).map_err(invalid),
            layers => {
                let mut builder = PolicyWrap::builder().policy_key(name);
                for layer in layers {
                    let key = format!("{}.{}", name, layer.kind());
                    builder = builder.wrap_shared(layer.build(&key).map_err(invalid)?);
                }
                Ok(Arc::new(builder.build().map_err(invalid)?))
            }
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BulwarkError::Config(e.to_string()))
    }

    /// Check every policy builds, without keeping the result
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.policies {
            policy.build::<(), ()>(name)?;
        }
        Ok(())
    }

    /// Build a registry holding every configured policy under its name.
    ///
    /// Each call builds fresh policies, so breakers and bulkheads in two
    /// registries never share state.
    pub fn build_registry<T, E>(&self) -> Result<PolicyRegistry>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut registry = PolicyRegistry::new();
        for (name, policy) in &self.policies {
            registry.add_shared(name.clone(), policy.build::<T, E>(name)?)?;
            debug!(policy = %name, layers = policy.layers.len(), "registered policy");
        }
        Ok(registry)
    }
}
