//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when the
//! protected operation is unhealthy. It has three automatic states and one
//! manual state:
//! - Closed: Normal operation, outcomes update the health counters
//! - Open: Executions are rejected with [`Fault::BrokenCircuit`] until the break deadline
//! - HalfOpen: Exactly one trial execution probes whether the operation recovered
//! - Isolated: Held open by [`CircuitBreaker::isolate`] until [`CircuitBreaker::reset`]
//!
//! Two strategies decide when a closed circuit breaks:
//! - [`BreakerStrategy::ConsecutiveFailures`]: N handled outcomes in a row
//! - [`BreakerStrategy::FailureRate`]: failure ratio over a sliding time window,
//!   once a minimum number of samples has landed in the window
//!
//! Open to HalfOpen is evaluated lazily when a call arrives (or when
//! [`CircuitBreaker::state`] is read), so no background timer is needed.

use crate::context::{generated_policy_key, Context};
use crate::error::{ConfigError, Fault, FaultOrigin};
use crate::outcome::{Classifier, Outcome};
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Observable state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, executions pass through
    Closed,
    /// Circuit is open, executions fail immediately
    Open,
    /// Break duration elapsed, the next execution is a trial
    HalfOpen,
    /// Manually held open
    Isolated,
}

/// Rule deciding when a closed circuit breaks
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerStrategy {
    /// Break after `threshold` consecutive handled outcomes; any success resets the count
    ConsecutiveFailures { threshold: u32 },
    /// Break when, within `sampling_duration`, at least `minimum_throughput`
    /// outcomes were recorded and the failure ratio is `>= threshold`
    FailureRate {
        threshold: f64,
        sampling_duration: Duration,
        minimum_throughput: u32,
    },
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// When to break
    pub strategy: BreakerStrategy,
    /// How long the circuit stays open before allowing a trial
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            strategy: BreakerStrategy::ConsecutiveFailures { threshold: 5 },
            break_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Basic breaker: `threshold` consecutive failures
    pub fn consecutive(threshold: u32, break_duration: Duration) -> Self {
        Self {
            strategy: BreakerStrategy::ConsecutiveFailures { threshold },
            break_duration,
        }
    }

    /// Advanced breaker: failure ratio over a sliding window
    pub fn failure_rate(
        threshold: f64,
        sampling_duration: Duration,
        minimum_throughput: u32,
        break_duration: Duration,
    ) -> Self {
        Self {
            strategy: BreakerStrategy::FailureRate {
                threshold,
                sampling_duration,
                minimum_throughput,
            },
            break_duration,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.break_duration.is_zero() {
            return Err(ConfigError::Zero {
                field: "break_duration",
            });
        }
        match self.strategy {
            BreakerStrategy::ConsecutiveFailures { threshold } => {
                if threshold == 0 {
                    return Err(ConfigError::Zero {
                        field: "failure_threshold",
                    });
                }
            }
            BreakerStrategy::FailureRate {
                threshold,
                sampling_duration,
                minimum_throughput,
            } => {
                if !(threshold > 0.0 && threshold <= 1.0) {
                    return Err(ConfigError::FailureRate(threshold));
                }
                if sampling_duration.is_zero() {
                    return Err(ConfigError::Zero {
                        field: "sampling_duration",
                    });
                }
                if minimum_throughput == 0 {
                    return Err(ConfigError::Zero {
                        field: "minimum_throughput",
                    });
                }
            }
        }
        Ok(())
    }
}

/// Why and when the circuit last broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakRecord {
    /// Origin of the fault that broke the circuit; `None` if a handled
    /// successful value (result predicate) broke it
    pub origin: Option<FaultOrigin>,
    /// Moment the circuit opened
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
    Isolated,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    /// Consecutive handled outcomes (basic strategy)
    consecutive_failures: u32,
    /// `(recorded_at, failed)` samples inside the window (advanced strategy)
    samples: VecDeque<(Instant, bool)>,
    last_break: Option<BreakRecord>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            samples: VecDeque::new(),
            last_break: None,
        }
    }

    fn clear_counters(&mut self) {
        self.consecutive_failures = 0;
        self.samples.clear();
    }

    fn open(&mut self, now: Instant, break_duration: Duration, origin: Option<FaultOrigin>) {
        self.phase = Phase::Open {
            until: now + break_duration,
        };
        self.clear_counters();
        self.last_break = Some(BreakRecord { origin, at: now });
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) >= window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

type BreakHook<T, E> = Arc<dyn Fn(&Outcome<T, E>, Duration, &Context) + Send + Sync>;
type ContextHook = Arc<dyn Fn(&Context) + Send + Sync>;

struct Hooks<T, E> {
    on_break: Option<BreakHook<T, E>>,
    on_reset: Option<ContextHook>,
    on_half_open: Option<ContextHook>,
}

/// Which kind of admission a call received
enum Permit {
    Closed,
    Trial(TrialGuard),
}

/// Holds the half-open trial slot; frees it if the trial never reports back
struct TrialGuard {
    state: Arc<Mutex<BreakerState>>,
    armed: bool,
}

impl TrialGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        if state.phase == (Phase::HalfOpen { trial_in_flight: true }) {
            state.phase = Phase::HalfOpen {
                trial_in_flight: false,
            };
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Clones share state, so one breaker can guard calls made from many tasks.
///
/// # Example
/// ```no_run
/// use bulwark_core_policy::{CircuitBreaker, CircuitBreakerConfig, PolicyExt};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::<String, String>::builder()
///     .config(CircuitBreakerConfig::failure_rate(
///         0.5,
///         Duration::from_secs(5),
///         5,
///         Duration::from_secs(30),
///     ))
///     .on_break(|_outcome, wait, _ctx| println!("breaking for {wait:?}"))
///     .build()?;
///
/// let result = breaker.execute(|| async { Ok("healthy".to_string()) }).await;
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<T, E> {
    key: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    classifier: Classifier<T, E>,
    hooks: Arc<Hooks<T, E>>,
    state: Arc<Mutex<BreakerState>>,
}

impl<T, E> Clone for CircuitBreaker<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            config: Arc::clone(&self.config),
            classifier: self.classifier.clone(),
            hooks: Arc::clone(&self.hooks),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> fmt::Debug for CircuitBreaker<T, E>
where
    T: 'static,
    E: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> CircuitBreaker<T, E>
where
    T: 'static,
    E: 'static,
{
    /// Create a circuit breaker handling every fault
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    /// Basic breaker opening after `threshold` consecutive failures
    pub fn basic(threshold: u32, break_duration: Duration) -> Result<Self, ConfigError> {
        Self::new(CircuitBreakerConfig::consecutive(threshold, break_duration))
    }

    /// Advanced breaker driven by the failure ratio over a sliding window
    pub fn advanced(
        failure_rate: f64,
        sampling_duration: Duration,
        minimum_throughput: u32,
        break_duration: Duration,
    ) -> Result<Self, ConfigError> {
        Self::new(CircuitBreakerConfig::failure_rate(
            failure_rate,
            sampling_duration,
            minimum_throughput,
            break_duration,
        ))
    }

    pub fn builder() -> CircuitBreakerBuilder<T, E> {
        CircuitBreakerBuilder::new()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state; reports `HalfOpen` once the break deadline has elapsed
    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        match state.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
            Phase::Isolated => CircuitState::Isolated,
        }
    }

    /// Failures counted toward the next break: consecutive failures for the
    /// basic strategy, failures inside the current window for the advanced one
    pub fn failure_count(&self) -> u32 {
        let mut state = self.state.lock();
        match self.config.strategy {
            BreakerStrategy::ConsecutiveFailures { .. } => state.consecutive_failures,
            BreakerStrategy::FailureRate {
                sampling_duration, ..
            } => {
                state.prune(Instant::now(), sampling_duration);
                state.samples.iter().filter(|(_, failed)| *failed).count() as u32
            }
        }
    }

    /// When and why the circuit last broke
    pub fn last_break(&self) -> Option<BreakRecord> {
        self.state.lock().last_break
    }

    /// Hold the circuit open until [`reset`](Self::reset) is called
    pub fn isolate(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Isolated;
        state.clear_counters();
        drop(state);
        warn!(policy_key = %self.key, "circuit isolated");
    }

    /// Close the circuit and clear all counters
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Closed;
        state.clear_counters();
        drop(state);
        self.fire_reset(&Context::new().for_policy(&self.key));
    }

    fn fire_reset(&self, ctx: &Context) {
        info!(
            policy_key = %self.key,
            correlation_id = %ctx.correlation_id(),
            "circuit reset"
        );
        if let Some(hook) = &self.hooks.on_reset {
            hook(ctx);
        }
    }

    /// Decide whether a call may proceed
    fn admit(&self, ctx: &Context) -> Result<Permit, Fault<E>> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Closed => Ok(Permit::Closed),
            Phase::Isolated => Err(Fault::IsolatedCircuit),
            Phase::HalfOpen {
                trial_in_flight: true,
            } => Err(Fault::BrokenCircuit),
            Phase::HalfOpen {
                trial_in_flight: false,
            } => {
                state.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Permit::Trial(self.trial_guard()))
            }
            Phase::Open { until } => {
                if Instant::now() < until {
                    return Err(Fault::BrokenCircuit);
                }
                state.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                drop(state);

                info!(
                    policy_key = %self.key,
                    correlation_id = %ctx.correlation_id(),
                    "circuit half-open, admitting trial execution"
                );
                if let Some(hook) = &self.hooks.on_half_open {
                    hook(ctx);
                }
                Ok(Permit::Trial(self.trial_guard()))
            }
        }
    }

    fn trial_guard(&self) -> TrialGuard {
        TrialGuard {
            state: Arc::clone(&self.state),
            armed: true,
        }
    }

    /// Update health from a finished execution
    fn record(&self, permit: Permit, outcome: &Outcome<T, E>, ctx: &Context) {
        let handled = self.classifier.handles(outcome);
        match permit {
            Permit::Closed => self.record_closed(handled, outcome, ctx),
            Permit::Trial(guard) => {
                self.record_trial(handled, outcome, ctx);
                guard.disarm();
            }
        }
    }

    fn record_closed(&self, handled: bool, outcome: &Outcome<T, E>, ctx: &Context) {
        // Unhandled faults are neither failures nor successes
        if !handled && outcome.is_err() {
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        // The circuit may have broken while this call was running
        if state.phase != Phase::Closed {
            return;
        }

        let should_break = match self.config.strategy {
            BreakerStrategy::ConsecutiveFailures { threshold } => {
                if handled {
                    state.consecutive_failures += 1;
                } else {
                    state.consecutive_failures = 0;
                }
                state.consecutive_failures >= threshold
            }
            BreakerStrategy::FailureRate {
                threshold,
                sampling_duration,
                minimum_throughput,
            } => {
                state.prune(now, sampling_duration);
                state.samples.push_back((now, handled));
                let total = state.samples.len();
                let failures = state.samples.iter().filter(|(_, failed)| *failed).count();
                handled
                    && total >= minimum_throughput as usize
                    && failures as f64 / total as f64 >= threshold
            }
        };

        if should_break {
            state.open(now, self.config.break_duration, fault_origin(outcome));
            drop(state);
            self.fire_break(outcome, ctx);
        }
    }

    fn record_trial(&self, handled: bool, outcome: &Outcome<T, E>, ctx: &Context) {
        let now = Instant::now();
        let mut state = self.state.lock();
        // A manual isolate or reset during the trial takes precedence
        if state.phase != (Phase::HalfOpen { trial_in_flight: true }) {
            return;
        }

        if handled {
            state.open(now, self.config.break_duration, fault_origin(outcome));
            drop(state);
            self.fire_break(outcome, ctx);
        } else if outcome.is_ok() {
            state.phase = Phase::Closed;
            state.clear_counters();
            drop(state);
            self.fire_reset(ctx);
        } else {
            // Unhandled fault says nothing about health; let another caller probe
            state.phase = Phase::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn fire_break(&self, outcome: &Outcome<T, E>, ctx: &Context) {
        let duration = self.config.break_duration;
        warn!(
            policy_key = %self.key,
            operation_key = ctx.operation_key().unwrap_or_default(),
            correlation_id = %ctx.correlation_id(),
            break_ms = duration.as_millis() as u64,
            "circuit broken"
        );
        if let Some(hook) = &self.hooks.on_break {
            hook(outcome, duration, ctx);
        }
    }
}

fn fault_origin<T, E>(outcome: &Outcome<T, E>) -> Option<FaultOrigin> {
    outcome.as_ref().err().map(Fault::origin)
}

#[async_trait]
impl<T, E> Policy<T, E> for CircuitBreaker<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn policy_key(&self) -> &str {
        &self.key
    }

    async fn execute_operation(
        &self,
        operation: Operation<T, E>,
        context: Context,
        cancel: CancellationToken,
    ) -> Outcome<T, E> {
        let ctx = context.for_policy(&self.key);
        let permit = self.admit(&ctx)?;
        let outcome = operation.invoke(ctx.clone(), cancel).await;
        self.record(permit, &outcome, &ctx);
        outcome
    }
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder<T, E> {
    key: Option<String>,
    config: CircuitBreakerConfig,
    classifier: Classifier<T, E>,
    hooks: Hooks<T, E>,
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: 'static,
    E: 'static,
{
    fn new() -> Self {
        Self {
            key: None,
            config: CircuitBreakerConfig::default(),
            classifier: Classifier::all_faults(),
            hooks: Hooks {
                on_break: None,
                on_reset: None,
                on_half_open: None,
            },
        }
    }

    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Which outcomes count as failures (default: every fault)
    pub fn handle(mut self, classifier: Classifier<T, E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Called when the circuit transitions to Open
    pub fn on_break<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Outcome<T, E>, Duration, &Context) + Send + Sync + 'static,
    {
        self.hooks.on_break = Some(Arc::new(hook));
        self
    }

    /// Called when the circuit transitions to Closed
    pub fn on_reset<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.hooks.on_reset = Some(Arc::new(hook));
        self
    }

    /// Called when a trial execution is admitted
    pub fn on_half_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.hooks.on_half_open = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<CircuitBreaker<T, E>, ConfigError> {
        self.config.validate()?;
        let key = self
            .key
            .unwrap_or_else(|| generated_policy_key("CircuitBreaker"));
        Ok(CircuitBreaker {
            key: Arc::from(key),
            config: Arc::new(self.config),
            classifier: self.classifier,
            hooks: Arc::new(self.hooks),
            state: Arc::new(Mutex::new(BreakerState::new())),
        })
    }
}
