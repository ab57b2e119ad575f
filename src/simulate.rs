/*!
 * Drive a configured policy against a synthetic flaky operation
 *
 * Useful for checking what a policy file actually does before wiring it
 * into a service: how many invocations a retry spends, when a breaker
 * opens, which calls time out.
 */

use bulwark_core_policy::{CancellationToken, Context, Fault, Operation, Policy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shape of the synthetic operation and of the call sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    /// The first `failures` invocations fail, later ones succeed
    pub failures: u32,
    /// Time each invocation takes before it resolves
    pub latency: Duration,
    /// Number of sequential executions of the policy
    pub calls: u32,
    /// Pause between executions
    pub spacing: Duration,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            failures: 0,
            latency: Duration::ZERO,
            calls: 1,
            spacing: Duration::ZERO,
        }
    }
}

/// What one execution of the policy returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReport {
    pub call: u32,
    /// Operation invocations seen so far, across all calls
    pub invocations: u32,
    /// `Ok(n)` carries the invocation number that succeeded
    pub outcome: Result<u32, Fault<String>>,
}

impl CallReport {
    pub fn describe(&self) -> String {
        match &self.outcome {
            Ok(n) => format!("call {}: ok (invocation {})", self.call, n),
            Err(fault) => format!("call {}: {}", self.call, fault),
        }
    }
}

/// Run `scenario` through `policy` and report every call
pub async fn run_scenario(
    policy: Arc<dyn Policy<u32, String>>,
    scenario: Scenario,
) -> Vec<CallReport> {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invocations);
    let operation = Operation::new(move |_ctx: Context, cancel: CancellationToken| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = scenario.failures;
        let latency = scenario.latency;
        async move {
            if !latency.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(format!("invocation {} cancelled", n));
                    }
                    _ = tokio::time::sleep(latency) => {}
                }
            }
            if n <= failures {
                Err(format!("simulated failure #{}", n))
            } else {
                Ok(n)
            }
        }
    });

    let mut reports = Vec::with_capacity(scenario.calls as usize);
    for call in 1..=scenario.calls {
        if call > 1 && !scenario.spacing.is_zero() {
            tokio::time::sleep(scenario.spacing).await;
        }

        let context = Context::with_operation_key(format!("simulate-{}", call));
        let outcome = policy
            .execute_operation(operation.clone(), context, CancellationToken::new())
            .await;

        let report = CallReport {
            call,
            invocations: invocations.load(Ordering::SeqCst),
            outcome,
        };
        info!(policy = policy.policy_key(), "{}", report.describe());
        reports.push(report);
    }
    reports
}
