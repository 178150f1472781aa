//! Poll-until-true primitive.
//!
//! The single place transient failures are absorbed. Every wait on a host
//! or guest condition goes through [`RetryWaiter::wait_for`]; no other
//! component retries on its own.

use std::future::Future;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};
use tokio::time::Instant;

use crate::runtime::constants::retry::{POLL_INTERVAL_SECS, PROGRESS_EVERY};

/// Polls a predicate at a fixed interval until it holds or the budget runs out.
///
/// The nominal timeout of every wait is multiplied by the execution weight,
/// which accounts for environments where everything runs slower.
#[derive(Debug, Clone)]
pub struct RetryWaiter {
    exec_weight: f64,
    interval: Duration,
}

impl Default for RetryWaiter {
    fn default() -> Self {
        Self::new(1.0, Duration::from_secs(POLL_INTERVAL_SECS))
    }
}

impl RetryWaiter {
    pub fn new(exec_weight: f64, interval: Duration) -> Self {
        Self {
            exec_weight,
            interval,
        }
    }

    pub fn exec_weight(&self) -> f64 {
        self.exec_weight
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Apply the execution weight to a nominal timeout in seconds.
    pub fn scale_secs(&self, timeout_secs: u64) -> u64 {
        (timeout_secs as f64 * self.exec_weight) as u64
    }

    /// Wait until `predicate` returns `Ok(true)`.
    ///
    /// Errors from the predicate count as "not yet true" and are only logged;
    /// [`HvError::ToolingNotReady`] is logged at trace level, anything else
    /// at debug. A progress line is emitted every 30 attempts. The loop
    /// sleeps a fixed interval between attempts, so the call returns no
    /// earlier than the scaled budget and at most one interval past it.
    ///
    /// # Errors
    ///
    /// Returns [`HvError::Timeout`] carrying the scaled budget once it is exhausted.
    pub async fn wait_for<F, Fut>(
        &self,
        description: &str,
        timeout_secs: u64,
        mut predicate: F,
    ) -> HvResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = HvResult<bool>>,
    {
        let budget_secs = self.scale_secs(timeout_secs);
        let budget = Duration::from_secs(budget_secs);
        let start = Instant::now();
        let mut attempt: u32 = 0;

        tracing::info!(description, budget_secs, "Waiting for condition");

        while start.elapsed() < budget {
            attempt += 1;
            match predicate().await {
                Ok(true) => {
                    tracing::info!(
                        description,
                        attempt,
                        elapsed_secs = start.elapsed().as_secs(),
                        budget_secs,
                        "Condition met"
                    );
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_tooling_not_ready() => {
                    tracing::trace!(description, error = %e, "Guest tooling not ready yet");
                }
                Err(e) => {
                    tracing::debug!(description, attempt, error = %e, "Predicate failed, retrying");
                }
            }

            if attempt % PROGRESS_EVERY == 0 {
                tracing::info!(
                    description,
                    remaining_secs = budget.saturating_sub(start.elapsed()).as_secs(),
                    "Still waiting"
                );
            }

            tokio::time::sleep(self.interval).await;
        }

        tracing::debug!(description, budget_secs, attempt, "Wait timed out");
        Err(HvError::Timeout {
            description: description.to_string(),
            timeout_secs: budget_secs,
        })
    }
}
