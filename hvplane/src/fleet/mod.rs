//! Fleet-wide fan-out of guest operations.
//!
//! A [`Fleet`] is only a named membership list; guests stay owned by the
//! [`VmRegistry`](crate::vm::VmRegistry). [`FleetOrchestrator::for_each`]
//! runs one task per guest and joins them under a deadline:
//!
//! ```text
//! dispatch g0 ─ stagger ─ dispatch g1 ─ stagger ─ ... ─┐
//!                                                      ├─ join (timeout)
//! results: guests that succeeded before the deadline ──┘
//! ```
//!
//! A guest that failed or was still running at the deadline has no entry
//! in the result map. Late tasks are not aborted; their results are dropped.

mod metrics;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use hvplane_shared::errors::{HvError, HvResult};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::accel::{AcceleratorPool, DeviceAttachment, VirtualFunction};
use crate::channel::CommandOutput;
use crate::vm::{Guest, VmController};

pub use metrics::{FleetMetrics, GuestTaskMetrics};

/// Named, ordered guest membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fleet {
    name: String,
    members: Vec<String>,
}

impl Fleet {
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    /// `count` members named `<prefix>0` .. `<prefix>{count-1}`.
    pub fn numbered(name: impl Into<String>, prefix: &str, count: usize) -> Self {
        Self::new(name, (0..count).map(|i| format!("{}{}", prefix, i)).collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Per-guest results of one fan-out call.
#[derive(Debug)]
pub struct FleetResults<T> {
    requested: Vec<String>,
    results: HashMap<String, T>,
    pub metrics: FleetMetrics,
}

impl<T> FleetResults<T> {
    pub fn get(&self, guest: &str) -> Option<&T> {
        self.results.get(guest)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Requested guests with no result, in request order.
    pub fn missing(&self) -> Vec<&str> {
        self.requested
            .iter()
            .filter(|g| !self.results.contains_key(*g))
            .map(String::as_str)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.len() == self.requested.len()
    }

    pub fn into_map(self) -> HashMap<String, T> {
        self.results
    }
}

struct Collected<T> {
    results: HashMap<String, T>,
    failed: usize,
    guests: Vec<GuestTaskMetrics>,
}

impl<T> Default for Collected<T> {
    fn default() -> Self {
        Self {
            results: HashMap::new(),
            failed: 0,
            guests: Vec::new(),
        }
    }
}

/// Runs operations across a fleet concurrently.
pub struct FleetOrchestrator {
    fleet: Fleet,
    controller: Arc<VmController>,
    pool: Arc<AcceleratorPool>,
    stagger: Duration,
}

impl FleetOrchestrator {
    pub fn new(
        fleet: Fleet,
        controller: Arc<VmController>,
        pool: Arc<AcceleratorPool>,
        stagger: Duration,
    ) -> Self {
        Self {
            fleet,
            controller,
            pool,
            stagger,
        }
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Join deadline for operations with a nominal budget of `timeout_secs`:
    /// the scaled budget plus one poll interval of overrun.
    fn join_budget(&self, timeout_secs: u64) -> Duration {
        let waiter = self.controller.waiter();
        Duration::from_secs(waiter.scale_secs(timeout_secs)) + waiter.interval()
    }

    /// Run `op` for every guest in `guests` (default: all members).
    ///
    /// Dispatches are staggered; the `timeout` starts once the last guest
    /// was dispatched. Never fails as a whole: failed and unfinished guests
    /// are absent from the results.
    pub async fn for_each<T, F, Fut>(
        &self,
        operation: &str,
        guests: Option<&[String]>,
        op: F,
        timeout: Duration,
    ) -> FleetResults<T>
    where
        T: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = HvResult<T>> + Send + 'static,
    {
        let requested: Vec<String> = guests.unwrap_or(self.fleet.members()).to_vec();
        let started_at = Utc::now();
        let started = Instant::now();
        let collected = Arc::new(Mutex::new(Collected::default()));

        tracing::info!(
            fleet = %self.fleet.name,
            operation,
            guests = requested.len(),
            "Dispatching fleet operation"
        );

        let mut handles = Vec::with_capacity(requested.len());
        for (i, guest) in requested.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            let task = op(guest.clone());
            let collected = Arc::clone(&collected);
            let guest = guest.clone();
            let operation = operation.to_string();
            handles.push(tokio::spawn(async move {
                let task_start = Instant::now();
                let outcome = task.await;
                let duration_ms = task_start.elapsed().as_millis();
                let mut collected = collected.lock();
                let succeeded = outcome.is_ok();
                match outcome {
                    Ok(value) => {
                        collected.results.insert(guest.clone(), value);
                    }
                    Err(e) => {
                        tracing::warn!(guest = %guest, operation = %operation, error = %e, "Fleet task failed");
                        collected.failed += 1;
                    }
                }
                collected.guests.push(GuestTaskMetrics {
                    guest,
                    succeeded,
                    duration_ms,
                });
            }));
        }

        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            tracing::warn!(
                fleet = %self.fleet.name,
                operation,
                timeout_secs = timeout.as_secs(),
                "Fleet join deadline passed, dropping unfinished guests"
            );
        }

        let Collected {
            results,
            failed,
            guests: guest_metrics,
        } = std::mem::take(&mut *collected.lock());
        let completed = results.len();
        let metrics = FleetMetrics {
            operation: operation.to_string(),
            started_at,
            dispatched: requested.len(),
            completed,
            failed,
            missing: requested.len().saturating_sub(completed + failed),
            total_duration_ms: started.elapsed().as_millis(),
            guests: guest_metrics,
        };

        tracing::info!(
            fleet = %self.fleet.name,
            operation,
            completed,
            failed,
            missing = metrics.missing,
            duration_ms = metrics.total_duration_ms,
            "Fleet operation finished"
        );

        FleetResults {
            requested,
            results,
            metrics,
        }
    }

    pub async fn execute_all(
        &self,
        command: &str,
        cwd: &str,
        timeout_secs: u64,
        guests: Option<&[String]>,
    ) -> FleetResults<CommandOutput> {
        let command = command.to_string();
        let cwd = cwd.to_string();
        self.for_each(
            "execute",
            guests,
            |guest| {
                let ctrl = Arc::clone(&self.controller);
                let command = command.clone();
                let cwd = cwd.clone();
                async move { ctrl.execute(&guest, &command, &cwd, timeout_secs).await }
            },
            self.join_budget(timeout_secs),
        )
        .await
    }

    pub async fn create_all(
        &self,
        template_dir: &str,
        memory_mb: u64,
        timeout: Duration,
    ) -> FleetResults<Guest> {
        let template_dir = template_dir.to_string();
        self.for_each(
            "create",
            None,
            |guest| {
                let ctrl = Arc::clone(&self.controller);
                let template_dir = template_dir.clone();
                async move {
                    ctrl.create_from_template(&guest, &template_dir, memory_mb, None)
                        .await
                }
            },
            timeout,
        )
        .await
    }

    pub async fn define_all(&self, timeout: Duration) -> FleetResults<Guest> {
        self.for_each(
            "define",
            None,
            |guest| {
                let ctrl = Arc::clone(&self.controller);
                async move { ctrl.define(&guest, None).await }
            },
            timeout,
        )
        .await
    }

    pub async fn start_all(&self, timeout_secs: u64) -> FleetResults<()> {
        self.for_each(
            "start",
            None,
            |guest| {
                let ctrl = Arc::clone(&self.controller);
                async move { ctrl.start(&guest, timeout_secs).await }
            },
            self.join_budget(timeout_secs),
        )
        .await
    }

    pub async fn shutdown_all(&self, timeout_secs: u64) -> FleetResults<()> {
        self.for_each(
            "shutdown",
            None,
            |guest| {
                let ctrl = Arc::clone(&self.controller);
                async move { ctrl.shutdown(&guest, timeout_secs).await }
            },
            self.join_budget(timeout_secs),
        )
        .await
    }

    pub async fn undefine_all(&self, timeout: Duration) -> FleetResults<()> {
        self.for_each(
            "undefine",
            None,
            |guest| {
                let ctrl = Arc::clone(&self.controller);
                async move { ctrl.undefine(&guest).await }
            },
            timeout,
        )
        .await
    }

    /// Attach one VF batch per member, in membership order.
    ///
    /// # Errors
    ///
    /// [`HvError::Config`] when the batch count differs from the member count;
    /// nothing is dispatched in that case.
    pub async fn attach_vfs_all(
        &self,
        kind: &str,
        batches: Vec<Vec<VirtualFunction>>,
        first_slot: u32,
        timeout: Duration,
    ) -> HvResult<FleetResults<Vec<DeviceAttachment>>> {
        if batches.len() != self.fleet.len() {
            return Err(HvError::Config(format!(
                "{} VF batches for {} guests in fleet {}",
                batches.len(),
                self.fleet.len(),
                self.fleet.name
            )));
        }
        let by_guest: Arc<HashMap<String, Vec<VirtualFunction>>> =
            Arc::new(self.fleet.members.iter().cloned().zip(batches).collect());
        let kind = kind.to_string();

        Ok(self
            .for_each(
                "attach_vfs",
                None,
                |guest| {
                    let pool = Arc::clone(&self.pool);
                    let by_guest = Arc::clone(&by_guest);
                    let kind = kind.clone();
                    async move {
                        let vfs = by_guest
                            .get(&guest)
                            .ok_or_else(|| HvError::NotFound(format!("VF batch for {}", guest)))?;
                        pool.attach_vf_list(&guest, &kind, vfs, first_slot).await
                    }
                },
                timeout,
            )
            .await)
    }

    pub async fn attach_mediated_all(
        &self,
        kind: &str,
        count: u32,
        first_slot: u32,
        profile_id: u32,
        timeout: Duration,
    ) -> FleetResults<Vec<DeviceAttachment>> {
        let kind = kind.to_string();
        self.for_each(
            "attach_mediated",
            None,
            |guest| {
                let pool = Arc::clone(&self.pool);
                let kind = kind.clone();
                async move {
                    pool.attach_mediated_devices(&guest, &kind, count, first_slot, profile_id)
                        .await
                }
            },
            timeout,
        )
        .await
    }
}
