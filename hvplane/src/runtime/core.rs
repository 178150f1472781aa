//! Control-plane wiring.

use std::sync::Arc;

use hvplane_shared::errors::HvResult;

use crate::accel::{AcceleratorPool, KindTable};
use crate::channel::{CommandChannel, FileTransfer, SshChannel};
use crate::fleet::{Fleet, FleetOrchestrator};
use crate::runtime::layout::DatastoreLayout;
use crate::runtime::options::HvOptions;
use crate::util::RetryWaiter;
use crate::vm::{VmController, VmRegistry};

/// Entry point: one host, one registry, and the components built on them.
///
/// **Cloning**: cheap via `Arc`; all clones share the same registry.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<ControlPlaneInner>,
}

struct ControlPlaneInner {
    options: HvOptions,
    registry: VmRegistry,
    controller: Arc<VmController>,
    pool: Arc<AcceleratorPool>,
}

impl ControlPlane {
    /// Connect to the host described by `options` over ssh.
    pub fn new(options: HvOptions) -> HvResult<Self> {
        let ssh = Arc::new(SshChannel::new(
            options.host.clone(),
            options.guest_relay.clone(),
        ));
        Self::with_transport(options, ssh.clone(), Some(ssh))
    }

    /// Build on a caller-supplied command channel and file transfer.
    pub fn with_transport(
        options: HvOptions,
        channel: Arc<dyn CommandChannel>,
        transfer: Option<Arc<dyn FileTransfer>>,
    ) -> HvResult<Self> {
        options.validate()?;

        let registry = VmRegistry::new();
        let waiter = RetryWaiter::new(options.exec_weight, options.poll_interval());
        let controller = Arc::new(VmController::new(
            channel.clone(),
            transfer,
            registry.clone(),
            waiter,
            DatastoreLayout::new(options.datastore.clone()),
            options.timeouts.clone(),
        ));
        let pool = Arc::new(AcceleratorPool::new(
            channel,
            registry.clone(),
            controller.editor().clone(),
            KindTable::new(options.accelerators.clone()),
            options.expected_sockets,
            options.timeouts.command(),
        ));

        tracing::info!(
            host = %options.host.destination(),
            datastore = %options.datastore,
            exec_weight = options.exec_weight,
            "Control plane ready"
        );

        Ok(Self {
            inner: Arc::new(ControlPlaneInner {
                options,
                registry,
                controller,
                pool,
            }),
        })
    }

    pub fn options(&self) -> &HvOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.inner.registry
    }

    pub fn controller(&self) -> &Arc<VmController> {
        &self.inner.controller
    }

    pub fn pool(&self) -> &Arc<AcceleratorPool> {
        &self.inner.pool
    }

    pub fn fleet(&self, fleet: Fleet) -> FleetOrchestrator {
        FleetOrchestrator::new(
            fleet,
            Arc::clone(&self.inner.controller),
            Arc::clone(&self.inner.pool),
            self.inner.options.fleet_stagger(),
        )
    }

    /// Orchestrator over `<prefix>0` .. `<prefix>{count-1}`.
    pub fn numbered_fleet(&self, name: &str, prefix: &str, count: usize) -> FleetOrchestrator {
        self.fleet(Fleet::numbered(name, prefix, count))
    }
}
