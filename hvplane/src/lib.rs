//! Hypervisor control plane for accelerator validation.
//!
//! Drives guest VMs on one hypervisor host through their lifecycle, carves
//! accelerator physical functions into SR-IOV virtual functions, binds them
//! into guests, and fans operations out across fleets of guests.
//!
//! ```ignore
//! use hvplane::{ControlPlane, HvOptions};
//!
//! let plane = ControlPlane::new(HvOptions::load(None)?)?;
//! let vfs = plane.pool().create_vfs("qat", 0, 4).await?;
//! plane.controller().create_from_template("centos_acce0", "/vmfs/volumes/datastore1/centos8_tpl", 8192, None).await?;
//! plane.pool().attach_vf_list("centos_acce0", "qat", &vfs, 0).await?;
//! plane.controller().start("centos_acce0", 600).await?;
//! ```

pub mod accel;
pub mod accumulator;
pub mod channel;
pub mod fleet;
pub mod logging;
pub mod runtime;
pub mod util;
pub mod vm;
pub mod vmx;

#[cfg(test)]
pub(crate) mod testing;

pub use accel::{AcceleratorPool, DeviceAttachment, PhysicalFunction, VirtualFunction};
pub use accumulator::KeyedAccumulator;
pub use channel::{CommandChannel, CommandOutput, FileTransfer, Target};
pub use fleet::{Fleet, FleetMetrics, FleetOrchestrator, FleetResults};
pub use hvplane_shared::{HvError, HvResult};
pub use logging::{LogGuard, init_logging};
pub use runtime::{ControlPlane, HvOptions};
pub use util::RetryWaiter;
pub use vm::{Guest, LifecycleState, OsFamily, VmController, VmRegistry};
