//! Accelerator resource pool.
//!
//! Enumerates physical functions on the host, creates and destroys SR-IOV
//! virtual functions against them, and binds VFs or mediated devices into
//! guest configurations.
//!
//! Hardware counts are never taken on trust: a PF or VF enumeration that
//! does not match the expected count fails with [`HvError::CountMismatch`].

pub mod attach;
pub mod kinds;
pub mod pci;

use std::sync::Arc;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};
use serde::Serialize;

use crate::channel::{CommandChannel, CommandOutput, Target};
use crate::vm::manager::VmRegistry;
use crate::vmx::{DirectiveSet, GuestConfigEditor};

pub use attach::DeviceAttachment;
pub use kinds::{AcceleratorKind, KindTable, VfOrderRule};
pub use pci::{PciAddress, PciDevice};

/// A PF of one accelerator kind, with its position in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalFunction {
    pub kind: String,
    pub index: usize,
    pub address: PciAddress,
}

/// A VF spawned from a PF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualFunction {
    pub kind: String,
    pub pf: PciAddress,
    pub address: PciAddress,
    pub device_id: String,
}

/// Provisions accelerator functions and binds them into guests.
pub struct AcceleratorPool {
    channel: Arc<dyn CommandChannel>,
    registry: VmRegistry,
    editor: GuestConfigEditor,
    kinds: KindTable,
    expected_sockets: Option<u32>,
    command_timeout: Duration,
}

impl AcceleratorPool {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        registry: VmRegistry,
        editor: GuestConfigEditor,
        kinds: KindTable,
        expected_sockets: Option<u32>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            registry,
            editor,
            kinds,
            expected_sockets,
            command_timeout,
        }
    }

    pub fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    async fn host(&self, command: &str) -> HvResult<CommandOutput> {
        self.channel
            .run(&Target::Host, command, ".", self.command_timeout)
            .await?
            .ensure_success(&Target::Host, command)
    }

    async fn enumerate(&self) -> HvResult<Vec<PciDevice>> {
        let output = self.host(pci::LIST_DEVICES).await?;
        Ok(pci::parse_devices(&output.stdout))
    }

    /// Configured socket count, or the host's CPU package count.
    pub async fn socket_count(&self) -> HvResult<u32> {
        if let Some(sockets) = self.expected_sockets {
            return Ok(sockets);
        }
        let output = self.host(pci::SOCKET_COUNT).await?;
        pci::parse_socket_count(&output.stdout)
    }

    /// PFs of `kind` in enumeration order.
    ///
    /// # Errors
    ///
    /// - [`HvError::CountMismatch`] unless exactly `sockets × devices_per_socket`
    ///   PFs are present
    /// - [`HvError::Config`] if that product does not fit in a `u32`
    pub async fn list_physical_functions(&self, kind: &str) -> HvResult<Vec<PhysicalFunction>> {
        let def = self.kinds.get(kind)?;
        let sockets = self.socket_count().await?;
        let devices = self.enumerate().await?;

        let pfs: Vec<PhysicalFunction> = pci::with_device_id(&devices, &def.pf_device_id)
            .enumerate()
            .map(|(index, d)| PhysicalFunction {
                kind: def.name.clone(),
                index,
                address: d.address,
            })
            .collect();

        let expected = sockets
            .checked_mul(def.devices_per_socket)
            .map(|n| n as usize)
            .ok_or_else(|| {
                HvError::Config(format!(
                    "{} sockets x {} {} devices per socket overflows",
                    sockets, def.devices_per_socket, def.name
                ))
            })?;
        if pfs.len() != expected {
            tracing::error!(kind = %def.name, expected, actual = pfs.len(), "PF count mismatch");
            return Err(HvError::CountMismatch {
                resource: format!("{} PF", def.name),
                expected,
                actual: pfs.len(),
            });
        }

        tracing::debug!(kind = %def.name, count = pfs.len(), "Enumerated PFs");
        Ok(pfs)
    }

    /// Create `count` VFs on the PF at `pf_index` and enable passthrough on each.
    ///
    /// The returned batch has exactly `count` entries, reordered by the
    /// kind's [`VfOrderRule`].
    ///
    /// # Errors
    ///
    /// - [`HvError::Config`] if `count` is zero or the kind has no VF signature
    /// - [`HvError::NotFound`] if `pf_index` is out of range
    /// - [`HvError::Command`] if the host rejects the VF count or a passthrough toggle
    /// - [`HvError::CountMismatch`] if the bus does not show exactly `count` VFs afterwards
    pub async fn create_vfs(
        &self,
        kind: &str,
        pf_index: usize,
        count: usize,
    ) -> HvResult<Vec<VirtualFunction>> {
        if count == 0 {
            return Err(HvError::Config(
                "VF count must be at least 1; use destroy_vfs to remove VFs".into(),
            ));
        }
        let def = self.kinds.get(kind)?;
        let vf_device_id = def.vf_device_id()?;
        let pf = self.physical_function(kind, pf_index).await?;

        let command = pci::set_vf_count(&pf.address, count);
        self.host(&command)
            .await?
            .ensure_clean(&Target::Host, &command)?;

        let devices = self.enumerate().await?;
        let mut vfs: Vec<VirtualFunction> = pci::with_device_id(&devices, vf_device_id)
            .filter(|d| d.address.same_bus(&pf.address))
            .map(|d| VirtualFunction {
                kind: def.name.clone(),
                pf: pf.address,
                address: d.address,
                device_id: d.device_id.clone(),
            })
            .collect();

        if vfs.len() != count {
            tracing::error!(kind = %def.name, pf = %pf.address, expected = count, actual = vfs.len(), "VF count mismatch");
            return Err(HvError::CountMismatch {
                resource: format!("{} VF on {}", def.name, pf.address),
                expected: count,
                actual: vfs.len(),
            });
        }

        def.vf_order.apply(&mut vfs);

        for vf in &vfs {
            let command = pci::enable_passthrough(&vf.address);
            self.host(&command)
                .await?
                .ensure_clean(&Target::Host, &command)?;
        }

        tracing::info!(kind = %def.name, pf = %pf.address, count, "Created VFs");
        Ok(vfs)
    }

    /// Create `count_per_pf` VFs on each of the first `pf_count` PFs.
    pub async fn create_vfs_on_pfs(
        &self,
        kind: &str,
        pf_count: usize,
        count_per_pf: usize,
    ) -> HvResult<Vec<Vec<VirtualFunction>>> {
        let mut batches = Vec::with_capacity(pf_count);
        for pf_index in 0..pf_count {
            batches.push(self.create_vfs(kind, pf_index, count_per_pf).await?);
        }
        Ok(batches)
    }

    /// Set the VF count of the PF at `pf_index` back to zero.
    pub async fn destroy_vfs(&self, kind: &str, pf_index: usize) -> HvResult<()> {
        let pf = self.physical_function(kind, pf_index).await?;
        let command = pci::set_vf_count(&pf.address, 0);
        self.host(&command)
            .await?
            .ensure_clean(&Target::Host, &command)?;
        tracing::info!(kind, pf = %pf.address, "Destroyed VFs");
        Ok(())
    }

    async fn physical_function(&self, kind: &str, pf_index: usize) -> HvResult<PhysicalFunction> {
        let pfs = self.list_physical_functions(kind).await?;
        let available = pfs.len();
        pfs.into_iter().nth(pf_index).ok_or_else(|| {
            HvError::NotFound(format!(
                "{} PF index {} ({} available)",
                kind, pf_index, available
            ))
        })
    }

    fn require_attachable(&self, guest: &str, operation: &str) -> HvResult<()> {
        let state = self.registry.state(guest)?;
        if state.can_attach() {
            Ok(())
        } else {
            Err(HvError::invalid_state(guest, state, operation))
        }
    }

    async fn bind(&self, guest: &str, slots: Vec<(u32, DirectiveSet)>) -> HvResult<Vec<DeviceAttachment>> {
        let mut combined = DirectiveSet::new();
        for (_, directives) in &slots {
            combined.extend(directives.clone());
        }
        let cleared: Vec<String> = slots.iter().map(|(slot, _)| attach::slot_prefix(*slot)).collect();
        self.editor.replace_prefixed(guest, &cleared, &combined).await?;

        Ok(slots
            .into_iter()
            .map(|(slot, directives)| DeviceAttachment {
                guest: guest.to_string(),
                slot,
                directives,
            })
            .collect())
    }

    /// Bind `vf` into `guest` at passthrough `slot`.
    ///
    /// # Errors
    ///
    /// [`HvError::InvalidState`] unless the guest is `Defined`.
    pub async fn attach_vf(
        &self,
        guest: &str,
        kind: &str,
        vf: &VirtualFunction,
        slot: u32,
    ) -> HvResult<DeviceAttachment> {
        let mut attached = self
            .attach_vf_list(guest, kind, std::slice::from_ref(vf), slot)
            .await?;
        attached
            .pop()
            .ok_or_else(|| HvError::Internal("attachment produced no slot".into()))
    }

    /// Bind `vfs` at consecutive slots starting from `first_slot`.
    pub async fn attach_vf_list(
        &self,
        guest: &str,
        kind: &str,
        vfs: &[VirtualFunction],
        first_slot: u32,
    ) -> HvResult<Vec<DeviceAttachment>> {
        let def = self.kinds.get(kind)?;
        if let Some(vf) = vfs.iter().find(|vf| !vf.kind.eq_ignore_ascii_case(&def.name)) {
            return Err(HvError::Config(format!(
                "VF {} belongs to {}, not {}",
                vf.address, vf.kind, def.name
            )));
        }
        self.require_attachable(guest, "attach a VF to")?;

        let slots = vfs
            .iter()
            .zip(first_slot..)
            .map(|(vf, slot)| (slot, attach::vf_directives(slot, vf)))
            .collect();
        let attached = self.bind(guest, slots).await?;
        tracing::info!(guest, kind = %def.name, count = attached.len(), first_slot, "Attached VFs");
        Ok(attached)
    }

    /// Bind one mediated device of `kind` into `guest` at `slot`.
    pub async fn attach_mediated_device(
        &self,
        guest: &str,
        kind: &str,
        slot: u32,
        profile_id: u32,
    ) -> HvResult<DeviceAttachment> {
        let mut attached = self
            .attach_mediated_devices(guest, kind, 1, slot, profile_id)
            .await?;
        attached
            .pop()
            .ok_or_else(|| HvError::Internal("attachment produced no slot".into()))
    }

    /// Bind `count` mediated devices at consecutive slots starting from `first_slot`.
    pub async fn attach_mediated_devices(
        &self,
        guest: &str,
        kind: &str,
        count: u32,
        first_slot: u32,
        profile_id: u32,
    ) -> HvResult<Vec<DeviceAttachment>> {
        let def = self.kinds.get(kind)?;
        let class = def.mediated_class()?;
        self.require_attachable(guest, "attach a mediated device to")?;

        let slots = (first_slot..first_slot + count)
            .map(|slot| (slot, attach::mediated_directives(slot, class, profile_id)))
            .collect();
        let attached = self.bind(guest, slots).await?;
        tracing::info!(guest, kind = %def.name, count, first_slot, "Attached mediated devices");
        Ok(attached)
    }
}
