//! Passthrough directives for guest configuration.

use serde::Serialize;

use super::VirtualFunction;
use crate::runtime::constants::pci::{
    MEDIATED_CLASS_PREFIX, MEDIATED_VIRTUAL_DEV, SLOT_PREFIX, VENDOR_INTEL,
};
use crate::vmx::DirectiveSet;

/// One VF or mediated device bound into a guest at a passthrough slot.
///
/// Directive keys embed the slot index. Re-attaching at a slot clears every
/// key of the previous binding before the new one is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAttachment {
    pub guest: String,
    pub slot: u32,
    pub directives: DirectiveSet,
}

/// Key prefix shared by every directive of `slot`, trailing dot included.
pub fn slot_prefix(slot: u32) -> String {
    format!("{}{}.", SLOT_PREFIX, slot)
}

fn slot_key(slot: u32, attr: &str) -> String {
    format!("{}{}", slot_prefix(slot), attr)
}

pub fn vf_directives(slot: u32, vf: &VirtualFunction) -> DirectiveSet {
    DirectiveSet::new()
        .with(slot_key(slot, "present"), "TRUE")
        .with(slot_key(slot, "id"), vf.address.passthrough_id())
        .with(slot_key(slot, "deviceId"), format!("0x{}", vf.device_id))
        .with(slot_key(slot, "vendorId"), format!("0x{}", VENDOR_INTEL))
        .with(slot_key(slot, "systemId"), "BYPASS")
}

pub fn mediated_directives(slot: u32, class: &str, profile_id: u32) -> DirectiveSet {
    DirectiveSet::new()
        .with(slot_key(slot, "present"), "TRUE")
        .with(slot_key(slot, "virtualDev"), MEDIATED_VIRTUAL_DEV)
        .with(
            slot_key(slot, "dvx.deviceClass"),
            format!("{}{}", MEDIATED_CLASS_PREFIX, class),
        )
        .with(slot_key(slot, "dvx.config.profile_id"), profile_id.to_string())
}

/// Memory size only.
pub fn memory_size(memory_mb: u64) -> DirectiveSet {
    DirectiveSet::new().with("memSize", memory_mb.to_string())
}

/// Size plus a full, pinned reservation. Passthrough requires guest memory
/// to be fully reserved.
pub fn memory_reservation(memory_mb: u64) -> DirectiveSet {
    let mb = memory_mb.to_string();
    DirectiveSet::new()
        .with("memSize", mb.clone())
        .with("sched.mem.min", mb.clone())
        .with("sched.mem.minSize", mb)
        .with("sched.mem.shares", "normal")
        .with("sched.mem.pin", "TRUE")
}
