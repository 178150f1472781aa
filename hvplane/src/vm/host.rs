//! Host command surface for guest inventory and power control.
//!
//! Commands follow the host's `<tool> <object>/<verb> <id>` pattern.
//! Enumeration output is a whitespace table parsed by column position.

use hvplane_shared::errors::{HvError, HvResult};
use serde::Serialize;

use crate::util::table;
use crate::vm::state::LifecycleState;

pub const LIST_GUESTS: &str = "vim-cmd vmsvc/getallvms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    On,
    Off,
    Shutdown,
    Reset,
    Reboot,
    Suspend,
    GetState,
}

impl PowerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOp::On => "on",
            PowerOp::Off => "off",
            PowerOp::Shutdown => "shutdown",
            PowerOp::Reset => "reset",
            PowerOp::Reboot => "reboot",
            PowerOp::Suspend => "suspend",
            PowerOp::GetState => "getstate",
        }
    }
}

pub fn power(op: PowerOp, id: &str) -> String {
    format!("vim-cmd vmsvc/power.{} {}", op.as_str(), id)
}

pub fn unregister(id: &str) -> String {
    format!("vim-cmd vmsvc/unregister {}", id)
}

pub fn register(vmx_path: &str) -> String {
    format!("vim-cmd solo/registervm {}", vmx_path)
}

pub fn snapshot_create(id: &str, name: &str) -> String {
    format!("vim-cmd vmsvc/snapshot.create {} {}", id, name)
}

pub fn snapshot_revert(id: &str, snapshot_id: &str) -> String {
    format!("vim-cmd vmsvc/snapshot.revert {} {} 0", id, snapshot_id)
}

pub fn snapshot_remove_all(id: &str) -> String {
    format!("vim-cmd vmsvc/snapshot.removeall {}", id)
}

/// One row of the host's guest inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostGuest {
    pub id: String,
    pub name: String,
}

/// Parse `vim-cmd vmsvc/getallvms`: header skipped, column 0 is the id, column 1 the name.
pub fn parse_guest_list(output: &str) -> Vec<HostGuest> {
    table::data_rows(output)
        .into_iter()
        .filter(|row| row.len() >= 2 && row[0].chars().all(|c| c.is_ascii_digit()))
        .map(|row| HostGuest {
            id: row[0].to_string(),
            name: row[1].to_string(),
        })
        .collect()
}

pub fn parse_power_state(output: &str) -> HvResult<LifecycleState> {
    LifecycleState::from_power_report(output)
        .ok_or_else(|| HvError::Parse(format!("unrecognized power state: {}", output.trim())))
}
