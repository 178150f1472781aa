//! PCI addresses and host bus enumeration.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use hvplane_shared::errors::{HvError, HvResult};
use regex::Regex;
use serde::Serialize;

use crate::util::table;

/// Bus enumeration with `segment:bus:dev.fn` addresses in column 0 and
/// `vendor:device` in column 1.
pub const LIST_DEVICES: &str = "lspci -p";

pub const SOCKET_COUNT: &str = "esxcli hardware cpu global get | grep Packages";

pub fn set_vf_count(pf: &PciAddress, count: usize) -> String {
    format!("esxcli hardware pci sriov maxvfs set -d {} -v {} -a", pf, count)
}

pub fn enable_passthrough(vf: &PciAddress) -> String {
    format!("esxcli hardware pci pcipassthru set -d {} -e=true -a", vf)
}

fn address_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^([0-9a-fA-F]{4,8}):([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$").ok()
        })
        .as_ref()
}

/// `segment:bus:device.function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PciAddress {
    pub segment: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn same_bus(&self, other: &PciAddress) -> bool {
        self.segment == other.segment && self.bus == other.bus
    }

    /// Passthrough id directive value: bus in decimal, `dev.fn` as printed by the host.
    pub fn passthrough_id(&self) -> String {
        format!("00000:{}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = HvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = address_pattern()
            .and_then(|re| re.captures(s.trim()))
            .ok_or_else(|| HvError::Parse(format!("invalid PCI address: {}", s)))?;
        let hex = |i: usize| -> HvResult<u32> {
            u32::from_str_radix(&caps[i], 16)
                .map_err(|e| HvError::Parse(format!("invalid PCI address {}: {}", s, e)))
        };
        Ok(Self {
            segment: hex(1)?,
            bus: hex(2)? as u8,
            device: hex(3)? as u8,
            function: hex(4)? as u8,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// One row of bus enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PciDevice {
    pub address: PciAddress,
    pub vendor_id: String,
    pub device_id: String,
}

/// Parse enumeration output. Rows whose first column is not an address
/// (headers, separators) are skipped.
pub fn parse_devices(output: &str) -> Vec<PciDevice> {
    table::all_rows(output)
        .into_iter()
        .filter_map(|row| {
            let address = row.first()?.parse::<PciAddress>().ok()?;
            let (vendor, device) = row.get(1)?.split_once(':')?;
            Some(PciDevice {
                address,
                vendor_id: vendor.to_ascii_lowercase(),
                device_id: device.to_ascii_lowercase(),
            })
        })
        .collect()
}

/// Devices whose device id equals `signature`, in enumeration order.
pub fn with_device_id<'a>(devices: &'a [PciDevice], signature: &str) -> impl Iterator<Item = &'a PciDevice> {
    let signature = signature.to_ascii_lowercase();
    devices.iter().filter(move |d| d.device_id == signature)
}

/// Parse the host's CPU package count line (`   CPU Packages: 2`).
pub fn parse_socket_count(output: &str) -> HvResult<u32> {
    table::last_token(output)
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| HvError::Parse(format!("unrecognized socket count: {}", output.trim())))
}
