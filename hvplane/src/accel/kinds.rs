//! Accelerator kind table.
//!
//! Device-id signatures and per-kind quirks are data, not logic. The
//! built-in table covers the kinds the harness provisions; options files
//! may replace it.

use hvplane_shared::errors::{HvError, HvResult};
use serde::{Deserialize, Serialize};

/// Post-processing applied to an enumerated VF batch before it is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfOrderRule {
    /// Keep bus enumeration order.
    #[default]
    AsEnumerated,
    /// Swap the first and third VF of the batch.
    ///
    /// Observed on DLB: enumeration order does not match the addressing
    /// order the guest driver expects. Unconfirmed whether this is a
    /// hardware property or an enumeration artifact.
    SwapFirstThird,
}

impl VfOrderRule {
    pub fn apply<T>(&self, batch: &mut [T]) {
        match self {
            VfOrderRule::AsEnumerated => {}
            VfOrderRule::SwapFirstThird => {
                if batch.len() >= 3 {
                    batch.swap(0, 2);
                } else {
                    tracing::warn!(len = batch.len(), "VF batch too short to reorder, left as enumerated");
                }
            }
        }
    }
}

/// One accelerator kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorKind {
    pub name: String,
    /// PF device id, lowercase hex without prefix (e.g. `4940`).
    pub pf_device_id: String,
    /// VF device id; `None` for kinds that are only shared through mediated devices.
    #[serde(default)]
    pub vf_device_id: Option<String>,
    pub devices_per_socket: u32,
    /// Mediated device class suffix (`com.intel.<class>`); `None` when unsupported.
    #[serde(default)]
    pub mediated_class: Option<String>,
    #[serde(default)]
    pub vf_order: VfOrderRule,
}

impl AcceleratorKind {
    fn new(name: &str, pf: &str, vf: Option<&str>, per_socket: u32, mediated: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            pf_device_id: pf.to_string(),
            vf_device_id: vf.map(String::from),
            devices_per_socket: per_socket,
            mediated_class: mediated.map(String::from),
            vf_order: VfOrderRule::AsEnumerated,
        }
    }

    pub fn vf_device_id(&self) -> HvResult<&str> {
        self.vf_device_id
            .as_deref()
            .ok_or_else(|| HvError::Config(format!("accelerator {} has no VF signature", self.name)))
    }

    pub fn mediated_class(&self) -> HvResult<&str> {
        self.mediated_class.as_deref().ok_or_else(|| {
            HvError::Config(format!("accelerator {} has no mediated device class", self.name))
        })
    }
}

/// Built-in kinds: QAT and DLB with SR-IOV, DSA and IAX through mediated devices.
pub fn default_kinds() -> Vec<AcceleratorKind> {
    let mut dlb = AcceleratorKind::new("dlb", "2710", Some("2711"), 1, None);
    dlb.vf_order = VfOrderRule::SwapFirstThird;
    vec![
        AcceleratorKind::new("qat", "4940", Some("4941"), 4, Some("qat")),
        dlb,
        AcceleratorKind::new("dsa", "0b25", None, 4, Some("dsa")),
        AcceleratorKind::new("iax", "0cfe", None, 4, Some("iax")),
    ]
}

/// Lookup by kind name.
#[derive(Debug, Clone)]
pub struct KindTable {
    kinds: Vec<AcceleratorKind>,
}

impl Default for KindTable {
    fn default() -> Self {
        Self::new(default_kinds())
    }
}

impl KindTable {
    pub fn new(kinds: Vec<AcceleratorKind>) -> Self {
        Self { kinds }
    }

    pub fn get(&self, name: &str) -> HvResult<&AcceleratorKind> {
        self.kinds
            .iter()
            .find(|k| k.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| HvError::NotFound(format!("accelerator kind {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.kinds.iter().map(|k| k.name.as_str()).collect()
    }
}
