//! Guest OS family inference.

use std::fmt;

use hvplane_shared::errors::{HvError, HvResult};
use serde::{Deserialize, Serialize};

/// Closed set of guest OS families.
///
/// Only selects command syntax and guest paths; it never participates in
/// lifecycle decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
}

/// Keyword table consulted in order; the first family with a matching keyword wins.
const KEYWORDS: &[(OsFamily, &[&str])] = &[
    (OsFamily::Linux, &["cent", "lin", "redhat", "rhel", "rhle"]),
    (OsFamily::Windows, &["win"]),
];

impl OsFamily {
    /// Classify a guest name or OS hint by case-insensitive substring match.
    pub fn infer(hint: &str) -> HvResult<Self> {
        let lowered = hint.to_ascii_lowercase();
        KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
            .map(|(family, _)| *family)
            .ok_or_else(|| HvError::Config(format!("cannot infer OS family from '{}'", hint)))
    }

    /// Infer from an explicit hint when given, falling back to the guest name.
    pub fn resolve(name: &str, hint: Option<&str>) -> HvResult<Self> {
        match hint {
            Some(hint) => Self::infer(hint),
            None => Self::infer(name),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
        }
    }

    /// `guestOS` directive value for guests cloned from a template.
    pub fn guest_os_type(&self) -> &'static str {
        match self {
            OsFamily::Linux => "centos8-64",
            OsFamily::Windows => "windows2019srvNext-64",
        }
    }

    /// In-guest reboot request.
    pub fn reboot_command(&self) -> &'static str {
        match self {
            OsFamily::Linux => "systemctl reboot",
            OsFamily::Windows => "shutdown /r /t 0",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
