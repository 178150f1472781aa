//! Control-plane configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) yields a
//! usable configuration against `root@127.0.0.1`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};
use serde::{Deserialize, Serialize};

use crate::accel::kinds::{AcceleratorKind, default_kinds};
use crate::runtime::constants::{datastore, envs, filenames, fleet, retry};

/// SSH options shared by every ssh/scp invocation.
const DEFAULT_SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=5",
];

/// How to reach the hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEndpoint {
    pub address: String,
    pub user: String,
    pub port: u16,
    /// Passed verbatim to both ssh and scp.
    pub ssh_options: Vec<String>,
}

impl Default for HostEndpoint {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            user: "root".to_string(),
            port: 22,
            ssh_options: DEFAULT_SSH_OPTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl HostEndpoint {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Nominal timeouts in seconds, before the execution weight is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Single host command.
    pub command_secs: u64,
    /// One liveness probe inside a guest.
    pub probe_secs: u64,
    pub start_secs: u64,
    pub shutdown_secs: u64,
    pub suspend_secs: u64,
    /// File copies on the host and transfers to or from guests.
    pub transfer_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: 60,
            probe_secs: 30,
            start_secs: 600,
            shutdown_secs: 60,
            suspend_secs: 600,
            transfer_secs: 600,
        }
    }
}

impl Timeouts {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }
}

/// Configuration options for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HvOptions {
    pub host: HostEndpoint,
    /// Host-side program that runs a command inside a named guest.
    pub guest_relay: String,
    /// Datastore holding guest directories.
    pub datastore: String,
    /// Multiplier applied to every wait budget.
    pub exec_weight: f64,
    pub poll_interval_secs: u64,
    pub fleet_stagger_ms: u64,
    pub timeouts: Timeouts,
    /// CPU socket count; queried from the host when absent.
    pub expected_sockets: Option<u32>,
    /// Directory for `hvplane.log`; stderr only when absent.
    pub log_dir: Option<PathBuf>,
    pub accelerators: Vec<AcceleratorKind>,
}

impl Default for HvOptions {
    fn default() -> Self {
        Self {
            host: HostEndpoint::default(),
            guest_relay: "/opt/hvplane/guest-relay".to_string(),
            datastore: datastore::DEFAULT_ROOT.to_string(),
            exec_weight: 1.0,
            poll_interval_secs: retry::POLL_INTERVAL_SECS,
            fleet_stagger_ms: fleet::STAGGER_MS,
            timeouts: Timeouts::default(),
            expected_sockets: None,
            log_dir: None,
            accelerators: default_kinds(),
        }
    }
}

impl HvOptions {
    /// Load options following the lookup order:
    ///
    /// 1. `path`, when given
    /// 2. `$HVPLANE_CONFIG`
    /// 3. `<config dir>/hvplane/hvplane.toml`, when it exists
    /// 4. built-in defaults
    ///
    /// `$HVPLANE_EXEC_WEIGHT` then overrides the execution weight.
    pub fn load(path: Option<&Path>) -> HvResult<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> HvResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env(envs::CONFIG).map(PathBuf::from));

        let mut options = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        if let Some(raw) = env(envs::EXEC_WEIGHT) {
            options.exec_weight = raw.trim().parse().map_err(|e| {
                HvError::Config(format!("invalid {}={}: {}", envs::EXEC_WEIGHT, raw, e))
            })?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> HvResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HvError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options: Self = toml::from_str(&text)
            .map_err(|e| HvError::Config(format!("invalid {}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "Loaded options");
        Ok(options)
    }

    pub fn validate(&self) -> HvResult<()> {
        if !(self.exec_weight.is_finite() && self.exec_weight > 0.0) {
            return Err(HvError::Config(format!(
                "exec_weight must be positive, got {}",
                self.exec_weight
            )));
        }
        if self.host.address.trim().is_empty() {
            return Err(HvError::Config("host address must not be empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(HvError::Config("poll_interval_secs must be at least 1".into()));
        }
        if let Some(kind) = self.accelerators.iter().find(|k| k.pf_device_id.trim().is_empty()) {
            return Err(HvError::Config(format!(
                "accelerator kind {} has no PF device id",
                kind.name
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fleet_stagger(&self) -> Duration {
        Duration::from_millis(self.fleet_stagger_ms)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hvplane").join(filenames::CONFIG))
}
