//! Command execution against the hypervisor host and its guests.
//!
//! ## Architecture
//!
//! - **CommandChannel**: runs one shell command on the host or inside a guest
//! - **FileTransfer**: moves files between the control machine and a guest
//! - **HostFiles**: whole-file helpers on the host built on a CommandChannel
//!
//! The channel knows nothing about VM semantics. Guest commands are relayed
//! through the host; see [`render`] for how they are wrapped and quoted.

pub mod files;
pub mod render;
mod ssh;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};
use serde::Serialize;

use crate::vm::os::OsFamily;

pub use files::HostFiles;
pub use ssh::SshChannel;

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The hypervisor host shell.
    Host,
    /// A named guest's shell, reached through the host.
    Guest { name: String, os: OsFamily },
}

impl Target {
    pub fn guest(name: impl Into<String>, os: OsFamily) -> Self {
        Target::Guest {
            name: name.into(),
            os,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => f.write_str("host"),
            Target::Guest { name, .. } => write!(f, "guest {}", name),
        }
    }
}

/// Captured result of a synchronous command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Treat a nonzero exit code as a [`HvError::Command`].
    pub fn ensure_success(self, target: &Target, command: &str) -> HvResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HvError::command(
                target,
                command,
                format!("exit code {}: {}", self.exit_code, self.stderr.trim()),
            ))
        }
    }

    /// Stricter check for host tools that report failure on stderr
    /// while still exiting zero.
    pub fn ensure_clean(self, target: &Target, command: &str) -> HvResult<Self> {
        let output = self.ensure_success(target, command)?;
        if output.stderr.trim().is_empty() {
            Ok(output)
        } else {
            Err(HvError::command(target, command, output.stderr.trim()))
        }
    }
}

/// Executes shell commands on the host or inside a guest.
///
/// Transport failures and timeouts surface as [`HvError::Command`]. A
/// nonzero exit code is not an error at this layer; callers decide.
#[async_trait::async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run `command` in `cwd` and wait for it, bounded by `timeout`.
    async fn run(
        &self,
        target: &Target,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> HvResult<CommandOutput>;

    /// Dispatch `command` and return without waiting for it.
    async fn run_async(&self, target: &Target, command: &str) -> HvResult<()>;
}

/// Moves files between the control machine and a guest.
#[async_trait::async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(&self, guest: &str, local: &Path, remote: &str) -> HvResult<()>;

    /// Deliver `remote` from the guest to the caller-specified `local` path.
    async fn download(&self, guest: &str, remote: &str, local: &Path) -> HvResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Host.to_string(), "host");
        assert_eq!(
            Target::guest("centos_acce0", OsFamily::Linux).to_string(),
            "guest centos_acce0"
        );
    }

    #[test]
    fn test_ensure_success() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: "done".into(),
            stderr: String::new(),
        };
        assert!(ok.clone().ensure_success(&Target::Host, "true").is_ok());

        let failed = CommandOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "no such vm\n".into(),
        };
        let err = failed.ensure_success(&Target::Host, "vim-cmd x").unwrap_err();
        assert!(err.to_string().contains("exit code 2: no such vm"));
    }

    #[test]
    fn test_ensure_clean_rejects_stderr_on_success() {
        let noisy = CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: "Unable to set max VFs".into(),
        };
        let err = noisy.ensure_clean(&Target::Host, "esxcli").unwrap_err();
        assert!(matches!(err, HvError::Command { .. }));
    }
}
