//! SSH transport to the hypervisor host.
//!
//! Host commands run directly in the host shell. Guest commands are handed
//! to a host-side relay program that executes them through the guest agent.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};
use tokio::process::Command;

use super::render::{self, CopyDirection};
use super::{CommandChannel, CommandOutput, FileTransfer, Target};
use crate::runtime::constants::guest::{
    DETACHED_RELAY_TIMEOUT_SECS, RELAY_GRACE_SECS, STAGING_DIR, TOOLING_MARKERS,
};
use crate::runtime::options::HostEndpoint;

/// ssh reserves this exit code for its own connection failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// [`CommandChannel`] and [`FileTransfer`] over `ssh`/`scp`.
#[derive(Debug, Clone)]
pub struct SshChannel {
    endpoint: HostEndpoint,
    relay: String,
}

impl SshChannel {
    pub fn new(endpoint: HostEndpoint, relay: impl Into<String>) -> Self {
        Self {
            endpoint,
            relay: relay.into(),
        }
    }

    fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = self.endpoint.ssh_options.clone();
        args.extend([
            "-p".to_string(),
            self.endpoint.port.to_string(),
            self.endpoint.destination(),
            remote_command.to_string(),
        ]);
        args
    }

    fn scp_args(&self, src: String, dest: String) -> Vec<String> {
        let mut args = self.endpoint.ssh_options.clone();
        args.extend(["-P".to_string(), self.endpoint.port.to_string(), src, dest]);
        args
    }

    fn remote_command(&self, target: &Target, command: &str, cwd: &str, timeout: Duration) -> String {
        match target {
            Target::Host => render::host_command(command, cwd),
            Target::Guest { name, os } => render::relay_invocation(
                &self.relay,
                name,
                timeout.as_secs(),
                &render::guest_command(*os, command, cwd, false),
            ),
        }
    }

    fn host_path(&self, path: &str) -> String {
        format!("{}:{}", self.endpoint.destination(), path)
    }

    fn staging_path(guest: &str, name: &str) -> String {
        format!("{}/{}-{}", STAGING_DIR, guest, name)
    }

    async fn copy(&self, src: String, dest: String, label: &str) -> HvResult<()> {
        let args = self.scp_args(src, dest);
        let status = Command::new("scp")
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| HvError::command("host", label, format!("failed to spawn scp: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(HvError::command(
                "host",
                label,
                format!("scp exited with {}", status.code().unwrap_or(-1)),
            ))
        }
    }

    async fn relay_copy(&self, guest: &str, direction: CopyDirection, src: &str, dest: &str) -> HvResult<()> {
        let command = render::relay_copy(&self.relay, guest, direction, src, dest);
        self.run(&Target::Host, &command, ".", Duration::from_secs(RELAY_GRACE_SECS * 10))
            .await?
            .ensure_success(&Target::Host, &command)?;
        Ok(())
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn local_str(path: &Path) -> HvResult<&str> {
    path.to_str()
        .ok_or_else(|| HvError::Config(format!("path is not valid UTF-8: {}", path.display())))
}

#[async_trait::async_trait]
impl CommandChannel for SshChannel {
    async fn run(
        &self,
        target: &Target,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> HvResult<CommandOutput> {
        let remote = self.remote_command(target, command, cwd, timeout);
        let deadline = match target {
            Target::Host => timeout,
            Target::Guest { .. } => timeout + Duration::from_secs(RELAY_GRACE_SECS),
        };

        tracing::debug!(on = %target, command, timeout_secs = timeout.as_secs(), "Running command");

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(&remote))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Err(_) => {
                return Err(HvError::command(
                    target,
                    command,
                    format!("timed out after {}s", deadline.as_secs()),
                ));
            }
            Ok(Err(e)) => {
                return Err(HvError::command(
                    target,
                    command,
                    format!("failed to spawn ssh: {}", e),
                ));
            }
            Ok(Ok(output)) => output,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code == SSH_TRANSPORT_FAILURE {
            return Err(HvError::command(target, command, stderr.trim()));
        }

        let stdout = match target {
            Target::Host => stdout,
            Target::Guest { name, .. } => {
                if TOOLING_MARKERS
                    .iter()
                    .any(|m| stdout.contains(m) || stderr.contains(m))
                {
                    return Err(HvError::ToolingNotReady(name.clone()));
                }
                render::strip_relay_banner(&stdout)
            }
        };

        tracing::trace!(on = %target, exit_code, "Command finished");
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn run_async(&self, target: &Target, command: &str) -> HvResult<()> {
        let remote = match target {
            Target::Host => format!("nohup sh -c '{}' > /dev/null 2>&1 &", command.replace('\'', "'\\''")),
            Target::Guest { name, os } => render::relay_invocation(
                &self.relay,
                name,
                DETACHED_RELAY_TIMEOUT_SECS,
                &render::guest_command(*os, command, ".", true),
            ),
        };

        tracing::debug!(on = %target, command, "Dispatching detached command");

        let mut child = Command::new("ssh")
            .args(self.ssh_args(&remote))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HvError::command(target, command, format!("failed to spawn ssh: {}", e)))?;

        // Reap the ssh process in the background; nobody observes its outcome.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileTransfer for SshChannel {
    async fn upload(&self, guest: &str, local: &Path, remote: &str) -> HvResult<()> {
        let staged = Self::staging_path(guest, file_name(local_str(local)?));
        self.copy(
            local_str(local)?.to_string(),
            self.host_path(&staged),
            "upload to host staging",
        )
        .await?;
        self.relay_copy(guest, CopyDirection::ToGuest, &staged, remote).await
    }

    async fn download(&self, guest: &str, remote: &str, local: &Path) -> HvResult<()> {
        let staged = Self::staging_path(guest, file_name(remote));
        self.relay_copy(guest, CopyDirection::FromGuest, remote, &staged)
            .await?;
        self.copy(
            self.host_path(&staged),
            local_str(local)?.to_string(),
            "download from host staging",
        )
        .await
    }
}
