//! Guest virtual machines.
//!
//! ## Architecture
//!
//! - `os`, `state`: closed enums for OS family and lifecycle state
//! - `manager`: [`VmRegistry`], the recorded state of every known guest
//! - `host`: host command builders and output parsers
//! - `lifecycle`: state transitions (start/shutdown/suspend/...)
//! - `template`: guest file materialization from a template directory
//!
//! [`VmController`] ties these together. Recorded state changes only after
//! the host confirmed the transition.

pub mod host;
mod lifecycle;
pub mod manager;
pub mod os;
pub mod state;
mod template;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};

use crate::accel::attach;
use crate::channel::{CommandChannel, CommandOutput, FileTransfer, HostFiles, Target};
use crate::runtime::constants::guest::LIVENESS_PROBE;
use crate::runtime::layout::DatastoreLayout;
use crate::runtime::options::Timeouts;
use crate::util::RetryWaiter;
use crate::vmx::GuestConfigEditor;

pub use host::{HostGuest, PowerOp};
pub use manager::{Guest, VmRegistry};
pub use os::OsFamily;
pub use state::LifecycleState;

/// Drives guests through their lifecycle on one host.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Callers must
/// not run two transitions for the same guest concurrently.
pub struct VmController {
    channel: Arc<dyn CommandChannel>,
    transfer: Option<Arc<dyn FileTransfer>>,
    registry: VmRegistry,
    waiter: RetryWaiter,
    files: HostFiles,
    editor: GuestConfigEditor,
    layout: DatastoreLayout,
    timeouts: Timeouts,
}

impl VmController {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        transfer: Option<Arc<dyn FileTransfer>>,
        registry: VmRegistry,
        waiter: RetryWaiter,
        layout: DatastoreLayout,
        timeouts: Timeouts,
    ) -> Self {
        let files = HostFiles::new(channel.clone(), timeouts.command(), timeouts.transfer());
        let editor = GuestConfigEditor::new(files.clone(), layout.clone());
        Self {
            channel,
            transfer,
            registry,
            waiter,
            files,
            editor,
            layout,
            timeouts,
        }
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    pub fn waiter(&self) -> &RetryWaiter {
        &self.waiter
    }

    pub fn editor(&self) -> &GuestConfigEditor {
        &self.editor
    }

    pub fn layout(&self) -> &DatastoreLayout {
        &self.layout
    }

    // ========================================================================
    // Host inventory
    // ========================================================================

    async fn host(&self, command: &str) -> HvResult<CommandOutput> {
        self.channel
            .run(&Target::Host, command, ".", self.timeouts.command())
            .await?
            .ensure_success(&Target::Host, command)
    }

    /// Guests registered with the host, whether or not this instance knows them.
    pub async fn list_host_guests(&self) -> HvResult<Vec<HostGuest>> {
        let output = self.host(host::LIST_GUESTS).await?;
        Ok(host::parse_guest_list(&output.stdout))
    }

    async fn find_id(&self, name: &str) -> HvResult<Option<String>> {
        Ok(self
            .list_host_guests()
            .await?
            .into_iter()
            .find(|g| g.name == name)
            .map(|g| g.id))
    }

    /// Host-assigned id of `name`.
    pub async fn guest_id(&self, name: &str) -> HvResult<String> {
        self.find_id(name)
            .await?
            .ok_or_else(|| HvError::NotFound(format!("guest {} on host", name)))
    }

    pub async fn exists(&self, name: &str) -> HvResult<bool> {
        Ok(self.find_id(name).await?.is_some())
    }

    /// Power state as reported by the host; `Undefined` when not registered there.
    pub async fn power_state(&self, name: &str) -> HvResult<LifecycleState> {
        let Some(id) = self.find_id(name).await? else {
            return Ok(LifecycleState::Undefined);
        };
        let output = self.host(&host::power(PowerOp::GetState, &id)).await?;
        host::parse_power_state(&output.stdout)
    }

    /// Asks the host, not the registry.
    pub async fn is_running(&self, name: &str) -> HvResult<bool> {
        Ok(self.power_state(name).await?.is_running())
    }

    /// Recorded state of `name`.
    pub fn state(&self, name: &str) -> HvResult<LifecycleState> {
        self.registry.state(name)
    }

    /// The recorded guest, adopting it from the host when this instance
    /// has not seen it yet. `None` when neither knows it.
    pub async fn current(&self, name: &str) -> HvResult<Option<Guest>> {
        if let Some(guest) = self.registry.get(name)? {
            return Ok(Some(guest));
        }

        let state = self.power_state(name).await?;
        if state == LifecycleState::Undefined {
            return Ok(None);
        }

        let os = self.adopted_os(name).await;
        let guest = Guest::new(name, os, state);
        self.registry.register(guest.clone())?;
        tracing::info!(guest = %name, state = %state, "Adopted guest from host inventory");
        Ok(Some(guest))
    }

    /// OS family of a guest this instance did not create: the name first,
    /// then the `guestOS` directive of its configuration, then linux.
    async fn adopted_os(&self, name: &str) -> OsFamily {
        if let Ok(os) = OsFamily::infer(name) {
            return os;
        }
        let declared = match self.editor.read(name).await {
            Ok(config) => config.get("guestOS").map(String::from),
            Err(e) => {
                tracing::debug!(guest = %name, error = %e, "Guest configuration unreadable");
                None
            }
        };
        match declared.as_deref().map(OsFamily::infer) {
            Some(Ok(os)) => os,
            _ => {
                tracing::warn!(guest = %name, guest_os = ?declared, "Assuming linux for adopted guest");
                OsFamily::Linux
            }
        }
    }

    async fn require_state(
        &self,
        name: &str,
        operation: &str,
        allowed: impl Fn(LifecycleState) -> bool,
    ) -> HvResult<Guest> {
        match self.current(name).await? {
            Some(guest) if allowed(guest.state) => Ok(guest),
            Some(guest) => Err(HvError::invalid_state(name, guest.state, operation)),
            None => Err(HvError::invalid_state(name, LifecycleState::Undefined, operation)),
        }
    }

    async fn require_running(&self, name: &str, operation: &str) -> HvResult<Guest> {
        self.require_state(name, operation, |s| s.is_running()).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Materialize `name` from `template_dir`, size its memory, and define it.
    ///
    /// A stale guest of the same name is undefined and its files removed first.
    ///
    /// # Errors
    ///
    /// [`HvError::InvalidState`] if `name` is currently running.
    pub async fn create_from_template(
        &self,
        name: &str,
        template_dir: &str,
        memory_mb: u64,
        os_hint: Option<&str>,
    ) -> HvResult<Guest> {
        template::create_from_template(self, name, template_dir, memory_mb, os_hint).await
    }

    /// Materialize `name` from `template_dir` and define it, keeping the
    /// template's memory size.
    pub async fn clone_guest(
        &self,
        name: &str,
        template_dir: &str,
        os_hint: Option<&str>,
    ) -> HvResult<Guest> {
        template::clone_guest(self, name, template_dir, os_hint).await
    }

    /// Register previously materialized guest files with the host.
    pub async fn define(&self, name: &str, os_hint: Option<&str>) -> HvResult<Guest> {
        lifecycle::define(self, name, os_hint).await
    }

    /// Power on and wait until the guest OS answers a liveness probe.
    ///
    /// Already running guests are left alone.
    pub async fn start(&self, name: &str, timeout_secs: u64) -> HvResult<()> {
        lifecycle::start(self, name, timeout_secs).await
    }

    /// Request a graceful guest shutdown and wait for the host to report it off.
    pub async fn shutdown(&self, name: &str, timeout_secs: u64) -> HvResult<()> {
        lifecycle::shutdown(self, name, timeout_secs).await
    }

    pub async fn suspend(&self, name: &str) -> HvResult<()> {
        lifecycle::suspend(self, name).await
    }

    pub async fn resume(&self, name: &str, timeout_secs: u64) -> HvResult<()> {
        lifecycle::resume(self, name, timeout_secs).await
    }

    /// Power-level reset.
    pub async fn reset(&self, name: &str, timeout_secs: u64) -> HvResult<()> {
        lifecycle::restart(self, name, PowerOp::Reset, timeout_secs).await
    }

    /// Reboot requested through the host's guest tooling.
    pub async fn reboot(&self, name: &str, timeout_secs: u64) -> HvResult<()> {
        lifecycle::restart(self, name, PowerOp::Reboot, timeout_secs).await
    }

    /// Reboot issued from inside the guest.
    pub async fn warm_reboot(&self, name: &str, timeout_secs: u64) -> HvResult<()> {
        lifecycle::warm_reboot(self, name, timeout_secs).await
    }

    /// Unregister from the host, shutting the guest down first when running.
    /// Unknown guests are a no-op.
    pub async fn undefine(&self, name: &str) -> HvResult<()> {
        lifecycle::undefine(self, name).await
    }

    /// Delete the guest's directory from the datastore.
    pub async fn remove_files(&self, name: &str) -> HvResult<()> {
        lifecycle::remove_files(self, name).await
    }

    // ========================================================================
    // Guest execution
    // ========================================================================

    /// Run `command` inside a running guest and wait for it.
    ///
    /// A nonzero exit code is returned, not raised.
    pub async fn execute(
        &self,
        name: &str,
        command: &str,
        cwd: &str,
        timeout_secs: u64,
    ) -> HvResult<CommandOutput> {
        let guest = self.require_running(name, "execute a command on").await?;
        let timeout = Duration::from_secs(self.waiter.scale_secs(timeout_secs));
        tracing::debug!(guest = %name, command, cwd, "Executing guest command");
        self.channel
            .run(&Target::guest(&guest.name, guest.os), command, cwd, timeout)
            .await
    }

    /// Dispatch `command` inside a running guest without waiting.
    pub async fn execute_async(&self, name: &str, command: &str) -> HvResult<()> {
        let guest = self.require_running(name, "execute a command on").await?;
        self.channel
            .run_async(&Target::guest(&guest.name, guest.os), command)
            .await
    }

    fn transfer(&self) -> HvResult<&Arc<dyn FileTransfer>> {
        self.transfer
            .as_ref()
            .ok_or_else(|| HvError::Config("no file transfer configured".into()))
    }

    pub async fn upload(&self, name: &str, local: &Path, remote: &str) -> HvResult<()> {
        self.require_running(name, "upload to").await?;
        self.transfer()?.upload(name, local, remote).await?;
        tracing::info!(guest = %name, local = %local.display(), remote, "Uploaded file");
        Ok(())
    }

    pub async fn download(&self, name: &str, remote: &str, local: &Path) -> HvResult<()> {
        self.require_running(name, "download from").await?;
        self.transfer()?.download(name, remote, local).await?;
        tracing::info!(guest = %name, remote, local = %local.display(), "Downloaded file");
        Ok(())
    }

    // ========================================================================
    // Snapshots and configuration
    // ========================================================================

    pub async fn create_snapshot(&self, name: &str, snapshot: &str) -> HvResult<()> {
        let id = self.guest_id(name).await?;
        self.host(&host::snapshot_create(&id, snapshot)).await?;
        tracing::info!(guest = %name, snapshot, "Created snapshot");
        Ok(())
    }

    /// Revert to `snapshot_id` and re-read the power state the snapshot left behind.
    pub async fn revert_snapshot(&self, name: &str, snapshot_id: &str) -> HvResult<()> {
        let id = self.guest_id(name).await?;
        self.host(&host::snapshot_revert(&id, snapshot_id)).await?;
        let state = self.power_state(name).await?;
        if self.registry.get(name)?.is_some() {
            self.registry.update_state(name, state)?;
        }
        tracing::info!(guest = %name, snapshot_id, state = %state, "Reverted snapshot");
        Ok(())
    }

    pub async fn remove_all_snapshots(&self, name: &str) -> HvResult<()> {
        let id = self.guest_id(name).await?;
        self.host(&host::snapshot_remove_all(&id)).await?;
        tracing::info!(guest = %name, "Removed all snapshots");
        Ok(())
    }

    /// Fully reserve and pin `memory_mb` of guest memory, as passthrough requires.
    pub async fn reserve_memory(&self, name: &str, memory_mb: u64) -> HvResult<()> {
        self.require_state(name, "reserve memory for", |s| s.can_attach())
            .await?;
        self.editor
            .apply(name, &attach::memory_reservation(memory_mb))
            .await?;
        tracing::info!(guest = %name, memory_mb, "Reserved guest memory");
        Ok(())
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// One liveness probe. Any answer counts, whatever its exit code.
    async fn probe(&self, guest: &Guest) -> HvResult<bool> {
        self.channel
            .run(
                &Target::guest(&guest.name, guest.os),
                LIVENESS_PROBE,
                ".",
                self.timeouts.probe(),
            )
            .await?;
        Ok(true)
    }

    async fn wait_until_live(&self, guest: &Guest, timeout_secs: u64) -> HvResult<()> {
        let this = self;
        let description = format!("guest {} to answer a liveness probe", guest.name);
        self.waiter
            .wait_for(&description, timeout_secs, move || this.probe(guest))
            .await
    }

    async fn wait_for_power(
        &self,
        name: &str,
        expected: LifecycleState,
        timeout_secs: u64,
    ) -> HvResult<()> {
        let this = self;
        let description = format!("guest {} to report {}", name, expected);
        self.waiter
            .wait_for(&description, timeout_secs, move || async move {
                let state = this.power_state(name).await?;
                Ok::<_, HvError>(state == expected)
            })
            .await
    }
}
