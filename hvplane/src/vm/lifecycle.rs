//! Guest state transitions.
//!
//! Each transition checks the recorded state, issues the host command, and
//! records the new state once the host accepted it. Transitions that end
//! with the guest running wait for a liveness probe inside the remaining
//! time budget.

use hvplane_shared::errors::{HvError, HvResult};
use tokio::time::Instant;

use super::host::{self, PowerOp};
use super::{Guest, LifecycleState, OsFamily, VmController};
use crate::channel::Target;

fn remaining_secs(started: Instant, timeout_secs: u64) -> u64 {
    timeout_secs.saturating_sub(started.elapsed().as_secs())
}

async fn existing(ctrl: &VmController, name: &str, operation: &str) -> HvResult<Guest> {
    ctrl.current(name)
        .await?
        .ok_or_else(|| HvError::invalid_state(name, LifecycleState::Undefined, operation))
}

async fn power(ctrl: &VmController, name: &str, op: PowerOp) -> HvResult<()> {
    let id = ctrl.guest_id(name).await?;
    ctrl.host(&host::power(op, &id)).await?;
    tracing::debug!(guest = %name, op = op.as_str(), "Power operation accepted");
    Ok(())
}

pub(super) async fn define(
    ctrl: &VmController,
    name: &str,
    os_hint: Option<&str>,
) -> HvResult<Guest> {
    let os = OsFamily::resolve(name, os_hint)?;
    let state = match ctrl.registry.get(name)? {
        Some(guest) => guest.state,
        None => ctrl.power_state(name).await?,
    };
    if state != LifecycleState::Undefined {
        return Err(HvError::invalid_state(name, state, "define"));
    }

    let vmx = ctrl.layout.vmx_path(name);
    if !ctrl.files.exists(&vmx).await? {
        return Err(HvError::NotFound(format!("guest configuration {}", vmx)));
    }

    ctrl.host(&host::register(&vmx)).await?;
    let guest = Guest::new(name, os, LifecycleState::Defined);
    ctrl.registry.register(guest.clone())?;
    tracing::info!(guest = %name, os = %os, "Defined guest");
    Ok(guest)
}

pub(super) async fn start(ctrl: &VmController, name: &str, timeout_secs: u64) -> HvResult<()> {
    let started = Instant::now();
    let guest = existing(ctrl, name, "start").await?;

    match guest.state {
        LifecycleState::Running => {
            tracing::info!(guest = %name, "Already running, nothing to start");
            return Ok(());
        }
        state if state.can_start() => {}
        state => return Err(HvError::invalid_state(name, state, "start")),
    }

    power(ctrl, name, PowerOp::On).await?;
    ctrl.registry.update_state(name, LifecycleState::Running)?;

    ctrl.wait_until_live(&guest, remaining_secs(started, timeout_secs))
        .await?;
    tracing::info!(
        guest = %name,
        elapsed_secs = started.elapsed().as_secs(),
        "Guest started"
    );
    Ok(())
}

pub(super) async fn shutdown(ctrl: &VmController, name: &str, timeout_secs: u64) -> HvResult<()> {
    let guest = existing(ctrl, name, "shut down").await?;

    match guest.state {
        LifecycleState::Defined => {
            tracing::info!(guest = %name, "Already powered off, nothing to shut down");
            return Ok(());
        }
        LifecycleState::Running => {}
        state => return Err(HvError::invalid_state(name, state, "shut down")),
    }

    power(ctrl, name, PowerOp::Shutdown).await?;
    ctrl.wait_for_power(name, LifecycleState::Defined, timeout_secs)
        .await?;
    ctrl.registry.update_state(name, LifecycleState::Defined)?;
    tracing::info!(guest = %name, "Guest shut down");
    Ok(())
}

pub(super) async fn suspend(ctrl: &VmController, name: &str) -> HvResult<()> {
    let guest = existing(ctrl, name, "suspend").await?;

    match guest.state {
        LifecycleState::Suspended => return Ok(()),
        LifecycleState::Running => {}
        state => return Err(HvError::invalid_state(name, state, "suspend")),
    }

    power(ctrl, name, PowerOp::Suspend).await?;
    ctrl.wait_for_power(name, LifecycleState::Suspended, ctrl.timeouts.suspend_secs)
        .await?;
    ctrl.registry.update_state(name, LifecycleState::Suspended)?;
    tracing::info!(guest = %name, "Guest suspended");
    Ok(())
}

pub(super) async fn resume(ctrl: &VmController, name: &str, timeout_secs: u64) -> HvResult<()> {
    let started = Instant::now();
    let guest = existing(ctrl, name, "resume").await?;

    match guest.state {
        LifecycleState::Running => return Ok(()),
        LifecycleState::Suspended => {}
        state => return Err(HvError::invalid_state(name, state, "resume")),
    }

    power(ctrl, name, PowerOp::On).await?;
    ctrl.registry.update_state(name, LifecycleState::Running)?;
    ctrl.wait_until_live(&guest, remaining_secs(started, timeout_secs))
        .await?;
    tracing::info!(guest = %name, "Guest resumed");
    Ok(())
}

/// Reset or reboot through the host, then wait for the guest to come back.
pub(super) async fn restart(
    ctrl: &VmController,
    name: &str,
    op: PowerOp,
    timeout_secs: u64,
) -> HvResult<()> {
    let started = Instant::now();
    let guest = ctrl.require_running(name, op.as_str()).await?;

    power(ctrl, name, op).await?;
    // The guest may still answer probes before it goes down.
    tokio::time::sleep(ctrl.waiter.interval()).await;
    ctrl.wait_until_live(&guest, remaining_secs(started, timeout_secs))
        .await?;
    tracing::info!(guest = %name, op = op.as_str(), "Guest restarted");
    Ok(())
}

pub(super) async fn warm_reboot(ctrl: &VmController, name: &str, timeout_secs: u64) -> HvResult<()> {
    let started = Instant::now();
    let guest = ctrl.require_running(name, "warm reboot").await?;

    ctrl.channel
        .run_async(&Target::guest(&guest.name, guest.os), guest.os.reboot_command())
        .await?;
    tokio::time::sleep(ctrl.waiter.interval()).await;
    ctrl.wait_until_live(&guest, remaining_secs(started, timeout_secs))
        .await?;
    tracing::info!(guest = %name, "Guest warm rebooted");
    Ok(())
}

pub(super) async fn undefine(ctrl: &VmController, name: &str) -> HvResult<()> {
    let Some(guest) = ctrl.current(name).await? else {
        tracing::debug!(guest = %name, "Not defined, nothing to undefine");
        return Ok(());
    };

    match guest.state {
        LifecycleState::Running => {
            shutdown(ctrl, name, ctrl.timeouts.shutdown_secs).await?;
        }
        LifecycleState::Suspended => {
            power(ctrl, name, PowerOp::Off).await?;
            ctrl.registry.update_state(name, LifecycleState::Defined)?;
        }
        LifecycleState::Defined | LifecycleState::Undefined => {}
    }

    match ctrl.find_id(name).await? {
        Some(id) => {
            ctrl.host(&host::unregister(&id)).await?;
        }
        None => {
            tracing::warn!(guest = %name, "Guest already gone from host inventory");
        }
    }
    ctrl.registry.remove(name)?;
    tracing::info!(guest = %name, "Undefined guest");
    Ok(())
}

pub(super) async fn remove_files(ctrl: &VmController, name: &str) -> HvResult<()> {
    if let Some(guest) = ctrl.current(name).await? {
        return Err(HvError::invalid_state(name, guest.state, "remove files of"));
    }
    let dir = ctrl.layout.guest_dir(name);
    ctrl.files.remove_dir(&dir).await?;
    tracing::info!(guest = %name, dir = %dir, "Removed guest files");
    Ok(())
}
