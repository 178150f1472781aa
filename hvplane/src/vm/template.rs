//! Guest files materialized from a template directory.
//!
//! A template directory `<dir>/<tpl>` holds `<tpl>.vmx`, `<tpl>.vmdk` and
//! friends. Cloning copies each file under the guest's name, drops the
//! directives tied to the host that built the template, and rewrites
//! references to the template's file names.

use hvplane_shared::errors::{HvError, HvResult};

use super::{Guest, LifecycleState, OsFamily, VmController, lifecycle};
use crate::accel::attach;
use crate::runtime::constants::datastore::{HOST_UNIQUE_KEYS, TEMPLATE_FILES};
use crate::runtime::layout::template_name;
use crate::vmx::{self, DirectiveSet};

/// Point quoted file references at the guest's files instead of the template's.
fn rename_references(text: &str, template: &str, guest: &str) -> String {
    text.replace(&format!("\"{}.", template), &format!("\"{}.", guest))
        .replace(&format!("\"{}-", template), &format!("\"{}-", guest))
}

async fn materialize(
    ctrl: &VmController,
    name: &str,
    template_dir: &str,
    os: OsFamily,
) -> HvResult<()> {
    let template_dir = template_dir.trim_end_matches('/');
    let template = template_name(template_dir);
    let guest_dir = ctrl.layout.guest_dir(name);

    tracing::info!(guest = %name, template, "Materializing guest files from template");
    ctrl.files.remove_dir(&guest_dir).await?;
    ctrl.files.make_dir(&guest_dir).await?;

    for (suffix, required) in TEMPLATE_FILES {
        let src = format!("{}/{}{}", template_dir, template, suffix);
        if !ctrl.files.exists(&src).await? {
            if *required {
                return Err(HvError::NotFound(format!("template file {}", src)));
            }
            tracing::debug!(src = %src, "Optional template file absent, skipped");
            continue;
        }
        ctrl.files.copy(&src, &ctrl.layout.guest_file(name, suffix)).await?;
    }

    let vmx_path = ctrl.layout.vmx_path(name);
    let text = ctrl.files.read(&vmx_path).await?;
    let text = rename_references(&vmx::strip_keys(&text, HOST_UNIQUE_KEYS), template, name);
    let text = DirectiveSet::new()
        .with("displayName", name)
        .with("guestOS", os.guest_os_type())
        .apply_to(&text)?;
    ctrl.files.write(&vmx_path, &text).await?;

    let disk_path = ctrl.layout.guest_file(name, ".vmdk");
    let descriptor = ctrl.files.read(&disk_path).await?;
    ctrl.files
        .write(&disk_path, &rename_references(&descriptor, template, name))
        .await?;
    Ok(())
}

pub(super) async fn clone_guest(
    ctrl: &VmController,
    name: &str,
    template_dir: &str,
    os_hint: Option<&str>,
) -> HvResult<Guest> {
    let os = OsFamily::resolve(name, os_hint)?;
    if let Some(guest) = ctrl.current(name).await? {
        return Err(HvError::invalid_state(name, guest.state, "clone over"));
    }
    materialize(ctrl, name, template_dir, os).await?;
    lifecycle::define(ctrl, name, os_hint).await
}

pub(super) async fn create_from_template(
    ctrl: &VmController,
    name: &str,
    template_dir: &str,
    memory_mb: u64,
    os_hint: Option<&str>,
) -> HvResult<Guest> {
    let os = OsFamily::resolve(name, os_hint)?;

    if let Some(guest) = ctrl.current(name).await? {
        if guest.state == LifecycleState::Running {
            return Err(HvError::invalid_state(name, guest.state, "recreate"));
        }
        tracing::info!(guest = %name, state = %guest.state, "Replacing existing guest");
        lifecycle::undefine(ctrl, name).await?;
    }
    lifecycle::remove_files(ctrl, name).await?;

    materialize(ctrl, name, template_dir, os).await?;
    ctrl.editor
        .apply(name, &attach::memory_size(memory_mb))
        .await?;
    let guest = lifecycle::define(ctrl, name, os_hint).await?;
    tracing::info!(guest = %name, memory_mb, "Created guest from template");
    Ok(guest)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::accel::{AcceleratorPool, KindTable};
    use crate::testing::{FakeHost, Power};
    use crate::vm::tests::controller;

    const TEMPLATE: &str = "/ds/templates/centos8_tpl";

    #[test]
    fn test_rename_references() {
        let text = "nvram = \"tpl.nvram\"\nRW 8 VMFS \"tpl-flat.vmdk\"\nnote = \"my tpl.\"\n";
        assert_eq!(
            rename_references(text, "tpl", "g1"),
            "nvram = \"g1.nvram\"\nRW 8 VMFS \"g1-flat.vmdk\"\nnote = \"my tpl.\"\n"
        );
    }

    #[tokio::test]
    async fn test_clone_materializes_and_defines() {
        let host = Arc::new(FakeHost::new());
        host.add_template(TEMPLATE);
        let ctrl = controller(&host);

        let guest = ctrl.clone_guest("centos_acce0", TEMPLATE, None).await.unwrap();
        assert_eq!(guest.state, LifecycleState::Defined);
        assert_eq!(host.power_of("centos_acce0"), Some(Power::Off));

        let vmx = host.file("/ds/centos_acce0/centos_acce0.vmx").unwrap();
        assert!(vmx.contains("displayName = \"centos_acce0\""));
        assert!(vmx.contains("guestOS = \"centos8-64\""));
        assert!(vmx.contains("nvram = \"centos_acce0.nvram\""));
        assert!(vmx.contains("memSize = \"1024\""));
        assert!(!vmx.contains("uuid.bios"));
        assert!(!vmx.contains("sched.swap.derivedName"));

        let vmdk = host.file("/ds/centos_acce0/centos_acce0.vmdk").unwrap();
        assert!(vmdk.contains("\"centos_acce0-flat.vmdk\""));
        assert!(host.file("/ds/centos_acce0/centos_acce0-flat.vmdk").is_some());
        assert!(host.file("/ds/centos_acce0/centos_acce0.vmsd").is_none());
    }

    #[tokio::test]
    async fn test_clone_missing_template() {
        let host = Arc::new(FakeHost::new());
        let ctrl = controller(&host);

        let err = ctrl
            .clone_guest("centos_acce0", TEMPLATE, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HvError::NotFound(_)));
        assert!(!ctrl.exists("centos_acce0").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_sets_memory() {
        let host = Arc::new(FakeHost::new());
        host.add_template(TEMPLATE);
        let ctrl = controller(&host);

        ctrl.create_from_template("centos_acce0", TEMPLATE, 2048, None)
            .await
            .unwrap();
        let vmx = host.file("/ds/centos_acce0/centos_acce0.vmx").unwrap();
        assert!(vmx.contains("memSize = \"2048\""));
        assert_eq!(vmx.matches("memSize").count(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_stale_guest() {
        let host = Arc::new(FakeHost::new());
        host.add_template(TEMPLATE);
        let ctrl = controller(&host);
        host.add_guest("centos_acce0", Power::Suspended);
        host.put_file("/ds/centos_acce0/stale.log", "old");

        ctrl.create_from_template("centos_acce0", TEMPLATE, 4096, None)
            .await
            .unwrap();
        assert!(host.file("/ds/centos_acce0/stale.log").is_none());
        assert_eq!(ctrl.list_host_guests().await.unwrap().len(), 1);
        assert_eq!(ctrl.state("centos_acce0").unwrap(), LifecycleState::Defined);
    }

    #[tokio::test]
    async fn test_create_refuses_running_guest() {
        let host = Arc::new(FakeHost::new());
        host.add_template(TEMPLATE);
        let ctrl = controller(&host);
        host.add_guest("centos_acce0", Power::On);

        let err = ctrl
            .create_from_template("centos_acce0", TEMPLATE, 2048, None)
            .await
            .unwrap_err();
        assert!(err.is_state_error());
        assert_eq!(host.power_of("centos_acce0"), Some(Power::On));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_needs_guest_powered_off() {
        let host = Arc::new(FakeHost::new());
        host.add_template(TEMPLATE);
        host.add_pfs("4940", Some("4941"), 8);
        let ctrl = controller(&host);
        let pool = AcceleratorPool::new(
            host.clone(),
            ctrl.registry().clone(),
            ctrl.editor().clone(),
            KindTable::default(),
            None,
            std::time::Duration::from_secs(5),
        );

        ctrl.create_from_template("centos_acce0", TEMPLATE, 2048, None)
            .await
            .unwrap();
        ctrl.start("centos_acce0", 300).await.unwrap();
        let vfs = pool.create_vfs("qat", 0, 1).await.unwrap();

        let err = pool
            .attach_vf("centos_acce0", "qat", &vfs[0], 0)
            .await
            .unwrap_err();
        assert!(err.is_state_error());

        ctrl.shutdown("centos_acce0", 60).await.unwrap();
        pool.attach_vf("centos_acce0", "qat", &vfs[0], 0)
            .await
            .unwrap();
        ctrl.start("centos_acce0", 300).await.unwrap();
        assert!(ctrl.is_running("centos_acce0").await.unwrap());

        let vmx = host.file("/ds/centos_acce0/centos_acce0.vmx").unwrap();
        assert!(vmx.contains("pciPassthru0.deviceId = \"0x4941\""));
    }
}
