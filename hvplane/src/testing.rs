//! In-memory hypervisor host for unit tests.
//!
//! Interprets the closed set of host and guest commands the control plane
//! issues and keeps a small inventory: registered guests and their power
//! state, host files, PCI devices and passthrough toggles.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};
use parking_lot::Mutex;

use crate::accel::PciAddress;
use crate::channel::{CommandChannel, CommandOutput, FileTransfer, Target};
use crate::runtime::constants::datastore::WRITE_DELIMITER;
use crate::runtime::constants::guest::LIVENESS_PROBE;
use crate::vm::host::LIST_GUESTS;
use crate::vmx::DirectiveSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Power {
    Off,
    On,
    Suspended,
}

#[derive(Debug, Clone)]
struct FakeGuest {
    name: String,
    power: Power,
}

#[derive(Debug, Clone)]
struct FakeDevice {
    address: PciAddress,
    device_id: String,
    /// VF device id spawned by this PF, when it supports SR-IOV.
    vf_device_id: Option<String>,
    /// Owning PF for VFs.
    parent: Option<PciAddress>,
}

#[derive(Default)]
struct FakeState {
    next_id: u32,
    next_bus: u8,
    sockets: u32,
    guests: BTreeMap<u32, FakeGuest>,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    devices: Vec<FakeDevice>,
    passthrough: BTreeSet<PciAddress>,
    vf_shortfall: usize,
    sriov_stderr: Option<String>,
    snapshots: BTreeMap<u32, Vec<String>>,
    unresponsive: HashSet<String>,
    failing: HashSet<String>,
    stalled: HashMap<String, Duration>,
    guest_files: BTreeMap<(String, String), Vec<u8>>,
    host_log: Vec<String>,
    guest_log: Vec<(String, String)>,
    detached: Vec<(String, String)>,
}

pub(crate) struct FakeHost {
    state: Mutex<FakeState>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

/// Exit zero with a complaint on stderr, as the host's SR-IOV tooling does.
fn warn(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn fail(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Arguments in single quotes, honouring the `'\''` escape.
fn quoted_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut arg = String::new();
        loop {
            match chars.next() {
                Some('\'') => {
                    let rest: String = chars.clone().take(3).collect();
                    if rest == "\\''" {
                        chars.nth(2);
                        arg.push('\'');
                    } else {
                        break;
                    }
                }
                Some(c) => arg.push(c),
                None => break,
            }
        }
        args.push(arg);
    }
    args
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 1,
                next_bus: 0x6b,
                sockets: 2,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn set_sockets(&self, sockets: u32) {
        self.state.lock().sockets = sockets;
    }

    /// Add `count` PFs with `pf_id`, each on its own bus.
    pub(crate) fn add_pfs(&self, pf_id: &str, vf_id: Option<&str>, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            let bus = state.next_bus;
            state.next_bus = state.next_bus.wrapping_add(2);
            state.devices.push(FakeDevice {
                address: PciAddress {
                    segment: 0,
                    bus,
                    device: 0,
                    function: 0,
                },
                device_id: pf_id.to_string(),
                vf_device_id: vf_id.map(String::from),
                parent: None,
            });
        }
    }

    /// Create this many fewer VFs than requested.
    pub(crate) fn set_vf_shortfall(&self, shortfall: usize) {
        self.state.lock().vf_shortfall = shortfall;
    }

    /// SR-IOV requests succeed with this text on stderr.
    pub(crate) fn set_sriov_stderr(&self, stderr: &str) {
        self.state.lock().sriov_stderr = Some(stderr.to_string());
    }

    pub(crate) fn put_file(&self, path: &str, contents: &str) {
        let mut state = self.state.lock();
        if let Some((dir, _)) = path.rsplit_once('/') {
            state.dirs.insert(dir.to_string());
        }
        state.files.insert(path.to_string(), contents.to_string());
    }

    pub(crate) fn file(&self, path: &str) -> Option<String> {
        self.state.lock().files.get(path).cloned()
    }

    /// Populate a template directory with the files a clone copies.
    pub(crate) fn add_template(&self, dir: &str) {
        let name = crate::runtime::layout::template_name(dir).to_string();
        let vmx = format!(
            "displayName = \"{name}\"\n\
             guestOS = \"winXPPro\"\n\
             memSize = \"1024\"\n\
             nvram = \"{name}.nvram\"\n\
             scsi0:0.fileName = \"{name}.vmdk\"\n\
             uuid.bios = \"56 4d 12\"\n\
             uuid.location = \"56 4d 34\"\n\
             sched.swap.derivedName = \"/vmfs/volumes/old/{name}.vswp\"\n"
        );
        let vmdk = format!("# Disk DescriptorFile\nRW 41943040 VMFS \"{name}-flat.vmdk\"\n");
        self.put_file(&format!("{dir}/{name}.vmx"), &vmx);
        self.put_file(&format!("{dir}/{name}.nvram"), "nvram");
        self.put_file(&format!("{dir}/{name}.vmdk"), &vmdk);
        self.put_file(&format!("{dir}/{name}-flat.vmdk"), "disk");
    }

    /// Register a guest with the host directly, bypassing the control plane.
    pub(crate) fn add_guest(&self, name: &str, power: Power) -> u32 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.guests.insert(
            id,
            FakeGuest {
                name: name.to_string(),
                power,
            },
        );
        id
    }

    pub(crate) fn power_of(&self, name: &str) -> Option<Power> {
        self.state
            .lock()
            .guests
            .values()
            .find(|g| g.name == name)
            .map(|g| g.power)
    }

    /// Force a guest's power state, as if changed outside the control plane.
    pub(crate) fn set_power(&self, name: &str, power: Power) {
        let mut state = self.state.lock();
        if let Some(guest) = state.guests.values_mut().find(|g| g.name == name) {
            guest.power = power;
        }
    }

    /// The guest's agent never answers.
    pub(crate) fn set_unresponsive(&self, name: &str, unresponsive: bool) {
        let mut state = self.state.lock();
        if unresponsive {
            state.unresponsive.insert(name.to_string());
        } else {
            state.unresponsive.remove(name);
        }
    }

    /// Every guest command fails with a transport error.
    pub(crate) fn set_failing(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    /// Every guest command takes this long before answering.
    pub(crate) fn set_stalled(&self, name: &str, delay: Duration) {
        self.state.lock().stalled.insert(name.to_string(), delay);
    }

    pub(crate) fn host_commands(&self) -> Vec<String> {
        self.state.lock().host_log.clone()
    }

    pub(crate) fn guest_commands(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .guest_log
            .iter()
            .filter(|(g, _)| g == name)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn detached_commands(&self) -> Vec<(String, String)> {
        self.state.lock().detached.clone()
    }

    pub(crate) fn passthrough_enabled(&self, address: &PciAddress) -> bool {
        self.state.lock().passthrough.contains(address)
    }

    pub(crate) fn snapshots(&self, name: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .guests
            .iter()
            .find(|(_, g)| g.name == name)
            .and_then(|(id, _)| state.snapshots.get(id).cloned())
            .unwrap_or_default()
    }

    pub(crate) fn guest_file(&self, guest: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .guest_files
            .get(&(guest.to_string(), path.to_string()))
            .cloned()
    }

    pub(crate) fn put_guest_file(&self, guest: &str, path: &str, bytes: &[u8]) {
        self.state
            .lock()
            .guest_files
            .insert((guest.to_string(), path.to_string()), bytes.to_vec());
    }

    fn host_run(&self, command: &str) -> CommandOutput {
        let mut state = self.state.lock();
        state.host_log.push(command.to_string());

        if command.starts_with("cat > ") {
            return write_file(&mut state, command);
        }
        if command == LIST_GUESTS {
            let mut out = String::from("Vmid   Name   File   Guest OS   Version   Annotation\n");
            for (id, guest) in &state.guests {
                out.push_str(&format!(
                    "{}   {}   [datastore1] {}/{}.vmx   centos8_64Guest   vmx-19\n",
                    id, guest.name, guest.name, guest.name
                ));
            }
            return ok(out);
        }
        if let Some(rest) = command.strip_prefix("vim-cmd vmsvc/power.") {
            return power(&mut state, rest);
        }
        if let Some(id) = command.strip_prefix("vim-cmd vmsvc/unregister ") {
            return unregister(&mut state, id);
        }
        if let Some(path) = command.strip_prefix("vim-cmd solo/registervm ") {
            return register(&mut state, path);
        }
        if let Some(rest) = command.strip_prefix("vim-cmd vmsvc/snapshot.") {
            return snapshot(&mut state, rest);
        }
        if command.starts_with("esxcli hardware cpu global get") {
            return ok(format!("   CPU Packages: {}\n", state.sockets));
        }
        if command == "lspci -p" {
            let mut out = String::from("Segment:Bus:Dev.Fn Vend:Dvid Subv:Subd ISR/Pin Driver\n");
            let mut devices = state.devices.clone();
            devices.sort_by_key(|d| d.address);
            for d in devices {
                out.push_str(&format!(
                    "{} 8086:{} 8086:0000 255/   /     @ V\n",
                    d.address, d.device_id
                ));
            }
            return ok(out);
        }
        if command.starts_with("esxcli hardware pci sriov maxvfs set") {
            return set_vfs(&mut state, command);
        }
        if command.starts_with("esxcli hardware pci pcipassthru set") {
            let address = command
                .split_whitespace()
                .skip_while(|t| *t != "-d")
                .nth(1)
                .and_then(|t| t.parse::<PciAddress>().ok());
            return match address {
                Some(address) if state.devices.iter().any(|d| d.address == address) => {
                    state.passthrough.insert(address);
                    ok("")
                }
                _ => warn("Unable to find device"),
            };
        }
        if let Some(rest) = command.strip_prefix("cat ") {
            let args = quoted_args(rest);
            return match args.first().and_then(|p| state.files.get(p)) {
                Some(contents) => ok(contents.clone()),
                None => fail(1, "cat: No such file or directory"),
            };
        }
        if let Some(rest) = command.strip_prefix("cp ") {
            let args = quoted_args(rest);
            let (Some(src), Some(dest)) = (args.first(), args.get(1)) else {
                return fail(1, "cp: missing operand");
            };
            return match state.files.get(src).cloned() {
                Some(contents) => {
                    state.files.insert(dest.clone(), contents);
                    ok("")
                }
                None => fail(1, "cp: cannot stat"),
            };
        }
        if let Some(rest) = command.strip_prefix("mkdir -p ") {
            for dir in quoted_args(rest) {
                state.dirs.insert(dir);
            }
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("rm -rf ") {
            for target in quoted_args(rest) {
                let prefix = format!("{}/", target);
                state.files.retain(|p, _| p != &target && !p.starts_with(&prefix));
                state.dirs.retain(|d| d != &target && !d.starts_with(&prefix));
            }
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("test -e ") {
            let path = quoted_args(rest).into_iter().next().unwrap_or_default();
            let prefix = format!("{}/", path);
            let exists = state.files.contains_key(&path)
                || state.dirs.contains(&path)
                || state.files.keys().any(|p| p.starts_with(&prefix));
            return if exists { ok("") } else { fail(1, "") };
        }

        fail(127, format!("unknown command: {}", command))
    }
}

fn write_file(state: &mut FakeState, command: &str) -> CommandOutput {
    let Some((header, body)) = command.split_once('\n') else {
        return fail(1, "malformed heredoc");
    };
    let Some(path) = quoted_args(header).into_iter().next() else {
        return fail(1, "missing path");
    };
    let Some(contents) = body.strip_suffix(WRITE_DELIMITER) else {
        return fail(1, "unterminated heredoc");
    };
    state.files.insert(path, contents.to_string());
    ok("")
}

fn guest_id(state: &FakeState, id: &str) -> Option<u32> {
    id.trim()
        .parse::<u32>()
        .ok()
        .filter(|id| state.guests.contains_key(id))
}

fn power(state: &mut FakeState, rest: &str) -> CommandOutput {
    let Some((op, id)) = rest.split_once(' ') else {
        return fail(1, "usage");
    };
    let Some(id) = guest_id(state, id) else {
        return fail(1, "vim.fault.NotFound");
    };
    let Some(guest) = state.guests.get_mut(&id) else {
        return fail(1, "vim.fault.NotFound");
    };
    let invalid = |p: Power| fail(1, format!("vim.fault.InvalidPowerState: {:?}", p));

    match (op, guest.power) {
        ("getstate", p) => {
            let text = match p {
                Power::On => "Powered on",
                Power::Off => "Powered off",
                Power::Suspended => "Suspended",
            };
            ok(format!("Retrieved runtime info\n{}\n", text))
        }
        ("on", Power::Off | Power::Suspended) => {
            guest.power = Power::On;
            ok("Powering on VM:\n")
        }
        ("off", Power::On | Power::Suspended) | ("shutdown", Power::On) => {
            guest.power = Power::Off;
            ok("")
        }
        ("reset" | "reboot", Power::On) => ok(""),
        ("suspend", Power::On) => {
            guest.power = Power::Suspended;
            ok("")
        }
        (_, p) => invalid(p),
    }
}

fn unregister(state: &mut FakeState, id: &str) -> CommandOutput {
    let Some(id) = guest_id(state, id) else {
        return fail(1, "vim.fault.NotFound");
    };
    if state.guests.get(&id).is_some_and(|g| g.power == Power::On) {
        return fail(1, "vim.fault.InvalidPowerState");
    }
    state.guests.remove(&id);
    state.snapshots.remove(&id);
    ok("")
}

fn register(state: &mut FakeState, path: &str) -> CommandOutput {
    let path = path.trim();
    let Some(text) = state.files.get(path) else {
        return fail(1, "vim.fault.NotFound");
    };
    let stem = path
        .rsplit('/')
        .next()
        .and_then(|f| f.strip_suffix(".vmx"))
        .unwrap_or(path)
        .to_string();
    let name = DirectiveSet::parse(text)
        .get("displayName")
        .map(String::from)
        .unwrap_or(stem);
    if state.guests.values().any(|g| g.name == name) {
        return fail(1, "vim.fault.AlreadyExists");
    }
    let id = state.next_id;
    state.next_id += 1;
    state.guests.insert(
        id,
        FakeGuest {
            name,
            power: Power::Off,
        },
    );
    ok(format!("{}\n", id))
}

fn snapshot(state: &mut FakeState, rest: &str) -> CommandOutput {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let Some(id) = tokens.get(1).and_then(|id| guest_id(state, id)) else {
        return fail(1, "vim.fault.NotFound");
    };
    let snaps = state.snapshots.entry(id).or_default();
    match tokens.first() {
        Some(&"create") => {
            snaps.push(tokens.get(2).copied().unwrap_or("snapshot").to_string());
            ok("")
        }
        Some(&"revert") => {
            let exists = tokens
                .get(2)
                .and_then(|s| s.parse::<usize>().ok())
                .is_some_and(|idx| idx >= 1 && idx <= snaps.len());
            if exists {
                ok("")
            } else {
                fail(1, "vim.fault.NotFound")
            }
        }
        Some(&"removeall") => {
            snaps.clear();
            ok("")
        }
        _ => fail(1, "usage"),
    }
}

fn set_vfs(state: &mut FakeState, command: &str) -> CommandOutput {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let pf = tokens.get(7).and_then(|t| t.parse::<PciAddress>().ok());
    let count = tokens.get(9).and_then(|t| t.parse::<usize>().ok());
    let (Some(pf), Some(count)) = (pf, count) else {
        return fail(1, "usage");
    };
    let Some(vf_id) = state
        .devices
        .iter()
        .find(|d| d.address == pf)
        .map(|d| d.vf_device_id.clone())
    else {
        return warn("Unable to find device");
    };
    let Some(vf_id) = vf_id else {
        return warn("SR-IOV is not supported on this device");
    };

    state.devices.retain(|d| d.parent != Some(pf));
    state.passthrough.retain(|a| !(a.same_bus(&pf) && *a != pf));

    let created = count.saturating_sub(state.vf_shortfall);
    for i in 1..=created {
        state.devices.push(FakeDevice {
            address: PciAddress {
                segment: pf.segment,
                bus: pf.bus,
                device: (i / 8) as u8,
                function: (i % 8) as u8,
            },
            device_id: vf_id.clone(),
            vf_device_id: None,
            parent: Some(pf),
        });
    }

    match &state.sriov_stderr {
        Some(stderr) => warn(stderr),
        None => ok(""),
    }
}

#[async_trait::async_trait]
impl CommandChannel for FakeHost {
    async fn run(
        &self,
        target: &Target,
        command: &str,
        _cwd: &str,
        _timeout: Duration,
    ) -> HvResult<CommandOutput> {
        let name = match target {
            Target::Host => return Ok(self.host_run(command)),
            Target::Guest { name, .. } => name.clone(),
        };

        let stall = self.state.lock().stalled.get(&name).copied();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.guest_log.push((name.clone(), command.to_string()));
        if state.failing.contains(&name) {
            return Err(HvError::command(target, command, "connection reset"));
        }
        let powered = state
            .guests
            .values()
            .any(|g| g.name == name && g.power == Power::On);
        if !powered {
            return Err(HvError::command(target, command, "guest is not powered on"));
        }
        if state.unresponsive.contains(&name) {
            return Err(HvError::ToolingNotReady(name));
        }
        if command == LIVENESS_PROBE {
            return Ok(ok("live\n"));
        }
        Ok(ok(format!("{}\n", command)))
    }

    async fn run_async(&self, target: &Target, command: &str) -> HvResult<()> {
        let mut state = self.state.lock();
        match target {
            Target::Host => state.host_log.push(command.to_string()),
            Target::Guest { name, .. } => {
                state.detached.push((name.clone(), command.to_string()))
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileTransfer for FakeHost {
    async fn upload(&self, guest: &str, local: &Path, remote: &str) -> HvResult<()> {
        let bytes = std::fs::read(local)?;
        self.put_guest_file(guest, remote, &bytes);
        Ok(())
    }

    async fn download(&self, guest: &str, remote: &str, local: &Path) -> HvResult<()> {
        let bytes = self
            .guest_file(guest, remote)
            .ok_or_else(|| HvError::NotFound(format!("{} on guest {}", remote, guest)))?;
        std::fs::write(local, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_args() {
        assert_eq!(quoted_args("'a' 'b c'"), vec!["a", "b c"]);
        assert_eq!(quoted_args("'it'\\''s'"), vec!["it's"]);
    }

    #[test]
    fn test_register_uses_display_name() {
        let host = FakeHost::new();
        host.put_file("/ds/g1/g1.vmx", "displayName = \"g1\"\n");
        let out = host.host_run("vim-cmd solo/registervm /ds/g1/g1.vmx");
        assert!(out.success());
        assert_eq!(host.power_of("g1"), Some(Power::Off));
    }

    #[test]
    fn test_passthrough_toggle_reads_device_flag() {
        let host = FakeHost::new();
        host.add_pfs("4940", Some("4941"), 1);
        let pf: PciAddress = "0000:6b:00.0".parse().unwrap();

        let out = host.host_run(&crate::accel::pci::enable_passthrough(&pf));
        assert!(out.success());
        assert!(out.stderr.is_empty());
        assert!(host.passthrough_enabled(&pf));

        let missing: PciAddress = "0000:01:00.0".parse().unwrap();
        let out = host.host_run(&crate::accel::pci::enable_passthrough(&missing));
        assert!(out.stderr.contains("Unable to find device"));
        assert!(!host.passthrough_enabled(&missing));
    }
}
