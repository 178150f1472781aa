//! Command-string construction for host and guest shells.
//!
//! Guest commands pass through several shells (host ssh, relay, guest
//! shell). Embedded double quotes are replaced with a token instead of
//! backslash-escaped so that no intermediate shell can mangle them.

use crate::runtime::constants::guest::QUOTE_TOKEN;
use crate::vm::os::OsFamily;

/// Prefix `command` with a directory change unless `cwd` is the current directory.
pub fn host_command(command: &str, cwd: &str) -> String {
    if cwd.is_empty() || cwd == "." {
        command.to_string()
    } else {
        format!("cd {} && {}", cwd, command)
    }
}

/// Wrap a guest command for `os`, then substitute its double quotes.
///
/// Linux: `cd <cwd> && <command>`, with a trailing `&` when detached.
/// Windows: `PowerShell -Command "& { cd <cwd>; <command> }"`, through
/// `start` when detached.
pub fn guest_command(os: OsFamily, command: &str, cwd: &str, detached: bool) -> String {
    let cwd = if cwd.is_empty() { "." } else { cwd };
    let wrapped = match os {
        OsFamily::Linux => {
            let line = format!("cd {} && {}", cwd, command);
            if detached { format!("{} &", line) } else { line }
        }
        OsFamily::Windows => {
            let line = format!("PowerShell -Command \"& {{ cd {}; {} }}\"", cwd, command);
            if detached {
                format!("start {}", line)
            } else {
                line
            }
        }
    };
    encode_quotes(&wrapped)
}

pub fn encode_quotes(command: &str) -> String {
    command.replace('"', QUOTE_TOKEN)
}

/// Host-side relay invocation that runs an encoded command inside `guest`.
pub fn relay_invocation(relay: &str, guest: &str, timeout_secs: u64, encoded: &str) -> String {
    format!(
        "{} --vm-name {} --timeout {} --vm-command \"{}\"",
        relay, guest, timeout_secs, encoded
    )
}

/// Relay invocation that copies a file between a host path and a guest path.
pub fn relay_copy(relay: &str, guest: &str, direction: CopyDirection, src: &str, dest: &str) -> String {
    format!(
        "{} --vm-name {} --{} --src {} --dest {}",
        relay,
        guest,
        direction.flag(),
        src,
        dest
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToGuest,
    FromGuest,
}

impl CopyDirection {
    fn flag(&self) -> &'static str {
        match self {
            CopyDirection::ToGuest => "upload",
            CopyDirection::FromGuest => "download",
        }
    }
}

/// Drop the banner line the relay prints before the guest's own output.
pub fn strip_relay_banner(stdout: &str) -> String {
    match stdout.split_once('\n') {
        Some((_, rest)) => rest.to_string(),
        None => String::new(),
    }
}

/// Single-quote a path for a POSIX host shell.
pub fn quote_path(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}
