// src/platform/mod.rs

// saferay only targets macOS, but nothing here is cfg-gated: off macOS the
// system commands simply fail and every reader degrades to "no evidence".
mod macos;

pub use macos::{PfFirewall, SystemSignals};

use crate::error::{Result, SaferayError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Raw text the VPN detector works from. Both reads are best-effort: a failed
/// command yields an empty string, never an error.
#[cfg_attr(test, mockall::automock)]
pub trait TunnelSignalReader {
    /// Resolver configuration dump (`scutil --dns`).
    fn resolver_config(&self) -> String;
    /// Interface enumeration (`ifconfig`).
    fn interface_list(&self) -> String;
}

/// The pf policy the watch daemon toggles.
#[cfg_attr(test, mockall::automock)]
pub trait FirewallController {
    fn is_enabled(&self) -> bool;
    /// Loads and activates the DNS-blocking rule set. Safe to repeat.
    fn enable(&self) -> Result<()>;
    /// Deactivates the firewall. Safe to repeat.
    fn disable(&self) -> Result<()>;
}

/// Runs a command to completion and returns its stdout.
pub(crate) fn run(program: &str, args: &[&str]) -> Result<String> {
    let command = describe(program, args);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| SaferayError::SpawnFailed {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SaferayError::CommandFailed { command, stderr });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run`], but any failure reads as empty output.
pub(crate) fn capture(program: &str, args: &[&str]) -> String {
    run(program, args).unwrap_or_else(|e| {
        debug!("{}", e);
        String::new()
    })
}

/// Runs a command for its side effect only, logging instead of failing.
pub(crate) fn run_quiet(program: &str, args: &[&str]) {
    if let Err(e) = run(program, args) {
        debug!("{}", e);
    }
}

pub(crate) fn is_command_available(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Replaces `path` by writing a sibling temp file and renaming it over the
/// original, so readers never see a half-written file.
pub(crate) fn replace_file(path: &Path, contents: &str, mode: u32) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".saferay-tmp");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, contents)?;
    std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode))?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Removes a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn describe(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
