//! launchd jobs: the VPN watch daemon and the boot-time DNS cache flush.

use crate::config::SaferayConfig;
use crate::error::Result;
use crate::platform;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

const FLUSH_DNS_SCRIPT: &str = "dscacheutil -flushcache; killall -HUP mDNSResponder";

#[derive(Debug, Clone)]
pub struct LaunchDaemon {
    pub label: String,
    pub plist_path: PathBuf,
    pub program_arguments: Vec<String>,
    pub keep_alive: bool,
    /// Receives both stdout and stderr when set.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    NotInstalled,
    InstalledNotLoaded,
    Loaded,
}

impl LaunchDaemon {
    /// Keeps `saferay xray watch` alive across reboots and crashes, reading
    /// the same config file as the command that installed it.
    pub fn watch(config: &SaferayConfig) -> Self {
        Self {
            label: config.watch.label.clone(),
            plist_path: config.watch.plist_path.clone(),
            program_arguments: vec![
                config.install.binary_path.to_string_lossy().into_owned(),
                "--config".to_string(),
                config.path.to_string_lossy().into_owned(),
                "xray".to_string(),
                "watch".to_string(),
            ],
            keep_alive: true,
            log_path: Some(config.watch.log_path.clone()),
        }
    }

    /// Flushes the DNS cache once at every boot.
    pub fn dns_flush(config: &SaferayConfig) -> Self {
        Self {
            label: config.dns.flush_label.clone(),
            plist_path: config.dns.flush_plist_path.clone(),
            program_arguments: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                FLUSH_DNS_SCRIPT.to_string(),
            ],
            keep_alive: false,
            log_path: None,
        }
    }

    pub fn render_plist(&self) -> String {
        let mut plist = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
"#,
        );

        let _ = writeln!(plist, "    <key>Label</key>");
        let _ = writeln!(plist, "    <string>{}</string>", xml_escape(&self.label));
        let _ = writeln!(plist, "    <key>ProgramArguments</key>");
        let _ = writeln!(plist, "    <array>");
        for arg in &self.program_arguments {
            let _ = writeln!(plist, "        <string>{}</string>", xml_escape(arg));
        }
        let _ = writeln!(plist, "    </array>");
        let _ = writeln!(plist, "    <key>RunAtLoad</key>");
        let _ = writeln!(plist, "    <true/>");
        if self.keep_alive {
            let _ = writeln!(plist, "    <key>KeepAlive</key>");
            let _ = writeln!(plist, "    <true/>");
        }
        if let Some(log_path) = &self.log_path {
            let log_path = xml_escape(&log_path.to_string_lossy());
            for key in ["StandardOutPath", "StandardErrorPath"] {
                let _ = writeln!(plist, "    <key>{}</key>", key);
                let _ = writeln!(plist, "    <string>{}</string>", log_path);
            }
        }

        plist.push_str("</dict>\n</plist>\n");
        plist
    }

    /// Writes the plist (root:wheel, 0644) and loads the job, replacing any
    /// previously loaded copy.
    pub fn install(&self) -> Result<()> {
        let plist_path = self.plist_path.to_string_lossy();
        info!("Installing launchd job {}", self.label);

        if self.plist_path.exists() {
            platform::run_quiet("launchctl", &["unload", "-w", &plist_path]);
        }

        platform::replace_file(&self.plist_path, &self.render_plist(), 0o644)?;
        std::os::unix::fs::chown(&self.plist_path, Some(0), Some(0))?;
        platform::run("launchctl", &["load", "-w", &plist_path])?;

        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        info!("Removing launchd job {}", self.label);

        if self.plist_path.exists() {
            platform::run_quiet("launchctl", &["unload", "-w", &self.plist_path.to_string_lossy()]);
        }
        platform::remove_if_exists(&self.plist_path)
    }

    pub fn state(&self) -> DaemonState {
        if !self.plist_path.exists() {
            return DaemonState::NotInstalled;
        }

        let listing = platform::capture("launchctl", &["list", &self.label]);
        if listing.contains(&self.label) {
            DaemonState::Loaded
        } else {
            DaemonState::InstalledNotLoaded
        }
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
