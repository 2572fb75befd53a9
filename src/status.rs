use crate::anchor::AnchorRules;
use crate::config::SaferayConfig;
use crate::detector::VpnDetector;
use crate::launchd::{DaemonState, LaunchDaemon};
use crate::light::LightStatus;
use crate::platform::{self, FirewallController, SystemSignals, TunnelSignalReader};
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::path::Path;

const LOG_TAIL_LINES: usize = 5;

/// State of the auto (watch daemon) mode, as `xray auto status` reports it.
#[derive(Debug, Serialize)]
pub struct AutoStatus {
    pub daemon: DaemonState,
    pub vpn_connected: bool,
    pub vpn_evidence: Option<String>,
    pub pf_enabled: bool,
    pub recent_log: Vec<String>,
}

impl AutoStatus {
    pub fn check(
        config: &SaferayConfig,
        detector: &VpnDetector<impl TunnelSignalReader>,
        firewall: &impl FirewallController,
    ) -> Self {
        let evidence = detector.evidence();
        Self {
            daemon: LaunchDaemon::watch(config).state(),
            vpn_connected: evidence.is_some(),
            vpn_evidence: evidence.map(|e| e.to_string()),
            pf_enabled: firewall.is_enabled(),
            recent_log: read_log_tail(&config.watch.log_path, LOG_TAIL_LINES),
        }
    }

    pub fn display(&self) {
        header("XRAY AUTO MODE STATUS");

        let daemon = match self.daemon {
            DaemonState::Loaded => "✓ Running".bright_green(),
            DaemonState::InstalledNotLoaded => "⚠ Installed but not running".yellow(),
            DaemonState::NotInstalled => "✗ Not installed".bright_red(),
        };
        row("Auto daemon:", daemon);

        let vpn = match &self.vpn_evidence {
            Some(evidence) => format!("✓ Yes ({})", evidence).bright_green(),
            None => "✗ No".bright_red(),
        };
        row("VPN connected:", vpn);
        row("pf firewall:", enabled(self.pf_enabled));

        if !self.recent_log.is_empty() {
            println!("\n  {}", "Recent log:".bold());
            for line in &self.recent_log {
                println!("    {}", line.dimmed());
            }
        }
        footer();
    }
}

#[derive(Debug, Serialize)]
pub struct XrayStatus {
    pub rules_installed: bool,
    pub pf_enabled: bool,
    pub anchor_loaded: bool,
    pub active_rules: Vec<String>,
}

impl XrayStatus {
    pub fn check(config: &SaferayConfig, firewall: &impl FirewallController) -> Self {
        let rules = AnchorRules::new(&config.firewall);
        Self {
            rules_installed: rules.is_installed(),
            pf_enabled: firewall.is_enabled(),
            anchor_loaded: rules.is_loaded(),
            active_rules: rules.active_rules(),
        }
    }

    pub fn display(&self) {
        header("XRAY DNS PROTECTION STATUS");
        row("Rules installed:", yes_no(self.rules_installed));
        row("pf firewall:", enabled(self.pf_enabled));
        row("Anchor loaded:", yes_no(self.anchor_loaded));

        if !self.active_rules.is_empty() {
            println!("\n  {}", "Active rules:".bold());
            for rule in &self.active_rules {
                println!("    {}", rule.bright_cyan());
            }
        }
        footer();
    }
}

impl LightStatus {
    pub fn display(&self) {
        header("LIGHT MODE STATUS");
        row("DNS flush daemon:", flush_daemon(self.flush_daemon));
        match (&self.service, &self.dns) {
            (Some(service), Some(dns)) => {
                row("Network service:", service.bright_cyan());
                row("DNS servers:", dns.to_string().bright_cyan());
            }
            _ => row("Network service:", "✗ Not detected".bright_red()),
        }
        footer();
    }
}

pub fn flush_daemon(state: DaemonState) -> ColoredString {
    match state {
        DaemonState::Loaded => "✓ Installed and loaded".bright_green(),
        DaemonState::InstalledNotLoaded => "⚠ Installed but not loaded".yellow(),
        DaemonState::NotInstalled => "✗ Not installed".bright_red(),
    }
}

/// Prerequisites `saferay check` verifies.
#[derive(Debug)]
pub struct SystemCheck {
    pub macos: bool,
    pub root: bool,
    pub pfctl: bool,
    pub launchctl: bool,
    pub tunnels: usize,
    pub vpn_connected: bool,
    pub pf_conf: bool,
}

impl SystemCheck {
    pub fn run(config: &SaferayConfig) -> Self {
        Self {
            macos: cfg!(target_os = "macos"),
            root: crate::is_root(),
            pfctl: platform::is_command_available("pfctl"),
            launchctl: platform::is_command_available("launchctl"),
            tunnels: count_tunnels(&platform::capture("ifconfig", &[])),
            vpn_connected: VpnDetector::new(SystemSignals).is_vpn_connected(),
            pf_conf: config.firewall.pf_conf.exists(),
        }
    }

    /// Root and VPN state are advisory; everything else is required.
    pub fn all_ok(&self) -> bool {
        self.macos && self.pfctl && self.launchctl && self.pf_conf
    }

    pub fn display(&self) {
        header("SYSTEM CHECK");
        row("macOS:", check(self.macos, "✓ Yes", "✗ No (required)"));
        row("root:", check(self.root, "✓ Yes", "⚠ No (needed for most commands)"));
        row("pfctl:", check(self.pfctl, "✓ Available", "✗ Not found"));
        row("launchctl:", check(self.launchctl, "✓ Available", "✗ Not found"));
        let tunnels = if self.tunnels > 0 {
            format!("✓ Found {} utun interface(s)", self.tunnels).bright_green()
        } else {
            "⚠ No utun interfaces (start VPN first)".yellow()
        };
        row("VPN tunnel:", tunnels);
        row("VPN connected:", yes_no(self.vpn_connected));
        row("pf.conf:", check(self.pf_conf, "✓ Exists", "✗ Not found"));

        println!();
        if self.all_ok() {
            println!("  {}", "All checks passed. Ready to use.".bright_green().bold());
        } else {
            println!(
                "  {}",
                "Some checks failed. saferay may not work correctly."
                    .bright_red()
                    .bold()
            );
        }
        footer();
    }
}

/// Header lines of tunnel interfaces in `ifconfig` output.
pub fn count_tunnels(ifconfig: &str) -> usize {
    ifconfig.lines().filter(|line| line.starts_with("utun")).count()
}

pub fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|line| line.to_string())
        .collect()
}

fn read_log_tail(path: &Path, n: usize) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|text| tail_lines(&text, n))
        .unwrap_or_default()
}

fn header(title: &str) {
    println!("\n{}", "━".repeat(60).bright_blue());
    println!("{}", format!("  {}", title).bright_blue().bold());
    println!("{}", "━".repeat(60).bright_blue());
    println!();
}

fn footer() {
    println!();
    println!("{}", "━".repeat(60).bright_blue());
    println!();
}

fn row(label: &str, value: ColoredString) {
    println!("  {} {}", format!("{:<18}", label).bold(), value);
}

fn check(ok: bool, yes: &str, no: &str) -> ColoredString {
    if ok {
        yes.bright_green()
    } else if no.starts_with('⚠') {
        no.yellow()
    } else {
        no.bright_red()
    }
}

fn yes_no(value: bool) -> ColoredString {
    check(value, "✓ Yes", "✗ No")
}

fn enabled(value: bool) -> ColoredString {
    check(value, "✓ Enabled", "✗ Disabled")
}
