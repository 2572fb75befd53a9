use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

mod anchor;
mod config;
mod detector;
mod dns;
mod error;
mod installer;
mod launchd;
mod light;
mod platform;
mod status;
mod watch;

use anchor::AnchorRules;
use config::{SaferayConfig, DEFAULT_CONFIG_PATH};
use detector::VpnDetector;
use error::SaferayError;
use installer::Installer;
use launchd::LaunchDaemon;
use light::LightMode;
use platform::{FirewallController, PfFirewall, SystemSignals};
use status::{AutoStatus, SystemCheck, XrayStatus};
use watch::WatchLoop;

#[derive(Parser)]
#[command(name = "saferay")]
#[command(version, about = "DNS leak protection for macOS VPN users", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install saferay to /usr/local/bin
    Install {
        /// Also set up light mode
        #[arg(long)]
        light: bool,
    },
    /// Remove saferay and everything it set up
    Uninstall,
    /// Check system requirements
    Check,
    /// Show current configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
    /// Boot-time DNS cache flushing
    Dns {
        #[command(subcommand)]
        action: DnsAction,
    },
    /// pf rules that keep DNS inside the VPN tunnel
    Xray {
        #[command(subcommand)]
        action: XrayAction,
    },
    /// Pin public DNS servers without pf
    Light {
        #[command(subcommand)]
        action: LightAction,
    },
}

#[derive(Subcommand)]
enum DnsAction {
    /// Flush the DNS cache on every reboot
    Setup,
    /// Remove the DNS flush daemon
    Remove,
    /// Show DNS flush daemon status
    Status,
    /// Flush the DNS cache now
    Flush,
}

#[derive(Subcommand)]
enum XrayAction {
    /// Install pf rules for Xray DNS protection
    Install,
    /// Enable pf with the Xray rules
    Enable,
    /// Disable pf
    Disable,
    /// Remove all Xray pf rules
    Reset,
    /// Show current pf/Xray status
    Status,
    /// Toggle DNS protection with the VPN until interrupted
    Watch {
        /// Seconds between VPN checks
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },
    /// Run the watcher as a launchd daemon
    Auto {
        #[command(subcommand)]
        action: AutoAction,
    },
}

#[derive(Subcommand)]
enum AutoAction {
    /// Install and load the watch daemon
    Start,
    /// Unload the watch daemon and disable pf
    Stop,
    /// Show daemon, VPN and pf state
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum LightAction {
    /// Set public DNS servers and flush the cache on reboot
    Setup,
    /// Restore the original DNS servers
    Reset,
    /// Show light mode status
    Status,
}

impl Commands {
    fn requires_root(&self) -> bool {
        !matches!(self, Commands::Check | Commands::Config { init: false })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `--json` output stays clean; launchd sends both
    // streams to the same file for the daemon, which must stay free of
    // colour codes.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();

    if !cfg!(target_os = "macos") {
        eprintln!("{}", "Error: saferay only works on macOS".bright_red().bold());
        std::process::exit(1);
    }

    if cli.command.requires_root() && !is_root() {
        eprintln!(
            "{}",
            "Error: saferay must be run as root (use sudo)"
                .bright_red()
                .bold()
        );
        std::process::exit(1);
    }

    let config = SaferayConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!("Ignoring unreadable config file {}: {}", cli.config.display(), e);
        SaferayConfig::default_at(&cli.config)
    });
    let firewall = PfFirewall::new(config.firewall.pf_conf.clone());

    match cli.command {
        Commands::Install { light } => {
            match Installer::install(&config) {
                Ok(false) => println!("{}", "saferay is already installed".bright_cyan()),
                Ok(true) => println!(
                    "{}",
                    format!(
                        "[✓] saferay installed to {}",
                        config.install.binary_path.display()
                    )
                    .green()
                ),
                Err(e) => fail("Failed to install", e),
            }

            if light {
                println!();
                light_setup(&config);
            }
        }

        Commands::Uninstall => {
            Installer::uninstall(&config, &firewall);
            println!("{}", "[✓] saferay uninstalled".bright_green().bold());
        }

        Commands::Check => {
            let check = SystemCheck::run(&config);
            check.display();
        }

        Commands::Config { init } => {
            if init {
                match config.save() {
                    Ok(path) => println!("{} {}", "[✓] Wrote".green(), path.display()),
                    Err(e) => fail("Failed to write config", e),
                }
            }
            println!("{}", "Current Configuration:".bright_blue().bold());
            println!("{}", "━".repeat(50).bright_blue());
            print!("{}", toml::to_string_pretty(&config)?);
        }

        Commands::Dns { action } => run_dns(action, &config),
        Commands::Xray { action } => run_xray(action, &config, firewall).await?,
        Commands::Light { action } => run_light(action, &config),
    }

    Ok(())
}

fn run_dns(action: DnsAction, config: &SaferayConfig) {
    match action {
        DnsAction::Setup => match dns::setup_flush_daemon(config) {
            Ok(()) => println!(
                "{}",
                "[✓] DNS flush daemon installed (will flush DNS on every reboot)".green()
            ),
            Err(e) => fail("Failed to install DNS flush daemon", e),
        },
        DnsAction::Remove => match dns::remove_flush_daemon(config) {
            Ok(()) => println!("{}", "[✓] DNS flush daemon removed".yellow()),
            Err(e) => fail("Failed to remove DNS flush daemon", e),
        },
        DnsAction::Status => {
            let state = dns::flush_daemon_state(config);
            println!("{} {}", "DNS flush daemon:".bold(), status::flush_daemon(state));
        }
        DnsAction::Flush => match dns::flush_cache() {
            Ok(()) => println!("{}", "[✓] DNS cache flushed".green()),
            Err(e) => fail("Failed to flush DNS cache", e),
        },
    }
}

async fn run_xray(action: XrayAction, config: &SaferayConfig, firewall: PfFirewall) -> Result<()> {
    let rules = AnchorRules::new(&config.firewall);

    match action {
        XrayAction::Install => match rules.install() {
            Ok(()) => {
                println!("{}", "[✓] Xray DNS protection rules installed".green());
                println!("    Run 'saferay xray enable' to activate");
            }
            Err(e) => fail("Failed to install rules", e),
        },
        XrayAction::Enable => match rules.enable(&firewall) {
            Ok(()) => println!("{}", "[✓] Xray DNS protection enabled".bright_green()),
            Err(e) => fail("Failed to enable pf", e),
        },
        XrayAction::Disable => match firewall.disable() {
            Ok(()) => println!("{}", "[✓] pf firewall disabled".yellow()),
            Err(e) => fail("Failed to disable pf", e),
        },
        XrayAction::Reset => match rules.reset(&firewall) {
            Ok(()) => println!("{}", "[✓] Xray DNS rules removed".yellow()),
            Err(e) => fail("Failed to remove rules", e),
        },
        XrayAction::Status => XrayStatus::check(config, &firewall).display(),
        XrayAction::Watch { interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.watch.interval());

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            ctrlc::set_handler(move || {
                let _ = shutdown_tx.send(true);
            })?;

            let mut daemon = WatchLoop::new(VpnDetector::new(SystemSignals), firewall, interval);
            daemon.run(shutdown_rx).await;
            info!(
                vpn_connected = daemon.last_known_connected(),
                "Watch daemon stopped, pf left as last set"
            );
        }
        XrayAction::Auto { action } => run_auto(action, config, &firewall)?,
    }

    Ok(())
}

fn run_auto(action: AutoAction, config: &SaferayConfig, firewall: &PfFirewall) -> Result<()> {
    let daemon = LaunchDaemon::watch(config);

    match action {
        AutoAction::Start => {
            if !config.install.binary_path.exists() {
                fail("Cannot start auto mode", SaferayError::NotInstalled);
            }
            if !AnchorRules::new(&config.firewall).is_installed() {
                fail("Cannot start auto mode", SaferayError::RulesNotInstalled);
            }

            match daemon.install() {
                Ok(()) => {
                    println!("{}", "[✓] Auto mode enabled".bright_green().bold());
                    println!("    - DNS protection will auto-enable when VPN connects");
                    println!("    - DNS protection will auto-disable when VPN disconnects");
                    println!("    - Log: {}", config.watch.log_path.display());
                }
                Err(e) => fail("Failed to start auto mode", e),
            }
        }
        AutoAction::Stop => {
            if let Err(e) = daemon.remove() {
                eprintln!("{} {}", "[!] Warning during stop:".yellow(), e);
            }
            // The daemon never disables pf on exit, so stopping auto mode does.
            if let Err(e) = firewall.disable() {
                eprintln!("{} {}", "[!] Warning during stop:".yellow(), e);
            }
            println!("{}", "[✓] Auto mode disabled".yellow());
        }
        AutoAction::Status { json } => {
            let status = AutoStatus::check(config, &VpnDetector::new(SystemSignals), firewall);
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                status.display();
            }
        }
    }

    Ok(())
}

fn run_light(action: LightAction, config: &SaferayConfig) {
    let light = LightMode::new(config);

    match action {
        LightAction::Setup => light_setup(config),
        LightAction::Reset => match light.reset() {
            Ok(restored) => {
                if let Some((service, dns)) = restored {
                    println!(
                        "{}",
                        format!("[✓] DNS restored to {} on {}", dns, service).green()
                    );
                }
                println!("{}", "[✓] Light mode disabled".yellow());
            }
            Err(e) => fail("Failed to reset light mode", e),
        },
        LightAction::Status => light.status().display(),
    }
}

fn light_setup(config: &SaferayConfig) {
    println!("{}", "[+] Setting up light mode...".cyan());

    match LightMode::new(config).setup() {
        Ok((service, servers)) => {
            println!("{}", "[✓] Light mode enabled".bright_green().bold());
            println!("    - DNS cache will flush on every reboot");
            println!("    - DNS set to {} on {}", servers, service);
        }
        Err(SaferayError::NoNetworkService) => {
            eprintln!(
                "{}",
                "[!] Warning: Could not detect active network service".yellow()
            );
            eprintln!(
                "    Please set DNS manually: networksetup -setdnsservers \"Wi-Fi\" {}",
                config.light.dns_servers.join(" ")
            );
        }
        Err(e) => fail("Failed to set up light mode", e),
    }
}

fn fail(what: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", format!("[✗] {}:", what).bright_red(), error);
    std::process::exit(1);
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
