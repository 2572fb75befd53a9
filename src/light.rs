//! Light mode: pin the active network service to public resolvers and flush
//! the DNS cache at boot, without touching pf.

use crate::config::SaferayConfig;
use crate::dns;
use crate::error::{Result, SaferayError};
use crate::launchd::DaemonState;
use crate::platform;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

const SERVICE_PRIORITY: [&str; 4] = [
    "Wi-Fi",
    "Ethernet",
    "USB 10/100/1000 LAN",
    "Thunderbolt Ethernet",
];

const NO_DNS_SERVERS: &str = "There aren't any DNS Servers";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsServers {
    /// Whatever DHCP hands out.
    Automatic,
    Manual(Vec<String>),
}

impl DnsServers {
    /// Parses `networksetup -getdnsservers <service>` output. Anything that
    /// is not a list of IP addresses (the "no servers" notice, `** Error`
    /// text printed with exit status 0) reads as automatic.
    pub fn parse(output: &str) -> Self {
        if output.contains(NO_DNS_SERVERS) {
            return DnsServers::Automatic;
        }
        let servers: Vec<String> = output.split_whitespace().map(str::to_string).collect();
        if servers.is_empty() || servers.iter().any(|s| s.parse::<IpAddr>().is_err()) {
            DnsServers::Automatic
        } else {
            DnsServers::Manual(servers)
        }
    }

    /// Arguments for `networksetup -setdnsservers`; `Empty` clears the list.
    fn networksetup_args(&self) -> Vec<&str> {
        match self {
            DnsServers::Automatic => vec!["Empty"],
            DnsServers::Manual(servers) => servers.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for DnsServers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsServers::Automatic => write!(f, "automatic (DHCP)"),
            DnsServers::Manual(servers) => write!(f, "{}", servers.join(", ")),
        }
    }
}

/// The DNS setting light mode replaced, kept so `reset` can put it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightState {
    pub service: String,
    pub dns: DnsServers,
}

impl LightState {
    pub fn render(&self) -> String {
        let dns = match &self.dns {
            DnsServers::Automatic => "auto".to_string(),
            DnsServers::Manual(servers) => servers.join(" "),
        };
        format!("service={}\ndns={}\n", self.service, dns)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut service = None;
        let mut dns = None;

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("service=") {
                service = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("dns=") {
                dns = Some(match value.trim() {
                    "auto" => DnsServers::Automatic,
                    servers => DnsServers::Manual(
                        servers.split_whitespace().map(str::to_string).collect(),
                    ),
                });
            }
        }

        match (service, dns) {
            (Some(service), Some(dns)) => Ok(Self { service, dns }),
            _ => Err(SaferayError::ConfigError(
                "light mode state is missing service= or dns=".to_string(),
            )),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        platform::replace_file(path, &self.render(), 0o644)
    }
}

/// Parses `networksetup -listallnetworkservices`, skipping the header and
/// disabled (`*`) services.
pub fn parse_services(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("An asterisk") && !line.starts_with('*')
        })
        .map(str::to_string)
        .collect()
}

/// Whether `networksetup -getinfo <service>` shows an assigned IP address.
pub fn has_address(info: &str) -> bool {
    info.contains("IP address:") && !info.contains("IP address: none")
}

/// Picks the service to reconfigure: the first connected service by
/// priority, then any connected service, then Wi-Fi if it exists at all.
pub fn choose_service(services: &[String], has_ip: impl Fn(&str) -> bool) -> Option<String> {
    SERVICE_PRIORITY
        .iter()
        .filter(|wanted| services.iter().any(|s| s == *wanted))
        .find(|wanted| has_ip(wanted))
        .map(|s| s.to_string())
        .or_else(|| services.iter().find(|s| has_ip(s)).cloned())
        .or_else(|| services.iter().find(|s| *s == "Wi-Fi").cloned())
}

pub fn active_service() -> Option<String> {
    let listing = platform::run("networksetup", &["-listallnetworkservices"]).ok()?;
    choose_service(&parse_services(&listing), |service| {
        has_address(&platform::capture("networksetup", &["-getinfo", service]))
    })
}

pub fn current_dns(service: &str) -> DnsServers {
    DnsServers::parse(&platform::capture("networksetup", &["-getdnsservers", service]))
}

pub fn set_dns(service: &str, dns: &DnsServers) -> Result<()> {
    let mut args = vec!["-setdnsservers", service];
    args.extend(dns.networksetup_args());
    platform::run("networksetup", &args)?;
    Ok(())
}

#[derive(Debug)]
pub struct LightStatus {
    pub flush_daemon: DaemonState,
    pub service: Option<String>,
    pub dns: Option<DnsServers>,
}

pub struct LightMode<'a> {
    config: &'a SaferayConfig,
}

impl<'a> LightMode<'a> {
    pub fn new(config: &'a SaferayConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.light.state_path.exists()
    }

    /// Installs the flush job, remembers the current DNS and pins the
    /// configured servers. Returns the service that was changed.
    pub fn setup(&self) -> Result<(String, DnsServers)> {
        info!("Setting up light mode");
        dns::setup_flush_daemon(self.config)?;

        let service = active_service().ok_or(SaferayError::NoNetworkService)?;

        // A second setup must not overwrite the original with our own servers.
        if !self.is_configured() {
            let previous = LightState {
                service: service.clone(),
                dns: current_dns(&service),
            };
            previous.save(&self.config.light.state_path)?;
        }

        let servers = DnsServers::Manual(self.config.light.dns_servers.clone());
        set_dns(&service, &servers)?;
        Ok((service, servers))
    }

    /// Removes the flush job and restores the saved DNS (automatic when
    /// nothing was saved). Returns what was restored, if a service was found.
    pub fn reset(&self) -> Result<Option<(String, DnsServers)>> {
        info!("Resetting light mode");
        dns::remove_flush_daemon(self.config)?;

        let saved = if self.is_configured() {
            LightState::load(&self.config.light.state_path)
                .map_err(|e| warn!("Ignoring unreadable light mode state: {}", e))
                .ok()
        } else {
            None
        };

        let restored = match saved {
            Some(state) => Some((state.service, state.dns)),
            None => active_service().map(|service| (service, DnsServers::Automatic)),
        };
        if let Some((service, dns)) = &restored {
            set_dns(service, dns)?;
        }

        let state_path = &self.config.light.state_path;
        platform::remove_if_exists(state_path)?;
        if let Some(dir) = state_path.parent() {
            // Only succeeds once the directory is empty.
            let _ = std::fs::remove_dir(dir);
        }

        Ok(restored)
    }

    pub fn status(&self) -> LightStatus {
        let service = active_service();
        let dns = service.as_deref().map(current_dns);
        LightStatus {
            flush_daemon: dns::flush_daemon_state(self.config),
            service,
            dns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICES: &str = "\
An asterisk (*) denotes that a network service is disabled.
USB 10/100/1000 LAN
Wi-Fi
*Bluetooth PAN
Thunderbolt Bridge
";

    fn services(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn networksetup_error_text_is_not_saved_as_servers() {
        assert_eq!(
            DnsServers::parse("** Error: The parameters were not valid.\n"),
            DnsServers::Automatic
        );
        assert_eq!(
            DnsServers::parse("Wi-Fi is not a recognized network service.\n"),
            DnsServers::Automatic
        );
    }

    #[test]
    fn service_listing_skips_header_and_disabled() {
        assert_eq!(
            parse_services(SERVICES),
            services(&["USB 10/100/1000 LAN", "Wi-Fi", "Thunderbolt Bridge"])
        );
    }

    #[test]
    fn getinfo_address_detection() {
        assert!(has_address(
            "DHCP Configuration\nIP address: 192.168.1.20\nSubnet mask: 255.255.255.0\n"
        ));
        assert!(!has_address("DHCP Configuration\nIP address: none\n"));
        assert!(!has_address("** Error: The parameters were not valid.\n"));
    }

    #[test]
    fn priority_service_wins_when_connected() {
        let list = services(&["USB 10/100/1000 LAN", "Wi-Fi"]);
        assert_eq!(choose_service(&list, |_| true), Some("Wi-Fi".to_string()));
        assert_eq!(
            choose_service(&list, |s| s != "Wi-Fi"),
            Some("USB 10/100/1000 LAN".to_string())
        );
    }

    #[test]
    fn unlisted_service_with_address_is_second_choice() {
        let list = services(&["Thunderbolt Bridge", "iPhone USB", "Wi-Fi"]);
        assert_eq!(
            choose_service(&list, |s| s == "iPhone USB"),
            Some("iPhone USB".to_string())
        );
    }

    #[test]
    fn wifi_is_the_last_resort() {
        assert_eq!(
            choose_service(&services(&["Thunderbolt Bridge", "Wi-Fi"]), |_| false),
            Some("Wi-Fi".to_string())
        );
        assert_eq!(choose_service(&services(&["Thunderbolt Bridge"]), |_| false), None);
    }

    #[test]
    fn dns_server_listing() {
        assert_eq!(
            DnsServers::parse("There aren't any DNS Servers set on Wi-Fi.\n"),
            DnsServers::Automatic
        );
        assert_eq!(
            DnsServers::parse("1.1.1.1\n1.0.0.1\n"),
            DnsServers::Manual(vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()])
        );
        assert_eq!(
            DnsServers::parse("2606:4700:4700::1111\n"),
            DnsServers::Manual(vec!["2606:4700:4700::1111".to_string()])
        );
        assert_eq!(
            DnsServers::Manual(vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]).to_string(),
            "1.1.1.1, 1.0.0.1"
        );
    }

    #[test]
    fn state_file_format() {
        let state = LightState {
            service: "Wi-Fi".to_string(),
            dns: DnsServers::Manual(vec!["9.9.9.9".to_string(), "149.112.112.112".to_string()]),
        };
        assert_eq!(state.render(), "service=Wi-Fi\ndns=9.9.9.9 149.112.112.112\n");
        assert_eq!(LightState::parse(&state.render()).unwrap(), state);

        let auto = LightState::parse("service=USB 10/100/1000 LAN\ndns=auto\n").unwrap();
        assert_eq!(auto.service, "USB 10/100/1000 LAN");
        assert_eq!(auto.dns, DnsServers::Automatic);
    }

    #[test]
    fn incomplete_state_is_rejected() {
        assert!(matches!(
            LightState::parse("service=Wi-Fi\n"),
            Err(SaferayError::ConfigError(_))
        ));
    }

    #[test]
    fn state_saves_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saferay").join("light.conf");
        let state = LightState {
            service: "Wi-Fi".to_string(),
            dns: DnsServers::Automatic,
        };

        state.save(&path).unwrap();
        assert_eq!(LightState::load(&path).unwrap(), state);
    }
}
