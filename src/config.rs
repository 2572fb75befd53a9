use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide, so the root launchd job and `sudo saferay ...` read the same
/// file whatever `HOME` is.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/saferay/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaferayConfig {
    /// File this config was loaded from, and where `save` writes.
    #[serde(skip)]
    pub path: PathBuf,
    pub watch: WatchConfig,
    pub firewall: FirewallConfig,
    pub install: InstallConfig,
    pub dns: DnsConfig,
    pub light: LightConfig,
}

/// The VPN watch daemon and its launchd job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub interval_seconds: u64,
    pub label: String,
    pub plist_path: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub pf_conf: PathBuf,
    pub anchor_name: String,
    pub anchor_path: PathBuf,
    /// Tunnel interface still allowed to carry DNS while the anchor is active.
    pub tunnel_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub binary_path: PathBuf,
}

/// The boot-time DNS cache flush job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub flush_label: String,
    pub flush_plist_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub dns_servers: Vec<String>,
    pub state_path: PathBuf,
}

impl Default for SaferayConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            watch: WatchConfig::default(),
            firewall: FirewallConfig::default(),
            install: InstallConfig::default(),
            dns: DnsConfig::default(),
            light: LightConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            label: "com.saferay.xray-auto".to_string(),
            plist_path: PathBuf::from("/Library/LaunchDaemons/com.saferay.xray-auto.plist"),
            log_path: PathBuf::from("/var/log/saferay-xray.log"),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            pf_conf: PathBuf::from("/etc/pf.conf"),
            anchor_name: "xray-dns".to_string(),
            anchor_path: PathBuf::from("/etc/pf.anchors/xray-dns"),
            tunnel_interface: "utun4".to_string(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/local/bin/saferay"),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            flush_label: "com.saferay.dnsflush".to_string(),
            flush_plist_path: PathBuf::from("/Library/LaunchDaemons/com.saferay.dnsflush.plist"),
        }
    }
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            state_path: PathBuf::from("/etc/saferay/light.conf"),
        }
    }
}

impl WatchConfig {
    pub fn interval(&self) -> Duration {
        // A zero interval would make tokio's interval panic.
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl SaferayConfig {
    /// Loads the config file, falling back to defaults when it does not exist.
    /// Never writes: the watch daemon calls this on every start.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.path = path.to_path_buf();

        Ok(config)
    }

    /// Defaults that still remember `path`, for when the file is unreadable.
    pub fn default_at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn save(&self) -> anyhow::Result<&Path> {
        if let Some(config_dir) = self.path.parent() {
            std::fs::create_dir_all(config_dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.path, content)?;

        Ok(&self.path)
    }
}
