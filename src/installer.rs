use crate::anchor::AnchorRules;
use crate::config::SaferayConfig;
use crate::dns;
use crate::launchd::LaunchDaemon;
use crate::light::LightMode;
use crate::platform::{self, FirewallController};
use colored::Colorize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

pub struct Installer;

impl Installer {
    /// Copies the running binary to the configured install path. Returns
    /// false when it is already running from there.
    pub fn install(config: &SaferayConfig) -> anyhow::Result<bool> {
        let current_exe = std::env::current_exe()?;
        let install_path = &config.install.binary_path;

        if Self::same_file(&current_exe, install_path) {
            return Ok(false);
        }

        info!(
            "Installing {} to {}",
            current_exe.display(),
            install_path.display()
        );
        if let Some(install_dir) = install_path.parent() {
            fs::create_dir_all(install_dir)?;
        }

        // Copy beside the target and rename, so a running copy is never
        // truncated in place.
        let mut tmp_name = install_path.as_os_str().to_owned();
        tmp_name.push(".saferay-tmp");
        fs::copy(&current_exe, &tmp_name)?;
        fs::set_permissions(&tmp_name, fs::Permissions::from_mode(0o755))?;
        fs::rename(&tmp_name, install_path)?;

        Ok(true)
    }

    /// Undoes everything saferay may have set up. Each step is attempted even
    /// when an earlier one fails.
    pub fn uninstall(config: &SaferayConfig, firewall: &impl FirewallController) {
        Self::step(
            "Auto mode daemon removed",
            LaunchDaemon::watch(config).remove().map_err(Into::into),
        );
        Self::step(
            "Binary removed",
            platform::remove_if_exists(&config.install.binary_path).map_err(Into::into),
        );
        Self::step(
            "DNS flush daemon removed",
            dns::remove_flush_daemon(config).map_err(Into::into),
        );
        Self::step(
            "Xray DNS rules removed",
            AnchorRules::new(&config.firewall)
                .reset(firewall)
                .map_err(Into::into),
        );

        let light = LightMode::new(config);
        if light.is_configured() {
            Self::step(
                "Light mode DNS restored",
                light.reset().map(|_| ()).map_err(Into::into),
            );
        }
    }

    fn step(done: &str, result: anyhow::Result<()>) {
        match result {
            Ok(()) => println!("{}", format!("[✓] {}", done).green()),
            Err(e) => eprintln!("{} {}", "[!] Warning:".yellow(), e),
        }
    }

    fn same_file(a: &Path, b: &Path) -> bool {
        match (fs::canonicalize(a), fs::canonicalize(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }
}
