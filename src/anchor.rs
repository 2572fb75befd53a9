//! The `xray-dns` pf anchor: DNS may leave only through the tunnel or to a
//! local resolver; every other port-53 packet is dropped.

use crate::config::FirewallConfig;
use crate::error::{Result, SaferayError};
use crate::platform::{self, FirewallController};
use tracing::info;

pub fn render_rules(tunnel_interface: &str) -> String {
    format!(
        "pass out quick on {tunnel_interface} proto {{ udp tcp }} to any port 53\n\
         pass out quick on lo0 proto {{ udp tcp }} to 127.0.0.0/8 port 53\n\
         block out quick proto {{ udp tcp }} to any port 53\n"
    )
}

/// Drops every pf.conf line that mentions the anchor.
pub fn strip_anchor(pf_conf: &str, anchor_name: &str) -> String {
    pf_conf
        .lines()
        .filter(|line| !line.contains(anchor_name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Appends the anchor declaration and its load directive, replacing any
/// earlier copies.
pub fn append_anchor(pf_conf: &str, anchor_name: &str, anchor_path: &str) -> String {
    let mut content = strip_anchor(pf_conf, anchor_name)
        .trim_end_matches(['\n', '\t', ' '])
        .to_string();
    content.push_str(&format!(
        "\nanchor \"{anchor_name}\"\nload anchor \"{anchor_name}\" from \"{anchor_path}\"\n"
    ));
    content
}

/// `pfctl -s rules` output without blank lines and ALTQ chatter.
pub fn rule_lines(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|line| !line.contains("ALTQ") && !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

pub struct AnchorRules<'a> {
    config: &'a FirewallConfig,
}

impl<'a> AnchorRules<'a> {
    pub fn new(config: &'a FirewallConfig) -> Self {
        Self { config }
    }

    pub fn is_installed(&self) -> bool {
        self.config.anchor_path.exists()
    }

    /// Writes the anchor file and hooks it into pf.conf.
    pub fn install(&self) -> Result<()> {
        info!("Installing pf anchor {}", self.config.anchor_name);

        if let Some(dir) = self.config.anchor_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        platform::replace_file(
            &self.config.anchor_path,
            &render_rules(&self.config.tunnel_interface),
            0o644,
        )?;

        let pf_conf = std::fs::read_to_string(&self.config.pf_conf)?;
        let updated = append_anchor(
            &pf_conf,
            &self.config.anchor_name,
            &self.config.anchor_path.to_string_lossy(),
        );
        platform::replace_file(&self.config.pf_conf, &updated, 0o644)
    }

    pub fn enable(&self, firewall: &impl FirewallController) -> Result<()> {
        if !self.is_installed() {
            return Err(SaferayError::RulesNotInstalled);
        }
        firewall.enable()
    }

    /// Disables pf and removes every trace of the anchor. Best-effort on the
    /// pf.conf side: a missing pf.conf is left alone.
    pub fn reset(&self, firewall: &impl FirewallController) -> Result<()> {
        info!("Removing pf anchor {}", self.config.anchor_name);

        if let Err(e) = firewall.disable() {
            tracing::debug!("{}", e);
        }

        if let Ok(pf_conf) = std::fs::read_to_string(&self.config.pf_conf) {
            let cleaned = strip_anchor(&pf_conf, &self.config.anchor_name);
            platform::replace_file(&self.config.pf_conf, &cleaned, 0o644)?;
        }

        platform::remove_if_exists(&self.config.anchor_path)
    }

    pub fn is_loaded(&self) -> bool {
        platform::capture("pfctl", &["-s", "Anchors"]).contains(&self.config.anchor_name)
    }

    pub fn active_rules(&self) -> Vec<String> {
        rule_lines(&platform::capture(
            "pfctl",
            &["-a", &self.config.anchor_name, "-s", "rules"],
        ))
    }
}
