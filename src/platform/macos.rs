use crate::error::{Result, SaferayError};
use crate::platform::{self, FirewallController, TunnelSignalReader};
use std::path::PathBuf;
use tracing::debug;

/// Reads tunnel evidence from `scutil` and `ifconfig`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSignals;

impl TunnelSignalReader for SystemSignals {
    fn resolver_config(&self) -> String {
        platform::capture("scutil", &["--dns"])
    }

    fn interface_list(&self) -> String {
        platform::capture("ifconfig", &[])
    }
}

/// pf driven through `pfctl`, loading the main ruleset (which pulls in the
/// DNS anchor) on enable.
#[derive(Debug, Clone)]
pub struct PfFirewall {
    pf_conf: PathBuf,
}

impl PfFirewall {
    pub fn new(pf_conf: impl Into<PathBuf>) -> Self {
        Self {
            pf_conf: pf_conf.into(),
        }
    }
}

impl FirewallController for PfFirewall {
    fn is_enabled(&self) -> bool {
        status_reports_enabled(&platform::capture("pfctl", &["-s", "info"]))
    }

    fn enable(&self) -> Result<()> {
        let pf_conf = self.pf_conf.to_string_lossy();
        debug!("Loading {} and enabling pf", pf_conf);

        tolerate(platform::run("pfctl", &["-ef", &pf_conf]), "already enabled")
    }

    fn disable(&self) -> Result<()> {
        debug!("Disabling pf");

        tolerate(platform::run("pfctl", &["-d"]), "not enabled")
    }
}

/// pfctl exits non-zero when pf is already in the requested state; a failure
/// whose stderr contains `already_in_state` counts as success.
fn tolerate(result: Result<String>, already_in_state: &str) -> Result<()> {
    match result {
        Err(SaferayError::CommandFailed { stderr, .. }) if stderr.contains(already_in_state) => {
            Ok(())
        }
        other => other.map(|_| ()),
    }
}

/// `pfctl -s info` prints e.g. `Status: Enabled for 0 days 00:01:12`.
pub(crate) fn status_reports_enabled(info: &str) -> bool {
    info.contains("Status: Enabled")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_status_report() {
        let info = "No ALTQ support in kernel\nALTQ related functions disabled\n\
                    Status: Enabled for 0 days 00:03:41           Debug: Urgent\n\n\
                    State Table                          Total             Rate\n";
        assert!(status_reports_enabled(info));
    }

    #[test]
    fn disabled_or_missing_status_report() {
        assert!(!status_reports_enabled(
            "Status: Disabled                              Debug: Urgent\n"
        ));
        assert!(!status_reports_enabled(""));
    }

    fn pfctl_failure(args: &str, stderr: &str) -> Result<String> {
        Err(SaferayError::CommandFailed {
            command: format!("pfctl {}", args),
            stderr: stderr.to_string(),
        })
    }

    #[test]
    fn enabling_enabled_pf_succeeds() {
        let result = tolerate(
            pfctl_failure("-ef /etc/pf.conf", "pfctl: pf already enabled"),
            "already enabled",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn disabling_disabled_pf_succeeds() {
        assert!(tolerate(pfctl_failure("-d", "pfctl: pf not enabled"), "not enabled").is_ok());
    }

    #[test]
    fn other_pfctl_failures_are_kept() {
        let result = tolerate(
            pfctl_failure("-ef /etc/pf.conf", "pfctl: /dev/pf: Permission denied"),
            "already enabled",
        );
        assert!(matches!(result, Err(SaferayError::CommandFailed { .. })));

        let result = tolerate(
            pfctl_failure("-d", "pfctl: /dev/pf: Permission denied"),
            "not enabled",
        );
        assert!(result.is_err());
    }

    #[test]
    fn successful_pfctl_run_is_ok() {
        assert!(tolerate(Ok("pf enabled\n".to_string()), "already enabled").is_ok());
    }
}
