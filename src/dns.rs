use crate::config::SaferayConfig;
use crate::error::Result;
use crate::launchd::{DaemonState, LaunchDaemon};
use crate::platform;
use tracing::info;

/// Flushes the directory-services cache and restarts mDNSResponder's cache.
pub fn flush_cache() -> Result<()> {
    info!("Flushing DNS cache");
    platform::run("dscacheutil", &["-flushcache"])?;
    platform::run("killall", &["-HUP", "mDNSResponder"])?;
    Ok(())
}

pub fn setup_flush_daemon(config: &SaferayConfig) -> Result<()> {
    LaunchDaemon::dns_flush(config).install()
}

pub fn remove_flush_daemon(config: &SaferayConfig) -> Result<()> {
    LaunchDaemon::dns_flush(config).remove()
}

pub fn flush_daemon_state(config: &SaferayConfig) -> DaemonState {
    LaunchDaemon::dns_flush(config).state()
}
