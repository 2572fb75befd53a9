//! The VPN watch daemon: keeps the pf DNS policy in step with tunnel presence.

use crate::detector::VpnDetector;
use crate::error::Result;
use crate::platform::{FirewallController, TunnelSignalReader};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consecutive failed mutations before each further failure is logged as a warning.
const MUTATION_FAILURE_WARN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
}

pub struct WatchLoop<R, F> {
    detector: VpnDetector<R>,
    firewall: F,
    interval: Duration,
    last_known_connected: bool,
    failed_mutations: u32,
}

impl<R, F> WatchLoop<R, F>
where
    R: TunnelSignalReader,
    F: FirewallController,
{
    pub fn new(detector: VpnDetector<R>, firewall: F, interval: Duration) -> Self {
        Self {
            detector,
            firewall,
            interval,
            last_known_connected: false,
            failed_mutations: 0,
        }
    }

    pub fn last_known_connected(&self) -> bool {
        self.last_known_connected
    }

    /// Startup step: converge pf to the current VPN state, consulting the
    /// live firewall status so nothing is toggled needlessly.
    pub fn reconcile(&mut self) {
        let evidence = self.detector.evidence();
        let connected = evidence.is_some();
        let pf_enabled = self.firewall.is_enabled();

        match evidence {
            Some(evidence) if !pf_enabled => {
                info!("VPN detected at startup ({}), enabling pf", evidence);
                let result = self.firewall.enable();
                self.record(result);
            }
            None if pf_enabled => {
                info!("No VPN at startup, disabling pf");
                let result = self.firewall.disable();
                self.record(result);
            }
            _ => debug!(connected, pf_enabled, "Startup state already consistent"),
        }

        self.last_known_connected = connected;
    }

    /// One poll cycle. Touches the firewall only on a state change.
    pub fn poll(&mut self) -> Option<Transition> {
        let evidence = self.detector.evidence();

        match (evidence, self.last_known_connected) {
            (Some(evidence), false) => {
                info!("VPN connected ({}), enabling DNS protection", evidence);
                let result = self.firewall.enable();
                self.record(result);
                self.last_known_connected = true;
                Some(Transition::Connected)
            }
            (None, true) => {
                info!("VPN disconnected, disabling DNS protection");
                let result = self.firewall.disable();
                self.record(result);
                self.last_known_connected = false;
                Some(Transition::Disconnected)
            }
            _ => None,
        }
    }

    /// Reconciles, then polls every interval until `shutdown` flips to true
    /// (or its sender goes away). Leaves pf exactly as it was last set.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting VPN watch daemon (interval {}s)",
            self.interval.as_secs()
        );
        self.reconcile();

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            // Shutdown wins over a tick that is ready in the same wakeup.
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll();
                }
            }
        }

        info!("Shutting down watch daemon");
    }

    fn record(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.failed_mutations = 0,
            Err(e) => {
                self.failed_mutations += 1;
                if self.failed_mutations >= MUTATION_FAILURE_WARN_THRESHOLD {
                    warn!(
                        failures = self.failed_mutations,
                        "Firewall change failed, DNS protection may not match VPN state: {}", e
                    );
                } else {
                    debug!("Firewall change failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SaferayError;
    use crate::platform::{MockFirewallController, MockTunnelSignalReader};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const VPN_RESOLVER: &str = "resolver #1\n  nameserver[0] : 10.8.0.1\n  if_index : 7 (utun5)\n";

    /// Replays a fixed sequence of samples, repeating the last one forever.
    struct ScriptedSignals {
        samples: Mutex<VecDeque<bool>>,
        last: Mutex<bool>,
    }

    impl ScriptedSignals {
        fn new(samples: &[bool]) -> Self {
            Self {
                samples: Mutex::new(samples.iter().copied().collect()),
                last: Mutex::new(false),
            }
        }
    }

    impl TunnelSignalReader for ScriptedSignals {
        fn resolver_config(&self) -> String {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.samples.lock().unwrap().pop_front() {
                *last = next;
            }
            if *last {
                VPN_RESOLVER.to_string()
            } else {
                String::new()
            }
        }

        fn interface_list(&self) -> String {
            String::new()
        }
    }

    /// Stands in for pf: idempotent, and counts every mutation call.
    #[derive(Clone, Default)]
    struct FakePf {
        enabled: Arc<AtomicBool>,
        enables: Arc<AtomicUsize>,
        disables: Arc<AtomicUsize>,
    }

    impl FakePf {
        fn with_enabled(enabled: bool) -> Self {
            let pf = Self::default();
            pf.enabled.store(enabled, Ordering::SeqCst);
            pf
        }

        fn calls(&self) -> (usize, usize) {
            (
                self.enables.load(Ordering::SeqCst),
                self.disables.load(Ordering::SeqCst),
            )
        }
    }

    impl FirewallController for FakePf {
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn enable(&self) -> Result<()> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            self.enabled.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disable(&self) -> Result<()> {
            self.disables.fetch_add(1, Ordering::SeqCst);
            self.enabled.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn watch_loop<F: FirewallController>(
        samples: &[bool],
        firewall: F,
    ) -> WatchLoop<ScriptedSignals, F> {
        WatchLoop::new(
            VpnDetector::new(ScriptedSignals::new(samples)),
            firewall,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn startup_enables_pf_when_vpn_already_up() {
        let pf = FakePf::with_enabled(false);
        let mut daemon = watch_loop(&[true], pf.clone());

        daemon.reconcile();

        assert!(daemon.last_known_connected());
        assert!(pf.is_enabled());
        assert_eq!(pf.calls(), (1, 0));
    }

    #[test]
    fn startup_disables_stale_pf_without_vpn() {
        let pf = FakePf::with_enabled(true);
        let mut daemon = watch_loop(&[false], pf.clone());

        daemon.reconcile();

        assert!(!daemon.last_known_connected());
        assert!(!pf.is_enabled());
        assert_eq!(pf.calls(), (0, 1));
    }

    #[test]
    fn startup_leaves_consistent_state_alone() {
        let mut firewall = MockFirewallController::new();
        firewall.expect_is_enabled().return_const(true);
        firewall.expect_enable().never();
        firewall.expect_disable().never();

        let mut daemon = watch_loop(&[true], firewall);
        daemon.reconcile();
        assert!(daemon.last_known_connected());
    }

    #[test]
    fn mutations_match_transitions_exactly() {
        let samples = [
            false, // startup
            false, true, true, true, false, false, true, false, false,
        ];
        let pf = FakePf::with_enabled(false);
        let mut daemon = watch_loop(&samples, pf.clone());

        daemon.reconcile();
        let transitions: Vec<_> = (1..samples.len()).filter_map(|_| daemon.poll()).collect();

        assert_eq!(
            transitions,
            vec![
                Transition::Connected,
                Transition::Disconnected,
                Transition::Connected,
                Transition::Disconnected,
            ]
        );
        assert_eq!(pf.calls(), (2, 2));
        assert!(!pf.is_enabled());
    }

    #[test]
    fn failed_mutation_still_records_transition_and_is_not_retried() {
        let mut firewall = MockFirewallController::new();
        firewall.expect_is_enabled().return_const(false);
        firewall.expect_enable().times(1).returning(|| {
            Err(SaferayError::CommandFailed {
                command: "pfctl -ef /etc/pf.conf".to_string(),
                stderr: "pfctl: /dev/pf: Permission denied".to_string(),
            })
        });
        firewall.expect_disable().never();

        let mut daemon = watch_loop(&[false, true, true, true], firewall);
        daemon.reconcile();

        assert_eq!(daemon.poll(), Some(Transition::Connected));
        assert_eq!(daemon.poll(), None);
        assert_eq!(daemon.poll(), None);
        assert!(daemon.last_known_connected());
    }

    #[test]
    fn repeated_failures_are_counted_until_a_success() {
        let mut firewall = MockFirewallController::new();
        firewall.expect_is_enabled().return_const(false);
        firewall
            .expect_enable()
            .returning(|| Err(SaferayError::NotInstalled));
        firewall.expect_disable().returning(|| Ok(()));

        let mut daemon = watch_loop(&[false, true, false, true], firewall);
        daemon.reconcile();

        daemon.poll();
        assert_eq!(daemon.failed_mutations, 1);
        daemon.poll();
        assert_eq!(daemon.failed_mutations, 0);
        daemon.poll();
        assert_eq!(daemon.failed_mutations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_interval_stops_without_touching_pf() {
        let pf = FakePf::with_enabled(false);
        let mut daemon = watch_loop(&[true, true, true], pf.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            daemon.run(shutdown_rx).await;
            daemon
        });

        // One tick at 5s, then stop halfway to the next.
        time::sleep(Duration::from_millis(7_500)).await;
        shutdown_tx.send(true).unwrap();

        let started = Instant::now();
        let daemon = handle.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(daemon.last_known_connected());
        assert!(pf.is_enabled());
        assert_eq!(pf.calls(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_drive_transitions() {
        let pf = FakePf::with_enabled(false);
        // startup, then ticks at 5s, 10s, 15s
        let mut daemon = watch_loop(&[false, true, true, false], pf.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            daemon.run(shutdown_rx).await;
            daemon
        });

        time::sleep(Duration::from_millis(16_000)).await;
        shutdown_tx.send(true).unwrap();
        let daemon = handle.await.unwrap();

        assert!(!daemon.last_known_connected());
        assert_eq!(pf.calls(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn already_requested_shutdown_only_reconciles() {
        let mut reader = MockTunnelSignalReader::new();
        reader
            .expect_resolver_config()
            .times(1)
            .return_const(String::new());
        reader
            .expect_interface_list()
            .times(1)
            .return_const(String::new());

        let mut firewall = MockFirewallController::new();
        firewall.expect_is_enabled().times(1).return_const(false);
        firewall.expect_enable().never();
        firewall.expect_disable().never();

        let mut daemon = WatchLoop::new(VpnDetector::new(reader), firewall, Duration::from_secs(5));
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        daemon.run(shutdown_rx).await;
        assert!(!daemon.last_known_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_beats_a_tick_due_at_the_same_time() {
        let pf = FakePf::with_enabled(false);
        // The tick at 5s would see the VPN come up.
        let mut daemon = watch_loop(&[false, true], pf.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            daemon.run(shutdown_rx).await;
            daemon
        });
        tokio::task::yield_now().await;

        shutdown_tx.send(true).unwrap();
        time::advance(Duration::from_secs(5)).await;
        let daemon = handle.await.unwrap();

        assert!(!daemon.last_known_connected());
        assert_eq!(pf.calls(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_ends_the_loop() {
        let pf = FakePf::with_enabled(false);
        let mut daemon = watch_loop(&[false], pf.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        daemon.run(shutdown_rx).await;
        assert_eq!(pf.calls(), (0, 0));
    }
}
