//! Wi-Fi station and access-point lifecycle. A device with bad or
//! missing credentials must always end up reachable through the
//! provisioning portal, so every failure path lands in `Provisioning`.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::hardware::{ResetInput, WifiDriver};

/// Join attempt budget before degrading to provisioning.
pub const STATION_ATTEMPTS: u32 = 20;
pub const STATION_ATTEMPT_DELAY: Duration = Duration::from_millis(500);

/// A provisioning session with no saved configuration restarts after
/// this long, in case the access point came up dead.
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(300);

/// How long the reset input must be held to erase the configuration.
pub const RESET_HOLD: Duration = Duration::from_secs(3);

const RESET_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Unconfigured,
    Provisioning,
    StationConnecting,
    StationConnected,
    StationFailed,
}

pub struct ConnectivityManager {
    wifi: Box<dyn WifiDriver + Send>,
    state: ConnectivityState,
    provisioning_since: Option<Instant>,
}

impl ConnectivityManager {
    pub fn new(wifi: Box<dyn WifiDriver + Send>) -> Self {
        ConnectivityManager {
            wifi,
            state: ConnectivityState::Unconfigured,
            provisioning_since: None,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Station link quality, 0 until the link is up.
    pub fn rssi(&self) -> i32 {
        if !self.wifi.is_connected() {
            return 0;
        }
        self.wifi.rssi()
    }

    /// Tries to join the configured network within the attempt budget.
    /// Exhausting the budget falls back to provisioning so the device
    /// stays reachable for reconfiguration.
    pub async fn establish(&mut self, config: &DeviceConfig) -> Result<ConnectivityState> {
        self.establish_with(config, STATION_ATTEMPTS, STATION_ATTEMPT_DELAY)
            .await
    }

    pub(crate) async fn establish_with(
        &mut self,
        config: &DeviceConfig,
        attempts: u32,
        delay: Duration,
    ) -> Result<ConnectivityState> {
        self.state = ConnectivityState::StationConnecting;
        info!(ssid = %config.ssid, "joining station network");
        for attempt in 1..=attempts {
            if self.wifi.connect_station(&config.ssid, &config.password) {
                self.state = ConnectivityState::StationConnected;
                info!(attempt, rssi = self.wifi.rssi(), "station connected");
                return Ok(self.state);
            }
            tokio::time::sleep(delay).await;
        }
        warn!(attempts, "station join budget exhausted");
        self.state = ConnectivityState::StationFailed;
        self.enter_provisioning()?;
        // ends in Provisioning, never stuck retrying with bad credentials
        Ok(self.state)
    }

    /// Starts the setup access point and captive DNS. The only way out
    /// of this state is a restart, either from an accepted
    /// configuration or from the provisioning timeout.
    pub fn enter_provisioning(&mut self) -> Result<()> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let ssid = format!("soilmesh-setup-{}", &suffix[..6]);
        self.wifi.start_access_point(&ssid)?;
        self.wifi.start_captive_dns()?;
        self.state = ConnectivityState::Provisioning;
        self.provisioning_since = Some(Instant::now());
        info!(%ssid, "provisioning portal reachable");
        Ok(())
    }

    pub fn provisioning_expired(&self, now: Instant) -> bool {
        self.state == ConnectivityState::Provisioning
            && self
                .provisioning_since
                .is_some_and(|since| now.duration_since(since) >= PROVISIONING_TIMEOUT)
    }
}

/// Tracks the dedicated reset input across loop iterations and fires
/// once the hold time is reached.
pub struct ResetWatcher {
    input: Box<dyn ResetInput + Send>,
    pressed_since: Option<Instant>,
}

impl ResetWatcher {
    pub fn new(input: Box<dyn ResetInput + Send>) -> Self {
        ResetWatcher {
            input,
            pressed_since: None,
        }
    }

    /// Resolves once the input has been held for the full duration.
    /// Raced against other bounded waits so the hold works while the
    /// device is joining a network or waiting for mesh peers.
    pub async fn held(&mut self) {
        loop {
            if self.check(Instant::now()) {
                return;
            }
            tokio::time::sleep(RESET_POLL).await;
        }
    }

    /// Returns true exactly once per continuous hold of the full
    /// duration. Releasing the input resets the timer.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.input.is_pressed() {
            let since = *self.pressed_since.get_or_insert(now);
            if now.duration_since(since) >= RESET_HOLD {
                self.pressed_since = None;
                return true;
            }
        } else {
            self.pressed_since = None;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct WifiLog {
        ap_ssid: Option<String>,
        dns_started: bool,
    }

    struct ScriptedWifi {
        /// Join attempts succeed once this many have failed.
        fail_first: u32,
        attempts: u32,
        log: Arc<Mutex<WifiLog>>,
    }

    impl ScriptedWifi {
        fn new(fail_first: u32) -> (Self, Arc<Mutex<WifiLog>>) {
            let log = Arc::new(Mutex::new(WifiLog::default()));
            (
                ScriptedWifi {
                    fail_first,
                    attempts: 0,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl WifiDriver for ScriptedWifi {
        fn connect_station(&mut self, _ssid: &str, _password: &str) -> bool {
            self.attempts += 1;
            self.attempts > self.fail_first
        }
        fn is_connected(&self) -> bool {
            self.attempts > self.fail_first
        }
        fn rssi(&self) -> i32 {
            -55
        }
        fn start_access_point(&mut self, ssid: &str) -> Result<()> {
            self.log.lock().unwrap().ap_ssid = Some(ssid.to_string());
            Ok(())
        }
        fn start_captive_dns(&mut self) -> Result<()> {
            self.log.lock().unwrap().dns_started = true;
            Ok(())
        }
    }

    struct HeldInput(bool);
    impl ResetInput for HeldInput {
        fn is_pressed(&mut self) -> bool {
            self.0
        }
    }

    fn config() -> DeviceConfig {
        DeviceConfig {
            ssid: "farmnet".into(),
            password: "secret".into(),
            endpoint_host: "hub".into(),
            device_id: "dev".into(),
            ..DeviceConfig::default()
        }
    }

    #[tokio::test]
    async fn join_within_budget_reaches_station_connected() {
        let (wifi, _log) = ScriptedWifi::new(2);
        let mut manager = ConnectivityManager::new(Box::new(wifi));
        let state = manager
            .establish_with(&config(), 5, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(state, ConnectivityState::StationConnected);
    }

    #[tokio::test]
    async fn exhausted_budget_degrades_to_provisioning() {
        let (wifi, log) = ScriptedWifi::new(u32::MAX);
        let mut manager = ConnectivityManager::new(Box::new(wifi));
        let state = manager
            .establish_with(&config(), 3, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(state, ConnectivityState::Provisioning);
        assert_eq!(manager.state(), ConnectivityState::Provisioning);
        assert!(manager.provisioning_since.is_some());
        assert!(log.lock().unwrap().ap_ssid.is_some());
    }

    #[tokio::test]
    async fn rssi_reads_zero_until_connected() {
        let (wifi, _log) = ScriptedWifi::new(0);
        let mut manager = ConnectivityManager::new(Box::new(wifi));
        assert_eq!(manager.rssi(), 0);
        manager
            .establish_with(&config(), 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(manager.rssi(), -55);
    }

    #[test]
    fn provisioning_starts_ap_and_captive_dns() {
        let (wifi, log) = ScriptedWifi::new(0);
        let mut manager = ConnectivityManager::new(Box::new(wifi));
        manager.enter_provisioning().unwrap();
        assert_eq!(manager.state(), ConnectivityState::Provisioning);
        let log = log.lock().unwrap();
        assert!(log.ap_ssid.as_deref().unwrap().starts_with("soilmesh-setup-"));
        assert!(log.dns_started);
    }

    #[test]
    fn provisioning_expires_after_timeout() {
        let (wifi, _log) = ScriptedWifi::new(0);
        let mut manager = ConnectivityManager::new(Box::new(wifi));
        manager.enter_provisioning().unwrap();
        let entered = manager.provisioning_since.unwrap();
        assert!(!manager.provisioning_expired(entered));
        assert!(!manager.provisioning_expired(entered + PROVISIONING_TIMEOUT - Duration::from_secs(1)));
        assert!(manager.provisioning_expired(entered + PROVISIONING_TIMEOUT));
    }

    #[test]
    fn reset_fires_only_after_full_hold() {
        let mut watcher = ResetWatcher::new(Box::new(HeldInput(true)));
        let t0 = Instant::now();
        assert!(!watcher.check(t0));
        assert!(!watcher.check(t0 + Duration::from_secs(2)));
        assert!(watcher.check(t0 + RESET_HOLD));
        // released timer restarts from scratch
        assert!(!watcher.check(t0 + RESET_HOLD + Duration::from_secs(1)));
    }

    #[test]
    fn released_input_never_fires() {
        let mut watcher = ResetWatcher::new(Box::new(HeldInput(false)));
        let t0 = Instant::now();
        assert!(!watcher.check(t0));
        assert!(!watcher.check(t0 + Duration::from_secs(10)));
    }
}
