//! Boot orchestration and role dispatch. One pass through `boot`
//! decides whether this power cycle runs the provisioning portal, the
//! always-on gateway loop or the node's single-shot duty cycle.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cloud::CloudForwarder;
use crate::config::{ConfigStore, DeviceConfig, DeviceRole, SensorDescriptor};
use crate::connectivity::{ConnectivityManager, ConnectivityState, ResetWatcher};
use crate::hardware::{halt, mount_storage, Board, PowerControl};
use crate::mesh::MeshRelay;
use crate::scheduler::{
    GatewayCycle, NodeCycle, ShotOutcome, GATEWAY_INTERVAL, PEER_WAIT_TIMEOUT, SERVICE_TICK,
};
use crate::sensors::SensorRegistry;
use crate::telemetry::TelemetryFragment;

/// Outcome of one boot pass.
pub enum Boot {
    Provision(ProvisioningRuntime),
    Gateway(GatewayRuntime),
    Node(NodeRuntime),
    /// The reset input was held during boot; the configuration is
    /// erased and a restart has been requested.
    Restart,
}

/// Determines the role for this power cycle and builds its runtime.
///
/// An unmountable data partition halts the device; a missing or
/// invalid configuration forces provisioning; everything else follows
/// the configured role.
pub async fn boot(store: ConfigStore, mut board: Board) -> Result<Boot> {
    if mount_storage(store.dir()).is_err() {
        halt().await;
    }

    let (config, valid) = store.load();
    let mut connectivity = ConnectivityManager::new(board.wifi);
    let mut watcher = ResetWatcher::new(board.reset);

    if !valid || !config.is_valid() {
        info!("no usable configuration, entering provisioning");
        connectivity.enter_provisioning()?;
        return Ok(Boot::Provision(ProvisioningRuntime {
            connectivity,
            watcher,
            store,
            power: board.power,
            drivers: board.drivers,
            current: if valid { Some(config) } else { None },
        }));
    }

    // the hold must work even while the join budget is being spent
    let state = tokio::select! {
        state = connectivity.establish(&config) => state?,
        _ = watcher.held() => {
            store.erase()?;
            info!("reset held during station join, configuration erased, restarting");
            board.power.restart();
            return Ok(Boot::Restart);
        }
    };
    if state != ConnectivityState::StationConnected {
        warn!("station join failed, entering provisioning");
        return Ok(Boot::Provision(ProvisioningRuntime {
            connectivity,
            watcher,
            store,
            power: board.power,
            drivers: board.drivers,
            current: Some(config),
        }));
    }

    let registry = SensorRegistry::build(&config.sensors, board.drivers.as_mut());
    let mut relay = MeshRelay::new(board.mesh);
    relay.init(&config.device_id)?;

    match config.role {
        DeviceRole::Gateway => {
            let forwarder = CloudForwarder::from_config(&config);
            info!(device_id = %config.device_id, "booting as gateway");
            Ok(Boot::Gateway(GatewayRuntime {
                cycle: GatewayCycle::new(registry, relay, forwarder, &config.device_id),
                connectivity,
                watcher,
                store,
                power: board.power,
            }))
        }
        DeviceRole::Node => {
            let boot_count = board.retained.boot_count().saturating_add(1);
            board.retained.set_boot_count(boot_count);
            let battery = board.power.battery_volts();
            info!(device_id = %config.device_id, boot_count, "booting as node");
            Ok(Boot::Node(NodeRuntime {
                cycle: NodeCycle::new(registry, relay, &config.device_id),
                watcher,
                store,
                power: board.power,
                boot_count,
                battery,
                sleep: Duration::from_secs(config.sleep_seconds),
            }))
        }
    }
}

/// Boots and then runs the selected role to completion.
pub async fn run(store: ConfigStore, board: Board) -> Result<()> {
    match boot(store, board).await? {
        Boot::Provision(runtime) => runtime.run().await,
        Boot::Gateway(runtime) => runtime.run().await,
        Boot::Node(runtime) => runtime.run().await,
        Boot::Restart => Ok(()),
    }
}

/// Captive-portal session. The portal handler calls into this surface;
/// the loop only services the reset input and the session timeout.
pub struct ProvisioningRuntime {
    connectivity: ConnectivityManager,
    watcher: ResetWatcher,
    store: ConfigStore,
    power: Box<dyn PowerControl + Send>,
    drivers: Box<dyn crate::sensors::SensorDrivers + Send>,
    current: Option<DeviceConfig>,
}

impl ProvisioningRuntime {
    /// The configuration already on the device, for portal prefill.
    pub fn current_config(&self) -> Option<&DeviceConfig> {
        self.current.as_ref()
    }

    /// Persists a submitted configuration and restarts into it. The
    /// new settings only take effect through the restart.
    pub fn accept_config(&mut self, config: DeviceConfig) -> Result<()> {
        self.store.save(&config)?;
        info!("configuration accepted, restarting");
        self.power.restart();
        Ok(())
    }

    /// Takes one reading from a candidate sensor list so the portal
    /// can show live values before the user commits.
    pub fn probe_sensors(&mut self, descriptors: &[SensorDescriptor]) -> TelemetryFragment {
        let mut registry = SensorRegistry::build(descriptors, self.drivers.as_mut());
        let mut fragment = TelemetryFragment::new("probe", 0);
        registry.acquire(&mut fragment);
        fragment
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::time::sleep(SERVICE_TICK).await;
            let now = Instant::now();
            if self.watcher.check(now) {
                self.store.erase()?;
                info!("reset held, configuration erased, restarting");
                self.power.restart();
                return Ok(());
            }
            if self.connectivity.provisioning_expired(now) {
                warn!("provisioning session expired, restarting");
                self.power.restart();
                return Ok(());
            }
        }
    }
}

/// Always-on gateway loop: periodic beats, mesh servicing and the
/// reset input, multiplexed on one task.
pub struct GatewayRuntime {
    cycle: GatewayCycle<CloudForwarder>,
    connectivity: ConnectivityManager,
    watcher: ResetWatcher,
    store: ConfigStore,
    power: Box<dyn PowerControl + Send>,
}

impl GatewayRuntime {
    pub async fn run(mut self) -> Result<()> {
        let mut beat = tokio::time::interval(GATEWAY_INTERVAL);
        let mut service = tokio::time::interval(SERVICE_TICK);
        loop {
            tokio::select! {
                _ = beat.tick() => {
                    let rssi = self.connectivity.rssi();
                    self.cycle.beat(rssi).await;
                }
                _ = service.tick() => {
                    let rssi = self.connectivity.rssi();
                    self.cycle.service(rssi).await;
                    if self.watcher.check(Instant::now()) {
                        self.store.erase()?;
                        info!("reset held, configuration erased, restarting");
                        self.power.restart();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Battery-node duty cycle: one shot then deep sleep on the first
/// wake of a power cycle; later wakes skip the send and idle with only
/// the reset input serviced.
pub struct NodeRuntime {
    cycle: NodeCycle,
    watcher: ResetWatcher,
    store: ConfigStore,
    power: Box<dyn PowerControl + Send>,
    boot_count: u32,
    battery: Option<f64>,
    sleep: Duration,
}

impl NodeRuntime {
    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    pub async fn run(mut self) -> Result<()> {
        // the hold must work during the peer wait too
        let outcome = tokio::select! {
            outcome = self.cycle.one_shot(self.boot_count, self.battery, PEER_WAIT_TIMEOUT) => outcome,
            _ = self.watcher.held() => {
                self.store.erase()?;
                info!("reset held, configuration erased, restarting");
                self.power.restart();
                return Ok(());
            }
        };
        // a lost broadcast is accepted data loss; the first wake still
        // spent its one attempt and the node suspends either way
        if outcome != ShotOutcome::Skipped {
            info!(sleep_seconds = self.sleep.as_secs(), "entering deep sleep");
            self.power.deep_sleep(self.sleep);
            return Ok(());
        }
        loop {
            tokio::time::sleep(SERVICE_TICK).await;
            if self.watcher.check(Instant::now()) {
                self.store.erase()?;
                info!("reset held, configuration erased, restarting");
                self.power.restart();
                return Ok(());
            }
        }
    }
}
