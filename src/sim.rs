//! Host implementations of the hardware collaborators. The binary runs
//! against these so a virtual device can be exercised end to end on a
//! laptop; a board port swaps them for real drivers.

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::hardware::{Board, MeshTransport, PowerControl, ResetInput, RetainedMemory, WifiDriver};
use crate::sensors::{
    AnalogReader, BaroReading, Barometer, ClimateSensor, DigitalReader, OneWireBus, SensorDrivers,
};

/// Always joins on the first attempt and reports a plausible signal.
pub struct SimWifi {
    connected: bool,
}

impl SimWifi {
    pub fn new() -> Self {
        SimWifi { connected: false }
    }
}

impl Default for SimWifi {
    fn default() -> Self {
        Self::new()
    }
}

impl WifiDriver for SimWifi {
    fn connect_station(&mut self, ssid: &str, _password: &str) -> bool {
        info!(%ssid, "sim wifi joined");
        self.connected = true;
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn rssi(&self) -> i32 {
        if self.connected {
            -40 - rand::thread_rng().gen_range(0..8)
        } else {
            0
        }
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<()> {
        info!(%ssid, "sim access point up");
        Ok(())
    }

    fn start_captive_dns(&mut self) -> Result<()> {
        Ok(())
    }
}

type SharedQueue = Arc<Mutex<VecDeque<String>>>;

/// In-process mesh: two endpoints over a pair of shared queues. Peer
/// count is 1 once paired, 0 for a standalone endpoint.
pub struct SimMeshTransport {
    outbound: Option<SharedQueue>,
    inbound: Option<SharedQueue>,
}

impl SimMeshTransport {
    /// A mesh with no peers.
    pub fn standalone() -> Self {
        SimMeshTransport {
            outbound: None,
            inbound: None,
        }
    }

    /// Two connected endpoints; what one broadcasts the other
    /// receives.
    pub fn pair() -> (Self, Self) {
        let a_to_b: SharedQueue = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a: SharedQueue = Arc::new(Mutex::new(VecDeque::new()));
        (
            SimMeshTransport {
                outbound: Some(a_to_b.clone()),
                inbound: Some(b_to_a.clone()),
            },
            SimMeshTransport {
                outbound: Some(b_to_a),
                inbound: Some(a_to_b),
            },
        )
    }
}

impl MeshTransport for SimMeshTransport {
    fn init(&mut self, mesh_id: &str) -> Result<()> {
        info!(%mesh_id, "sim mesh up");
        Ok(())
    }

    fn broadcast(&mut self, payload: &str) -> Result<()> {
        if let Some(queue) = &self.outbound {
            queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(payload.to_string());
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<String> {
        self.inbound
            .as_ref()?
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn peer_count(&self) -> usize {
        usize::from(self.outbound.is_some())
    }

    fn hop_count(&self) -> u32 {
        u32::from(self.outbound.is_some())
    }

    fn link_rssi(&self) -> i32 {
        -60 - rand::thread_rng().gen_range(0..10)
    }

    fn update(&mut self) {}
}

/// Reset input that is never pressed.
pub struct SimResetInput;

impl ResetInput for SimResetInput {
    fn is_pressed(&mut self) -> bool {
        false
    }
}

/// Power control for a host process: restart and deep sleep both end
/// the process, which is the closest host analog to a reset.
pub struct SimPower;

impl PowerControl for SimPower {
    fn restart(&mut self) {
        info!("sim restart requested, exiting");
        std::process::exit(0);
    }

    fn deep_sleep(&mut self, duration: Duration) {
        info!(seconds = duration.as_secs(), "sim deep sleep, exiting");
        std::process::exit(0);
    }

    fn battery_volts(&mut self) -> Option<f64> {
        Some(3.6 + rand::thread_rng().gen_range(0.0..0.3))
    }
}

#[derive(Serialize, Deserialize, Default)]
struct RetainedState {
    boot_count: u32,
}

/// Retained memory backed by a small JSON file in the data directory,
/// so the boot counter survives process restarts like RTC memory
/// survives deep sleep. Deleting the file is the power-loss analog.
pub struct FileRetainedMemory {
    path: PathBuf,
    state: RetainedState,
}

impl FileRetainedMemory {
    pub fn open(dir: &Path) -> Self {
        let path = dir.join("retained.json");
        let state = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        FileRetainedMemory { path, state }
    }
}

impl RetainedMemory for FileRetainedMemory {
    fn boot_count(&self) -> u32 {
        self.state.boot_count
    }

    fn set_boot_count(&mut self, count: u32) {
        self.state.boot_count = count;
        if let Ok(raw) = serde_json::to_string(&self.state) {
            let _ = fs::write(&self.path, raw);
        }
    }
}

struct SimAnalog {
    center: u16,
}

impl AnalogReader for SimAnalog {
    fn read_raw(&mut self) -> Option<u16> {
        let jitter: i32 = rand::thread_rng().gen_range(-150..150);
        Some((i32::from(self.center) + jitter).clamp(0, 4095) as u16)
    }
}

struct SimDigital;

impl DigitalReader for SimDigital {
    fn read_level(&mut self) -> Option<bool> {
        Some(rand::thread_rng().gen_bool(0.5))
    }
}

struct SimClimate;

impl ClimateSensor for SimClimate {
    fn read(&mut self) -> Option<(f64, f64)> {
        let mut rng = rand::thread_rng();
        let temp = 20.0 + rng.gen_range(-2.5..2.5);
        let humidity = 50.0 + rng.gen_range(-5.0..5.0);
        Some((temp, humidity))
    }
}

struct SimOneWire {
    converted: bool,
}

impl OneWireBus for SimOneWire {
    fn request_conversion(&mut self) {
        self.converted = true;
    }

    fn read_temperature(&mut self, index: u8) -> Option<f64> {
        if !self.converted {
            return None;
        }
        let jitter = rand::thread_rng().gen_range(-0.1..0.1);
        Some(18.5 + 0.25 * f64::from(index) + jitter)
    }
}

struct SimBarometer {
    with_humidity: bool,
}

impl Barometer for SimBarometer {
    fn read(&mut self) -> Option<BaroReading> {
        let mut rng = rand::thread_rng();
        Some(BaroReading {
            pressure_hpa: 1013.0 + rng.gen_range(-4.0..4.0),
            temperature: 21.0 + rng.gen_range(-1.5..1.5),
            humidity: self.with_humidity.then(|| 48.0 + rng.gen_range(-4.0..4.0)),
        })
    }
}

/// Factory producing the simulated sensor fleet.
pub struct SimSensorDrivers;

impl SensorDrivers for SimSensorDrivers {
    fn analog(&mut self, _pin: u8) -> Box<dyn AnalogReader + Send> {
        Box::new(SimAnalog { center: 2600 })
    }

    fn digital(&mut self, _pin: u8) -> Box<dyn DigitalReader + Send> {
        Box::new(SimDigital)
    }

    fn climate(&mut self, _pin: u8) -> Box<dyn ClimateSensor + Send> {
        Box::new(SimClimate)
    }

    fn one_wire(&mut self, _pin: u8) -> Arc<Mutex<dyn OneWireBus + Send>> {
        Arc::new(Mutex::new(SimOneWire { converted: false }))
    }

    fn barometer(&mut self, address: u8) -> Box<dyn Barometer + Send> {
        // 0x76/0x77 with humidity is the BME280 convention
        Box::new(SimBarometer {
            with_humidity: address == 0x76 || address == 0x77,
        })
    }
}

/// A complete simulated board for the host binary.
pub fn host_board(data_dir: &Path) -> Board {
    Board {
        wifi: Box::new(SimWifi::new()),
        mesh: Box::new(SimMeshTransport::standalone()),
        reset: Box::new(SimResetInput),
        power: Box::new(SimPower),
        retained: Box::new(FileRetainedMemory::open(data_dir)),
        drivers: Box::new(SimSensorDrivers),
    }
}
