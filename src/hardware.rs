//! Narrow interfaces to the hardware collaborators. The orchestration
//! core only ever talks to these traits; the binary wires them to the
//! host simulation in `sim`, a board port wires them to real drivers.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{error, warn};

/// Station and access-point lifecycle of the Wi-Fi radio.
pub trait WifiDriver {
    /// One join attempt against the configured network. Blocks for at
    /// most one attempt, the retry budget lives in the connectivity
    /// manager.
    fn connect_station(&mut self, ssid: &str, password: &str) -> bool;

    fn is_connected(&self) -> bool;

    /// Link quality of the station connection in dBm.
    fn rssi(&self) -> i32;

    fn start_access_point(&mut self, ssid: &str) -> anyhow::Result<()>;

    /// Answers every DNS query with the device's own address so any
    /// client hostname lands on the provisioning portal.
    fn start_captive_dns(&mut self) -> anyhow::Result<()>;
}

/// Peer-to-peer packet transport provided by the mesh networking
/// library. Payloads are opaque strings at this level.
pub trait MeshTransport {
    fn init(&mut self, mesh_id: &str) -> anyhow::Result<()>;

    /// Fire-and-forget broadcast into the mesh.
    fn broadcast(&mut self, payload: &str) -> anyhow::Result<()>;

    /// Next inbound message, if any arrived since the last poll.
    fn try_recv(&mut self) -> Option<String>;

    fn peer_count(&self) -> usize;

    /// Hops between this device and the mesh root, 0 when directly
    /// attached.
    fn hop_count(&self) -> u32;

    /// Link quality of the mesh uplink in dBm.
    fn link_rssi(&self) -> i32;

    /// Transport housekeeping, called once per loop iteration.
    fn update(&mut self);
}

/// The dedicated reset input, active low.
pub trait ResetInput {
    fn is_pressed(&mut self) -> bool;
}

/// Restart, deep sleep and battery monitoring.
pub trait PowerControl {
    /// Requests a device restart. On real hardware this does not
    /// return; host implementations may, so callers return promptly
    /// after invoking it.
    fn restart(&mut self);

    /// True power-off suspension, no code runs until wake. Waking ends
    /// in a reset, not in this call returning.
    fn deep_sleep(&mut self, duration: Duration);

    /// Battery voltage, if the board has a battery monitor.
    fn battery_volts(&mut self) -> Option<f64>;
}

/// Small memory region that survives restarts and deep-sleep wakeups
/// but reads as zero after full power loss. Holds the boot counter the
/// node duty cycle keys its one-shot send on.
pub trait RetainedMemory {
    fn boot_count(&self) -> u32;
    fn set_boot_count(&mut self, count: u32);
}

/// Everything the controller needs from the board, bundled for wiring.
pub struct Board {
    pub wifi: Box<dyn WifiDriver + Send>,
    pub mesh: Box<dyn MeshTransport + Send>,
    pub reset: Box<dyn ResetInput + Send>,
    pub power: Box<dyn PowerControl + Send>,
    pub retained: Box<dyn RetainedMemory + Send>,
    pub drivers: Box<dyn crate::sensors::SensorDrivers + Send>,
}

/// Mounts the data partition, reformatting once if the first mount
/// fails. A second failure is the only fatal condition in the system.
pub fn mount_storage(dir: &Path) -> io::Result<()> {
    if fs::create_dir_all(dir).is_ok() {
        return Ok(());
    }
    warn!(dir = %dir.display(), "storage mount failed, reformatting");
    if fs::remove_dir_all(dir).is_err() {
        let _ = fs::remove_file(dir);
    }
    fs::create_dir_all(dir)
}

/// Terminal wait for the unrecoverable-storage case. No further
/// progress is possible without a data partition.
pub async fn halt() -> ! {
    error!("persistent storage unavailable after reformat, halting");
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mount_creates_missing_data_dir() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        mount_storage(&data).unwrap();
        assert!(data.is_dir());
        // mounting an existing dir is a no-op
        mount_storage(&data).unwrap();
    }

    #[test]
    fn mount_reformats_over_a_plain_file() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::write(&data, "junk").unwrap();
        mount_storage(&data).unwrap();
        assert!(data.is_dir());
    }
}
