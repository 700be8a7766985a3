//! Persisted device configuration. The blob is a single JSON document
//! read once at boot and overwritten wholesale by the provisioning
//! portal; there is no partial mutation at runtime.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_SLEEP_SECONDS: u64 = 60;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceRole {
    #[serde(rename = "gateway")]
    Gateway,
    #[serde(rename = "node")]
    #[default]
    Node,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardProtocol {
    #[serde(rename = "http")]
    #[default]
    Http,
    #[serde(rename = "mqtt")]
    Mqtt,
    #[serde(rename = "sdk")]
    Sdk,
}

/// One configured physical sensor. The `type` tag selects the variant
/// and each variant carries only its own calibration fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SensorKind {
    #[serde(rename = "cap_soil_moisture")]
    CapacitiveMoisture {
        pin: u8,
        air_value: u16,
        water_value: u16,
    },
    #[serde(rename = "dht22")]
    TemperatureHumidity { pin: u8 },
    #[serde(rename = "ds18b20")]
    OneWireTemperature {
        pin: u8,
        #[serde(default)]
        index: u8,
    },
    #[serde(rename = "bme280")]
    PressureTempHumidity { address: u8 },
    #[serde(rename = "bmp280")]
    PressureTemp { address: u8 },
    #[serde(rename = "pin")]
    DigitalInput { pin: u8 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: SensorKind,
}

/// The whole persisted record. Serde renames match the external JSON
/// schema the provisioning portal writes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    #[serde(rename = "mode", default)]
    pub role: DeviceRole,
    #[serde(rename = "SSID", default)]
    pub ssid: String,
    #[serde(rename = "PASSWORD", default)]
    pub password: String,
    #[serde(rename = "IOTHUB_HOST", default)]
    pub endpoint_host: String,
    #[serde(rename = "DEVICE_ID", default)]
    pub device_id: String,
    #[serde(rename = "SAS_TOKEN", default)]
    pub sas_token: String,
    #[serde(rename = "PROTOCOL", default)]
    pub protocol: ForwardProtocol,
    #[serde(rename = "firmwareUrl", default, skip_serializing_if = "Option::is_none")]
    pub firmware_url: Option<String>,
    #[serde(rename = "sleepSeconds", default = "default_sleep_seconds")]
    pub sleep_seconds: u64,
    #[serde(default)]
    pub sensors: Vec<SensorDescriptor>,
}

fn default_sleep_seconds() -> u64 {
    DEFAULT_SLEEP_SECONDS
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            role: DeviceRole::default(),
            ssid: String::new(),
            password: String::new(),
            endpoint_host: String::new(),
            device_id: String::new(),
            sas_token: String::new(),
            protocol: ForwardProtocol::default(),
            firmware_url: None,
            sleep_seconds: DEFAULT_SLEEP_SECONDS,
            sensors: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// A device can only run normally with station credentials, an
    /// ingestion host and an identity. Anything less forces
    /// provisioning mode.
    pub fn is_valid(&self) -> bool {
        !self.ssid.is_empty() && !self.endpoint_host.is_empty() && !self.device_id.is_empty()
    }
}

/// Owns the configuration blob on the data partition.
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        ConfigStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Reads and parses the blob. A missing or malformed blob is not an
    /// error, it yields an empty invalid configuration so boot can
    /// degrade to provisioning instead of halting.
    pub fn load(&self) -> (DeviceConfig, bool) {
        let path = self.blob_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                info!(path = %path.display(), "no persisted configuration");
                return (DeviceConfig::default(), false);
            }
        };
        match serde_json::from_str::<DeviceConfig>(&raw) {
            Ok(config) => {
                let valid = config.is_valid();
                if !valid {
                    warn!("persisted configuration is incomplete");
                }
                (config, valid)
            }
            Err(error) => {
                warn!(%error, "persisted configuration is malformed");
                (DeviceConfig::default(), false)
            }
        }
    }

    /// Writes the blob through a temp file so the old content is only
    /// replaced once the new content is fully on disk. The caller is
    /// expected to restart the device afterwards; components never
    /// pick up a new configuration live.
    pub fn save(&self, config: &DeviceConfig) -> Result<()> {
        let raw = serde_json::to_string_pretty(config)?;
        let path = self.blob_path();
        let tmp = self.dir.join(format!("{CONFIG_FILE}.tmp"));
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Removes the blob so the next boot starts unconfigured.
    pub fn erase(&self) -> Result<()> {
        let path = self.blob_path();
        if path.exists() {
            fs::remove_file(&path)?;
            info!("configuration erased");
        }
        Ok(())
    }
}
