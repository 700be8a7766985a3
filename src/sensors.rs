//! Sensor abstraction layer: turns the configured descriptor list into
//! uniform telemetry fields. Vendor bus drivers stay behind the reader
//! traits; the registry only owns wiring, sharing and value derivation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{SensorDescriptor, SensorKind};
use crate::telemetry::TelemetryFragment;

/// Raw ADC input for a single pin.
pub trait AnalogReader {
    fn read_raw(&mut self) -> Option<u16>;
}

/// Bare digital level on a single pin.
pub trait DigitalReader {
    fn read_level(&mut self) -> Option<bool>;
}

/// Combined temperature and relative-humidity probe (DHT22 class).
pub trait ClimateSensor {
    /// (temperature °C, relative humidity %).
    fn read(&mut self) -> Option<(f64, f64)>;
}

/// One-wire temperature bus (DS18B20 class). Several probes share one
/// physical bus; a conversion must be requested bus-wide before any
/// probe is read by index.
pub trait OneWireBus {
    fn request_conversion(&mut self);
    fn read_temperature(&mut self, index: u8) -> Option<f64>;
}

#[derive(Debug, Clone, Copy)]
pub struct BaroReading {
    pub pressure_hpa: f64,
    pub temperature: f64,
    pub humidity: Option<f64>,
}

/// I²C barometric sensor (BME280/BMP280 class).
pub trait Barometer {
    fn read(&mut self) -> Option<BaroReading>;
}

/// Factory for the vendor bus drivers. Called once per descriptor
/// during build; the registry handles bus sharing on top of it.
pub trait SensorDrivers {
    fn analog(&mut self, pin: u8) -> Box<dyn AnalogReader + Send>;
    fn digital(&mut self, pin: u8) -> Box<dyn DigitalReader + Send>;
    fn climate(&mut self, pin: u8) -> Box<dyn ClimateSensor + Send>;
    fn one_wire(&mut self, pin: u8) -> Arc<Mutex<dyn OneWireBus + Send>>;
    fn barometer(&mut self, address: u8) -> Box<dyn Barometer + Send>;
}

/// Capacitive moisture calibration: `air_value` is the raw reading in
/// air (dry, 0%), `water_value` the raw reading submerged (wet, 100%).
/// Clamped so out-of-range raw inputs never leave [0, 100].
pub fn moisture_percent(raw: u16, air_value: u16, water_value: u16) -> f64 {
    let dry = f64::from(air_value);
    let wet = f64::from(water_value);
    if (dry - wet).abs() < f64::EPSILON {
        return 0.0;
    }
    let percent = 100.0 * (dry - f64::from(raw)) / (dry - wet);
    percent.clamp(0.0, 100.0)
}

enum Reader {
    Moisture {
        air_value: u16,
        water_value: u16,
        input: Box<dyn AnalogReader + Send>,
    },
    Climate {
        input: Box<dyn ClimateSensor + Send>,
    },
    OneWire {
        index: u8,
        bus: Arc<Mutex<dyn OneWireBus + Send>>,
    },
    Baro {
        input: Box<dyn Barometer + Send>,
    },
    Digital {
        input: Box<dyn DigitalReader + Send>,
    },
}

/// The set of configured sensor instances for this device.
#[derive(Default)]
pub struct SensorRegistry {
    sensors: Vec<(String, Reader)>,
    one_wire_buses: HashMap<u8, Arc<Mutex<dyn OneWireBus + Send>>>,
}

impl SensorRegistry {
    /// Instantiates one reader per descriptor. The first one-wire
    /// descriptor on a pin creates the bus driver, later ones on the
    /// same pin reuse it; exactly one driver exists per physical bus.
    pub fn build(descriptors: &[SensorDescriptor], drivers: &mut dyn SensorDrivers) -> Self {
        let mut registry = SensorRegistry::default();
        for descriptor in descriptors {
            let reader = match descriptor.kind {
                SensorKind::CapacitiveMoisture {
                    pin,
                    air_value,
                    water_value,
                } => Reader::Moisture {
                    air_value,
                    water_value,
                    input: drivers.analog(pin),
                },
                SensorKind::TemperatureHumidity { pin } => Reader::Climate {
                    input: drivers.climate(pin),
                },
                SensorKind::OneWireTemperature { pin, index } => {
                    let bus = registry
                        .one_wire_buses
                        .entry(pin)
                        .or_insert_with(|| drivers.one_wire(pin))
                        .clone();
                    Reader::OneWire { index, bus }
                }
                SensorKind::PressureTempHumidity { address } => Reader::Baro {
                    input: drivers.barometer(address),
                },
                SensorKind::PressureTemp { address } => Reader::Baro {
                    input: drivers.barometer(address),
                },
                SensorKind::DigitalInput { pin } => Reader::Digital {
                    input: drivers.digital(pin),
                },
            };
            registry.sensors.push((descriptor.name.clone(), reader));
        }
        info!(
            sensors = registry.sensors.len(),
            one_wire_buses = registry.one_wire_buses.len(),
            "sensor registry built"
        );
        registry
    }

    /// Polls every configured sensor once into the fragment. A sensor
    /// that returns an invalid reading is skipped, never failing the
    /// whole cycle. One-wire buses get one conversion request per
    /// cycle before any probe is read.
    pub fn acquire(&mut self, fragment: &mut TelemetryFragment) {
        for bus in self.one_wire_buses.values() {
            bus.lock().unwrap_or_else(|e| e.into_inner()).request_conversion();
        }
        for (name, reader) in &mut self.sensors {
            match reader {
                Reader::Moisture {
                    air_value,
                    water_value,
                    input,
                } => match input.read_raw() {
                    Some(raw) => {
                        fragment.set_number(name, moisture_percent(raw, *air_value, *water_value))
                    }
                    None => warn!(sensor = %name, "moisture read failed, skipped"),
                },
                Reader::Climate { input } => match input.read() {
                    Some((temperature, humidity))
                        if temperature.is_finite() && humidity.is_finite() =>
                    {
                        fragment.set_number(&format!("{name}_temp"), temperature);
                        fragment.set_number(&format!("{name}_hum"), humidity);
                    }
                    _ => warn!(sensor = %name, "climate read invalid, skipped"),
                },
                Reader::OneWire { index, bus } => {
                    let reading = bus
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .read_temperature(*index);
                    match reading {
                        Some(temperature) if temperature.is_finite() => {
                            fragment.set_number(name, temperature)
                        }
                        _ => warn!(sensor = %name, index = *index, "probe read invalid, skipped"),
                    }
                }
                Reader::Baro { input } => match input.read() {
                    Some(reading)
                        if reading.pressure_hpa.is_finite() && reading.temperature.is_finite() =>
                    {
                        fragment.set_number(&format!("{name}_pres"), reading.pressure_hpa);
                        fragment.set_number(&format!("{name}_temp"), reading.temperature);
                        if let Some(humidity) = reading.humidity.filter(|h| h.is_finite()) {
                            fragment.set_number(&format!("{name}_hum"), humidity);
                        }
                    }
                    _ => warn!(sensor = %name, "barometer read invalid, skipped"),
                },
                Reader::Digital { input } => match input.read_level() {
                    Some(level) => fragment.set_bool(name, level),
                    None => warn!(sensor = %name, "digital read failed, skipped"),
                },
            }
        }
        debug!(fields = fragment.len(), "acquisition cycle complete");
    }

    /// Releases every sensor and bus driver instance. Safe to call
    /// before a fresh `build` after reconfiguration.
    pub fn clear(&mut self) {
        self.sensors.clear();
        self.one_wire_buses.clear();
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn one_wire_bus_count(&self) -> usize {
        self.one_wire_buses.len()
    }
}
