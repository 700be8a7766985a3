use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Firmware version stamped into every fragment.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One snapshot of sensor and metadata values, produced per acquisition
/// cycle. Built fresh, serialized, forwarded, discarded; never stored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct TelemetryFragment {
    fields: Map<String, Value>,
}

impl TelemetryFragment {
    /// Starts a fragment with the metadata every device reports:
    /// identity, firmware version and link quality.
    pub fn new(device_id: &str, rssi: i32) -> Self {
        let mut fragment = Self::default();
        fragment.set_str("deviceId", device_id);
        fragment.set_str("firmwareVersion", FIRMWARE_VERSION);
        fragment.set_i64("rssi", rssi as i64);
        fragment
    }

    /// Numeric field. Non-finite values are discarded, a reading that
    /// produced NaN must not reach the wire.
    pub fn set_number(&mut self, name: &str, value: f64) {
        if let Some(number) = Number::from_f64(value) {
            let _ = self.fields.insert(name.to_string(), Value::Number(number));
        }
    }

    pub fn set_i64(&mut self, name: &str, value: i64) {
        let _ = self.fields.insert(name.to_string(), Value::Number(value.into()));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        let _ = self.fields.insert(name.to_string(), Value::Bool(value));
    }

    pub fn set_str(&mut self, name: &str, value: &str) {
        let _ = self
            .fields
            .insert(name.to_string(), Value::String(value.to_string()));
    }

    /// RFC 3339 acquisition timestamp.
    pub fn stamp(&mut self) {
        self.set_str("timestamp", &Utc::now().to_rfc3339());
    }

    /// Marks a fragment as authored by the gateway itself rather than
    /// relayed from a node.
    pub fn mark_gateway(&mut self) {
        self.set_bool("gateway", true);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fragment_carries_device_metadata() {
        let fragment = TelemetryFragment::new("node-01", -62);
        assert_eq!(
            fragment.get("deviceId"),
            Some(&Value::String("node-01".into()))
        );
        assert_eq!(
            fragment.get("firmwareVersion"),
            Some(&Value::String(FIRMWARE_VERSION.into()))
        );
        assert_eq!(fragment.number("rssi"), Some(-62.0));
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let mut fragment = TelemetryFragment::default();
        fragment.set_number("bad", f64::NAN);
        fragment.set_number("worse", f64::INFINITY);
        fragment.set_number("fine", 21.5);
        assert_eq!(fragment.len(), 1);
        assert_eq!(fragment.number("fine"), Some(21.5));
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let mut fragment = TelemetryFragment::new("gw-01", -41);
        fragment.mark_gateway();
        fragment.set_number("m1", 42.5);
        let raw = fragment.to_json().unwrap();
        let back = TelemetryFragment::from_json(&raw).unwrap();
        assert_eq!(back, fragment);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(TelemetryFragment::from_json("[1,2,3]").is_err());
        assert!(TelemetryFragment::from_json("not json").is_err());
    }
}
