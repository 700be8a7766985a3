//! Mesh relay between nodes and the gateway. Nodes broadcast their
//! fragment fire-and-forget; the gateway parses whatever arrives,
//! attaches its own link quality and hands the result upstream. A
//! corrupt peer message is dropped, it must never affect gateway
//! stability.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hardware::MeshTransport;
use crate::telemetry::TelemetryFragment;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("mesh relay driven before initialization")]
    NotInitialized,
    #[error("fragment serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mesh transport failure: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Mesh identity derived from the device identity. Stable across boots
/// and cheap to compute (FNV-1a).
pub fn mesh_identity(device_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in device_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("soilmesh-{:08x}", (hash as u32) ^ ((hash >> 32) as u32))
}

pub struct MeshRelay {
    transport: Box<dyn MeshTransport + Send>,
    initialized: bool,
}

impl MeshRelay {
    pub fn new(transport: Box<dyn MeshTransport + Send>) -> Self {
        MeshRelay {
            transport,
            initialized: false,
        }
    }

    pub fn init(&mut self, device_id: &str) -> Result<(), RelayError> {
        let identity = mesh_identity(device_id);
        self.transport.init(&identity)?;
        self.initialized = true;
        info!(mesh_id = %identity, "mesh relay initialized");
        Ok(())
    }

    /// Transport housekeeping. Driving an uninitialized transport is
    /// undefined, so this is a guarded no-op until `init` succeeds.
    pub fn update(&mut self) {
        if !self.initialized {
            return;
        }
        self.transport.update();
    }

    pub fn peer_count(&self) -> usize {
        if !self.initialized {
            return 0;
        }
        self.transport.peer_count()
    }

    pub fn hop_count(&self) -> u32 {
        if !self.initialized {
            return 0;
        }
        self.transport.hop_count()
    }

    pub fn link_rssi(&self) -> i32 {
        if !self.initialized {
            return 0;
        }
        self.transport.link_rssi()
    }

    /// Serializes and broadcasts one fragment. No acknowledgment is
    /// waited for.
    pub fn broadcast(&mut self, fragment: &TelemetryFragment) -> Result<(), RelayError> {
        if !self.initialized {
            return Err(RelayError::NotInitialized);
        }
        let payload = fragment.to_json()?;
        self.transport.broadcast(&payload)?;
        debug!(bytes = payload.len(), "fragment broadcast into mesh");
        Ok(())
    }

    /// Drains inbound messages, attaching the gateway's own link
    /// quality to each parsed fragment. Malformed messages are dropped
    /// silently apart from a log line.
    pub fn drain_inbound(&mut self, rssi: i32) -> Vec<TelemetryFragment> {
        let mut fragments = Vec::new();
        if !self.initialized {
            return fragments;
        }
        while let Some(raw) = self.transport.try_recv() {
            match TelemetryFragment::from_json(&raw) {
                Ok(mut fragment) => {
                    fragment.set_i64("rssi", i64::from(rssi));
                    fragments.push(fragment);
                }
                Err(error) => {
                    warn!(%error, bytes = raw.len(), "dropping malformed mesh message");
                }
            }
        }
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct QueueTransport {
        sent: Arc<Mutex<Vec<String>>>,
        inbound: Arc<Mutex<VecDeque<String>>>,
        peers: usize,
    }

    impl MeshTransport for QueueTransport {
        fn init(&mut self, _mesh_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn broadcast(&mut self, payload: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }
        fn try_recv(&mut self) -> Option<String> {
            self.inbound.lock().unwrap().pop_front()
        }
        fn peer_count(&self) -> usize {
            self.peers
        }
        fn hop_count(&self) -> u32 {
            1
        }
        fn link_rssi(&self) -> i32 {
            -70
        }
        fn update(&mut self) {}
    }

    #[test]
    fn mesh_identity_is_stable_and_distinct() {
        assert_eq!(mesh_identity("node-01"), mesh_identity("node-01"));
        assert_ne!(mesh_identity("node-01"), mesh_identity("node-02"));
        assert!(mesh_identity("node-01").starts_with("soilmesh-"));
    }

    #[test]
    fn uninitialized_relay_refuses_to_broadcast() {
        let mut relay = MeshRelay::new(Box::<QueueTransport>::default());
        let fragment = TelemetryFragment::new("node-01", -60);
        assert!(matches!(
            relay.broadcast(&fragment),
            Err(RelayError::NotInitialized)
        ));
        // housekeeping and queries are guarded no-ops
        relay.update();
        assert_eq!(relay.peer_count(), 0);
        assert!(relay.drain_inbound(-40).is_empty());
    }

    #[test]
    fn broadcast_serializes_the_fragment() {
        let transport = QueueTransport::default();
        let sent = transport.sent.clone();
        let mut relay = MeshRelay::new(Box::new(transport));
        relay.init("node-01").unwrap();

        let mut fragment = TelemetryFragment::new("node-01", -60);
        fragment.set_number("m1", 55.0);
        relay.broadcast(&fragment).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let back = TelemetryFragment::from_json(&sent[0]).unwrap();
        assert_eq!(back.number("m1"), Some(55.0));
    }

    #[test]
    fn inbound_gets_gateway_rssi_attached() {
        let transport = QueueTransport::default();
        let inbound = transport.inbound.clone();
        let mut relay = MeshRelay::new(Box::new(transport));
        relay.init("gw-01").unwrap();

        let mut node_fragment = TelemetryFragment::new("node-01", -72);
        node_fragment.set_number("m1", 31.0);
        inbound
            .lock()
            .unwrap()
            .push_back(node_fragment.to_json().unwrap());

        let fragments = relay.drain_inbound(-44);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].number("rssi"), Some(-44.0));
        assert_eq!(fragments[0].number("m1"), Some(31.0));
    }

    #[test]
    fn malformed_inbound_is_dropped_in_order() {
        let transport = QueueTransport::default();
        let inbound = transport.inbound.clone();
        let mut relay = MeshRelay::new(Box::new(transport));
        relay.init("gw-01").unwrap();

        {
            let mut queue = inbound.lock().unwrap();
            queue.push_back(TelemetryFragment::new("node-01", -70).to_json().unwrap());
            queue.push_back("garbage{{".to_string());
            queue.push_back(TelemetryFragment::new("node-02", -80).to_json().unwrap());
        }

        let fragments = relay.drain_inbound(-44);
        assert_eq!(fragments.len(), 2);
        assert_eq!(
            fragments[0].get("deviceId"),
            Some(&serde_json::Value::String("node-01".into()))
        );
        assert_eq!(
            fragments[1].get("deviceId"),
            Some(&serde_json::Value::String("node-02".into()))
        );
    }
}
