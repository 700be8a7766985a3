//! Duty cycles. A gateway stays awake and runs periodic beats; a node
//! takes one reading per wake, hands it to the mesh and goes back to
//! deep sleep.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cloud::Forward;
use crate::mesh::MeshRelay;
use crate::sensors::SensorRegistry;
use crate::telemetry::TelemetryFragment;

/// Gateway telemetry period.
pub const GATEWAY_INTERVAL: Duration = Duration::from_secs(10);

/// Mesh housekeeping and input polling period.
pub const SERVICE_TICK: Duration = Duration::from_millis(100);

/// How long a waking node waits for a mesh peer before sending blind.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retained boot counter value on the very first wake after power-up.
/// Only this wake transmits; later wakes within the same power cycle
/// are skipped until the counter is cleared again.
pub const FIRST_BOOT: u32 = 1;

/// Always-on duty cycle: local acquisition plus relay of everything
/// the mesh delivers, all through one forwarder.
pub struct GatewayCycle<F: Forward> {
    registry: SensorRegistry,
    relay: MeshRelay,
    forwarder: F,
    device_id: String,
}

impl<F: Forward> GatewayCycle<F> {
    pub fn new(registry: SensorRegistry, relay: MeshRelay, forwarder: F, device_id: &str) -> Self {
        GatewayCycle {
            registry,
            relay,
            forwarder,
            device_id: device_id.to_string(),
        }
    }

    /// One telemetry beat: acquire every configured sensor, mark the
    /// fragment as gateway-originated and forward it. A transport
    /// failure drops the fragment; the next beat is the retry.
    pub async fn beat(&mut self, rssi: i32) {
        let mut fragment = TelemetryFragment::new(&self.device_id, rssi);
        fragment.stamp();
        self.registry.acquire(&mut fragment);
        fragment.mark_gateway();
        if let Err(error) = self.forwarder.forward(&fragment).await {
            warn!(%error, "gateway beat dropped");
        } else {
            debug!(fields = fragment.len(), "gateway beat forwarded");
        }
    }

    /// One service tick: run mesh housekeeping, then forward every
    /// fragment nodes handed us since the last tick. Relayed fragments
    /// go out as the node built them, with only the link rssi rewritten
    /// on receipt.
    pub async fn service(&mut self, rssi: i32) {
        self.relay.update();
        for fragment in self.relay.drain_inbound(rssi) {
            if let Err(error) = self.forwarder.forward(&fragment).await {
                warn!(%error, "relayed fragment dropped");
            }
        }
    }
}

/// What a node wake did with its send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotOutcome {
    /// First wake, fragment broadcast into the mesh.
    Sent,
    /// First wake, broadcast failed at the transport. Accepted data
    /// loss; the wake still counts as the one attempt.
    Lost,
    /// Not the first wake, no attempt was made.
    Skipped,
}

/// Wake-once duty cycle for battery nodes.
pub struct NodeCycle {
    registry: SensorRegistry,
    relay: MeshRelay,
    device_id: String,
}

impl NodeCycle {
    pub fn new(registry: SensorRegistry, relay: MeshRelay, device_id: &str) -> Self {
        NodeCycle {
            registry,
            relay,
            device_id: device_id.to_string(),
        }
    }

    /// Sends one reading into the mesh if this is the first wake of the
    /// power cycle.
    ///
    /// The node waits up to `peer_wait` for a peer to appear so the
    /// fragment has somewhere to go, then broadcasts regardless; a
    /// mesh with no listeners just loses the fragment. A transport
    /// failure is reported as `Lost`, never retried within the wake.
    pub async fn one_shot(
        &mut self,
        boot_count: u32,
        battery: Option<f64>,
        peer_wait: Duration,
    ) -> ShotOutcome {
        if boot_count != FIRST_BOOT {
            info!(boot_count, "not the first wake, skipping transmission");
            return ShotOutcome::Skipped;
        }

        let deadline = Instant::now() + peer_wait;
        loop {
            self.relay.update();
            if self.relay.peer_count() > 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("no mesh peer visible, broadcasting anyway");
                break;
            }
            tokio::time::sleep(SERVICE_TICK).await;
        }

        let mut fragment = TelemetryFragment::new(&self.device_id, self.relay.link_rssi());
        fragment.stamp();
        self.registry.acquire(&mut fragment);
        if let Some(volts) = battery {
            fragment.set_number("battery", volts);
        }
        fragment.set_i64("meshHopCount", i64::from(self.relay.hop_count()));

        match self.relay.broadcast(&fragment) {
            Ok(()) => {
                info!(fields = fragment.len(), "node reading broadcast");
                ShotOutcome::Sent
            }
            Err(error) => {
                warn!(%error, "node broadcast lost");
                ShotOutcome::Lost
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ForwardError;
    use crate::hardware::MeshTransport;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingForwarder {
        sent: Arc<Mutex<Vec<TelemetryFragment>>>,
        fail: bool,
    }

    impl Forward for RecordingForwarder {
        async fn forward(&mut self, fragment: &TelemetryFragment) -> Result<(), ForwardError> {
            if self.fail {
                return Err(ForwardError::NotConnected);
            }
            self.sent.lock().unwrap().push(fragment.clone());
            Ok(())
        }
    }

    struct FakeTransport {
        peers: usize,
        fail_broadcast: bool,
        inbound: VecDeque<String>,
        outbound: Arc<Mutex<Vec<String>>>,
    }

    impl FakeTransport {
        fn new(peers: usize) -> (Self, Arc<Mutex<Vec<String>>>) {
            let outbound = Arc::new(Mutex::new(Vec::new()));
            (
                FakeTransport {
                    peers,
                    fail_broadcast: false,
                    inbound: VecDeque::new(),
                    outbound: outbound.clone(),
                },
                outbound,
            )
        }
    }

    impl MeshTransport for FakeTransport {
        fn init(&mut self, _identity: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn broadcast(&mut self, payload: &str) -> anyhow::Result<()> {
            if self.fail_broadcast {
                anyhow::bail!("radio busy");
            }
            self.outbound.lock().unwrap().push(payload.to_string());
            Ok(())
        }
        fn try_recv(&mut self) -> Option<String> {
            self.inbound.pop_front()
        }
        fn peer_count(&self) -> usize {
            self.peers
        }
        fn hop_count(&self) -> u32 {
            2
        }
        fn link_rssi(&self) -> i32 {
            -67
        }
        fn update(&mut self) {}
    }

    fn relay_with(transport: FakeTransport) -> MeshRelay {
        let mut relay = MeshRelay::new(Box::new(transport));
        relay.init("test-device").unwrap();
        relay
    }

    #[tokio::test]
    async fn gateway_beat_marks_and_forwards() {
        let (transport, _outbound) = FakeTransport::new(1);
        let forwarder = RecordingForwarder::default();
        let sent = forwarder.sent.clone();
        let mut cycle =
            GatewayCycle::new(SensorRegistry::default(), relay_with(transport), forwarder, "gw-01");

        cycle.beat(-42).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get("deviceId").unwrap(), "gw-01");
        assert_eq!(sent[0].get("gateway").unwrap(), true);
        assert_eq!(sent[0].number("rssi").unwrap(), -42.0);
        assert!(sent[0].get("timestamp").is_some());
    }

    #[tokio::test]
    async fn gateway_service_relays_inbound_fragments() {
        let (mut transport, _outbound) = FakeTransport::new(1);
        let mut node_fragment = TelemetryFragment::new("node-07", -80);
        node_fragment.set_number("m1", 55.0);
        transport
            .inbound
            .push_back(node_fragment.to_json().unwrap());

        let forwarder = RecordingForwarder::default();
        let sent = forwarder.sent.clone();
        let mut cycle =
            GatewayCycle::new(SensorRegistry::default(), relay_with(transport), forwarder, "gw-01");

        cycle.service(-50).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get("deviceId").unwrap(), "node-07");
        // link rssi is rewritten at the receiving hop
        assert_eq!(sent[0].number("rssi").unwrap(), -50.0);
        assert!(sent[0].get("gateway").is_none());
    }

    #[tokio::test]
    async fn gateway_beat_survives_forward_failure() {
        let (transport, _outbound) = FakeTransport::new(1);
        let forwarder = RecordingForwarder {
            fail: true,
            ..RecordingForwarder::default()
        };
        let mut cycle =
            GatewayCycle::new(SensorRegistry::default(), relay_with(transport), forwarder, "gw-01");
        cycle.beat(-42).await;
        cycle.beat(-42).await;
    }

    #[tokio::test]
    async fn first_boot_broadcasts_exactly_once() {
        let (transport, outbound) = FakeTransport::new(1);
        let mut cycle = NodeCycle::new(SensorRegistry::default(), relay_with(transport), "node-01");

        let outcome = cycle.one_shot(FIRST_BOOT, Some(3.71), Duration::ZERO).await;
        assert_eq!(outcome, ShotOutcome::Sent);

        let outbound = outbound.lock().unwrap();
        assert_eq!(outbound.len(), 1);
        let fragment = TelemetryFragment::from_json(&outbound[0]).unwrap();
        assert_eq!(fragment.get("deviceId").unwrap(), "node-01");
        assert_eq!(fragment.number("battery").unwrap(), 3.71);
        assert_eq!(fragment.number("meshHopCount").unwrap(), 2.0);
        assert_eq!(fragment.number("rssi").unwrap(), -67.0);
    }

    #[tokio::test]
    async fn later_wakes_stay_silent() {
        let (transport, outbound) = FakeTransport::new(1);
        let mut cycle = NodeCycle::new(SensorRegistry::default(), relay_with(transport), "node-01");

        let outcome = cycle.one_shot(FIRST_BOOT + 1, None, Duration::ZERO).await;
        assert_eq!(outcome, ShotOutcome::Skipped);
        assert!(outbound.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn peerless_node_still_sends_after_timeout() {
        let (transport, outbound) = FakeTransport::new(0);
        let mut cycle = NodeCycle::new(SensorRegistry::default(), relay_with(transport), "node-01");

        let outcome = cycle.one_shot(FIRST_BOOT, None, Duration::ZERO).await;
        assert_eq!(outcome, ShotOutcome::Sent);
        assert_eq!(outbound.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_broadcast_is_lost_not_skipped() {
        let (mut transport, outbound) = FakeTransport::new(1);
        transport.fail_broadcast = true;
        let mut cycle = NodeCycle::new(SensorRegistry::default(), relay_with(transport), "node-01");

        let outcome = cycle.one_shot(FIRST_BOOT, Some(3.7), Duration::ZERO).await;
        assert_eq!(outcome, ShotOutcome::Lost);
        assert!(outbound.lock().unwrap().is_empty());
    }
}
