//! Cloud forwarding of telemetry fragments over the protocol fixed at
//! configuration time. A failed transmission is logged and dropped;
//! the next scheduled cycle is the retry, nothing is queued durably.

use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, ForwardProtocol};
use crate::telemetry::TelemetryFragment;

/// REST and MQTT API version of the ingestion endpoint.
pub const API_VERSION: &str = "2018-06-30";

/// Persistent-connection protocols never reconnect more often than
/// this.
pub const RECONNECT_FLOOR: Duration = Duration::from_secs(5);

const SDK_BACKOFF_BASE: Duration = Duration::from_secs(1);
const SDK_BACKOFF_CAP: Duration = Duration::from_secs(60);
const SDK_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("fragment serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("not connected, fragment dropped")]
    NotConnected,
    #[error("mqtt client: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("send queue closed")]
    QueueClosed,
}

/// Seam between the duty-cycle scheduler and a concrete transport.
#[allow(async_fn_in_trait)]
pub trait Forward {
    async fn forward(&mut self, fragment: &TelemetryFragment) -> Result<(), ForwardError>;
}

/// Last-attempt timestamp and failure counter for one transport.
/// Reset on any successful transmission.
#[derive(Debug, Default)]
pub struct RetryState {
    last_attempt: Option<Instant>,
    failures: u32,
}

impl RetryState {
    /// Whether enough time has passed since the last attempt.
    pub fn ready(&self, now: Instant, floor: Duration) -> bool {
        self.last_attempt
            .map_or(true, |last| now.duration_since(last) >= floor)
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        *self = RetryState::default();
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Exponential backoff for the current failure count, capped and
    /// jittered by ±50% to keep a fleet from thundering in lockstep.
    pub fn backoff(&self, base: Duration, cap: Duration) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        let raw = base.saturating_mul(1u32 << exponent).min(cap);
        raw.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// One fresh authenticated connection per call, one blocking request,
/// closed regardless of outcome.
#[derive(Clone)]
pub struct HttpForwarder {
    host: String,
    device_id: String,
    sas_token: String,
}

impl HttpForwarder {
    pub fn new(config: &DeviceConfig) -> Self {
        HttpForwarder {
            host: config.endpoint_host.clone(),
            device_id: config.device_id.clone(),
            sas_token: config.sas_token.clone(),
        }
    }

    pub fn ingest_url(&self) -> String {
        format!(
            "https://{}/devices/{}/messages/events?api-version={}",
            self.host, self.device_id, API_VERSION
        )
    }
}

impl Forward for HttpForwarder {
    async fn forward(&mut self, fragment: &TelemetryFragment) -> Result<(), ForwardError> {
        let body = fragment.to_json()?;
        let client = reqwest::Client::new();
        let response = client
            .post(self.ingest_url())
            .header("Authorization", &self.sas_token)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        let _ = response.error_for_status()?;
        info!("fragment forwarded over http");
        Ok(())
    }
}

/// Persistent MQTT session against the ingestion endpoint. Publishes
/// only while connected; a fragment arriving while disconnected is
/// dropped rather than queued.
pub struct MqttForwarder {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topic: String,
}

impl MqttForwarder {
    pub fn connect(config: &DeviceConfig) -> Self {
        let mut options = MqttOptions::new(&config.device_id, &config.endpoint_host, 8883);
        options.set_transport(Transport::tls_with_default_config());
        options.set_keep_alive(Duration::from_secs(30));
        // connection identity: device identity plus a signed credential
        options.set_credentials(
            format!(
                "{}/{}/?api-version={}",
                config.endpoint_host, config.device_id, API_VERSION
            ),
            config.sas_token.clone(),
        );
        let (client, event_loop) = AsyncClient::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));
        spawn_event_loop(event_loop, connected.clone());
        MqttForwarder {
            client,
            connected,
            topic: format!("devices/{}/messages/events/", config.device_id),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Drives the rumqttc event loop. rumqttc reconnects on every poll, so
/// a failed attempt is recorded and the next poll is held back until
/// the reconnect floor has passed.
fn spawn_event_loop(mut event_loop: EventLoop, connected: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut retry = RetryState::default();
        loop {
            while !retry.ready(Instant::now(), RECONNECT_FLOOR) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    retry.reset();
                    connected.store(true, Ordering::SeqCst);
                    info!("mqtt session established");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!("mqtt endpoint disconnected us");
                }
                Ok(_) => {}
                Err(error) => {
                    connected.store(false, Ordering::SeqCst);
                    retry.record_attempt(Instant::now());
                    retry.record_failure();
                    warn!(%error, failures = retry.failures(), "mqtt connection lost");
                }
            }
        }
    });
}

impl Forward for MqttForwarder {
    async fn forward(&mut self, fragment: &TelemetryFragment) -> Result<(), ForwardError> {
        if !self.is_connected() {
            warn!("mqtt disconnected, fragment dropped");
            return Err(ForwardError::NotConnected);
        }
        let body = fragment.to_json()?;
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, body)
            .await?;
        info!("fragment published over mqtt");
        Ok(())
    }
}

/// Vendor-SDK style asynchronous send queue: the caller hands off the
/// fragment and returns immediately; a worker retries with exponential
/// backoff and jitter, and delivery confirmations are observed through
/// a counter instead of blocking anyone.
pub struct SdkForwarder {
    queue: mpsc::UnboundedSender<TelemetryFragment>,
    delivered: Arc<AtomicU64>,
}

impl SdkForwarder {
    pub fn spawn(config: &DeviceConfig) -> Self {
        let http = HttpForwarder::new(config);
        Self::spawn_with_policy(
            move |fragment| {
                let mut http = http.clone();
                async move { http.forward(&fragment).await }
            },
            SDK_BACKOFF_BASE,
            SDK_BACKOFF_CAP,
            SDK_MAX_ATTEMPTS,
        )
    }

    pub fn spawn_with_policy<F, Fut>(
        mut delivery: F,
        base: Duration,
        cap: Duration,
        max_attempts: u32,
    ) -> Self
    where
        F: FnMut(TelemetryFragment) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ForwardError>> + Send + 'static,
    {
        let (queue, mut inbox) = mpsc::unbounded_channel::<TelemetryFragment>();
        let delivered = Arc::new(AtomicU64::new(0));
        let confirmations = delivered.clone();
        let _ = tokio::spawn(async move {
            let mut retry = RetryState::default();
            while let Some(fragment) = inbox.recv().await {
                loop {
                    retry.record_attempt(Instant::now());
                    match delivery(fragment.clone()).await {
                        Ok(()) => {
                            retry.reset();
                            let _ = confirmations.fetch_add(1, Ordering::SeqCst);
                            debug!("sdk queue delivery confirmed");
                            break;
                        }
                        Err(error) => {
                            retry.record_failure();
                            if retry.failures() >= max_attempts {
                                warn!(%error, "sdk queue gave up on fragment");
                                retry.reset();
                                break;
                            }
                            let delay = retry.backoff(base, cap);
                            warn!(%error, ?delay, "sdk queue delivery failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        });
        SdkForwarder { queue, delivered }
    }

    /// Number of confirmed deliveries reported by the queue worker.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl Forward for SdkForwarder {
    async fn forward(&mut self, fragment: &TelemetryFragment) -> Result<(), ForwardError> {
        self.queue
            .send(fragment.clone())
            .map_err(|_| ForwardError::QueueClosed)?;
        debug!("fragment handed to sdk send queue");
        Ok(())
    }
}

/// The transport fixed at configuration time.
pub enum CloudForwarder {
    Http(HttpForwarder),
    Mqtt(MqttForwarder),
    Sdk(SdkForwarder),
}

impl CloudForwarder {
    pub fn from_config(config: &DeviceConfig) -> Self {
        match config.protocol {
            ForwardProtocol::Http => CloudForwarder::Http(HttpForwarder::new(config)),
            ForwardProtocol::Mqtt => CloudForwarder::Mqtt(MqttForwarder::connect(config)),
            ForwardProtocol::Sdk => CloudForwarder::Sdk(SdkForwarder::spawn(config)),
        }
    }
}

impl Forward for CloudForwarder {
    async fn forward(&mut self, fragment: &TelemetryFragment) -> Result<(), ForwardError> {
        match self {
            CloudForwarder::Http(inner) => inner.forward(fragment).await,
            CloudForwarder::Mqtt(inner) => inner.forward(fragment).await,
            CloudForwarder::Sdk(inner) => inner.forward(fragment).await,
        }
    }
}
