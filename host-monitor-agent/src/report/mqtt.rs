//! MQTT Discovery backend
//!
//! Each sensor gets one retained discovery config (QoS 1) the first time it
//! is published in a broker session, then plain-string states (QoS 0).
//!
//! Topics:
//! - `<discovery_prefix>/sensor/<entity_prefix>_<key>/config`
//! - `<discovery_prefix>/sensor/<entity_prefix>_<key>/state`

use super::{ReportBackend, ReportResult, ReportResults, SensorUpdate, READY_TIMEOUT};
use crate::config::MqttConfig;
use crate::error::{MonitorError, MonitorResult};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(50);
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 64;

/// Publishing side of an MQTT client.
#[async_trait]
pub trait MqttPublish: Send + Sync {
    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Vec<u8>) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl MqttPublish for AsyncClient {
    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Vec<u8>) -> anyhow::Result<()> {
        AsyncClient::publish(self, topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        AsyncClient::disconnect(self).await?;
        Ok(())
    }
}

/// Connection flag written by the event-loop task only; everyone else reads.
///
/// `session` increments on every successful ConnAck so the reporter can tell
/// a fresh broker session apart from the one it already sent discovery to.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    connected: Arc<AtomicBool>,
    session: Arc<AtomicU64>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    pub(crate) fn mark_connected(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        self.connected.store(true, Ordering::Release);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

#[derive(Debug, Serialize)]
struct DiscoveryConfig<'a> {
    name: String,
    unique_id: String,
    object_id: String,
    state_topic: String,
    device: DeviceInfo<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeviceInfo<'a> {
    identifiers: [&'a str; 1],
    name: String,
    manufacturer: &'static str,
    model: &'static str,
    sw_version: &'static str,
}

pub struct MqttReporter {
    settings: MqttConfig,
    client_id: String,
    entity_prefix: String,
    client: Option<Arc<dyn MqttPublish>>,
    event_loop: Option<JoinHandle<()>>,
    reconnect_delay: Duration,
    state: ConnectionState,
    discovered: HashSet<String>,
    discovered_session: u64,
}

impl MqttReporter {
    pub fn new(settings: &MqttConfig, entity_prefix: &str) -> Self {
        Self {
            client_id: settings.effective_client_id(),
            settings: settings.clone(),
            entity_prefix: entity_prefix.to_string(),
            client: None,
            event_loop: None,
            reconnect_delay: RECONNECT_DELAY,
            state: ConnectionState::default(),
            discovered: HashSet::new(),
            discovered_session: 0,
        }
    }

    /// Reporter around an already running client.
    #[cfg(test)]
    pub(crate) fn with_client(settings: &MqttConfig, entity_prefix: &str, client: Arc<dyn MqttPublish>) -> Self {
        let mut reporter = Self::new(settings, entity_prefix);
        reporter.client = Some(client);
        reporter
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &ConnectionState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn object_id(&self, key: &str) -> String {
        format!("{}_{}", self.entity_prefix, key)
    }

    pub fn config_topic(&self, key: &str) -> String {
        format!("{}/sensor/{}/config", self.settings.discovery_prefix, self.object_id(key))
    }

    pub fn state_topic(&self, key: &str) -> String {
        format!("{}/sensor/{}/state", self.settings.discovery_prefix, self.object_id(key))
    }

    fn discovery_payload(&self, update: &SensorUpdate) -> serde_json::Result<Vec<u8>> {
        let unique_id = self.object_id(&update.key);
        let config = DiscoveryConfig {
            name: update.friendly_name(),
            object_id: unique_id.clone(),
            unique_id,
            state_topic: self.state_topic(&update.key),
            device: DeviceInfo {
                identifiers: [self.entity_prefix.as_str()],
                name: format!("Host Monitor ({})", self.entity_prefix),
                manufacturer: "Host Monitor",
                model: "Host Monitor Agent",
                sw_version: env!("CARGO_PKG_VERSION"),
            },
            unit_of_measurement: update.unit.as_deref(),
            device_class: update.device_class.as_deref(),
            state_class: update.state_class.as_deref(),
        };
        serde_json::to_vec(&config)
    }

    async fn send_discovery(&mut self, client: &dyn MqttPublish, update: &SensorUpdate) {
        let topic = self.config_topic(&update.key);
        let payload = match self.discovery_payload(update) {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %update.key, error = %e, "failed to encode discovery config");
                return;
            }
        };

        match client.publish(topic, QoS::AtLeastOnce, true, payload).await {
            Ok(()) => {
                self.discovered.insert(update.key.clone());
                debug!(key = %update.key, "sent discovery config");
            }
            Err(e) => error!(key = %update.key, error = %e, "failed to send discovery config"),
        }
    }

    /// Forget discovery state when the broker session changed underneath us.
    fn sync_session(&mut self) {
        let session = self.state.session();
        if session != self.discovered_session {
            if !self.discovered.is_empty() {
                debug!(session, "new broker session, discovery will be re-sent");
            }
            self.discovered.clear();
            self.discovered_session = session;
        }
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, state: ConnectionState, reconnect_delay: Duration) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    state.mark_connected();
                    info!("connected to MQTT broker");
                } else {
                    state.mark_disconnected();
                    error!(code = ?ack.code, "MQTT broker refused connection");
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                state.mark_disconnected();
                warn!("MQTT broker closed the connection");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.mark_disconnected();
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.is_connected() {
                    warn!(error = %e, "unexpected disconnect from MQTT broker");
                } else {
                    debug!(error = %e, "MQTT connection attempt failed");
                }
                state.mark_disconnected();
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

#[async_trait]
impl ReportBackend for MqttReporter {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&mut self) -> MonitorResult<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(&self.client_id, &self.settings.broker, self.settings.port);
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs.max(5)));
        if !self.settings.username.is_empty() {
            options.set_credentials(&self.settings.username, &self.settings.password);
        }

        info!(
            broker = %self.settings.broker,
            port = self.settings.port,
            client_id = %self.client_id,
            "connecting to MQTT broker"
        );
        let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        self.event_loop = Some(tokio::spawn(drive_event_loop(
            eventloop,
            self.state.clone(),
            self.reconnect_delay,
        )));
        self.client = Some(Arc::new(client));
        self.discovered.clear();
        Ok(())
    }

    async fn wait_ready(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.state.is_connected() && Instant::now() < deadline {
            tokio::time::sleep(READY_POLL).await;
        }
        self.state.is_connected()
    }

    async fn publish(&mut self, updates: &[SensorUpdate]) -> MonitorResult<ReportResults> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| MonitorError::ConnectivityFailure("MQTT client is not started".to_string()))?;

        let mut results = ReportResults::new();
        if !self.state.is_connected() {
            warn!(skipped = updates.len(), "not connected to MQTT broker, skipping state updates");
            for update in updates {
                results.insert(
                    self.state_topic(&update.key),
                    ReportResult::failed("not connected to MQTT broker"),
                );
            }
            return Ok(results);
        }

        self.sync_session();

        for update in updates {
            if !self.discovered.contains(&update.key) {
                self.send_discovery(client.as_ref(), update).await;
            }

            let topic = self.state_topic(&update.key);
            let payload = update.state.to_string().into_bytes();
            let result = match client.publish(topic.clone(), QoS::AtMostOnce, false, payload).await {
                Ok(()) => {
                    debug!(key = %update.key, state = %update.state, "sent state");
                    ReportResult::ok()
                }
                Err(e) => {
                    error!(key = %update.key, error = %e, "failed to send state");
                    ReportResult::failed(e.to_string())
                }
            };
            results.insert(topic, result);
        }

        Ok(results)
    }

    async fn test_connection(&mut self) -> (bool, Option<String>) {
        if let Err(e) = self.connect().await {
            return (false, Some(e.to_string()));
        }

        let connected = self.wait_ready(READY_TIMEOUT).await;
        self.close().await;

        if connected {
            (true, None)
        } else {
            (
                false,
                Some(format!(
                    "could not connect to MQTT broker at {}:{}",
                    self.settings.broker, self.settings.port
                )),
            )
        }
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "MQTT disconnect request failed");
            }
        }

        if let Some(mut handle) = self.event_loop.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
            info!("disconnected from MQTT broker");
        }

        self.state.mark_disconnected();
        self.discovered.clear();
    }
}
