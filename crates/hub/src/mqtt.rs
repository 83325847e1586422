use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, Packet, QoS};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use smart_water_engine::{EntityState, EntityStates, ServiceDispatcher};

use crate::state::SharedState;

const STATE_PREFIX: &str = "state/";
const STATE_FILTER: &str = "state/#";
/// How long a service call waits for the broker's PUBACK.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract entity_id from "state/<entity_id>".
pub(crate) fn extract_entity_id(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix(STATE_PREFIX)?;
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id)
    }
}

/// "service/<domain>/<service>".
pub(crate) fn service_topic(domain: &str, service: &str) -> String {
    format!("service/{domain}/{service}")
}

/// Parse an entity payload: `{"state": .., "attributes": {..}}`, a bare JSON
/// scalar, or plain text.
pub(crate) fn parse_entity_payload(payload: &[u8]) -> EntityState {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut obj)) if obj.contains_key("state") => {
            let state = obj.remove("state").map(scalar_text).unwrap_or_default();
            let attributes = match obj.remove("attributes") {
                Some(Value::Object(attrs)) => attrs,
                _ => Map::new(),
            };
            EntityState { state, attributes }
        }
        Ok(value @ (Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null)) => {
            EntityState::new(scalar_text(value))
        }
        _ => EntityState::new(text),
    }
}

fn scalar_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => "unknown".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Entity mirror
// ---------------------------------------------------------------------------

/// Latest state of every entity published under `state/`.
#[derive(Debug, Default)]
pub struct MqttEntities {
    states: RwLock<HashMap<String, EntityState>>,
}

impl MqttEntities {
    /// Store the payload if `topic` is an entity topic. Returns the entity id.
    pub fn apply<'t>(&self, topic: &'t str, payload: &[u8]) -> Option<&'t str> {
        let entity_id = extract_entity_id(topic)?;
        let state = parse_entity_payload(payload);
        debug!(entity_id, state = %state.state, "entity updated");
        self.states
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(entity_id.to_string(), state);
        Some(entity_id)
    }

    pub fn count(&self) -> usize {
        self.states.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl EntityStates for MqttEntities {
    fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(entity_id)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Service dispatch
// ---------------------------------------------------------------------------

/// Broker connectivity plus the QoS 1 publishes still waiting for a PUBACK.
///
/// Publishes leave the client queue in order, so each outgoing packet id is
/// matched to the oldest queued call.
#[derive(Debug)]
pub struct AckTracker {
    connected: watch::Sender<bool>,
    pending: Mutex<Pending>,
}

#[derive(Debug, Default)]
struct Pending {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            connected: watch::channel(false).0,
            pending: Mutex::new(Pending::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Losing the connection fails every call still waiting.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
        if !connected {
            let mut pending = self.lock();
            let waiting = pending.queued.len() + pending.inflight.len();
            if waiting > 0 {
                warn!(waiting, "connection lost with unacknowledged service calls");
            }
            pending.queued.clear();
            pending.inflight.clear();
        }
    }

    pub async fn wait_connected(&self, within: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let connected = matches!(timeout(within, rx.wait_for(|c| *c)).await, Ok(Ok(_)));
        connected
    }

    /// Run `publish` and queue a waiter for its acknowledgement, under one
    /// lock so queue order matches send order.
    fn track(&self, publish: impl FnOnce() -> Result<(), ClientError>) -> Result<oneshot::Receiver<()>, ClientError> {
        let mut pending = self.lock();
        publish()?;
        let (tx, rx) = oneshot::channel();
        pending.queued.push_back(tx);
        Ok(rx)
    }

    pub fn sent(&self, pkid: u16) {
        let mut pending = self.lock();
        if let Some(tx) = pending.queued.pop_front() {
            pending.inflight.insert(pkid, tx);
        }
    }

    pub fn acked(&self, pkid: u16) {
        match self.lock().inflight.remove(&pkid) {
            // The caller may have given up already.
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!(pkid, "ack for an untracked publish"),
        }
    }
}

/// Publishes every service call as JSON to `service/<domain>/<service>` and
/// waits for the broker to acknowledge it.
#[derive(Debug, Clone)]
pub struct MqttDispatcher {
    client: AsyncClient,
    acks: Arc<AckTracker>,
}

impl MqttDispatcher {
    pub fn new(client: AsyncClient, acks: Arc<AckTracker>) -> Self {
        Self { client, acks }
    }
}

#[async_trait]
impl ServiceDispatcher for MqttDispatcher {
    async fn call(&self, domain: &str, service: &str, payload: Map<String, Value>) -> anyhow::Result<()> {
        let topic = service_topic(domain, service);
        if !self.acks.is_connected() {
            bail!("mqtt broker not connected, cannot publish {topic}");
        }
        let body = serde_json::to_vec(&payload)?;
        let shown = Value::Object(payload);
        info!(%topic, payload = %shown, "dispatching service call");

        let ack = self
            .acks
            .track(|| self.client.try_publish(topic.clone(), QoS::AtLeastOnce, false, body))?;
        match timeout(ACK_TIMEOUT, ack).await {
            Ok(Ok(())) => {
                debug!(%topic, "service call acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(anyhow!("connection lost before {topic} was acknowledged")),
            Err(_) => Err(anyhow!("no acknowledgement for {topic} within {}s", ACK_TIMEOUT.as_secs())),
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive the MQTT connection forever: mirror entity states, settle service
/// call acknowledgements and track broker connectivity. Subscriptions are
/// renewed on every connect.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    entities: Arc<MqttEntities>,
    acks: Arc<AckTracker>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.acked(ack.pkid),
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if entities.apply(&p.topic, &p.payload).is_none() {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                }
                shared.write().await.entities_seen = entities.count();
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = client.subscribe(STATE_FILTER, QoS::AtLeastOnce).await {
                    warn!("failed to subscribe to {STATE_FILTER}: {e}");
                }
                acks.set_connected(true);
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_mqtt("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                acks.set_connected(false);
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_mqtt("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                acks.set_connected(false);
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
