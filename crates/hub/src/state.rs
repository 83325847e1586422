use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use smart_water_engine::{ControllerStatus, Snapshot, StationStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Process-level state the engine does not own: broker connectivity and a
/// short history of what happened.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub entities_seen: usize,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Api,
    Mqtt,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub entities_seen: usize,
    pub engine: EngineStatus,
    pub events: Vec<HubEvent>,
}

#[derive(Serialize)]
pub struct EngineStatus {
    pub controller: ControllerStatus,
    pub stations: Vec<StationStatus>,
    pub next_schedule: Option<String>,
    pub armed_cycles: usize,
    pub weather_enabled: bool,
    pub last_update_success: bool,
    pub updated_at: Option<String>,
}

impl EngineStatus {
    pub fn new(state: &smart_water_engine::EngineState, snapshot: &Snapshot, armed_cycles: usize, weather_enabled: bool) -> Self {
        Self {
            controller: state.controller,
            stations: state.stations.clone(),
            next_schedule: state
                .next_schedule
                .as_ref()
                .map(smart_water_engine::clock::format_timestamp),
            armed_cycles,
            weather_enabled,
            last_update_success: snapshot.last_update_success,
            updated_at: snapshot.updated_at.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            entities_seen: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_api(&mut self, detail: String) {
        self.push_event(EventKind::Api, detail);
    }

    pub fn record_mqtt(&mut self, detail: String) {
        self.push_event(EventKind::Mqtt, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON status, newest event first.
    pub fn to_status(&self, engine: EngineStatus) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            entities_seen: self.entities_seen,
            engine,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}
