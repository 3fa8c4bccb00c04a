use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::power::PowerState;
use crate::watering::WateringStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub power: Option<PowerState>,
    pub sensors: HashMap<String, LatestReading>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestReading {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub value: f64,
    pub unit: String,
    /// Consecutive failed reads; 0 after a good one.
    pub failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Watering,
    Alert,
    Power,
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
    pub watering: WateringStatus,
    pub power: Option<PowerState>,
    pub sensors: HashMap<String, LatestReading>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            power: None,
            sensors: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_reading(&mut self, sensor_id: &str, value: f64, unit: &str) {
        self.sensors.insert(
            sensor_id.to_string(),
            LatestReading {
                at: OffsetDateTime::now_utc(),
                value,
                unit: unit.to_string(),
                failures: 0,
            },
        );
        self.push_event(EventKind::Reading, format!("{sensor_id}={value:.1}{unit}"));
    }

    pub fn record_read_failure(&mut self, sensor_id: &str, failures: u32, detail: String) {
        if let Some(latest) = self.sensors.get_mut(sensor_id) {
            latest.failures = failures;
        }
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_power(&mut self, power: PowerState) {
        let changed = self
            .power
            .map_or(true, |prev| prev.system_enabled != power.system_enabled);
        if changed {
            let state = if power.system_enabled { "enabled" } else { "disabled" };
            self.push_event(
                EventKind::Power,
                format!("system {state} at {:.2} V", power.battery_voltage),
            );
        }
        self.power = Some(power);
    }

    pub fn record_watering(&mut self, detail: String) {
        self.push_event(EventKind::Watering, detail);
    }

    pub fn record_alert(&mut self, detail: String) {
        self.push_event(EventKind::Alert, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot; newest events first.
    pub fn to_status(&self, watering: WateringStatus) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            watering,
            power: self.power,
            sensors: self.sensors.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
