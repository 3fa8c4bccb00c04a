//! Deterministic fakes for unit tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use irrigation_hw::{HardwareAccess, HardwareError};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::model::{
    now_unix, Calibration, IrrigationRecord, ReadingStats, RecordUpdate, SensorDescriptor, SensorKind, SensorReading,
    SensorStatus,
};
use crate::notify::{AlertKind, NotificationSink};
use crate::store::PersistenceStore;

pub fn soil_sensor(id: &str, channel: u8) -> SensorDescriptor {
    SensorDescriptor {
        sensor_id: id.into(),
        name: format!("{id} probe"),
        kind: SensorKind::SoilMoisture,
        location: None,
        channel,
        active: true,
        status: SensorStatus::Active,
        calibration: Calibration::default(),
        min_threshold: 30.0,
        max_threshold: 80.0,
    }
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeRig {
    raw: HashMap<u8, i64>,
    failing: HashSet<u8>,
    inputs: HashMap<u8, bool>,
    pump_on: bool,
    switches: Vec<bool>,
    fail_pump_on: bool,
    fail_pump_off: u32,
}

#[derive(Default)]
pub struct FakeHardware {
    rig: Mutex<FakeRig>,
}

impl FakeHardware {
    pub fn set_raw(&self, channel: u8, raw: i64) {
        let mut rig = self.rig.lock().unwrap();
        rig.failing.remove(&channel);
        rig.raw.insert(channel, raw);
    }

    pub fn fail_channel(&self, channel: u8) {
        self.rig.lock().unwrap().failing.insert(channel);
    }

    pub fn set_input(&self, pin: u8, level: bool) {
        self.rig.lock().unwrap().inputs.insert(pin, level);
    }

    pub fn fail_pump_on(&self, fail: bool) {
        self.rig.lock().unwrap().fail_pump_on = fail;
    }

    /// The next `n` pump-off commands fail.
    pub fn fail_pump_off(&self, n: u32) {
        self.rig.lock().unwrap().fail_pump_off = n;
    }

    pub fn pump_on(&self) -> bool {
        self.rig.lock().unwrap().pump_on
    }

    /// Every successful pump command, in order.
    pub fn pump_switches(&self) -> Vec<bool> {
        self.rig.lock().unwrap().switches.clone()
    }
}

impl HardwareAccess for FakeHardware {
    fn read_raw(&self, channel: u8) -> Result<i64, HardwareError> {
        let rig = self.rig.lock().unwrap();
        if rig.failing.contains(&channel) {
            return Err(HardwareError::Bus(format!("channel {channel} timed out")));
        }
        rig.raw
            .get(&channel)
            .copied()
            .ok_or(HardwareError::UnknownChannel(channel))
    }

    fn set_pump(&self, on: bool) -> Result<(), HardwareError> {
        let mut rig = self.rig.lock().unwrap();
        if on && rig.fail_pump_on {
            return Err(HardwareError::Bus("relay stuck".into()));
        }
        if !on && rig.fail_pump_off > 0 {
            rig.fail_pump_off -= 1;
            return Err(HardwareError::Bus("relay stuck".into()));
        }
        rig.pump_on = on;
        rig.switches.push(on);
        Ok(())
    }

    fn read_digital_input(&self, pin: u8) -> Result<bool, HardwareError> {
        self.rig
            .lock()
            .unwrap()
            .inputs
            .get(&pin)
            .copied()
            .ok_or(HardwareError::UnknownPin(pin))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    sensors: Vec<SensorDescriptor>,
    readings: Vec<SensorReading>,
    records: Vec<IrrigationRecord>,
    fail_record_writes: u32,
    fail_readings: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn with_sensor(self, sensor: SensorDescriptor) -> Self {
        self.tables.lock().unwrap().sensors.push(sensor);
        self
    }

    /// Append a valid reading stamped now.
    pub fn push_reading(&self, sensor_id: &str, value: f64) {
        self.tables.lock().unwrap().readings.push(SensorReading {
            sensor_id: sensor_id.into(),
            ts: now_unix(),
            value,
            unit: "%".into(),
            valid: true,
        });
    }

    pub fn readings(&self, sensor_id: &str) -> Vec<SensorReading> {
        self.tables
            .lock()
            .unwrap()
            .readings
            .iter()
            .filter(|r| r.sensor_id == sensor_id)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<IrrigationRecord> {
        self.tables.lock().unwrap().records.clone()
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<SensorDescriptor> {
        self.tables
            .lock()
            .unwrap()
            .sensors
            .iter()
            .find(|s| s.sensor_id == sensor_id)
            .cloned()
    }

    /// The next `n` record inserts/updates fail.
    pub fn fail_record_writes(&self, n: u32) {
        self.tables.lock().unwrap().fail_record_writes = n;
    }

    pub fn fail_readings(&self, fail: bool) {
        self.tables.lock().unwrap().fail_readings = fail;
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        Ok(self.tables.lock().unwrap().sensors.clone())
    }

    async fn get_sensor(&self, sensor_id: &str) -> Result<Option<SensorDescriptor>> {
        Ok(self.sensor(sensor_id))
    }

    async fn set_sensor_status(&self, sensor_id: &str, status: SensorStatus) -> Result<()> {
        let mut t = self.tables.lock().unwrap();
        match t.sensors.iter_mut().find(|s| s.sensor_id == sensor_id) {
            Some(s) => {
                s.status = status;
                Ok(())
            }
            None => bail!("unknown sensor '{sensor_id}'"),
        }
    }

    async fn save_reading(&self, reading: &SensorReading) -> Result<()> {
        let mut t = self.tables.lock().unwrap();
        if t.fail_readings {
            bail!("readings table locked");
        }
        t.readings.push(reading.clone());
        Ok(())
    }

    async fn save_record(&self, record: &IrrigationRecord) -> Result<i64> {
        let mut t = self.tables.lock().unwrap();
        if take_failure(&mut t.fail_record_writes) {
            bail!("disk full");
        }
        let id = t.records.len() as i64 + 1;
        t.records.push(IrrigationRecord {
            id: Some(id),
            ..record.clone()
        });
        Ok(id)
    }

    async fn update_record(&self, id: i64, u: &RecordUpdate) -> Result<()> {
        let mut t = self.tables.lock().unwrap();
        if take_failure(&mut t.fail_record_writes) {
            bail!("disk full");
        }
        let Some(rec) = t.records.iter_mut().find(|r| r.id == Some(id)) else {
            bail!("no irrigation record with id {id}");
        };
        rec.duration_secs = u.duration_secs;
        rec.water_volume_l = u.water_volume_l;
        rec.humidity_after = u.humidity_after;
        rec.status = u.status;
        rec.note = u.note.clone();
        Ok(())
    }

    async fn query_latest_reading(&self, sensor_id: &str) -> Result<Option<SensorReading>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .readings
            .iter()
            .filter(|r| r.sensor_id == sensor_id && r.valid)
            .last()
            .cloned())
    }

    async fn query_readings(&self, sensor_id: &str, since: i64) -> Result<Vec<SensorReading>> {
        let t = self.tables.lock().unwrap();
        let mut out: Vec<SensorReading> = t
            .readings
            .iter()
            .filter(|r| r.sensor_id == sensor_id && r.valid && r.ts >= since)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.ts);
        Ok(out)
    }

    async fn query_history(&self, sensor_id: &str, limit: i64) -> Result<Vec<IrrigationRecord>> {
        let t = self.tables.lock().unwrap();
        Ok(t.records
            .iter()
            .rev()
            .filter(|r| r.sensor_id == sensor_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn query_stats(&self, sensor_id: &str, since: i64) -> Result<ReadingStats> {
        let t = self.tables.lock().unwrap();
        let values: Vec<f64> = t
            .readings
            .iter()
            .filter(|r| r.sensor_id == sensor_id && r.valid && r.ts >= since)
            .map(|r| r.value)
            .collect();
        if values.is_empty() {
            return Ok(ReadingStats {
                average: None,
                minimum: None,
                maximum: None,
                count: 0,
            });
        }
        Ok(ReadingStats {
            average: Some(values.iter().sum::<f64>() / values.len() as f64),
            minimum: values.iter().copied().reduce(f64::min),
            maximum: values.iter().copied().reduce(f64::max),
            count: values.len() as i64,
        })
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Alert {
        sensor_id: String,
        value: f64,
        threshold: f64,
        kind: AlertKind,
    },
    Completed {
        sensor_id: String,
        duration_secs: i64,
        before: Option<f64>,
        after: Option<f64>,
    },
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn alert_threshold(&self, sensor_id: &str, value: f64, threshold: f64, kind: AlertKind) {
        self.notices.lock().unwrap().push(Notice::Alert {
            sensor_id: sensor_id.into(),
            value,
            threshold,
            kind,
        });
    }

    async fn notify_irrigation_completed(
        &self,
        sensor_id: &str,
        duration_secs: i64,
        before: Option<f64>,
        after: Option<f64>,
    ) {
        self.notices.lock().unwrap().push(Notice::Completed {
            sensor_id: sensor_id.into(),
            duration_secs,
            before,
            after,
        });
    }
}
