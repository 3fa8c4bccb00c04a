//! Periodic sensor polling.
//!
//! Each cycle: power tick first (a low battery preempts everything else),
//! then every polled sensor is read, calibrated, persisted and checked
//! against its thresholds, and finally the automatic policy runs on the
//! controlling sensor's fresh value.  A failing sensor never aborts the
//! cycle for the others; after `failure_threshold` consecutive failures it
//! is marked `error` and it returns to `active` on its next good reading.

use irrigation_hw::HardwareAccess;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calibration::{calibrate_reading, voltage_from_raw, AdcScale};
use crate::error::IrrigationError;
use crate::model::{now_unix, SensorDescriptor, SensorReading, SensorStatus};
use crate::notify::{AlertKind, NotificationSink};
use crate::policy::AutomaticIrrigationPolicy;
use crate::power::{PowerSafetyGuard, PowerState};
use crate::state::SharedState;
use crate::store::PersistenceStore;
use crate::threshold::{above_max, below_min};

#[derive(Debug, Clone, Copy)]
pub struct PowerChannels {
    pub battery: u8,
    pub solar: u8,
    pub divider_ratio: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub adc: AdcScale,
    pub power: PowerChannels,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub readings: usize,
    pub failures: usize,
    pub power: Option<PowerState>,
}

/// Per-sensor bookkeeping carried between cycles.
#[derive(Default)]
struct Bookkeeping {
    failures: HashMap<String, u32>,
    last_ts: HashMap<String, i64>,
}

struct MonitorCore {
    hw: Arc<dyn HardwareAccess>,
    store: Arc<dyn PersistenceStore>,
    notifier: Arc<dyn NotificationSink>,
    guard: Arc<PowerSafetyGuard>,
    policy: AutomaticIrrigationPolicy,
    shared: SharedState,
    cfg: MonitorConfig,
    book: Mutex<Bookkeeping>,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SensorMonitor {
    core: Arc<MonitorCore>,
    task: Mutex<Option<Running>>,
}

impl SensorMonitor {
    pub fn new(
        hw: Arc<dyn HardwareAccess>,
        store: Arc<dyn PersistenceStore>,
        notifier: Arc<dyn NotificationSink>,
        guard: Arc<PowerSafetyGuard>,
        policy: AutomaticIrrigationPolicy,
        shared: SharedState,
        cfg: MonitorConfig,
    ) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                hw,
                store,
                notifier,
                guard,
                policy,
                shared,
                cfg,
                book: Mutex::new(Bookkeeping::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling loop.  Returns immediately.
    pub async fn start(&self) -> Result<(), IrrigationError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(IrrigationError::MonitorAlreadyRunning);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.core).run(stop_rx));
        *task = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// Signal the loop and wait for it to exit.  A cycle in progress runs to
    /// completion first.  No-op when already stopped.
    pub async fn stop(&self) {
        let Some(running) = self.task.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "sensor monitor task failed");
        }
    }

    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run a single cycle outside the loop.
    #[cfg(test)]
    pub async fn run_cycle(&self) -> CycleReport {
        self.core.run_cycle().await
    }
}

impl MonitorCore {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(
            interval_sec = self.cfg.interval.as_secs(),
            failure_threshold = self.cfg.failure_threshold,
            "sensor monitor started"
        );
        self.shared
            .write()
            .await
            .record_system("sensor monitor started".to_string());

        loop {
            if *stop.borrow() {
                break;
            }
            let report = self.run_cycle().await;
            debug!(
                readings = report.readings,
                failures = report.failures,
                battery_v = report.power.map(|p| p.battery_voltage),
                "monitor cycle done"
            );
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.cfg.interval) => {}
            }
        }

        info!("sensor monitor stopped");
        self.shared
            .write()
            .await
            .record_system("sensor monitor stopped".to_string());
    }

    async fn run_cycle(&self) -> CycleReport {
        let mut book = self.book.lock().await;
        let mut report = CycleReport {
            power: self.power_tick().await,
            ..CycleReport::default()
        };

        let sensors = match self.store.load_sensors().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "loading sensors failed, skipping cycle");
                self.shared
                    .write()
                    .await
                    .record_error(format!("loading sensors failed: {e:#}"));
                return report;
            }
        };

        let mut controlling: Option<(&SensorDescriptor, f64)> = None;
        for sensor in sensors.iter().filter(|s| s.is_polled()) {
            match self.poll_sensor(sensor, &mut book).await {
                Ok(value) => {
                    report.readings += 1;
                    if sensor.sensor_id == self.policy.sensor_id() {
                        controlling = Some((sensor, value));
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    self.note_failure(sensor, &e, &mut book).await;
                }
            }
        }

        // No fresh value for the controlling sensor means no decision.
        if let Some((sensor, moisture)) = controlling {
            let enabled = self.guard.system_enabled().await;
            self.policy.evaluate(sensor, moisture, enabled).await;
        }
        report
    }

    async fn power_tick(&self) -> Option<PowerState> {
        let ch = self.cfg.power;
        let battery = match self.read_voltage(ch.battery, ch.divider_ratio) {
            Ok(v) => v,
            Err(e) => {
                error!(channel = ch.battery, error = %e, "battery read failed, power state unchanged");
                self.shared
                    .write()
                    .await
                    .record_error(format!("battery read failed: {e}"));
                return None;
            }
        };
        let solar = self.read_voltage(ch.solar, ch.divider_ratio).unwrap_or_else(|e| {
            warn!(channel = ch.solar, error = %e, "solar read failed, assuming 0 V");
            0.0
        });

        let power = self.guard.update(battery, solar).await;
        self.shared.write().await.record_power(power);
        Some(power)
    }

    fn read_voltage(&self, channel: u8, divider_ratio: f64) -> anyhow::Result<f64> {
        let raw = self.hw.read_raw(channel)?;
        Ok(voltage_from_raw(raw, self.cfg.adc, divider_ratio)?)
    }

    async fn poll_sensor(&self, s: &SensorDescriptor, book: &mut Bookkeeping) -> Result<f64, IrrigationError> {
        let raw = self
            .hw
            .read_raw(s.channel)
            .map_err(|source| IrrigationError::SensorRead {
                sensor_id: s.sensor_id.clone(),
                source,
            })?;
        let value = calibrate_reading(s.kind, raw, s.calibration, self.cfg.adc).map_err(|source| {
            IrrigationError::Calibration {
                sensor_id: s.sensor_id.clone(),
                source,
            }
        })?;

        // Never step back in time, even if the wall clock does.
        let ts = match book.last_ts.get(&s.sensor_id) {
            Some(&last) => now_unix().max(last),
            None => now_unix(),
        };
        let reading = SensorReading {
            sensor_id: s.sensor_id.clone(),
            ts,
            value,
            unit: s.kind.unit().to_string(),
            valid: true,
        };
        if let Err(e) = self.store.save_reading(&reading).await {
            warn!(sensor = %s.sensor_id, error = %e, "reading not persisted");
            self.shared
                .write()
                .await
                .record_error(format!("{}: reading not persisted: {e:#}", s.sensor_id));
        }
        book.last_ts.insert(s.sensor_id.clone(), ts);
        book.failures.remove(&s.sensor_id);

        if s.status == SensorStatus::Error {
            match self.store.set_sensor_status(&s.sensor_id, SensorStatus::Active).await {
                Ok(()) => info!(sensor = %s.sensor_id, "sensor recovered"),
                Err(e) => warn!(sensor = %s.sensor_id, error = %e, "clearing sensor error failed"),
            }
        }

        self.shared
            .write()
            .await
            .record_reading(&s.sensor_id, value, &reading.unit);

        if below_min(value, s.min_threshold) {
            self.notifier
                .alert_threshold(&s.sensor_id, value, s.min_threshold, AlertKind::Low)
                .await;
        } else if above_max(value, s.max_threshold) {
            self.notifier
                .alert_threshold(&s.sensor_id, value, s.max_threshold, AlertKind::High)
                .await;
        }
        Ok(value)
    }

    async fn note_failure(&self, s: &SensorDescriptor, err: &IrrigationError, book: &mut Bookkeeping) {
        let count = book.failures.entry(s.sensor_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        warn!(sensor = %s.sensor_id, failures = count, error = %err, "sensor read failed");
        self.shared
            .write()
            .await
            .record_read_failure(&s.sensor_id, count, err.to_string());

        if count >= self.cfg.failure_threshold && s.status != SensorStatus::Error {
            match self.store.set_sensor_status(&s.sensor_id, SensorStatus::Error).await {
                Ok(()) => warn!(sensor = %s.sensor_id, failures = count, "sensor marked error"),
                Err(e) => error!(sensor = %s.sensor_id, error = %e, "marking sensor error failed"),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
