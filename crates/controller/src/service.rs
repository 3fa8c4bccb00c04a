//! Operations exposed to the HTTP layer.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::IrrigationError;
use crate::model::{now_unix, IrrigationKind, IrrigationRecord, ReadingStats, SensorDescriptor, SensorReading};
use crate::settings::{RuntimeSettings, SettingsUpdate, SettingsView};
use crate::store::PersistenceStore;
use crate::threshold::above_max;
use crate::watering::{CancelOutcome, CancelReason, WateringController, WateringStatus};

pub struct IrrigationService {
    controller: Arc<WateringController>,
    store: Arc<dyn PersistenceStore>,
    settings: Arc<RuntimeSettings>,
}

impl IrrigationService {
    pub fn new(controller: Arc<WateringController>, store: Arc<dyn PersistenceStore>, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            controller,
            store,
            settings,
        }
    }

    async fn sensor(&self, sensor_id: &str) -> Result<SensorDescriptor, IrrigationError> {
        self.store
            .get_sensor(sensor_id)
            .await
            .map_err(IrrigationError::Persistence)?
            .ok_or_else(|| IrrigationError::UnknownSensor(sensor_id.to_string()))
    }

    fn session_length(&self, requested: Option<Duration>) -> Result<Duration, IrrigationError> {
        self.settings
            .check_duration(requested.unwrap_or_else(|| self.settings.duration()))
    }

    /// Start an automatic session, refusing when the soil is already wet or
    /// there is nothing to judge it by.
    pub async fn start_automatic(&self, sensor_id: &str, duration: Option<Duration>) -> Result<(), IrrigationError> {
        let duration = self.session_length(duration)?;
        let sensor = self.sensor(sensor_id).await?;
        let latest = self
            .store
            .query_latest_reading(sensor_id)
            .await
            .map_err(IrrigationError::Persistence)?
            .ok_or_else(|| IrrigationError::NoReading(sensor_id.to_string()))?;
        if above_max(latest.value, sensor.max_threshold) {
            return Err(IrrigationError::MoistureHigh {
                value: latest.value,
                max: sensor.max_threshold,
            });
        }
        self.controller
            .start(sensor_id, duration, IrrigationKind::Automatic)
            .await?;
        Ok(())
    }

    pub async fn start_manual(&self, sensor_id: &str, duration: Option<Duration>) -> Result<(), IrrigationError> {
        let duration = self.session_length(duration)?;
        self.sensor(sensor_id).await?;
        self.controller
            .start(sensor_id, duration, IrrigationKind::Manual)
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> CancelOutcome {
        let outcome = self.controller.cancel(CancelReason::Requested).await;
        info!(?outcome, "stop requested");
        outcome
    }

    pub async fn get_status(&self) -> WateringStatus {
        self.controller.status().await
    }

    pub async fn get_history(&self, sensor_id: &str, limit: i64) -> Result<Vec<IrrigationRecord>, IrrigationError> {
        self.sensor(sensor_id).await?;
        self.store
            .query_history(sensor_id, limit)
            .await
            .map_err(IrrigationError::Persistence)
    }

    pub async fn get_statistics(&self, sensor_id: &str, window: Duration) -> Result<ReadingStats, IrrigationError> {
        self.sensor(sensor_id).await?;
        self.store
            .query_stats(sensor_id, window_start(window))
            .await
            .map_err(IrrigationError::Persistence)
    }

    /// Valid readings inside the window, oldest first.
    pub async fn get_readings(&self, sensor_id: &str, window: Duration) -> Result<Vec<SensorReading>, IrrigationError> {
        self.sensor(sensor_id).await?;
        self.store
            .query_readings(sensor_id, window_start(window))
            .await
            .map_err(IrrigationError::Persistence)
    }

    pub fn get_settings(&self) -> SettingsView {
        self.settings.view()
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<SettingsView, IrrigationError> {
        self.settings.apply(update)
    }
}

/// Unix seconds `window` ago, saturating for absurd windows.
fn window_start(window: Duration) -> i64 {
    let secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
    now_unix().saturating_sub(secs)
}
