//! Automatic watering decisions, evaluated once per monitor cycle.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::IrrigationError;
use crate::model::{IrrigationKind, SensorDescriptor};
use crate::settings::RuntimeSettings;
use crate::threshold::{above_max, below_min};
use crate::watering::{CancelOutcome, CancelReason, WateringController, WateringState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Start,
    Stop,
    Hold,
}

/// Inputs the decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    pub state: WateringState,
    /// Kind of the session in progress, if any.
    pub running_kind: Option<IrrigationKind>,
    pub moisture: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub system_enabled: bool,
    pub auto_mode: bool,
}

/// Start only from idle with power and auto mode on; stop only automatic
/// sessions, never manual or scheduled ones.
pub fn decide(input: PolicyInput) -> PolicyAction {
    match input.state {
        WateringState::Idle
            if input.auto_mode && input.system_enabled && below_min(input.moisture, input.min_threshold) =>
        {
            PolicyAction::Start
        }
        WateringState::Running
            if input.running_kind == Some(IrrigationKind::Automatic)
                && above_max(input.moisture, input.max_threshold) =>
        {
            PolicyAction::Stop
        }
        _ => PolicyAction::Hold,
    }
}

pub struct AutomaticIrrigationPolicy {
    controller: Arc<WateringController>,
    sensor_id: String,
    settings: Arc<RuntimeSettings>,
}

impl AutomaticIrrigationPolicy {
    pub fn new(controller: Arc<WateringController>, sensor_id: String, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            controller,
            sensor_id,
            settings,
        }
    }

    /// The soil sensor whose readings drive the pump.
    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub async fn evaluate(&self, sensor: &SensorDescriptor, moisture: f64, system_enabled: bool) -> PolicyAction {
        let status = self.controller.status().await;
        let action = decide(PolicyInput {
            state: status.state,
            running_kind: status.kind,
            moisture,
            min_threshold: sensor.min_threshold,
            max_threshold: sensor.max_threshold,
            system_enabled,
            auto_mode: self.settings.auto_mode(),
        });

        match action {
            PolicyAction::Start => {
                match self
                    .controller
                    .start(&sensor.sensor_id, self.settings.duration(), IrrigationKind::Automatic)
                    .await
                {
                    Ok(_) => info!(sensor = %sensor.sensor_id, moisture, min = sensor.min_threshold, "soil dry, automatic watering"),
                    // Lost a race with another starter or the interlock.
                    Err(e @ (IrrigationError::AlreadyWatering | IrrigationError::PowerUnsafe)) => {
                        debug!(sensor = %sensor.sensor_id, reason = e.reason_code(), "automatic start skipped")
                    }
                    Err(e) => warn!(sensor = %sensor.sensor_id, error = %e, "automatic start failed"),
                }
            }
            PolicyAction::Stop => {
                // The session may have been replaced since `status`; only an
                // automatic one is stopped.
                let outcome = self
                    .controller
                    .cancel_kind(IrrigationKind::Automatic, CancelReason::MoistureAboveMax)
                    .await;
                if outcome == CancelOutcome::Cancelled {
                    info!(sensor = %sensor.sensor_id, moisture, max = sensor.max_threshold, "soil wet, automatic watering stopped");
                }
            }
            PolicyAction::Hold => {}
        }
        action
    }
}
