//! Battery interlock with hysteresis.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::threshold::battery_safe;
use crate::watering::{CancelOutcome, WateringController};

/// Solar counts as charging once it exceeds the battery by this much.
const CHARGING_MARGIN_V: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerState {
    pub battery_voltage: f64,
    pub solar_voltage: f64,
    pub system_enabled: bool,
    pub charging: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PowerThresholds {
    /// Disable below this voltage.
    pub low: f64,
    /// Re-enable only above this voltage.
    pub high: f64,
}

pub struct PowerSafetyGuard {
    controller: Arc<WateringController>,
    thresholds: PowerThresholds,
    state: Mutex<PowerState>,
}

impl PowerSafetyGuard {
    pub fn new(controller: Arc<WateringController>, thresholds: PowerThresholds) -> Self {
        Self {
            controller,
            thresholds,
            state: Mutex::new(PowerState {
                battery_voltage: 0.0,
                solar_voltage: 0.0,
                system_enabled: true,
                charging: false,
            }),
        }
    }

    pub async fn system_enabled(&self) -> bool {
        self.state.lock().await.system_enabled
    }

    /// Feed the latest voltages.  Going unsafe cancels any running session
    /// before this returns.
    pub async fn update(&self, battery_voltage: f64, solar_voltage: f64) -> PowerState {
        let mut st = self.state.lock().await;
        let PowerThresholds { low, high } = self.thresholds;
        let enabled = battery_safe(battery_voltage, low, high, st.system_enabled);

        if enabled != st.system_enabled {
            if enabled {
                info!(battery_voltage, high, "battery recovered, watering re-enabled");
            } else {
                warn!(battery_voltage, low, "battery low, watering disabled");
            }
        }

        // The guard lock is held across this call so interlock changes reach
        // the controller in order.
        if self.controller.set_power_enabled(enabled).await == CancelOutcome::Cancelled {
            warn!(battery_voltage, "running session stopped for low battery");
        }

        *st = PowerState {
            battery_voltage,
            solar_voltage,
            system_enabled: enabled,
            charging: solar_voltage > battery_voltage + CHARGING_MARGIN_V,
        };
        *st
    }
}
