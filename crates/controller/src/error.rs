use irrigation_hw::HardwareError;
use thiserror::Error;

use crate::calibration::CalibrationError;

/// Failures surfaced by the irrigation engine.
///
/// Cancelling with nothing to cancel is not an error; see
/// [`CancelOutcome`](crate::watering::CancelOutcome).
#[derive(Debug, Error)]
pub enum IrrigationError {
    #[error("a watering session is already in progress")]
    AlreadyWatering,
    #[error("power interlock is off (battery below safe level)")]
    PowerUnsafe,
    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),
    #[error("no valid reading for sensor '{0}' yet")]
    NoReading(String),
    #[error("moisture {value:.1}% is above the {max:.1}% threshold")]
    MoistureHigh { value: f64, max: f64 },
    #[error("reading sensor '{sensor_id}' failed: {source}")]
    SensorRead {
        sensor_id: String,
        #[source]
        source: HardwareError,
    },
    #[error("calibrating sensor '{sensor_id}' failed: {source}")]
    Calibration {
        sensor_id: String,
        #[source]
        source: CalibrationError,
    },
    #[error("pump {stage}: {source}")]
    Pump {
        /// `on` or `off`.
        stage: &'static str,
        #[source]
        source: HardwareError,
    },
    #[error("duration {secs}s is outside 1..={max}s")]
    InvalidDuration { secs: u64, max: u64 },
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
    #[error("sensor monitor is already running")]
    MonitorAlreadyRunning,
}

impl IrrigationError {
    /// Stable identifier returned to API callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::AlreadyWatering => "already_watering",
            Self::PowerUnsafe => "power_unsafe",
            Self::UnknownSensor(_) => "unknown_sensor",
            Self::NoReading(_) => "no_reading",
            Self::MoistureHigh { .. } => "moisture_high",
            Self::SensorRead { .. } => "sensor_read_failure",
            Self::Calibration { .. } => "calibration_error",
            Self::Pump { .. } => "pump_failure",
            Self::InvalidDuration { .. } => "invalid_duration",
            Self::Persistence(_) => "persistence_failure",
            Self::MonitorAlreadyRunning => "already_running",
        }
    }
}
