//! Domain types shared by the engine, the store and the HTTP layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {what} '{value}'")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as
/// lowercase text.
macro_rules! text_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError { what: $what, value: s.to_string() }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    SoilMoisture,
    Temperature,
    Humidity,
    Light,
    Ph,
}

text_enum!(SensorKind, "sensor kind", {
    SoilMoisture => "soil_moisture",
    Temperature => "temperature",
    Humidity => "humidity",
    Light => "light",
    Ph => "ph",
});

impl SensorKind {
    /// Readings of this kind are a percentage and get clamped to 0..=100.
    pub fn is_percentage(self) -> bool {
        matches!(self, Self::SoilMoisture | Self::Humidity)
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::SoilMoisture | Self::Humidity => "%",
            Self::Temperature => "°C",
            Self::Light => "lx",
            Self::Ph => "pH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Inactive,
    Error,
    Maintenance,
}

text_enum!(SensorStatus, "sensor status", {
    Active => "active",
    Inactive => "inactive",
    Error => "error",
    Maintenance => "maintenance",
});

/// Linear transform from raw signal to physical unit: `raw * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub scale: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { offset: 0.0, scale: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub sensor_id: String,
    pub name: String,
    pub kind: SensorKind,
    pub location: Option<String>,
    /// Analog input the sensor is wired to.
    pub channel: u8,
    pub active: bool,
    pub status: SensorStatus,
    pub calibration: Calibration,
    pub min_threshold: f64,
    pub max_threshold: f64,
}

impl SensorDescriptor {
    /// Whether the monitor should poll this sensor.  Sensors in `error` keep
    /// being polled so they can recover.
    pub fn is_polled(&self) -> bool {
        self.active && matches!(self.status, SensorStatus::Active | SensorStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_id: String,
    /// Unix seconds.
    pub ts: i64,
    pub value: f64,
    pub unit: String,
    pub valid: bool,
}

/// Aggregates over a reading window; the values are `None` for an empty window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingStats {
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Irrigation records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrrigationKind {
    Automatic,
    Manual,
    Scheduled,
}

text_enum!(IrrigationKind, "irrigation kind", {
    Automatic => "automatic",
    Manual => "manual",
    Scheduled => "scheduled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrrigationStatus {
    /// Tentative: the session is still in progress.
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(IrrigationStatus, "irrigation status", {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl IrrigationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationRecord {
    pub id: Option<i64>,
    pub sensor_id: String,
    /// Unix seconds.
    pub started_at: i64,
    pub duration_secs: i64,
    pub water_volume_l: f64,
    pub humidity_before: Option<f64>,
    pub humidity_after: Option<f64>,
    pub kind: IrrigationKind,
    pub status: IrrigationStatus,
    pub note: Option<String>,
}

impl IrrigationRecord {
    /// Tentative record opened when a session starts.
    pub fn open(sensor_id: &str, started_at: i64, kind: IrrigationKind, humidity_before: Option<f64>) -> Self {
        Self {
            id: None,
            sensor_id: sensor_id.to_string(),
            started_at,
            duration_secs: 0,
            water_volume_l: 0.0,
            humidity_before,
            humidity_after: None,
            kind,
            status: IrrigationStatus::Running,
            note: None,
        }
    }

    /// Fields written when the session reaches its terminal status.
    pub fn finalization(&self) -> RecordUpdate {
        RecordUpdate {
            duration_secs: self.duration_secs,
            water_volume_l: self.water_volume_l,
            humidity_after: self.humidity_after,
            status: self.status,
            note: self.note.clone(),
        }
    }
}

/// Terminal fields of an [`IrrigationRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub duration_secs: i64,
    pub water_volume_l: f64,
    pub humidity_after: Option<f64>,
    pub status: IrrigationStatus,
    pub note: Option<String>,
}

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_parse_their_own_text() {
        assert_eq!("soil_moisture".parse::<SensorKind>().unwrap(), SensorKind::SoilMoisture);
        assert_eq!("maintenance".parse::<SensorStatus>().unwrap(), SensorStatus::Maintenance);
        assert_eq!("scheduled".parse::<IrrigationKind>().unwrap(), IrrigationKind::Scheduled);
        assert_eq!("cancelled".parse::<IrrigationStatus>().unwrap(), IrrigationStatus::Cancelled);
    }

    #[test]
    fn unknown_enum_text_names_the_type() {
        let err = "soil".parse::<SensorKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown sensor kind 'soil'");
    }

    #[test]
    fn serde_matches_stored_text() {
        let json = serde_json::to_string(&SensorKind::SoilMoisture).unwrap();
        assert_eq!(json, "\"soil_moisture\"");
        let json = serde_json::to_string(&IrrigationStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn percentage_kinds() {
        assert!(SensorKind::SoilMoisture.is_percentage());
        assert!(SensorKind::Humidity.is_percentage());
        assert!(!SensorKind::Temperature.is_percentage());
        assert!(!SensorKind::Light.is_percentage());
    }

    #[test]
    fn only_running_is_not_terminal() {
        assert!(!IrrigationStatus::Running.is_terminal());
        assert!(IrrigationStatus::Completed.is_terminal());
        assert!(IrrigationStatus::Failed.is_terminal());
        assert!(IrrigationStatus::Cancelled.is_terminal());
    }
}
