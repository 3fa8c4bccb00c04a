//! TOML config file loading, validation, and database seeding for sensors.

use anyhow::{bail, Context, Result};
use irrigation_hw::{ADC_CHANNELS, ADS1115_MAX};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::calibration::AdcScale;
use crate::db::Db;
use crate::model::{Calibration, SensorDescriptor, SensorKind, SensorStatus};
use crate::monitor::{MonitorConfig, PowerChannels};
use crate::power::PowerThresholds;
use crate::settings::RuntimeSettings;
use crate::watering::WateringConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorSection,
    pub irrigation: IrrigationSection,
    pub manual: ManualSection,
    pub power: PowerSection,
    pub pump: PumpSection,
    pub adc: AdcSection,
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_sec: i64,
    /// Consecutive read failures before a sensor is marked `error`.
    pub failure_threshold: i64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IrrigationSection {
    /// Soil sensor whose readings drive automatic watering.
    pub sensor_id: String,
    pub duration_sec: i64,
    /// Upper bound for any session length, including ones set over the API.
    pub max_duration_sec: i64,
    pub flow_rate_lpm: f64,
    pub settle_sec: i64,
    pub auto_mode: bool,
}

impl Default for IrrigationSection {
    fn default() -> Self {
        Self {
            sensor_id: String::new(),
            duration_sec: 30,
            max_duration_sec: 3600,
            flow_rate_lpm: 2.0,
            settle_sec: 5,
            auto_mode: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ManualSection {
    pub button_pin: i64,
    pub debounce_ms: i64,
    pub poll_ms: i64,
    pub duration_sec: i64,
}

impl Default for ManualSection {
    fn default() -> Self {
        Self {
            button_pin: 17,
            debounce_ms: 500,
            poll_ms: 100,
            duration_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PowerSection {
    pub battery_channel: i64,
    pub solar_channel: i64,
    pub divider_ratio: f64,
    pub low_voltage: f64,
    pub high_voltage: f64,
}

impl Default for PowerSection {
    fn default() -> Self {
        Self {
            battery_channel: 1,
            solar_channel: 2,
            divider_ratio: 4.0,
            low_voltage: 11.0,
            high_voltage: 14.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpSection {
    pub gpio_pin: i64,
    pub active_low: bool,
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            gpio_pin: 18,
            active_low: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdcSection {
    pub max_raw: i64,
    pub full_scale_v: f64,
}

impl Default for AdcSection {
    fn default() -> Self {
        Self {
            max_raw: ADS1115_MAX,
            full_scale_v: 4.096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub name: String,
    pub kind: SensorKind,
    #[serde(default)]
    pub location: Option<String>,
    pub channel: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_timing(&mut errors);
        self.validate_power(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let positive = [
            ("monitor.interval_sec", self.monitor.interval_sec),
            ("monitor.failure_threshold", self.monitor.failure_threshold),
            ("irrigation.duration_sec", self.irrigation.duration_sec),
            ("irrigation.max_duration_sec", self.irrigation.max_duration_sec),
            ("manual.duration_sec", self.manual.duration_sec),
            ("manual.poll_ms", self.manual.poll_ms),
            ("manual.debounce_ms", self.manual.debounce_ms),
        ];
        for (name, value) in positive {
            if value <= 0 {
                errors.push(format!("{name} must be positive, got {value}"));
            }
        }
        let max = self.irrigation.max_duration_sec;
        for (name, value) in [
            ("irrigation.duration_sec", self.irrigation.duration_sec),
            ("manual.duration_sec", self.manual.duration_sec),
        ] {
            if max > 0 && value > max {
                errors.push(format!("{name} ({value}) exceeds irrigation.max_duration_sec ({max})"));
            }
        }
        if self.irrigation.settle_sec < 0 {
            errors.push(format!(
                "irrigation.settle_sec must not be negative, got {}",
                self.irrigation.settle_sec
            ));
        }
        if !(self.irrigation.flow_rate_lpm > 0.0) {
            errors.push(format!(
                "irrigation.flow_rate_lpm must be positive, got {}",
                self.irrigation.flow_rate_lpm
            ));
        }
    }

    fn validate_power(&self, errors: &mut Vec<String>) {
        let p = &self.power;

        // ── ADC scaling ─────────────────────────────────────
        if self.adc.max_raw <= 0 || self.adc.max_raw > ADS1115_MAX {
            errors.push(format!(
                "adc.max_raw {} out of ADS1115 range [1, {ADS1115_MAX}]",
                self.adc.max_raw
            ));
        }
        if !(self.adc.full_scale_v > 0.0) {
            errors.push(format!(
                "adc.full_scale_v must be positive, got {}",
                self.adc.full_scale_v
            ));
        }

        // ── Channels ────────────────────────────────────────
        for (name, ch) in [("battery_channel", p.battery_channel), ("solar_channel", p.solar_channel)] {
            if !valid_channel(ch) {
                errors.push(format!(
                    "power.{name} {ch} is not an ADC channel (allowed: 0-{})",
                    ADC_CHANNELS - 1
                ));
            }
        }
        if p.battery_channel == p.solar_channel {
            errors.push(format!(
                "power.battery_channel and power.solar_channel are both {}",
                p.battery_channel
            ));
        }

        // ── Voltages ────────────────────────────────────────
        if !(p.divider_ratio > 0.0) {
            errors.push(format!("power.divider_ratio must be positive, got {}", p.divider_ratio));
        }
        if !(p.low_voltage > 0.0) {
            errors.push(format!("power.low_voltage must be positive, got {}", p.low_voltage));
        }
        if p.high_voltage <= p.low_voltage {
            errors.push(format!(
                "power.high_voltage ({}) must be greater than power.low_voltage ({})",
                p.high_voltage, p.low_voltage
            ));
        }
        if self.adc.max_raw > 0 && self.adc.full_scale_v > 0.0 && p.divider_ratio > 0.0 {
            let ceiling = self.adc.full_scale_v * p.divider_ratio;
            if p.high_voltage >= ceiling {
                errors.push(format!(
                    "power.high_voltage ({}) is unreachable: divider tops out at {ceiling:.2} V",
                    p.high_voltage
                ));
            }
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        for (name, pin) in [("pump.gpio_pin", self.pump.gpio_pin), ("manual.button_pin", self.manual.button_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!("{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"));
            }
        }
        if self.pump.gpio_pin == self.manual.button_pin {
            errors.push(format!(
                "manual.button_pin {} is already used by the pump",
                self.manual.button_pin
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_channels: HashSet<i64> = HashSet::new();
        let power_channels = [self.power.battery_channel, self.power.solar_channel];

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Channel ─────────────────────────────────────────
            if !valid_channel(s.channel) {
                errors.push(format!(
                    "{}: channel {} is not an ADC channel (allowed: 0-{})",
                    ctx(),
                    s.channel,
                    ADC_CHANNELS - 1
                ));
            } else if power_channels.contains(&s.channel) {
                errors.push(format!("{}: channel {} is wired to power sensing", ctx(), s.channel));
            } else if !seen_channels.insert(s.channel) {
                errors.push(format!(
                    "{}: channel {} is already used by another sensor",
                    ctx(),
                    s.channel
                ));
            }

            // ── Calibration + thresholds ────────────────────────
            if !s.offset.is_finite() || !s.scale.is_finite() || s.scale == 0.0 {
                errors.push(format!(
                    "{}: calibration offset {} / scale {} is not usable",
                    ctx(),
                    s.offset,
                    s.scale
                ));
            }
            if s.min_threshold >= s.max_threshold {
                errors.push(format!(
                    "{}: max_threshold ({}) must be greater than min_threshold ({})",
                    ctx(),
                    s.max_threshold,
                    s.min_threshold
                ));
            }
            if s.kind.is_percentage() {
                for (name, v) in [("min_threshold", s.min_threshold), ("max_threshold", s.max_threshold)] {
                    if !(0.0..=100.0).contains(&v) {
                        errors.push(format!("{}: {name} {v} out of range [0, 100]", ctx()));
                    }
                }
            }
        }

        // ── Controlling sensor ──────────────────────────────
        let id = &self.irrigation.sensor_id;
        if id.trim().is_empty() {
            errors.push("irrigation.sensor_id is empty".to_string());
        } else {
            match self.sensors.iter().find(|s| &s.sensor_id == id) {
                None => errors.push(format!(
                    "irrigation.sensor_id '{id}' does not match any defined sensor"
                )),
                Some(s) if s.kind != SensorKind::SoilMoisture => errors.push(format!(
                    "irrigation.sensor_id '{id}' is a {} sensor, expected soil_moisture",
                    s.kind
                )),
                Some(_) => {}
            }
        }
    }
}

fn valid_channel(ch: i64) -> bool {
    (0..i64::from(ADC_CHANNELS)).contains(&ch)
}

// ---------------------------------------------------------------------------
// Runtime settings
// ---------------------------------------------------------------------------

// The conversions below assume a validated config.
fn secs(v: i64) -> Duration {
    Duration::from_secs(v.max(0) as u64)
}

fn millis(v: i64) -> Duration {
    Duration::from_millis(v.max(0) as u64)
}

impl Config {
    pub fn adc_scale(&self) -> AdcScale {
        AdcScale {
            max_raw: self.adc.max_raw,
            full_scale_v: self.adc.full_scale_v,
        }
    }

    pub fn watering(&self) -> WateringConfig {
        WateringConfig {
            flow_rate_lpm: self.irrigation.flow_rate_lpm,
            settle: secs(self.irrigation.settle_sec),
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            interval: secs(self.monitor.interval_sec),
            failure_threshold: self.monitor.failure_threshold.clamp(1, i64::from(u32::MAX)) as u32,
            adc: self.adc_scale(),
            power: PowerChannels {
                battery: self.power.battery_channel as u8,
                solar: self.power.solar_channel as u8,
                divider_ratio: self.power.divider_ratio,
            },
        }
    }

    pub fn power_thresholds(&self) -> PowerThresholds {
        PowerThresholds {
            low: self.power.low_voltage,
            high: self.power.high_voltage,
        }
    }

    pub fn irrigation_duration(&self) -> Duration {
        secs(self.irrigation.duration_sec)
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings::new(
            self.irrigation.auto_mode,
            self.irrigation_duration(),
            secs(self.irrigation.max_duration_sec),
        )
    }

    pub fn manual_duration(&self) -> Duration {
        secs(self.manual.duration_sec)
    }

    pub fn manual_poll(&self) -> Duration {
        millis(self.manual.poll_ms)
    }

    pub fn manual_debounce(&self) -> Duration {
        millis(self.manual.debounce_ms)
    }
}

impl SensorEntry {
    pub fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            sensor_id: self.sensor_id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            location: self.location.clone(),
            channel: self.channel as u8,
            active: self.active,
            status: SensorStatus::Active,
            calibration: Calibration {
                offset: self.offset,
                scale: self.scale,
            },
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all sensors from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sensors {
        db.upsert_sensor(&s.descriptor())
            .await
            .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;
    }

    tracing::info!(
        sensors = config.sensors.len(),
        controlling = %config.irrigation.sensor_id,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
