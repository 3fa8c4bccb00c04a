//! Raw signal to physical unit conversions.

use thiserror::Error;

use crate::model::{Calibration, SensorKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("raw value {raw} outside ADC range [0, {max_raw}]")]
    RawOutOfRange { raw: i64, max_raw: i64 },
    #[error("ADC full scale must be positive, got {0}")]
    InvalidRange(i64),
    #[error("calibration produced a non-finite value")]
    NonFinite,
}

/// ADC scaling shared by every analog channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScale {
    pub max_raw: i64,
    pub full_scale_v: f64,
}

/// `raw * scale + offset`.
pub fn calibrate(raw: f64, offset: f64, scale: f64) -> Result<f64, CalibrationError> {
    let v = raw * scale + offset;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CalibrationError::NonFinite)
    }
}

fn check_raw(raw: i64, max_raw: i64) -> Result<(), CalibrationError> {
    if max_raw <= 0 {
        return Err(CalibrationError::InvalidRange(max_raw));
    }
    if !(0..=max_raw).contains(&raw) {
        return Err(CalibrationError::RawOutOfRange { raw, max_raw });
    }
    Ok(())
}

/// Soil moisture percentage from a capacitive probe; the probe reads higher
/// when the soil is drier.
pub fn moisture_from_raw(raw: i64, max_raw: i64) -> Result<f64, CalibrationError> {
    check_raw(raw, max_raw)?;
    let pct = (max_raw - raw) as f64 / max_raw as f64 * 100.0;
    Ok(pct.clamp(0.0, 100.0))
}

/// Voltage behind a resistive divider, rounded to 2 decimals.
pub fn voltage_from_raw(raw: i64, adc: AdcScale, divider_ratio: f64) -> Result<f64, CalibrationError> {
    check_raw(raw, adc.max_raw)?;
    let v = raw as f64 / adc.max_raw as f64 * adc.full_scale_v * divider_ratio;
    if !v.is_finite() {
        return Err(CalibrationError::NonFinite);
    }
    Ok((v * 100.0).round() / 100.0)
}

/// Raw count that [`voltage_from_raw`] maps back to `volts`, saturating at
/// the ADC limits.  Used to seed simulated channels.
pub fn raw_for_voltage(volts: f64, adc: AdcScale, divider_ratio: f64) -> i64 {
    let raw = volts / (adc.full_scale_v * divider_ratio) * adc.max_raw as f64;
    (raw.round() as i64).clamp(0, adc.max_raw)
}

/// Calibrated value of a raw sensor signal.  Soil moisture goes through the
/// ADC inversion first; percentage kinds are clamped to 0..=100 at the end.
pub fn calibrate_reading(kind: SensorKind, raw: i64, cal: Calibration, adc: AdcScale) -> Result<f64, CalibrationError> {
    check_raw(raw, adc.max_raw)?;
    let base = match kind {
        SensorKind::SoilMoisture => moisture_from_raw(raw, adc.max_raw)?,
        _ => raw as f64,
    };
    let value = calibrate(base, cal.offset, cal.scale)?;
    Ok(if kind.is_percentage() {
        value.clamp(0.0, 100.0)
    } else {
        value
    })
}
