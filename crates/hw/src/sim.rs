//! Simulated rig for development without hardware.
//!
//! Soil moisture channels are driven by a stateful model of a capacitive
//! probe (random walk around a drying trend, ADC noise, occasional spikes, a
//! day/night swing) that reacts to the pump: while it runs, the soil gets
//! wetter.  Every other analog channel is either a fixed value or a uniform
//! random value in a band.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::{HardwareAccess, HardwareError, ADS1115_MAX};

/// Irwin-Hall approximation of N(0, 1): sum of 12 uniforms minus 6.
fn std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * std_normal()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Simulation profile, selected with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start drifting dry; reaches the watering threshold.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Noisy with frequent spikes.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Drying => Profile { drift: 15.0, walk: 150.0, reversion: 0.02, noise: 80.0, spike_prob: 0.03, spike: 2000.0, start: 0.5 },
            Self::Stable => Profile { drift: 2.0, walk: 60.0, reversion: 0.05, noise: 40.0, spike_prob: 0.005, spike: 1000.0, start: 0.5 },
            Self::Flaky => Profile { drift: 10.0, walk: 250.0, reversion: 0.02, noise: 200.0, spike_prob: 0.10, spike: 3000.0, start: 0.5 },
            Self::Wet => Profile { drift: 3.0, walk: 80.0, reversion: 0.02, noise: 60.0, spike_prob: 0.02, spike: 1500.0, start: 0.2 },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drying => "drying",
            Self::Stable => "stable",
            Self::Flaky => "flaky",
            Self::Wet => "wet",
        };
        f.write_str(name)
    }
}

/// Tuning for one scenario, all in ADC units per sample.
#[derive(Debug, Clone, Copy)]
struct Profile {
    drift: f64,
    walk: f64,
    reversion: f64,
    noise: f64,
    spike_prob: f32,
    spike: f64,
    /// 0.0 = wet end, 1.0 = dry end.
    start: f64,
}

// ---------------------------------------------------------------------------
// Soil model
// ---------------------------------------------------------------------------

struct Probe {
    level: f64,
    bias: f64,
    noise: f64,
}

/// Soil moisture model producing raw ADC values (higher = drier).
pub struct SoilMoistureSim {
    probes: Vec<Probe>,
    profile: Profile,
    raw_dry: f64,
    raw_wet: f64,
    diurnal_amplitude: f64,
    diurnal_period_s: f64,
    watering: bool,
}

/// ADC units per sample the soil moves toward wet while the pump runs.
const WETTING_RATE: f64 = 300.0;

impl SoilMoistureSim {
    pub fn new(scenario: Scenario, probes: usize, raw_dry: f64, raw_wet: f64, diurnal_period_s: f64) -> Self {
        let profile = scenario.profile();
        let span = raw_dry - raw_wet;
        let start = raw_wet + profile.start * span;

        let probes = (0..probes)
            .map(|_| Probe {
                level: (start + gaussian(0.0, span * 0.03)).clamp(raw_wet, raw_dry),
                bias: gaussian(0.0, span * 0.02),
                noise: profile.noise * (1.0 + 0.2 * std_normal()).max(0.3),
            })
            .collect();

        Self {
            probes,
            profile,
            raw_dry,
            raw_wet,
            diurnal_amplitude: span * 0.06,
            diurnal_period_s,
            watering: false,
        }
    }

    pub fn set_watering(&mut self, on: bool) {
        self.watering = on;
    }

    #[cfg(test)]
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Advance probe `index` by one step and return its raw reading.
    /// Returns `None` for an index past the last probe.
    pub fn sample(&mut self, index: usize) -> Option<i64> {
        let p = self.profile;
        let centre = (self.raw_dry + self.raw_wet) / 2.0;
        let wetting = if self.watering { WETTING_RATE } else { 0.0 };
        let (lo, hi) = (self.raw_wet - 500.0, self.raw_dry + 500.0);
        let probe = self.probes.get_mut(index)?;

        let step = p.drift + p.reversion * (centre - probe.level) + gaussian(0.0, p.walk) - wetting;
        probe.level = (probe.level + step).clamp(lo, hi);

        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let diurnal = self.diurnal_amplitude * (std::f64::consts::TAU * now_s / self.diurnal_period_s).sin();
        let spike = if fastrand::f32() < p.spike_prob { gaussian(0.0, p.spike) } else { 0.0 };

        let raw = probe.level + probe.bias + diurnal + gaussian(0.0, probe.noise) + spike;
        Some(raw.round().clamp(0.0, ADS1115_MAX as f64) as i64)
    }
}

// ---------------------------------------------------------------------------
// Simulated rig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Signal {
    Fixed(i64),
    Uniform(i64, i64),
}

struct Rig {
    soil: SoilMoistureSim,
    soil_channels: Vec<u8>,
    signals: HashMap<u8, Signal>,
    inputs: HashMap<u8, bool>,
    pump_on: bool,
}

/// [`HardwareAccess`] backed by [`SoilMoistureSim`].
pub struct SimulatedHardware {
    rig: Mutex<Rig>,
}

impl SimulatedHardware {
    /// One simulated probe per entry of `soil_channels`.
    pub fn new(scenario: Scenario, soil_channels: Vec<u8>, raw_dry: f64, raw_wet: f64) -> Self {
        let soil = SoilMoistureSim::new(scenario, soil_channels.len(), raw_dry, raw_wet, 600.0);
        tracing::info!(%scenario, channels = ?soil_channels, "simulated hardware ready");
        Self {
            rig: Mutex::new(Rig {
                soil,
                soil_channels,
                signals: HashMap::new(),
                inputs: HashMap::new(),
                pump_on: false,
            }),
        }
    }

    /// Serve a constant raw value on `channel`.
    pub fn with_fixed(self, channel: u8, raw: i64) -> Self {
        self.with_signal(channel, Signal::Fixed(raw))
    }

    /// Serve uniformly random raw values in `lo..=hi` on `channel`.
    pub fn with_uniform(self, channel: u8, lo: i64, hi: i64) -> Self {
        self.with_signal(channel, Signal::Uniform(lo.min(hi), lo.max(hi)))
    }

    /// Register a pulled-up digital input (idle level high).
    pub fn with_input(self, pin: u8) -> Self {
        if let Ok(mut rig) = self.rig.lock() {
            rig.inputs.insert(pin, true);
        }
        self
    }

    fn with_signal(self, channel: u8, signal: Signal) -> Self {
        if let Ok(mut rig) = self.rig.lock() {
            rig.signals.insert(channel, signal);
        }
        self
    }

    /// Change a fixed channel at runtime (e.g. to simulate a battery sag).
    #[cfg(test)]
    pub fn set_fixed(&self, channel: u8, raw: i64) -> Result<(), HardwareError> {
        self.rig()?.signals.insert(channel, Signal::Fixed(raw));
        Ok(())
    }

    /// Drive a digital input level (`false` = button pressed).
    #[cfg(test)]
    pub fn set_input(&self, pin: u8, level: bool) -> Result<(), HardwareError> {
        let mut rig = self.rig()?;
        match rig.inputs.get_mut(&pin) {
            Some(l) => {
                *l = level;
                Ok(())
            }
            None => Err(HardwareError::UnknownPin(pin)),
        }
    }

    #[cfg(test)]
    pub fn pump_on(&self) -> bool {
        self.rig().map(|r| r.pump_on).unwrap_or(false)
    }

    fn rig(&self) -> Result<MutexGuard<'_, Rig>, HardwareError> {
        self.rig
            .lock()
            .map_err(|_| HardwareError::Bus("simulator state poisoned".to_string()))
    }
}

impl HardwareAccess for SimulatedHardware {
    fn read_raw(&self, channel: u8) -> Result<i64, HardwareError> {
        let mut rig = self.rig()?;
        if let Some(index) = rig.soil_channels.iter().position(|&c| c == channel) {
            return rig.soil.sample(index).ok_or(HardwareError::UnknownChannel(channel));
        }
        match rig.signals.get(&channel) {
            Some(Signal::Fixed(raw)) => Ok(*raw),
            Some(Signal::Uniform(lo, hi)) => Ok(fastrand::i64(*lo..=*hi)),
            None => Err(HardwareError::UnknownChannel(channel)),
        }
    }

    fn set_pump(&self, on: bool) -> Result<(), HardwareError> {
        let mut rig = self.rig()?;
        if rig.pump_on != on {
            tracing::info!("[sim] pump {}", if on { "ON" } else { "OFF" });
        }
        rig.pump_on = on;
        rig.soil.set_watering(on);
        Ok(())
    }

    fn read_digital_input(&self, pin: u8) -> Result<bool, HardwareError> {
        self.rig()?
            .inputs
            .get(&pin)
            .copied()
            .ok_or(HardwareError::UnknownPin(pin))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
