//! Hardware access for the irrigation rig.
//!
//! The controller talks to the physical world only through [`HardwareAccess`]:
//! analog channels (soil moisture, battery and solar voltage, ...), the pump
//! relay, and digital inputs such as the manual override button.  Two variants
//! are provided and the controller logic is identical for both:
//!
//! - `SimulatedHardware` (feature `sim`, default) for local development;
//! - `RpiHardware` (feature `rpi`) driving an ADS1115 over I2C plus GPIO.

use thiserror::Error;

#[cfg(feature = "rpi")]
mod adc;
#[cfg(feature = "rpi")]
mod gpio;
#[cfg(feature = "sim")]
mod sim;

#[cfg(feature = "rpi")]
pub use gpio::{RpiHardware, RpiPins};
#[cfg(feature = "sim")]
pub use sim::{Scenario, SimulatedHardware, SoilMoistureSim};

/// Highest single-ended reading from the ADS1115 (15-bit unsigned).
pub const ADS1115_MAX: i64 = 32767;

/// Number of single-ended ADS1115 inputs (AIN0..AIN3).
pub const ADC_CHANNELS: u8 = 4;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("analog channel {0} is not wired")]
    UnknownChannel(u8),
    #[error("input pin {0} is not configured")]
    UnknownPin(u8),
    #[error("bus error: {0}")]
    Bus(String),
}

/// Capability the controller uses to reach sensors and actuators.
///
/// Calls are expected to complete in bounded time (a single ADC conversion is
/// ~10 ms); implementations must be safe to share between tasks.
pub trait HardwareAccess: Send + Sync {
    /// Raw reading of an analog channel.
    fn read_raw(&self, channel: u8) -> Result<i64, HardwareError>;

    /// Switch the pump relay.
    fn set_pump(&self, on: bool) -> Result<(), HardwareError>;

    /// Level of a digital input (`true` = high).
    fn read_digital_input(&self, pin: u8) -> Result<bool, HardwareError>;
}
