//! Raspberry Pi rig: ADS1115 analog inputs, pump relay and button on GPIO.

use rppal::gpio::{Gpio, InputPin, OutputPin};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::adc::Ads1115;
use crate::{HardwareAccess, HardwareError};

/// Pin assignment for [`RpiHardware`].
#[derive(Debug, Clone)]
pub struct RpiPins {
    /// I2C address of the ADS1115.
    pub adc_addr: u16,
    /// BCM pin driving the pump relay.
    pub pump: u8,
    /// Many relay boards switch on a LOW input.
    pub pump_active_low: bool,
    /// BCM pins read as pulled-up digital inputs.
    pub inputs: Vec<u8>,
}

pub struct RpiHardware {
    adc: Mutex<Ads1115>,
    pump: Mutex<OutputPin>,
    pump_active_low: bool,
    inputs: HashMap<u8, InputPin>,
}

fn gpio_err(e: rppal::gpio::Error) -> HardwareError {
    HardwareError::Bus(e.to_string())
}

fn locked<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, HardwareError> {
    m.lock()
        .map_err(|_| HardwareError::Bus("driver state poisoned".to_string()))
}

impl RpiHardware {
    pub fn new(pins: &RpiPins) -> Result<Self, HardwareError> {
        let gpio = Gpio::new().map_err(gpio_err)?;

        let mut pump = gpio.get(pins.pump).map_err(gpio_err)?.into_output();
        // Relay off before anything else runs.
        write_relay(&mut pump, false, pins.pump_active_low);

        let mut inputs = HashMap::new();
        for &pin in &pins.inputs {
            inputs.insert(pin, gpio.get(pin).map_err(gpio_err)?.into_input_pullup());
        }

        tracing::info!(
            pump = pins.pump,
            active_low = pins.pump_active_low,
            inputs = ?pins.inputs,
            "gpio ready"
        );

        Ok(Self {
            adc: Mutex::new(Ads1115::open(pins.adc_addr)?),
            pump: Mutex::new(pump),
            pump_active_low: pins.pump_active_low,
            inputs,
        })
    }
}

fn write_relay(pin: &mut OutputPin, on: bool, active_low: bool) {
    // active-low: LOW = on; active-high: HIGH = on
    if on != active_low {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

impl HardwareAccess for RpiHardware {
    fn read_raw(&self, channel: u8) -> Result<i64, HardwareError> {
        locked(&self.adc)?.read(channel)
    }

    fn set_pump(&self, on: bool) -> Result<(), HardwareError> {
        write_relay(&mut *locked(&self.pump)?, on, self.pump_active_low);
        tracing::info!("pump {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn read_digital_input(&self, pin: u8) -> Result<bool, HardwareError> {
        self.inputs
            .get(&pin)
            .map(|p| p.is_high())
            .ok_or(HardwareError::UnknownPin(pin))
    }
}
