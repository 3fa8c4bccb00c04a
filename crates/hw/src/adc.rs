//! ADS1115 16-bit ADC over I2C.
//!
//! Single-shot, single-ended conversions at PGA ±4.096 V and 128 SPS.  The
//! controller converts raw counts to moisture/voltage itself, so this driver
//! only hands back the clamped 0..=32767 count.

use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::{HardwareError, ADC_CHANNELS, ADS1115_MAX};

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

// Config register, MSB first:
//   [15] OS  [14:12] MUX  [11:9] PGA  [8] MODE  [7:5] DR  [4:0] comparator
//
// OS=1 start, PGA=001 ±4.096 V, MODE=1 single-shot, DR=100 128 SPS,
// COMP_QUE=11 comparator disabled.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
const MUX_SHIFT: u16 = 12;
/// AINx vs GND.
const MUX_SINGLE_ENDED: [u16; ADC_CHANNELS as usize] = [0b100, 0b101, 0b110, 0b111];
const OS_READY: u16 = 1 << 15;

/// One conversion at 128 SPS takes ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);
const READY_POLLS: usize = 3;

fn config_word(channel: u8) -> Option<u16> {
    MUX_SINGLE_ENDED
        .get(channel as usize)
        .map(|mux| CONFIG_BASE | (mux << MUX_SHIFT))
}

fn bus(e: rppal::i2c::Error) -> HardwareError {
    HardwareError::Bus(e.to_string())
}

pub(crate) struct Ads1115 {
    i2c: I2c,
}

impl Ads1115 {
    /// Open I2C bus 1 with the converter at `addr` (0x48 with ADDR to GND).
    pub(crate) fn open(addr: u16) -> Result<Self, HardwareError> {
        let mut i2c = I2c::new().map_err(bus)?;
        i2c.set_slave_address(addr).map_err(bus)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 ready");
        Ok(Self { i2c })
    }

    pub(crate) fn read(&mut self, channel: u8) -> Result<i64, HardwareError> {
        let config = config_word(channel).ok_or(HardwareError::UnknownChannel(channel))?;
        self.i2c
            .block_write(REG_CONFIG, &config.to_be_bytes())
            .map_err(bus)?;
        thread::sleep(CONVERSION_WAIT);

        let mut buf = [0u8; 2];
        for _ in 0..READY_POLLS {
            self.i2c.block_read(REG_CONFIG, &mut buf).map_err(bus)?;
            if u16::from_be_bytes(buf) & OS_READY != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        self.i2c.block_read(REG_CONVERSION, &mut buf).map_err(bus)?;
        // Single-ended results are never negative unless the bus glitched.
        Ok((i16::from_be_bytes(buf) as i64).clamp(0, ADS1115_MAX))
    }
}
