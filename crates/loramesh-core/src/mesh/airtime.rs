//! LoRa time-on-air
//!
//! The scheduler needs each frame's airtime to pace duty cycle, so the
//! closed-form LoRa symbol formula is evaluated here rather than asked of
//! the PHY:
//!
//! ```text
//! Tsym      = 2^SF / BW
//! Tpreamble = (8 + 4.25) * Tsym
//! PL        = length + 8                      (8 header bytes)
//! n         = 8 + max(ceil((8PL - 4SF + 44) / 4SF) * (CR + 4), 0)
//! T         = Tpreamble + (8 + n) * Tsym
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

const PREAMBLE_SYMBOLS: f64 = 8.0;
const HEADER_BYTES: i64 = 8;

/// Radio parameters attached to an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioSettings {
    /// Spreading factor (7-12)
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth_hz: u32,
    /// Coding rate index (1-4, meaning 4/5 to 4/8)
    pub coding_rate: u8,
    /// Transmit power in dBm
    pub tx_power_dbm: f32,
    /// Carrier frequency in Hz
    pub center_frequency_hz: u64,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coding_rate: 1,
            tx_power_dbm: 14.0,
            center_frequency_hz: 868_000_000, // EU868
        }
    }
}

impl RadioSettings {
    pub fn with_spreading_factor(mut self, sf: u8) -> Self {
        self.spreading_factor = sf;
        self
    }

    /// Airtime of a frame carrying `length` application bytes
    pub fn airtime(&self, length: u16) -> Duration {
        time_on_air(self.spreading_factor, self.bandwidth_hz, self.coding_rate, length)
    }

    /// Symbol duration
    pub fn symbol_time(&self) -> Duration {
        Duration::from_secs_f64(symbol_secs(self.spreading_factor, self.bandwidth_hz))
    }
}

fn symbol_secs(sf: u8, bandwidth_hz: u32) -> f64 {
    if bandwidth_hz == 0 {
        return 0.0;
    }
    2f64.powi(i32::from(sf)) / f64::from(bandwidth_hz)
}

/// Time on air for one LoRa frame
pub fn time_on_air(sf: u8, bandwidth_hz: u32, coding_rate: u8, length: u16) -> Duration {
    let tsym = symbol_secs(sf, bandwidth_hz);
    let sf = i64::from(sf.max(1));
    let payload_bytes = i64::from(length) + HEADER_BYTES;

    let numerator = 8 * payload_bytes - 4 * sf + 28 + 16;
    let denominator = 4 * sf;
    let blocks = (numerator as f64 / denominator as f64).ceil() as i64;
    let payload_symbols = 8 + (blocks * (i64::from(coding_rate) + 4)).max(0);

    let preamble = (PREAMBLE_SYMBOLS + 4.25) * tsym;
    let frame = (8 + payload_symbols) as f64 * tsym;

    Duration::from_secs_f64(preamble + frame)
}
