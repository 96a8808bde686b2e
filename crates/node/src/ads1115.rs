//! ADS1115 16-bit ADC over I2C as the battery voltage input.
//!
//! Single-ended, PGA ±4.096 V, 128 SPS, single-shot.  Pair it with
//! `reference_volts = 4.096` and `full_scale_counts = 32767` in `[battery]`.

use anyhow::{ensure, Context, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::sensors::battery::AdcChannel;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS        write 1 to start a single-shot conversion
//   [14:12] MUX       input multiplexer (channel selection)
//   [11:9]  PGA       programmable gain amplifier
//   [8]     MODE      0 = continuous, 1 = single-shot
//   [7:5]   DR        data rate
//   [4:2]   COMP_*    comparator mode, polarity, latch
//   [1:0]   COMP_QUE  11 = comparator disabled

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for AINx vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// ~7.8 ms at 128 SPS.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Set in the config register once the conversion is done.
const OS_READY_BIT: u16 = 1 << 15;

pub const DEFAULT_ADDR: u16 = 0x48;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Parse an I2C address given as hex (`0x48`) or decimal (`72`).  Empty
/// means [`DEFAULT_ADDR`].
pub fn parse_addr(s: &str) -> Result<u16> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(DEFAULT_ADDR);
    }
    let addr = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .with_context(|| format!("invalid I2C address {s:?}"))?;
    ensure!(
        (0x08..=0x77).contains(&addr),
        "I2C address 0x{addr:02x} outside the 7-bit device range"
    );
    Ok(addr)
}

/// Parse a single-ended channel index.  Empty means AIN0.
pub fn parse_channel(s: &str) -> Result<usize> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let ch: usize = s
        .parse()
        .with_context(|| format!("invalid ADS1115 channel {s:?}"))?;
    ensure!(ch <= MAX_CHANNEL, "channel {ch} exceeds maximum ({MAX_CHANNEL})");
    Ok(ch)
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// One ADS1115 input backed by `rppal::i2c`.
pub struct Ads1115Channel {
    i2c: I2c,
    channel: usize,
}

impl Ads1115Channel {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16, channel: usize) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0-{MAX_CHANNEL})"
        );

        let mut i2c = I2c::new().context("failed to open I2C bus")?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            "ads1115 initialised"
        );

        Ok(Self { i2c, channel })
    }
}

impl AdcChannel for Ads1115Channel {
    fn read_raw(&mut self) -> Result<u16> {
        let config = config_for_channel(self.channel);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        // One wait is normally enough at 128 SPS.
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        // Single-ended reads are non-negative; bus corruption is not.
        Ok(i16::from_be_bytes(buf).max(0) as u16)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
