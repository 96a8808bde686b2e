//! DS18B20 soil temperature probe on a 1-Wire bus.
//!
//! Reads follow the usual single-drop sequence: search for the ROM, issue
//! Convert T, wait out the conversion, read the 9-byte scratchpad.  The
//! scratchpad and the ROM are both checked against the Dallas CRC-8 before a
//! value is trusted.

use anyhow::{bail, ensure, Result};
use serde::Serialize;
use std::{thread, time::Duration};
use tracing::{info, warn};

use crate::persist::Slot;
use crate::queue::MessageQueue;
use crate::sensor::{fahrenheit, now_unix, Quality, Sensor};

// ── 1-Wire family codes ─────────────────────────────────────────────────────

const FAMILY_DS18S20: u8 = 0x10;
const FAMILY_DS18B20: u8 = 0x28;

// ── Scratchpad layout ───────────────────────────────────────────────────────
//
//   [0] temp LSB   [1] temp MSB   [2] TH   [3] TL   [4] config
//   [5] reserved   [6] COUNT_REMAIN (DS18S20)   [7] COUNT_PER_C   [8] CRC

const CONFIG_RESOLUTION_MASK: u8 = 0x60;
const RES_9_BIT: u8 = 0x00;
const RES_10_BIT: u8 = 0x20;
const RES_11_BIT: u8 = 0x40;

/// Raw bus access.  One device on the line.
pub trait OneWireBus {
    /// Search the bus for a device ROM.  `None` when nothing answers.
    fn search(&mut self) -> Result<Option<[u8; 8]>>;
    /// Issue Convert T to `rom`.
    fn start_conversion(&mut self, rom: &[u8; 8]) -> Result<()>;
    /// Read the full scratchpad from `rom`.
    fn read_scratchpad(&mut self, rom: &[u8; 8]) -> Result<[u8; 9]>;
}

/// Dallas/Maxim CRC-8 (poly x^8 + x^5 + x^4 + 1, reflected).  Running it over
/// a block including its trailing CRC byte yields zero.
pub(crate) fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
    }
    crc
}

/// Decode a scratchpad to degrees Celsius.
pub fn decode_scratchpad(family: u8, data: &[u8; 9]) -> Result<f32> {
    ensure!(
        data.iter().any(|&b| b != 0xFF),
        "scratchpad reads all 0xFF (device not responding)"
    );
    let crc = crc8(&data[..8]);
    ensure!(
        crc == data[8],
        "scratchpad CRC mismatch (computed 0x{crc:02x}, read 0x{:02x})",
        data[8]
    );

    let mut raw = i16::from_le_bytes([data[0], data[1]]);
    if family == FAMILY_DS18S20 {
        raw <<= 3;
        if data[7] == 0x10 {
            // COUNT_REMAIN extends the 9-bit reading to 12 bits.
            raw = (raw & !0x0F) + 12 - i16::from(data[6]);
        }
    } else {
        // Low bits are undefined below 12-bit resolution.
        match data[4] & CONFIG_RESOLUTION_MASK {
            RES_9_BIT => raw &= !7,
            RES_10_BIT => raw &= !3,
            RES_11_BIT => raw &= !1,
            _ => {}
        }
    }
    Ok(f32::from(raw) / 16.0)
}

#[derive(Debug, Serialize)]
struct SoilTempReport {
    soil_temp: Option<f32>,
    quality: Quality,
    ts: i64,
}

pub struct SoilTemp {
    topic: String,
    bus: Box<dyn OneWireBus>,
    rom: Option<[u8; 8]>,
    interval_ms: u64,
    conversion_wait: Duration,
    discovery_attempts: u32,
    discovery_backoff: Duration,
}

impl SoilTemp {
    pub fn new(
        topic: impl Into<String>,
        bus: Box<dyn OneWireBus>,
        interval_ms: u64,
        conversion_wait: Duration,
        discovery_attempts: u32,
        discovery_backoff: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            bus,
            rom: None,
            interval_ms,
            conversion_wait,
            discovery_attempts: discovery_attempts.max(1),
            discovery_backoff,
        }
    }

    fn read_celsius(&mut self) -> Result<f32> {
        let Some(rom) = self.rom else {
            bail!("no probe discovered");
        };
        self.bus.start_conversion(&rom)?;
        thread::sleep(self.conversion_wait);
        let data = self.bus.read_scratchpad(&rom)?;
        decode_scratchpad(rom[0], &data)
    }
}

impl Sensor for SoilTemp {
    fn id(&self) -> &str {
        "soil_temp"
    }

    fn initialize_hardware(&mut self) -> Result<()> {
        for attempt in 1..=self.discovery_attempts {
            match self.bus.search() {
                Ok(Some(rom)) if crc8(&rom) == 0 => {
                    if rom[0] != FAMILY_DS18B20 && rom[0] != FAMILY_DS18S20 {
                        bail!("unsupported 1-Wire family 0x{:02x}", rom[0]);
                    }
                    info!(
                        rom = format_args!("{:02x?}", rom),
                        attempt, "soil_temp: probe found"
                    );
                    self.rom = Some(rom);
                    return Ok(());
                }
                Ok(Some(rom)) => {
                    warn!(attempt, rom = format_args!("{:02x?}", rom), "soil_temp: ROM CRC mismatch");
                }
                Ok(None) => warn!(attempt, "soil_temp: no device on bus"),
                Err(e) => warn!(attempt, "soil_temp: bus search failed: {e}"),
            }
            if attempt < self.discovery_attempts {
                thread::sleep(self.discovery_backoff);
            }
        }
        bail!(
            "no 1-Wire probe after {} attempt(s)",
            self.discovery_attempts
        )
    }

    fn produce_and_publish(&mut self, outbox: &mut MessageQueue) -> Result<()> {
        match self.read_celsius() {
            Ok(celsius) => {
                let f = fahrenheit(celsius);
                info!(celsius, fahrenheit = f, "soil_temp: reading");
                let report = SoilTempReport {
                    soil_temp: Some(f),
                    quality: Quality::Ok,
                    ts: now_unix(),
                };
                ensure!(outbox.enqueue(&self.topic, &report), "outbound queue full");
                Ok(())
            }
            Err(e) => {
                outbox.enqueue(
                    &self.topic,
                    &SoilTempReport {
                        soil_temp: None,
                        quality: Quality::Failed,
                        ts: now_unix(),
                    },
                );
                Err(e)
            }
        }
    }

    fn nominal_interval_ms(&self) -> u64 {
        self.interval_ms
    }

    fn persistent_slot(&self) -> Slot {
        super::SOIL_TEMP_SLOT
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn with_crc<const N: usize>(mut bytes: [u8; N]) -> [u8; N] {
        bytes[N - 1] = crc8(&bytes[..N - 1]);
        bytes
    }

    fn ds18b20_rom() -> [u8; 8] {
        with_crc([FAMILY_DS18B20, 0xFF, 0x4C, 0x19, 0x61, 0x16, 0x03, 0])
    }

    /// Scratchpad for a DS18B20 at 12-bit resolution holding `raw`.
    fn pad(raw: i16, config: u8) -> [u8; 9] {
        let [lo, hi] = raw.to_le_bytes();
        with_crc([lo, hi, 0x4B, 0x46, config, 0xFF, 0x0C, 0x10, 0])
    }

    struct FakeBus {
        searches: VecDeque<Result<Option<[u8; 8]>>>,
        scratchpad: Result<[u8; 9], String>,
        conversions: u32,
    }

    impl FakeBus {
        fn new(searches: Vec<Result<Option<[u8; 8]>>>, scratchpad: [u8; 9]) -> Self {
            Self {
                searches: searches.into(),
                scratchpad: Ok(scratchpad),
                conversions: 0,
            }
        }
    }

    impl OneWireBus for FakeBus {
        fn search(&mut self) -> Result<Option<[u8; 8]>> {
            self.searches.pop_front().unwrap_or(Ok(None))
        }

        fn start_conversion(&mut self, _rom: &[u8; 8]) -> Result<()> {
            self.conversions += 1;
            Ok(())
        }

        fn read_scratchpad(&mut self, _rom: &[u8; 8]) -> Result<[u8; 9]> {
            self.scratchpad.clone().map_err(anyhow::Error::msg)
        }
    }

    fn probe(bus: FakeBus) -> SoilTemp {
        SoilTemp::new(
            "tele/test/soil_temp",
            Box::new(bus),
            600_000,
            Duration::ZERO,
            3,
            Duration::ZERO,
        )
    }

    // -- CRC-8 --------------------------------------------------------------

    #[test]
    fn crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xA1);
    }

    #[test]
    fn crc8_over_block_with_crc_is_zero() {
        assert_eq!(crc8(&ds18b20_rom()), 0);
        assert_eq!(crc8(&pad(0x0191, 0x7F)), 0);
    }

    #[test]
    fn crc8_empty_is_zero() {
        assert_eq!(crc8(&[]), 0);
    }

    // -- Scratchpad decode --------------------------------------------------

    #[test]
    fn decodes_positive_reading() {
        let c = decode_scratchpad(FAMILY_DS18B20, &pad(0x0191, 0x7F)).unwrap();
        assert_eq!(c, 25.0625);
    }

    #[test]
    fn decodes_negative_reading() {
        // 0xFF5E = -10.125 °C
        let c = decode_scratchpad(FAMILY_DS18B20, &pad(0xFF5E_u16 as i16, 0x7F)).unwrap();
        assert_eq!(c, -10.125);
    }

    #[test]
    fn masks_undefined_bits_at_low_resolution() {
        let raw = 0x0197; // 25.4375 at 12-bit
        assert_eq!(decode_scratchpad(FAMILY_DS18B20, &pad(raw, 0x1F)).unwrap(), 25.0);
        assert_eq!(decode_scratchpad(FAMILY_DS18B20, &pad(raw, 0x3F)).unwrap(), 25.25);
        assert_eq!(decode_scratchpad(FAMILY_DS18B20, &pad(raw, 0x5F)).unwrap(), 25.375);
    }

    #[test]
    fn ds18s20_uses_count_remain() {
        // 9-bit reading 0x0032 (25.0 °C), COUNT_REMAIN 0x0C -> 25.0 + 0.75 - 0.75
        let data = with_crc([0x32, 0x00, 0x4B, 0x46, 0xFF, 0xFF, 0x0C, 0x10, 0]);
        let c = decode_scratchpad(FAMILY_DS18S20, &data).unwrap();
        assert_eq!(c, 25.0);

        let data = with_crc([0x32, 0x00, 0x4B, 0x46, 0xFF, 0xFF, 0x08, 0x10, 0]);
        let c = decode_scratchpad(FAMILY_DS18S20, &data).unwrap();
        assert_eq!(c, 25.25);
    }

    #[test]
    fn rejects_bad_crc() {
        let mut data = pad(0x0191, 0x7F);
        data[0] ^= 0x01;
        assert!(decode_scratchpad(FAMILY_DS18B20, &data).is_err());
    }

    #[test]
    fn rejects_floating_bus() {
        assert!(decode_scratchpad(FAMILY_DS18B20, &[0xFF; 9]).is_err());
    }

    // -- Sensor -------------------------------------------------------------

    #[test]
    fn discovery_retries_until_found() {
        let bus = FakeBus::new(
            vec![Ok(None), Err(anyhow::anyhow!("reset failed")), Ok(Some(ds18b20_rom()))],
            pad(0x0191, 0x7F),
        );
        let mut s = probe(bus);
        s.initialize_hardware().unwrap();
        assert_eq!(s.rom, Some(ds18b20_rom()));
    }

    #[test]
    fn discovery_gives_up_after_bounded_attempts() {
        let bus = FakeBus::new(vec![Ok(None), Ok(None), Ok(None), Ok(Some(ds18b20_rom()))], pad(0, 0x7F));
        let mut s = probe(bus);
        assert!(s.initialize_hardware().is_err());
    }

    #[test]
    fn discovery_skips_corrupt_rom() {
        let mut bad = ds18b20_rom();
        bad[3] ^= 0x40;
        let bus = FakeBus::new(vec![Ok(Some(bad)), Ok(Some(ds18b20_rom()))], pad(0, 0x7F));
        let mut s = probe(bus);
        s.initialize_hardware().unwrap();
        assert_eq!(s.rom, Some(ds18b20_rom()));
    }

    #[test]
    fn discovery_rejects_unknown_family() {
        let rom = with_crc([0x3B, 1, 2, 3, 4, 5, 6, 0]);
        let bus = FakeBus::new(vec![Ok(Some(rom))], pad(0, 0x7F));
        let mut s = probe(bus);
        assert!(s.initialize_hardware().is_err());
    }

    #[test]
    fn publishes_fahrenheit() {
        let bus = FakeBus::new(vec![Ok(Some(ds18b20_rom()))], pad(0x0190, 0x7F));
        let mut s = probe(bus);
        s.initialize_hardware().unwrap();

        let mut q = MessageQueue::new(4);
        s.produce_and_publish(&mut q).unwrap();
        let msg = q.dequeue().unwrap();
        assert_eq!(msg.topic, "tele/test/soil_temp");
        let v: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert!((v["soil_temp"].as_f64().unwrap() - 77.0).abs() < 1e-4);
        assert_eq!(v["quality"], "ok");
    }

    #[test]
    fn failed_read_publishes_failed_quality() {
        let mut bus = FakeBus::new(vec![Ok(Some(ds18b20_rom()))], pad(0, 0x7F));
        bus.scratchpad = Err("bus timeout".into());
        let mut s = probe(bus);
        s.initialize_hardware().unwrap();

        let mut q = MessageQueue::new(4);
        assert!(s.produce_and_publish(&mut q).is_err());
        let v: serde_json::Value = serde_json::from_slice(&q.dequeue().unwrap().payload).unwrap();
        assert!(v["soil_temp"].is_null());
        assert_eq!(v["quality"], "failed");
    }
}
