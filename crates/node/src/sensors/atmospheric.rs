//! BMP280 air temperature and barometric pressure, read in forced mode: the
//! part takes one measurement on request and drops back to sleep.

use anyhow::{ensure, Context, Result};
use serde::Serialize;
use std::ops::RangeInclusive;
use tracing::info;

use crate::persist::Slot;
use crate::queue::MessageQueue;
use crate::sensor::{fahrenheit, now_unix, Quality, Sensor};

/// Operating range of the part.  Anything outside is a bad read.
const PRESSURE_RANGE_PA: RangeInclusive<f32> = 30_000.0..=110_000.0;
const TEMPERATURE_RANGE_C: RangeInclusive<f32> = -40.0..=85.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub celsius: f32,
    pub pascals: f32,
}

/// Driver-level access to the barometer.
pub trait Barometer {
    /// Probe the part and configure forced-mode sampling.
    fn init(&mut self) -> Result<()>;
    /// Trigger one conversion and return the compensated result.
    fn forced_measurement(&mut self) -> Result<Measurement>;
}

fn check_plausible(m: Measurement) -> Result<Measurement> {
    ensure!(
        TEMPERATURE_RANGE_C.contains(&m.celsius),
        "temperature {:.2} °C outside sensor range",
        m.celsius
    );
    ensure!(
        PRESSURE_RANGE_PA.contains(&m.pascals),
        "pressure {:.0} Pa outside sensor range",
        m.pascals
    );
    Ok(m)
}

#[derive(Debug, Serialize)]
struct AtmosphericReport {
    bmp_temperature: Option<f32>,
    bmp_pressure: Option<f32>,
    quality: Quality,
    ts: i64,
}

pub struct Atmospheric {
    topic: String,
    baro: Box<dyn Barometer>,
    interval_ms: u64,
}

impl Atmospheric {
    pub fn new(topic: impl Into<String>, baro: Box<dyn Barometer>, interval_ms: u64) -> Self {
        Self {
            topic: topic.into(),
            baro,
            interval_ms,
        }
    }
}

impl Sensor for Atmospheric {
    fn id(&self) -> &str {
        "atmospheric"
    }

    fn initialize_hardware(&mut self) -> Result<()> {
        self.baro.init().context("bmp280 not found")
    }

    fn produce_and_publish(&mut self, outbox: &mut MessageQueue) -> Result<()> {
        let reading = self
            .baro
            .forced_measurement()
            .context("forced measurement failed")
            .and_then(check_plausible);

        let report = match &reading {
            Ok(m) => {
                info!(celsius = m.celsius, pascals = m.pascals, "atmospheric: reading");
                AtmosphericReport {
                    bmp_temperature: Some(fahrenheit(m.celsius)),
                    bmp_pressure: Some(m.pascals),
                    quality: Quality::Ok,
                    ts: now_unix(),
                }
            }
            Err(_) => AtmosphericReport {
                bmp_temperature: None,
                bmp_pressure: None,
                quality: Quality::Failed,
                ts: now_unix(),
            },
        };
        let queued = outbox.enqueue(&self.topic, &report);
        reading?;
        ensure!(queued, "outbound queue full");
        Ok(())
    }

    fn nominal_interval_ms(&self) -> u64 {
        self.interval_ms
    }

    fn persistent_slot(&self) -> Slot {
        super::ATMOSPHERIC_SLOT
    }
}

// ===========================================================================
// Tests
// ===========================================================================
