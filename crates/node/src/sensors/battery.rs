//! Battery voltage through a resistor divider into an ADC channel.
//!
//! The ADC shares the radio's reference and reads garbage while the radio is
//! up, so the sample is taken during hardware initialisation, before the
//! transport connects, and only reported on dispatch.

use anyhow::{ensure, Context, Result};
use serde::Serialize;
use std::{thread, time::Duration};
use tracing::info;

use crate::persist::Slot;
use crate::queue::MessageQueue;
use crate::sensor::{now_unix, Quality, Sensor};

/// One single-ended ADC input.
pub trait AdcChannel {
    fn read_raw(&mut self) -> Result<u16>;
}

/// Counts-to-volts conversion for the divider feeding the ADC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageDivider {
    pub reference_volts: f32,
    pub ratio: f32,
    pub full_scale_counts: u16,
}

impl VoltageDivider {
    pub fn volts(&self, counts: f32) -> f32 {
        counts * self.reference_volts * self.ratio / f32::from(self.full_scale_counts)
    }
}

#[derive(Debug, Serialize)]
struct BatteryReport {
    battery: Option<f32>,
    quality: Quality,
    ts: i64,
}

pub struct Battery {
    topic: String,
    adc: Box<dyn AdcChannel>,
    divider: VoltageDivider,
    samples: u32,
    settle: Duration,
    interval_ms: u64,
    volts: Option<f32>,
}

impl Battery {
    pub fn new(
        topic: impl Into<String>,
        adc: Box<dyn AdcChannel>,
        divider: VoltageDivider,
        samples: u32,
        settle: Duration,
        interval_ms: u64,
    ) -> Self {
        Self {
            topic: topic.into(),
            adc,
            divider,
            samples: samples.max(1),
            settle,
            interval_ms,
            volts: None,
        }
    }

    /// Voltage captured at initialisation, if sampling succeeded.
    #[cfg(test)]
    pub fn volts(&self) -> Option<f32> {
        self.volts
    }

    fn sample(&mut self) -> Result<f32> {
        // First conversion after power-up is unreliable.
        self.adc.read_raw().context("battery adc warm-up read")?;
        thread::sleep(self.settle);

        let mut total: u64 = 0;
        for _ in 0..self.samples {
            total += u64::from(self.adc.read_raw()?);
        }
        let average = total as f32 / self.samples as f32;
        Ok(self.divider.volts(average))
    }
}

impl Sensor for Battery {
    fn id(&self) -> &str {
        "battery"
    }

    fn initialize_hardware(&mut self) -> Result<()> {
        self.volts = None;
        let volts = self.sample()?;
        info!(volts, samples = self.samples, "battery: sampled");
        self.volts = Some(volts);
        Ok(())
    }

    fn produce_and_publish(&mut self, outbox: &mut MessageQueue) -> Result<()> {
        let report = BatteryReport {
            battery: self.volts,
            quality: if self.volts.is_some() {
                Quality::Ok
            } else {
                Quality::Failed
            },
            ts: now_unix(),
        };
        let queued = outbox.enqueue(&self.topic, &report);
        ensure!(self.volts.is_some(), "no battery sample this cycle");
        ensure!(queued, "outbound queue full");
        Ok(())
    }

    fn nominal_interval_ms(&self) -> u64 {
        self.interval_ms
    }

    fn persistent_slot(&self) -> Slot {
        super::BATTERY_SLOT
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedAdc(VecDeque<Result<u16>>);

    impl AdcChannel for ScriptedAdc {
        fn read_raw(&mut self) -> Result<u16> {
            self.0.pop_front().unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    const DIVIDER: VoltageDivider = VoltageDivider {
        reference_volts: 3.22,
        ratio: 2.0,
        full_scale_counts: 4095,
    };

    fn battery(reads: Vec<Result<u16>>, samples: u32) -> Battery {
        Battery::new(
            "tele/test/battery",
            Box::new(ScriptedAdc(reads.into())),
            DIVIDER,
            samples,
            Duration::ZERO,
            1_800_000,
        )
    }

    #[test]
    fn full_scale_reads_reference_times_ratio() {
        assert!((DIVIDER.volts(4095.0) - 6.44).abs() < 1e-4);
        assert_eq!(DIVIDER.volts(0.0), 0.0);
    }

    #[test]
    fn discards_first_read_and_averages_the_rest() {
        // Warm-up read of 0 must not drag the average down.
        let mut b = battery(vec![Ok(0), Ok(2000), Ok(2100), Ok(2200), Ok(2300)], 4);
        b.initialize_hardware().unwrap();
        let expected = DIVIDER.volts(2150.0);
        assert!((b.volts().unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn adc_error_fails_init() {
        let mut b = battery(vec![Ok(0), Ok(2000), Err(anyhow::anyhow!("i2c nack"))], 4);
        assert!(b.initialize_hardware().is_err());
        assert!(b.volts().is_none());
    }

    #[test]
    fn reports_the_sample_taken_at_init() {
        let mut b = battery(vec![Ok(0), Ok(2600), Ok(2600)], 2);
        b.initialize_hardware().unwrap();

        let mut q = MessageQueue::new(2);
        b.produce_and_publish(&mut q).unwrap();
        let msg = q.dequeue().unwrap();
        assert_eq!(msg.topic, "tele/test/battery");
        let v: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert!((v["battery"].as_f64().unwrap() - f64::from(DIVIDER.volts(2600.0))).abs() < 1e-4);
        assert_eq!(v["quality"], "ok");
    }

    #[test]
    fn publish_without_sample_is_a_failed_report() {
        let mut b = battery(vec![], 2);
        let mut q = MessageQueue::new(2);
        assert!(b.produce_and_publish(&mut q).is_err());
        let v: serde_json::Value = serde_json::from_slice(&q.dequeue().unwrap().payload).unwrap();
        assert!(v["battery"].is_null());
        assert_eq!(v["quality"], "failed");
    }
}
