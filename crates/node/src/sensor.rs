//! The capability contract every measurement source implements to take part
//! in scheduling.

use anyhow::Result;
use serde::Serialize;

use crate::persist::{PersistentClock, Slot};
use crate::queue::MessageQueue;
use crate::wake::WakeReason;

/// Data-quality marker carried by every published payload.  A failed
/// measurement is published as `failed` with empty values rather than
/// repeating whatever the last reading happened to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Ok,
    Failed,
}

/// A measurement source driven by the [`Scheduler`](crate::scheduler::Scheduler).
///
/// The scheduler owns the sensor's `LastUpdate` slot: implementations never
/// write timing state themselves.
pub trait Sensor {
    /// Short stable name, used in logs, status output and topics.
    fn id(&self) -> &str;

    /// Configure the physical interface.  Called once per wake cycle at
    /// registration.  Must give up after a bounded number of attempts; an
    /// error disables the sensor for the rest of the cycle.
    fn initialize_hardware(&mut self) -> Result<()>;

    /// Take a measurement and queue the resulting payload.  An error is
    /// logged by the scheduler and the sensor is retried at its next due time.
    fn produce_and_publish(&mut self, outbox: &mut MessageQueue) -> Result<()>;

    /// Fixed cadence for this sensor.
    fn nominal_interval_ms(&self) -> u64;

    /// True when asynchronously captured data should go out now, regardless
    /// of cadence.
    fn has_urgent_data(&self) -> bool {
        false
    }

    /// The retained slot holding this sensor's last update time.
    fn persistent_slot(&self) -> Slot;

    /// Told why the device woke, before hardware initialisation.
    fn on_wake(&mut self, _reason: WakeReason, _clock: &mut PersistentClock) {}

    /// Last chance to retain sensor-local state before the device sleeps.
    fn before_sleep(&mut self, _clock: &mut PersistentClock) {}
}

/// Unix seconds, stamped on every payload.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub fn fahrenheit(celsius: f32) -> f32 {
    celsius * 1.8 + 32.0
}

// ===========================================================================
// Tests
// ===========================================================================
