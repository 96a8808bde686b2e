//! Tipping-bucket rain gauge.
//!
//! Each bucket tip closes a reed switch.  The edge is counted in interrupt
//! context by [`TipCounter`], which does nothing but debounce and bump an
//! atomic.  All reporting happens later in the main context.
//!
//! Tips survive sleep through the `RainTips` retention slot: they are folded
//! in just before sleeping and restored on the next wake.  A tip that woke the
//! device is counted on wake, since the edge fired while nothing was attached.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::persist::{PersistentClock, Slot};
use crate::queue::MessageQueue;
use crate::sensor::{now_unix, Quality, Sensor};
use crate::wake::WakeReason;

const NO_EDGE: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Interrupt-side counter
// ---------------------------------------------------------------------------

/// Debounced edge counter shared between the interrupt handler and the
/// sensor.  Lock-free; safe to call from any context.
#[derive(Debug)]
pub struct TipCounter {
    tips: AtomicU32,
    last_edge_ms: AtomicU64,
    debounce_ms: u64,
}

impl TipCounter {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            tips: AtomicU32::new(0),
            last_edge_ms: AtomicU64::new(NO_EDGE),
            debounce_ms,
        }
    }

    /// Record an edge seen at `uptime_ms`.  Returns whether it counted.
    /// Edges within the debounce window of the last accepted edge are
    /// switch bounce.
    pub fn on_edge(&self, uptime_ms: u64) -> bool {
        let last = self.last_edge_ms.load(Ordering::Acquire);
        if last != NO_EDGE && uptime_ms.saturating_sub(last) <= self.debounce_ms {
            return false;
        }
        self.last_edge_ms.store(uptime_ms, Ordering::Release);
        self.tips.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn pending(&self) -> u32 {
        self.tips.load(Ordering::Acquire)
    }

    /// Take every pending tip, leaving zero.
    pub fn take(&self) -> u32 {
        self.tips.swap(0, Ordering::AcqRel)
    }

    /// Put tips back (retained count on wake, or a report that could not be queued).
    pub fn restore(&self, tips: u32) {
        self.tips.fetch_add(tips, Ordering::AcqRel);
    }
}

/// The GPIO line the reed switch is wired to.
pub trait TipSource {
    /// Start delivering edges to `counter`.
    fn attach(&mut self, counter: Arc<TipCounter>) -> Result<()>;
    /// Stop delivering edges.  After this returns no further edge reaches
    /// the counter.
    fn detach(&mut self);
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RainReport {
    rain: f32,
    tips: u32,
    quality: Quality,
    ts: i64,
}

pub struct RainGauge {
    topic: String,
    source: Box<dyn TipSource>,
    counter: Arc<TipCounter>,
    interval_ms: u64,
    inches_per_tip: f32,
    report_immediately: bool,
    attached: bool,
}

impl RainGauge {
    pub fn new(
        topic: impl Into<String>,
        source: Box<dyn TipSource>,
        interval_ms: u64,
        debounce_ms: u64,
        inches_per_tip: f32,
        report_immediately: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            source,
            counter: Arc::new(TipCounter::new(debounce_ms)),
            interval_ms,
            inches_per_tip,
            report_immediately,
            attached: false,
        }
    }

    #[cfg(test)]
    pub fn pending_tips(&self) -> u32 {
        self.counter.pending()
    }

    fn detach(&mut self) {
        if self.attached {
            self.source.detach();
            self.attached = false;
        }
    }
}

impl Sensor for RainGauge {
    fn id(&self) -> &str {
        "rain"
    }

    fn initialize_hardware(&mut self) -> Result<()> {
        self.source.attach(Arc::clone(&self.counter))?;
        self.attached = true;
        info!(debounce_ms = self.counter.debounce_ms, "rain: tip interrupt armed");
        Ok(())
    }

    fn produce_and_publish(&mut self, outbox: &mut MessageQueue) -> Result<()> {
        let tips = self.counter.take();
        let report = RainReport {
            rain: tips as f32 * self.inches_per_tip,
            tips,
            quality: Quality::Ok,
            ts: now_unix(),
        };
        if !outbox.enqueue(&self.topic, &report) {
            self.counter.restore(tips);
            bail!("outbound queue full, {tips} tip(s) kept for next report");
        }
        info!(tips, inches = report.rain, "rain: report queued");
        Ok(())
    }

    fn nominal_interval_ms(&self) -> u64 {
        self.interval_ms
    }

    fn has_urgent_data(&self) -> bool {
        self.report_immediately && self.counter.pending() > 0
    }

    fn persistent_slot(&self) -> Slot {
        super::RAIN_SLOT
    }

    fn on_wake(&mut self, reason: WakeReason, clock: &mut PersistentClock) {
        let retained = clock.read(Slot::RainTips);
        if retained > 0 {
            self.counter
                .restore(u32::try_from(retained).unwrap_or(u32::MAX));
            clock.write(Slot::RainTips, 0);
        }
        if reason.is_interrupt() {
            self.counter.restore(1);
        }
        debug!(
            retained,
            woke_on_tip = reason.is_interrupt(),
            pending = self.counter.pending(),
            "rain: wake"
        );
    }

    fn before_sleep(&mut self, clock: &mut PersistentClock) {
        // Stop counting before snapshotting so no edge lands between the two.
        self.detach();
        let pending = self.counter.take();
        clock.write(Slot::RainTips, u64::from(pending));
        if pending > 0 {
            debug!(pending, "rain: tips retained across sleep");
        }
    }
}

impl Drop for RainGauge {
    fn drop(&mut self) {
        self.detach();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
