//! Per-sensor update scheduler.
//!
//! Built fresh on every wake from nothing but the retained slot table.  One
//! wake cycle runs:
//!
//! ```text
//! new ──▶ register* ──▶ evaluate / has_data_to_send ──▶ dispatch ──▶ plan ──▶ (sleep)
//! ```
//!
//! All due-ness is computed against the *logical* now (see [`crate::wake`]),
//! never against the uptime counter.  The scheduler is the single writer of
//! every `LastUpdate` slot and of the two wake-timing slots.

use anyhow::{Context, Result};
use std::fmt;
use tracing::{debug, info, warn};

use crate::persist::{PersistentClock, Slot};
use crate::queue::MessageQueue;
use crate::sensor::Sensor;
use crate::wake::{self, WakeCause, WakeReason};

/// Bounds applied to the proposed sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepLimits {
    /// Shortest sleep ever requested.  Keeps an urgent sensor from busy-looping.
    pub floor_ms: u64,
    /// Longest sleep ever requested.
    pub ceiling_ms: u64,
    /// Proposal when no sensor is enabled.
    pub idle_ms: u64,
}

impl SleepLimits {
    pub fn clamp(&self, ms: u64) -> u64 {
        ms.max(self.floor_ms).min(self.ceiling_ms)
    }
}

/// Why a sensor is due this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    /// `LastUpdate` still holds the zero sentinel.
    NeverRun,
    /// A full interval has passed.
    Elapsed,
    /// Not on cadence, but the sensor holds data that should go out now.
    Urgent,
    /// `LastUpdate` is ahead of logical now.  Forced due to resynchronise.
    Resync,
}

impl fmt::Display for DueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DueReason::NeverRun => "never-run",
            DueReason::Elapsed => "elapsed",
            DueReason::Urgent => "urgent",
            DueReason::Resync => "resync",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Due {
    pub sensor: String,
    pub reason: DueReason,
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sensors serviced, in dispatch order.
    pub serviced: Vec<String>,
    /// How many of those returned an error.
    pub failed: usize,
    /// How many were forced due by a clock resync.
    pub resynced: usize,
}

/// The sleep decided for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    /// Tightest remaining budget across enabled sensors, before clamping.
    pub proposed_ms: u64,
    /// What was persisted and should be handed to the power controller.
    pub duration_ms: u64,
}

struct Registration {
    sensor: Box<dyn Sensor>,
    interval_ms: u64,
    slot: Slot,
    enabled: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    clock: PersistentClock,
    reason: WakeReason,
    now: u64,
    limits: SleepLimits,
    sensors: Vec<Registration>,
}

impl Scheduler {
    /// Classify the wake, fix logical now for the cycle and bump the boot counter.
    pub fn new(
        mut clock: PersistentClock,
        cause: WakeCause,
        uptime_ms: u64,
        limits: SleepLimits,
    ) -> Self {
        let reason = wake::classify(&clock, cause);
        let now = wake::logical_now(reason, &clock, uptime_ms);
        let boots = clock.read(Slot::BootCount).wrapping_add(1);
        clock.write(Slot::BootCount, boots);

        info!(
            ?reason,
            ?cause,
            logical_now = now,
            uptime_ms,
            boot = boots,
            "scheduler: wake"
        );

        Self {
            clock,
            reason,
            now,
            limits,
            sensors: Vec::new(),
        }
    }

    /// Add a sensor.  Dispatch order is registration order.
    ///
    /// The sensor is told why the device woke, then its hardware is
    /// initialised.  An init failure is logged and leaves the sensor disabled
    /// for this cycle; the node carries on with the rest.  Returns whether
    /// the sensor ended up enabled.
    ///
    /// Panics if the sensor's slot is not a `LastUpdate` slot, is out of
    /// range, or is already claimed.
    pub fn register(&mut self, mut sensor: Box<dyn Sensor>) -> bool {
        let slot = sensor.persistent_slot();
        assert!(
            matches!(slot, Slot::LastUpdate(_)),
            "sensor {} must own a last_update slot, not {slot}",
            sensor.id()
        );
        if let Some(other) = self.sensors.iter().find(|r| r.slot == slot) {
            panic!(
                "sensors {} and {} both claim slot {slot}",
                other.sensor.id(),
                sensor.id()
            );
        }
        let last = self.clock.read(slot);
        let interval_ms = sensor.nominal_interval_ms();

        sensor.on_wake(self.reason, &mut self.clock);
        let enabled = match sensor.initialize_hardware() {
            Ok(()) => {
                info!(
                    sensor = sensor.id(),
                    interval_ms,
                    %slot,
                    first_run = last == 0,
                    "scheduler: registered"
                );
                true
            }
            Err(e) => {
                warn!(
                    sensor = sensor.id(),
                    "scheduler: hardware init failed, disabled for this cycle: {e:#}"
                );
                false
            }
        };

        self.sensors.push(Registration {
            sensor,
            interval_ms,
            slot,
            enabled,
        });
        enabled
    }

    /// Pause or resume a sensor without removing it.  Returns false for an
    /// unknown id.
    pub fn set_enabled(&mut self, sensor_id: &str, enabled: bool) -> bool {
        match self.sensors.iter_mut().find(|r| r.sensor.id() == sensor_id) {
            Some(reg) => {
                reg.enabled = enabled;
                info!(sensor = sensor_id, enabled, "scheduler: sensor toggled");
                true
            }
            None => false,
        }
    }

    pub fn disable(&mut self, sensor_id: &str) -> bool {
        self.set_enabled(sensor_id, false)
    }

    pub fn active_sensor_count(&self) -> usize {
        self.sensors.iter().filter(|r| r.enabled).count()
    }

    fn due_reason(&self, reg: &Registration) -> Option<DueReason> {
        if !reg.enabled {
            return None;
        }
        let last = self.clock.read(reg.slot);
        if last == 0 {
            return Some(DueReason::NeverRun);
        }
        match self.now.checked_sub(last) {
            None => Some(DueReason::Resync),
            Some(elapsed) if elapsed >= reg.interval_ms => Some(DueReason::Elapsed),
            Some(_) if reg.sensor.has_urgent_data() => Some(DueReason::Urgent),
            Some(_) => None,
        }
    }

    /// Time left before `reg` is due again.  Zero when already due.
    fn remaining_ms(&self, reg: &Registration) -> u64 {
        let last = self.clock.read(reg.slot);
        if last == 0 {
            return 0;
        }
        self.now
            .checked_sub(last)
            .map_or(0, |elapsed| reg.interval_ms.saturating_sub(elapsed))
    }

    /// Enabled sensors due this cycle, in registration order.
    pub fn evaluate(&self) -> Vec<Due> {
        self.sensors
            .iter()
            .filter_map(|reg| {
                self.due_reason(reg).map(|reason| Due {
                    sensor: reg.sensor.id().to_string(),
                    reason,
                })
            })
            .collect()
    }

    /// Whether this cycle is worth bringing the radio up for.  Ask before
    /// [`dispatch`](Self::dispatch): afterwards nothing is due.
    pub fn has_data_to_send(&self) -> bool {
        self.is_first_boot() || self.sensors.iter().any(|r| self.due_reason(r).is_some())
    }

    /// Service every due sensor.  Each one's `LastUpdate` is set to logical
    /// now once its call returns, whether it succeeded or not.
    pub fn dispatch(&mut self, outbox: &mut MessageQueue) -> DispatchReport {
        let mut report = DispatchReport::default();
        let now = self.now;

        for i in 0..self.sensors.len() {
            let Some(reason) = self.due_reason(&self.sensors[i]) else {
                continue;
            };
            let reg = &mut self.sensors[i];
            let id = reg.sensor.id().to_string();

            if reason == DueReason::Resync {
                warn!(
                    sensor = %id,
                    last_update = self.clock.read(reg.slot),
                    logical_now = now,
                    "scheduler: last update ahead of now, resynchronising"
                );
                report.resynced += 1;
            }

            match reg.sensor.produce_and_publish(outbox) {
                Ok(()) => debug!(sensor = %id, %reason, "scheduler: updated"),
                Err(e) => {
                    report.failed += 1;
                    warn!(sensor = %id, %reason, "scheduler: update failed: {e:#}");
                }
            }
            self.clock.write(reg.slot, now);
            report.serviced.push(id);
        }

        info!(
            serviced = report.serviced.len(),
            failed = report.failed,
            queued = outbox.len(),
            "scheduler: dispatch complete"
        );
        report
    }

    /// Tightest remaining budget across enabled sensors, unclamped.  Zero if
    /// any enabled sensor holds urgent data; `idle_ms` if none is enabled.
    pub fn next_sleep_ms(&self) -> u64 {
        let mut enabled = self.sensors.iter().filter(|r| r.enabled).peekable();
        if enabled.peek().is_none() {
            return self.limits.idle_ms;
        }
        let mut min = u64::MAX;
        for reg in enabled {
            if reg.sensor.has_urgent_data() {
                return 0;
            }
            min = min.min(self.remaining_ms(reg));
        }
        min
    }

    /// Decide the sleep, let sensors retain their own state, and persist the
    /// wake-timing slots.  Must run before the device sleeps.
    pub fn plan(&mut self) -> Result<SleepPlan> {
        let proposed_ms = self.next_sleep_ms();
        let duration_ms = self.limits.clamp(proposed_ms);

        for reg in &mut self.sensors {
            reg.sensor.before_sleep(&mut self.clock);
        }
        self.clock.write(Slot::PlannedSleepDuration, duration_ms);
        self.clock.write(Slot::LastWakeTime, self.now);
        self.clock
            .flush()
            .context("failed to persist wake timing before sleep")?;

        info!(
            proposed_ms,
            duration_ms,
            logical_now = self.now,
            "scheduler: sleep planned"
        );
        Ok(SleepPlan {
            proposed_ms,
            duration_ms,
        })
    }

    /// Diagnostic snapshot of every registered sensor.
    pub fn status(&self) -> SchedulerStatus {
        let sensors = self
            .sensors
            .iter()
            .map(|reg| {
                let last = self.clock.read(reg.slot);
                SensorStatus {
                    id: reg.sensor.id().to_string(),
                    enabled: reg.enabled,
                    due: self.due_reason(reg),
                    since_update_ms: if last == 0 {
                        None
                    } else {
                        self.now.checked_sub(last)
                    },
                    interval_ms: reg.interval_ms,
                }
            })
            .collect();
        SchedulerStatus {
            reason: self.reason,
            logical_now: self.now,
            boot_count: self.clock.read(Slot::BootCount),
            next_sleep_ms: self.next_sleep_ms(),
            sensors,
        }
    }

    pub fn reason(&self) -> WakeReason {
        self.reason
    }

    pub fn logical_now(&self) -> u64 {
        self.now
    }

    pub fn is_first_boot(&self) -> bool {
        self.reason == WakeReason::ColdBoot
    }

    pub fn clock(&self) -> &PersistentClock {
        &self.clock
    }
}

// ---------------------------------------------------------------------------
// Status surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorStatus {
    pub id: String,
    pub enabled: bool,
    pub due: Option<DueReason>,
    /// `None` if the sensor never ran or its slot is ahead of now.
    pub since_update_ms: Option<u64>,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub reason: WakeReason,
    pub logical_now: u64,
    pub boot_count: u64,
    pub next_sleep_ms: u64,
    pub sensors: Vec<SensorStatus>,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "wake={:?} logical_now={}ms boot={} next_sleep={}ms",
            self.reason, self.logical_now, self.boot_count, self.next_sleep_ms
        )?;
        writeln!(
            f,
            "  {:<12} {:<8} {:<10} {:>14} {:>12}",
            "sensor", "enabled", "due", "since_update", "interval"
        )?;
        for s in &self.sensors {
            let due = s.due.map_or_else(|| "-".to_string(), |d| d.to_string());
            let since = match s.since_update_ms {
                Some(ms) => format!("{ms}ms"),
                None => "never".to_string(),
            };
            writeln!(
                f,
                "  {:<12} {:<8} {:<10} {:>14} {:>12}",
                s.id,
                if s.enabled { "yes" } else { "no" },
                due,
                since,
                format!("{}ms", s.interval_ms)
            )?;
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
