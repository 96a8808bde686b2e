//! Retained counters that survive a sleep/wake transition.
//!
//! On the device these live in low-power retention memory: they keep their
//! value across deep sleep and read back as zero after a power loss.  The
//! host build keeps the same flat table in a JSON file, so every simulated
//! wake starts from nothing but what was written here before the previous
//! sleep.
//!
//! The scheduler is the only writer of the timing slots.  The rain gauge owns
//! `RainTips`, which it folds back in just before sleeping.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(test)]
use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
#[cfg(test)]
use std::rc::Rc;

/// Number of per-sensor `LastUpdate` slots reserved in the table.
pub const MAX_SENSORS: usize = 8;

/// Slots that are not tied to a sensor.
const FIXED_SLOTS: usize = 4;

/// Total number of counters in the table.
pub const SLOT_COUNT: usize = FIXED_SLOTS + MAX_SENSORS;

// ---------------------------------------------------------------------------
// Slot identifiers
// ---------------------------------------------------------------------------

/// Names one counter in the retained table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Logical time of the previous wake cycle.  Zero means cold boot.
    LastWakeTime,
    /// Sleep duration requested from the power controller before sleeping.
    PlannedSleepDuration,
    /// Wake cycles since the last power loss.
    BootCount,
    /// Rain-gauge tips captured but not yet published.
    RainTips,
    /// Logical time of a sensor's last update.  Zero means never updated.
    LastUpdate(usize),
}

impl Slot {
    /// Position in the table.
    ///
    /// Panics on a `LastUpdate` index past [`MAX_SENSORS`]: that is a wiring
    /// defect, not something to recover from at runtime.
    fn index(self) -> usize {
        match self {
            Slot::LastWakeTime => 0,
            Slot::PlannedSleepDuration => 1,
            Slot::BootCount => 2,
            Slot::RainTips => 3,
            Slot::LastUpdate(n) => {
                assert!(
                    n < MAX_SENSORS,
                    "persistent slot LastUpdate({n}) out of range (table holds {MAX_SENSORS} sensors)"
                );
                FIXED_SLOTS + n
            }
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::LastWakeTime => write!(f, "last_wake_time"),
            Slot::PlannedSleepDuration => write!(f, "planned_sleep_duration"),
            Slot::BootCount => write!(f, "boot_count"),
            Slot::RainTips => write!(f, "rain_tips"),
            Slot::LastUpdate(n) => write!(f, "last_update[{n}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// Retention backends
// ---------------------------------------------------------------------------

/// Storage that outlives a wake cycle but not a power loss.
pub trait Retention {
    /// Returns the retained table, or `None` after a power loss.
    fn load(&mut self) -> Result<Option<Vec<u64>>>;
    /// Makes `slots` visible to the next wake cycle.
    fn store(&mut self, slots: &[u64]) -> Result<()>;
}

/// In-process retention.  Clones share the same cell, so a clone handed to a
/// fresh [`PersistentClock`] behaves like the next wake of the same device.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryRetention {
    cell: Rc<RefCell<Option<Vec<u64>>>>,
}

#[cfg(test)]
impl MemoryRetention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a power loss: the next load sees nothing.
    pub fn power_loss(&self) {
        self.cell.borrow_mut().take();
    }
}

#[cfg(test)]
impl Retention for MemoryRetention {
    fn load(&mut self) -> Result<Option<Vec<u64>>> {
        Ok(self.cell.borrow().clone())
    }

    fn store(&mut self, slots: &[u64]) -> Result<()> {
        *self.cell.borrow_mut() = Some(slots.to_vec());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RetainedFile {
    slots: Vec<u64>,
}

/// JSON file standing in for RTC retention memory on the host.
///
/// A missing file reads as a power loss.  Writes go to a sibling temp file
/// and are renamed into place so a crash mid-write never leaves half a table.
pub struct FileRetention {
    path: PathBuf,
}

impl FileRetention {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Deletes the retained table, forcing the next wake to be a cold boot.
    pub fn power_loss(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to clear {}", self.path.display())),
        }
    }
}

impl Retention for FileRetention {
    fn load(&mut self) -> Result<Option<Vec<u64>>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let file: RetainedFile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(file.slots))
    }

    fn store(&mut self, slots: &[u64]) -> Result<()> {
        let body = serde_json::to_vec_pretty(&RetainedFile {
            slots: slots.to_vec(),
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PersistentClock
// ---------------------------------------------------------------------------

/// The retained counter table plus the backend that carries it across sleep.
pub struct PersistentClock {
    slots: [u64; SLOT_COUNT],
    backend: Box<dyn Retention>,
}

impl PersistentClock {
    /// Load the table from `backend`.  A missing table, or one whose shape
    /// does not match this build, starts from all zeros (cold boot).
    pub fn open(mut backend: Box<dyn Retention>) -> Result<Self> {
        let mut slots = [0u64; SLOT_COUNT];
        match backend.load()? {
            Some(saved) if saved.len() == SLOT_COUNT => slots.copy_from_slice(&saved),
            Some(saved) => {
                tracing::warn!(
                    found = saved.len(),
                    expected = SLOT_COUNT,
                    "retained table has the wrong shape, treating as cold boot"
                );
            }
            None => {}
        }
        Ok(Self { slots, backend })
    }

    /// Fresh table over a private in-memory backend.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            slots: [0; SLOT_COUNT],
            backend: Box::new(MemoryRetention::new()),
        }
    }

    pub fn read(&self, slot: Slot) -> u64 {
        self.slots[slot.index()]
    }

    pub fn write(&mut self, slot: Slot, value: u64) {
        self.slots[slot.index()] = value;
    }

    /// Hand the table to the backend.  Must happen before the device sleeps.
    pub fn flush(&mut self) -> Result<()> {
        self.backend.store(&self.slots)
    }
}

impl fmt::Debug for PersistentClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentClock")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "weather-node-{tag}-{}-{}.json",
            std::process::id(),
            fastrand::u64(..)
        ))
    }

    // -- Slot table ---------------------------------------------------------

    #[test]
    fn fresh_clock_reads_zero_everywhere() {
        let clock = PersistentClock::in_memory();
        assert_eq!(clock.read(Slot::LastWakeTime), 0);
        assert_eq!(clock.read(Slot::PlannedSleepDuration), 0);
        assert_eq!(clock.read(Slot::BootCount), 0);
        assert_eq!(clock.read(Slot::RainTips), 0);
        for n in 0..MAX_SENSORS {
            assert_eq!(clock.read(Slot::LastUpdate(n)), 0);
        }
    }

    #[test]
    fn slots_are_independent() {
        let mut clock = PersistentClock::in_memory();
        clock.write(Slot::LastUpdate(0), 10);
        clock.write(Slot::LastUpdate(1), 20);
        clock.write(Slot::LastWakeTime, 30);
        assert_eq!(clock.read(Slot::LastUpdate(0)), 10);
        assert_eq!(clock.read(Slot::LastUpdate(1)), 20);
        assert_eq!(clock.read(Slot::LastWakeTime), 30);
        assert_eq!(clock.read(Slot::PlannedSleepDuration), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_sensor_slot_panics() {
        let clock = PersistentClock::in_memory();
        clock.read(Slot::LastUpdate(MAX_SENSORS));
    }

    #[test]
    fn slot_display_names() {
        assert_eq!(Slot::LastWakeTime.to_string(), "last_wake_time");
        assert_eq!(Slot::LastUpdate(3).to_string(), "last_update[3]");
    }

    // -- Memory retention ---------------------------------------------------

    #[test]
    fn flushed_values_survive_reopen() {
        let mem = MemoryRetention::new();
        let mut clock = PersistentClock::open(Box::new(mem.clone())).unwrap();
        clock.write(Slot::LastWakeTime, 1234);
        clock.write(Slot::LastUpdate(2), 99);
        clock.flush().unwrap();
        drop(clock);

        let clock = PersistentClock::open(Box::new(mem)).unwrap();
        assert_eq!(clock.read(Slot::LastWakeTime), 1234);
        assert_eq!(clock.read(Slot::LastUpdate(2)), 99);
    }

    #[test]
    fn unflushed_values_are_lost() {
        let mem = MemoryRetention::new();
        let mut clock = PersistentClock::open(Box::new(mem.clone())).unwrap();
        clock.write(Slot::LastWakeTime, 1234);
        drop(clock);

        let clock = PersistentClock::open(Box::new(mem)).unwrap();
        assert_eq!(clock.read(Slot::LastWakeTime), 0);
    }

    #[test]
    fn power_loss_zeroes_the_table() {
        let mem = MemoryRetention::new();
        let mut clock = PersistentClock::open(Box::new(mem.clone())).unwrap();
        clock.write(Slot::BootCount, 7);
        clock.flush().unwrap();

        mem.power_loss();
        let clock = PersistentClock::open(Box::new(mem)).unwrap();
        assert_eq!(clock.read(Slot::BootCount), 0);
    }

    #[test]
    fn wrong_shape_is_treated_as_cold() {
        let mut mem = MemoryRetention::new();
        mem.store(&[5, 6, 7]).unwrap();
        let clock = PersistentClock::open(Box::new(mem)).unwrap();
        assert_eq!(clock.read(Slot::LastWakeTime), 0);
    }

    // -- File retention -----------------------------------------------------

    #[test]
    fn file_retention_round_trip() {
        let path = temp_path("roundtrip");
        let mut clock = PersistentClock::open(Box::new(FileRetention::new(&path))).unwrap();
        clock.write(Slot::PlannedSleepDuration, 60_000);
        clock.flush().unwrap();

        let clock = PersistentClock::open(Box::new(FileRetention::new(&path))).unwrap();
        assert_eq!(clock.read(Slot::PlannedSleepDuration), 60_000);

        FileRetention::new(&path).power_loss().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_is_cold_boot() {
        let path = temp_path("missing");
        let mut backend = FileRetention::new(&path);
        assert!(backend.load().unwrap().is_none());
        // Clearing an absent file is not an error.
        backend.power_loss().unwrap();
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "not json").unwrap();
        let result = PersistentClock::open(Box::new(FileRetention::new(&path)));
        assert!(result.is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
