//! Wake-cause classification and the logical clock.
//!
//! The hardware uptime counter restarts at zero on every wake, so it is never
//! used as a cross-wake "now".  Instead each warm wake advances the logical
//! clock by the sleep duration that was *planned* before sleeping.  An
//! interrupt that cuts a sleep short is reported to the sensors (the rain
//! gauge counts the tip) but moves the shared timeline exactly like a timer
//! wake would.

use crate::persist::{PersistentClock, Slot};

/// Wake cause as reported by the power controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    Timer,
    ExternalEvent,
    Other,
}

/// Wake cause normalised for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// No retained timing state: power-on or power loss.
    ColdBoot,
    TimerWake,
    InterruptWake,
    /// Anything else (reset button, maintenance wake).  Scheduled like a timer wake.
    Other,
}

impl WakeReason {
    pub fn is_interrupt(self) -> bool {
        self == WakeReason::InterruptWake
    }
}

/// Classify this wake.  A zero `LastWakeTime` means nothing was retained, so
/// the hardware cause is irrelevant.
pub fn classify(clock: &PersistentClock, cause: WakeCause) -> WakeReason {
    if clock.read(Slot::LastWakeTime) == 0 {
        return WakeReason::ColdBoot;
    }
    match cause {
        WakeCause::Timer => WakeReason::TimerWake,
        WakeCause::ExternalEvent => WakeReason::InterruptWake,
        WakeCause::Other => WakeReason::Other,
    }
}

/// Logical "now" for this wake cycle.
///
/// Never returns zero: zero is the "never" sentinel for every timestamp slot.
pub fn logical_now(reason: WakeReason, clock: &PersistentClock, uptime_ms: u64) -> u64 {
    let now = match reason {
        WakeReason::ColdBoot => uptime_ms,
        WakeReason::TimerWake | WakeReason::InterruptWake | WakeReason::Other => clock
            .read(Slot::LastWakeTime)
            .wrapping_add(clock.read(Slot::PlannedSleepDuration)),
    };
    now.max(1)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn warm_clock(last_wake: u64, planned: u64) -> PersistentClock {
        let mut clock = PersistentClock::in_memory();
        clock.write(Slot::LastWakeTime, last_wake);
        clock.write(Slot::PlannedSleepDuration, planned);
        clock
    }

    // -- classify -----------------------------------------------------------

    #[test]
    fn zero_last_wake_is_cold_boot_whatever_the_cause() {
        let clock = PersistentClock::in_memory();
        assert_eq!(classify(&clock, WakeCause::Timer), WakeReason::ColdBoot);
        assert_eq!(classify(&clock, WakeCause::ExternalEvent), WakeReason::ColdBoot);
        assert_eq!(classify(&clock, WakeCause::Other), WakeReason::ColdBoot);
    }

    #[test]
    fn warm_causes_map_one_to_one() {
        let clock = warm_clock(5_000, 60_000);
        assert_eq!(classify(&clock, WakeCause::Timer), WakeReason::TimerWake);
        assert_eq!(
            classify(&clock, WakeCause::ExternalEvent),
            WakeReason::InterruptWake
        );
        assert_eq!(classify(&clock, WakeCause::Other), WakeReason::Other);
    }

    // -- logical_now --------------------------------------------------------

    #[test]
    fn cold_boot_uses_uptime() {
        let clock = PersistentClock::in_memory();
        assert_eq!(logical_now(WakeReason::ColdBoot, &clock, 420), 420);
    }

    #[test]
    fn cold_boot_at_uptime_zero_is_not_the_never_sentinel() {
        let clock = PersistentClock::in_memory();
        assert_eq!(logical_now(WakeReason::ColdBoot, &clock, 0), 1);
    }

    #[test]
    fn warm_wake_advances_by_planned_sleep() {
        let clock = warm_clock(100_000, 60_000);
        assert_eq!(logical_now(WakeReason::TimerWake, &clock, 37), 160_000);
    }

    #[test]
    fn interrupt_wake_does_not_perturb_the_timeline() {
        let clock = warm_clock(100_000, 60_000);
        let timer = logical_now(WakeReason::TimerWake, &clock, 12);
        let interrupt = logical_now(WakeReason::InterruptWake, &clock, 5_000);
        let other = logical_now(WakeReason::Other, &clock, 9);
        assert_eq!(timer, interrupt);
        assert_eq!(timer, other);
    }

    #[test]
    fn warm_wake_ignores_uptime() {
        let clock = warm_clock(100_000, 60_000);
        assert_eq!(
            logical_now(WakeReason::TimerWake, &clock, 1),
            logical_now(WakeReason::TimerWake, &clock, 999_999)
        );
    }

    #[test]
    fn wrapping_add_skips_zero() {
        let clock = warm_clock(u64::MAX, 1);
        assert_eq!(logical_now(WakeReason::TimerWake, &clock, 0), 1);
    }
}
