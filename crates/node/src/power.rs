//! Power control: the uptime counter and deep sleep.
//!
//! On the device `request_sleep` never returns; the next wake restarts the
//! program from the entry point.  The host stand-in blocks for the sleep
//! and returns the cause of the wake that ended it, and the caller rebuilds
//! every volatile structure from retained state before carrying on.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::wake::WakeCause;

/// Milliseconds since this wake began.  Restarts at zero every wake.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    started: Instant,
}

impl Uptime {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

pub trait PowerControl {
    /// Why the current wake happened.
    fn wake_cause(&self) -> WakeCause;
    /// Enter deep sleep for `duration`.  Ends early on an external event.
    fn request_sleep(&mut self, duration: Duration) -> WakeCause;
    /// Maintenance mode: idle for `duration` without entering low power.
    /// An external event still ends the wait.
    fn stay_awake(&mut self, duration: Duration) -> WakeCause;
}

/// Deep sleep simulated on the host.  External events arrive as messages
/// from the rain line while the node is asleep.
pub struct SimPower {
    edges: Receiver<()>,
    cause: WakeCause,
}

impl SimPower {
    pub fn new(edges: Receiver<()>) -> Self {
        Self {
            edges,
            cause: WakeCause::Other,
        }
    }
}

impl PowerControl for SimPower {
    fn wake_cause(&self) -> WakeCause {
        self.cause
    }

    fn request_sleep(&mut self, duration: Duration) -> WakeCause {
        info!(sleep_ms = duration.as_millis() as u64, "power: entering deep sleep");
        let started = Instant::now();
        self.cause = match self.edges.recv_timeout(duration) {
            Ok(()) => WakeCause::ExternalEvent,
            Err(RecvTimeoutError::Timeout) => WakeCause::Timer,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(duration.saturating_sub(started.elapsed()));
                WakeCause::Timer
            }
        };
        debug!(
            cause = ?self.cause,
            slept_ms = started.elapsed().as_millis() as u64,
            "power: woke"
        );
        self.cause
    }

    fn stay_awake(&mut self, duration: Duration) -> WakeCause {
        info!(
            idle_ms = duration.as_millis() as u64,
            "power: maintenance mode, staying awake"
        );
        self.cause = match self.edges.recv_timeout(duration) {
            Ok(()) => WakeCause::ExternalEvent,
            Err(RecvTimeoutError::Timeout) => WakeCause::Other,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(duration);
                WakeCause::Other
            }
        };
        self.cause
    }
}

// ===========================================================================
// Tests
// ===========================================================================
