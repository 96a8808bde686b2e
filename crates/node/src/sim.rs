//! Simulated field hardware for running the node on a host.
//!
//! Models the weather the sensors see and the parts they talk to:
//! - Temporal coherence via random walk with mean reversion
//! - Slow battery drain with a solar top-up
//! - Occasional hardware faults (missing probe, corrupt scratchpad,
//!   failed conversion) at a scenario-dependent rate
//! - Rain tips as a Poisson process on a background thread, with contact
//!   bounce, delivered either to the attached tip counter or as a wake edge

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::power::Uptime;
use crate::sensors::atmospheric::{Barometer, Measurement};
use crate::sensors::battery::{AdcChannel, VoltageDivider};
use crate::sensors::rain::{TipCounter, TipSource};
use crate::sensors::soil_temp::{crc8, OneWireBus};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Weather profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// No rain.  Rare hardware faults.  Exercises pure timer wakes.
    Dry,
    /// A tip every ten minutes or so.  Mix of timer and interrupt wakes.
    Showers,
    /// Tips every few seconds and flaky parts.  Exercises urgent rain data,
    /// debounce and the failed-reading path.
    Storm,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "dry" => Self::Dry,
            "storm" => Self::Storm,
            _ => Self::Showers, // default
        }
    }

    /// Mean gap between bucket tips.  `None` means no rain at all.
    pub fn mean_tip_gap(self) -> Option<Duration> {
        match self {
            Self::Dry => None,
            Self::Showers => Some(Duration::from_secs(600)),
            Self::Storm => Some(Duration::from_secs(20)),
        }
    }

    fn fault_rate(self) -> f32 {
        match self {
            Self::Dry => 0.01,
            Self::Showers => 0.02,
            Self::Storm => 0.08,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dry => write!(f, "dry"),
            Self::Showers => write!(f, "showers"),
            Self::Storm => write!(f, "storm"),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

const SOIL_CENTER_C: f64 = 18.0;
const AIR_CENTER_C: f64 = 21.0;
const PRESSURE_CENTER_PA: f64 = 101_325.0;
const BATTERY_FULL_V: f64 = 4.2;
const BATTERY_LOW_V: f64 = 3.4;

/// The outside world.  Lives for the whole host process, across simulated
/// sleeps, unlike anything the node itself holds.
pub struct Environment {
    soil_c: f64,
    air_c: f64,
    pressure_pa: f64,
    battery_v: f64,
    fault_rate: f32,
}

pub type SharedEnv = Rc<RefCell<Environment>>;

impl Environment {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            soil_c: SOIL_CENTER_C + gaussian(0.0, 1.5),
            air_c: AIR_CENTER_C + gaussian(0.0, 3.0),
            pressure_pa: PRESSURE_CENTER_PA + gaussian(0.0, 400.0),
            battery_v: BATTERY_FULL_V - fastrand::f64() * 0.3,
            fault_rate: scenario.fault_rate(),
        }
    }

    pub fn shared(scenario: Scenario) -> SharedEnv {
        Rc::new(RefCell::new(Self::new(scenario)))
    }

    /// Step the weather forward one wake cycle.
    pub fn advance(&mut self) {
        self.soil_c += 0.02 * (SOIL_CENTER_C - self.soil_c) + gaussian(0.0, 0.05);
        self.air_c += 0.05 * (AIR_CENTER_C - self.air_c) + gaussian(0.0, 0.3);
        self.pressure_pa += 0.02 * (PRESSURE_CENTER_PA - self.pressure_pa) + gaussian(0.0, 40.0);

        self.battery_v -= 0.0005 + fastrand::f64() * 0.0005;
        if self.battery_v < BATTERY_LOW_V {
            // Solar panel caught up.
            self.battery_v = BATTERY_FULL_V;
        }
    }

    fn fault(&self) -> bool {
        fastrand::f32() < self.fault_rate
    }
}

// ---------------------------------------------------------------------------
// Soil probe
// ---------------------------------------------------------------------------

/// One DS18B20 on a simulated 1-Wire line.
pub struct SimOneWire {
    env: SharedEnv,
    rom: [u8; 8],
}

impl SimOneWire {
    pub fn new(env: SharedEnv) -> Self {
        let mut rom = [0u8; 8];
        rom[0] = 0x28;
        for b in &mut rom[1..7] {
            *b = fastrand::u8(..);
        }
        rom[7] = crc8(&rom[..7]);
        Self { env, rom }
    }
}

impl OneWireBus for SimOneWire {
    fn search(&mut self) -> Result<Option<[u8; 8]>> {
        if self.env.borrow().fault() {
            return Ok(None);
        }
        Ok(Some(self.rom))
    }

    fn start_conversion(&mut self, rom: &[u8; 8]) -> Result<()> {
        if *rom != self.rom {
            bail!("no presence pulse from {:02x?}", rom);
        }
        Ok(())
    }

    fn read_scratchpad(&mut self, _rom: &[u8; 8]) -> Result<[u8; 9]> {
        let env = self.env.borrow();
        let raw = (gaussian(env.soil_c, 0.03) * 16.0).round() as i16;
        let [lo, hi] = raw.to_le_bytes();
        let mut pad = [lo, hi, 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10, 0];
        pad[8] = crc8(&pad[..8]);
        if env.fault() {
            // Line noise flips a bit.
            pad[fastrand::usize(..8)] ^= 1 << fastrand::u8(..8);
        }
        Ok(pad)
    }
}

// ---------------------------------------------------------------------------
// Barometer
// ---------------------------------------------------------------------------

pub struct SimBarometer {
    env: SharedEnv,
}

impl SimBarometer {
    pub fn new(env: SharedEnv) -> Self {
        Self { env }
    }
}

impl Barometer for SimBarometer {
    fn init(&mut self) -> Result<()> {
        if self.env.borrow().fault() {
            bail!("no ack at 0x77");
        }
        Ok(())
    }

    fn forced_measurement(&mut self) -> Result<Measurement> {
        let env = self.env.borrow();
        if env.fault() {
            bail!("measurement still busy after timeout");
        }
        Ok(Measurement {
            celsius: gaussian(env.air_c, 0.05) as f32,
            pascals: gaussian(env.pressure_pa, 3.0) as f32,
        })
    }
}

// ---------------------------------------------------------------------------
// Battery ADC
// ---------------------------------------------------------------------------

pub struct SimBatteryAdc {
    env: SharedEnv,
    divider: VoltageDivider,
    warmed_up: bool,
}

impl SimBatteryAdc {
    pub fn new(env: SharedEnv, divider: VoltageDivider) -> Self {
        Self {
            env,
            divider,
            warmed_up: false,
        }
    }
}

impl AdcChannel for SimBatteryAdc {
    fn read_raw(&mut self) -> Result<u16> {
        let full_scale = f64::from(self.divider.full_scale_counts);
        if !self.warmed_up {
            self.warmed_up = true;
            return Ok(fastrand::u16(..=self.divider.full_scale_counts));
        }
        let volts_per_count =
            f64::from(self.divider.reference_volts) * f64::from(self.divider.ratio) / full_scale;
        let counts = gaussian(self.env.borrow().battery_v / volts_per_count, 4.0);
        Ok(counts.round().clamp(0.0, full_scale) as u16)
    }
}

// ---------------------------------------------------------------------------
// Rain line
// ---------------------------------------------------------------------------

struct Attached {
    counter: Arc<TipCounter>,
    uptime: Uptime,
}

/// The reed-switch line, shared with the background thread that closes it.
#[derive(Clone, Default)]
pub struct RainLine {
    attached: Arc<Mutex<Option<Attached>>>,
}

impl RainLine {
    /// A tip source for the current wake, timestamping edges with `uptime`.
    pub fn bucket(&self, uptime: Uptime) -> Box<dyn TipSource> {
        Box::new(SimBucket {
            line: self.clone(),
            uptime,
        })
    }

    fn set(&self, attached: Option<Attached>) {
        *self.attached.lock().unwrap_or_else(PoisonError::into_inner) = attached;
    }
}

/// Start raining.  Tips land on the attached counter while the node is
/// awake and come out of the returned receiver as wake edges while it sleeps.
pub fn spawn_rain(mean_gap: Option<Duration>) -> Result<(RainLine, Receiver<()>)> {
    let (tx, rx) = mpsc::channel();
    let line = RainLine::default();
    let Some(mean_gap) = mean_gap else {
        return Ok((line, rx));
    };
    let shared = line.clone();
    thread::Builder::new()
        .name("rain-line".into())
        .spawn(move || loop {
            // Exponential inter-arrival time.
            let gap = -mean_gap.as_secs_f64() * (1.0 - fastrand::f64()).ln();
            thread::sleep(Duration::from_secs_f64(gap));

            let guard = shared.attached.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(a) => {
                    let at = a.uptime.millis();
                    a.counter.on_edge(at);
                    if fastrand::f32() < 0.3 {
                        a.counter.on_edge(at + fastrand::u64(1..40));
                    }
                }
                None => {
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            }
        })
        .context("failed to spawn rain thread")?;
    Ok((line, rx))
}

struct SimBucket {
    line: RainLine,
    uptime: Uptime,
}

impl TipSource for SimBucket {
    fn attach(&mut self, counter: Arc<TipCounter>) -> Result<()> {
        self.line.set(Some(Attached {
            counter,
            uptime: self.uptime,
        }));
        Ok(())
    }

    fn detach(&mut self) {
        self.line.set(None);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
