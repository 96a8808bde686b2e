#[cfg(feature = "adc")]
mod ads1115;
mod config;
mod persist;
mod power;
mod queue;
mod scheduler;
mod sensor;
mod sensors;
mod sim;
mod transport;
mod wake;

use anyhow::Result;
use std::{env, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use persist::{FileRetention, PersistentClock};
use power::{PowerControl, SimPower, Uptime};
use queue::MessageQueue;
use scheduler::Scheduler;
use sensor::Sensor;
use sensors::{atmospheric::Atmospheric, battery::Battery, rain::RainGauge, soil_temp::SoilTemp};
use sensors::battery::AdcChannel;
use sim::{Environment, RainLine, Scenario, SharedEnv};
use transport::MqttTransport;
use wake::WakeCause;

/// Host-side world the node wakes into.  Outlives every wake cycle.
struct Rig {
    env: SharedEnv,
    rain: RainLine,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let cfg = config::load(&config_path, |key| env::var(key).ok())?;

    if env::args().skip(1).any(|arg| arg == "--cold") {
        FileRetention::new(&cfg.node.state_path).power_loss()?;
        info!(path = %cfg.node.state_path, "retained state cleared, starting cold");
    }

    // ── Simulated field ─────────────────────────────────────────────
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let (rain, edges) = sim::spawn_rain(scenario.mean_tip_gap())?;
    let rig = Rig {
        env: Environment::shared(scenario),
        rain,
    };
    let mut power = SimPower::new(edges);

    info!(
        node_id = %cfg.node.node_id,
        %scenario,
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        maintenance = cfg.node.maintenance,
        "weather node starting"
    );

    // ── Wake loop ───────────────────────────────────────────────────
    // Each pass is one wake of the device: everything but retained state
    // is rebuilt from scratch.
    let mut cause = power.wake_cause();
    loop {
        let sleep = match run_wake_cycle(&cfg, &rig, cause).await {
            Ok(sleep) => sleep,
            Err(e) => {
                error!("wake cycle failed: {e:#}");
                Duration::from_millis(cfg.limits().clamp(cfg.scheduler.idle_sleep_ms))
            }
        };
        cause = if cfg.node.maintenance {
            power.stay_awake(sleep)
        } else {
            power.request_sleep(sleep)
        };
    }
}

/// One wake: measure what is due, ship it, and decide how long to sleep.
async fn run_wake_cycle(cfg: &Config, rig: &Rig, cause: WakeCause) -> Result<Duration> {
    let uptime = Uptime::start();
    let clock = open_clock(&cfg.node.state_path)?;
    rig.env.borrow_mut().advance();

    let mut sched = Scheduler::new(clock, cause, uptime.millis(), cfg.limits());
    register_sensors(&mut sched, cfg, rig, uptime)?;

    let due = sched.evaluate();
    info!(
        due = %due
            .iter()
            .map(|d| format!("{}({})", d.sensor, d.reason))
            .collect::<Vec<_>>()
            .join(","),
        "due this cycle"
    );

    let mut outbox = MessageQueue::new(cfg.scheduler.queue_capacity);
    let send = sched.has_data_to_send();
    let report = sched.dispatch(&mut outbox);
    if report.failed > 0 {
        warn!(
            failed = report.failed,
            serviced = report.serviced.len(),
            "some sensors published failure payloads"
        );
    }

    if send && !outbox.is_empty() {
        let mut mqtt = MqttTransport::new(
            &format!("weather-node-{}", cfg.node.node_id),
            &cfg.mqtt.host,
            cfg.mqtt.port,
            Duration::from_secs(cfg.mqtt.keep_alive_s),
            Duration::from_millis(cfg.mqtt.ack_timeout_ms),
        );
        transport::flush(&mut mqtt, &mut outbox, cfg.retry_policy()).await;
    }

    let sleep_ms = match sched.plan() {
        Ok(plan) => plan.duration_ms,
        Err(e) => {
            // Timing was not retained, so the next wake will be cold anyway.
            error!("{e:#}");
            cfg.limits().clamp(sched.next_sleep_ms())
        }
    };
    if cfg.node.maintenance {
        info!("status:\n{}", sched.status());
    }
    info!(awake_ms = uptime.millis(), sleep_ms, "wake cycle done");
    Ok(Duration::from_millis(sleep_ms))
}

/// Open the retained table.  A table that cannot be read is treated as a
/// power loss.
fn open_clock(path: &str) -> Result<PersistentClock> {
    match PersistentClock::open(Box::new(FileRetention::new(path))) {
        Ok(clock) => Ok(clock),
        Err(e) => {
            warn!("retained state unreadable, starting cold: {e:#}");
            FileRetention::new(path).power_loss()?;
            PersistentClock::open(Box::new(FileRetention::new(path)))
        }
    }
}

/// Register every sensor in dispatch order, then pause the ones switched off
/// in config.  Paused sensors keep their retained state and show up in the
/// status table but are never due.
fn register_sensors(sched: &mut Scheduler, cfg: &Config, rig: &Rig, uptime: Uptime) -> Result<()> {
    for (sensor, enabled) in build_sensors(cfg, rig, uptime)? {
        let id = sensor.id().to_string();
        if sched.register(sensor) && !enabled {
            sched.disable(&id);
        }
    }
    info!(active = sched.active_sensor_count(), "sensors registered");
    Ok(())
}

/// Every sensor with its configured enable flag.  Battery goes first so its
/// reading is taken before the radio loads the cell.
fn build_sensors(cfg: &Config, rig: &Rig, uptime: Uptime) -> Result<Vec<(Box<dyn Sensor>, bool)>> {
    Ok(vec![
        (
            Box::new(Battery::new(
                cfg.topic("battery"),
                battery_adc(cfg, rig)?,
                cfg.divider(),
                cfg.battery.samples,
                Duration::from_millis(cfg.battery.settle_ms),
                cfg.battery.interval_ms,
            )) as Box<dyn Sensor>,
            cfg.battery.enabled,
        ),
        (
            Box::new(RainGauge::new(
                cfg.topic("rain"),
                rig.rain.bucket(uptime),
                cfg.rain.interval_ms,
                cfg.rain.debounce_ms,
                cfg.rain.inches_per_tip,
                cfg.rain.report_immediately,
            )) as Box<dyn Sensor>,
            cfg.rain.enabled,
        ),
        (
            Box::new(SoilTemp::new(
                cfg.topic("soil_temp"),
                Box::new(sim::SimOneWire::new(rig.env.clone())),
                cfg.soil_temp.interval_ms,
                Duration::from_millis(cfg.soil_temp.conversion_wait_ms),
                cfg.soil_temp.discovery_attempts,
                Duration::from_millis(cfg.soil_temp.discovery_backoff_ms),
            )) as Box<dyn Sensor>,
            cfg.soil_temp.enabled,
        ),
        (
            Box::new(Atmospheric::new(
                cfg.topic("atmospheric"),
                Box::new(sim::SimBarometer::new(rig.env.clone())),
                cfg.atmospheric.interval_ms,
            )) as Box<dyn Sensor>,
            cfg.atmospheric.enabled,
        ),
    ])
}

#[cfg(feature = "adc")]
fn battery_adc(_cfg: &Config, _rig: &Rig) -> Result<Box<dyn AdcChannel>> {
    use anyhow::Context;

    let addr = ads1115::parse_addr(&env::var("ADC_ADDR").unwrap_or_default())?;
    let channel = ads1115::parse_channel(&env::var("ADC_CHANNEL").unwrap_or_default())?;
    let adc = ads1115::Ads1115Channel::new(addr, channel).context("battery adc unavailable")?;
    Ok(Box::new(adc))
}

#[cfg(not(feature = "adc"))]
fn battery_adc(cfg: &Config, rig: &Rig) -> Result<Box<dyn AdcChannel>> {
    Ok(Box::new(sim::SimBatteryAdc::new(rig.env.clone(), cfg.divider())))
}

// ===========================================================================
// Tests
// ===========================================================================
