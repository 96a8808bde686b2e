//! TOML config file loading, environment overrides and validation.
//!
//! Every section and field is optional; a missing file means all defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::scheduler::SleepLimits;
use crate::sensors::battery::VoltageDivider;
use crate::transport::RetryPolicy;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub mqtt: MqttConfig,
    pub scheduler: SchedulerConfig,
    pub rain: RainConfig,
    pub soil_temp: SoilTempConfig,
    pub atmospheric: AtmosphericConfig,
    pub battery: BatteryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    /// Retention file standing in for RTC memory.
    pub state_path: String,
    /// Stay awake between cycles and log the status table every cycle.
    pub maintenance: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-a".into(),
            state_path: "node-state.json".into(),
            maintenance: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub retry_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    pub keep_alive_s: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            connect_attempts: 3,
            retry_backoff_ms: 2_000,
            ack_timeout_ms: 5_000,
            keep_alive_s: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_sleep_ms: u64,
    pub max_sleep_ms: u64,
    pub idle_sleep_ms: u64,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_sleep_ms: 1_000,
            max_sleep_ms: 3_600_000,
            idle_sleep_ms: 60_000,
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RainConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Edges closer than this to the previous tip are contact bounce.
    pub debounce_ms: u64,
    pub inches_per_tip: f32,
    /// Treat captured tips as urgent data instead of waiting for the hourly report.
    pub report_immediately: bool,
}

impl Default for RainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 3_600_000,
            debounce_ms: 100,
            inches_per_tip: 0.01193,
            report_immediately: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoilTempConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub conversion_wait_ms: u64,
    pub discovery_attempts: u32,
    pub discovery_backoff_ms: u64,
}

impl Default for SoilTempConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 600_000,
            conversion_wait_ms: 1_000,
            discovery_attempts: 3,
            discovery_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtmosphericConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for AtmosphericConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub samples: u32,
    pub settle_ms: u64,
    pub reference_volts: f32,
    pub divider_ratio: f32,
    pub full_scale_counts: u16,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_800_000,
            samples: 10,
            settle_ms: 50,
            reference_volts: 3.22,
            divider_ratio: 2.0,
            full_scale_counts: 4095,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn limits(&self) -> SleepLimits {
        SleepLimits {
            floor_ms: self.scheduler.min_sleep_ms,
            ceiling_ms: self.scheduler.max_sleep_ms,
            idle_ms: self.scheduler.idle_sleep_ms,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.mqtt.connect_attempts,
            backoff: Duration::from_millis(self.mqtt.retry_backoff_ms),
        }
    }

    pub fn divider(&self) -> VoltageDivider {
        VoltageDivider {
            reference_volts: self.battery.reference_volts,
            ratio: self.battery.divider_ratio,
            full_scale_counts: self.battery.full_scale_counts,
        }
    }

    /// `tele/<node_id>/<sensor>`
    pub fn topic(&self, sensor: &str) -> String {
        format!("tele/{}/{sensor}", self.node.node_id)
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("{name}: expected a boolean, got {other:?}"),
    }
}

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `NODE_ID`, `STATE_PATH` and
    /// `MAINTENANCE` from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT: invalid port {port:?}"))?;
        }
        if let Some(id) = lookup("NODE_ID") {
            self.node.node_id = id;
        }
        if let Some(path) = lookup("STATE_PATH") {
            self.node.state_path = path;
        }
        if let Some(flag) = lookup("MAINTENANCE") {
            self.node.maintenance = parse_flag("MAINTENANCE", &flag)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_node(&mut errors);
        self.validate_scheduler(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_node(&self, errors: &mut Vec<String>) {
        let id = self.node.node_id.trim();
        if id.is_empty() {
            errors.push("node.node_id is empty".into());
        } else if id.contains(['/', '+', '#']) {
            errors.push(format!(
                "node.node_id '{id}' contains an MQTT topic separator or wildcard"
            ));
        }
        if self.node.state_path.trim().is_empty() {
            errors.push("node.state_path is empty".into());
        }

        // ── Broker ──────────────────────────────────────────
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if self.mqtt.connect_attempts == 0 {
            errors.push("mqtt.connect_attempts must be at least 1".into());
        }
        if self.mqtt.ack_timeout_ms == 0 {
            errors.push("mqtt.ack_timeout_ms must be positive".into());
        }
    }

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;
        if s.max_sleep_ms == 0 {
            errors.push("scheduler.max_sleep_ms must be positive".into());
        }
        if s.min_sleep_ms > s.max_sleep_ms {
            errors.push(format!(
                "scheduler.min_sleep_ms ({}) exceeds max_sleep_ms ({})",
                s.min_sleep_ms, s.max_sleep_ms
            ));
        }
        if s.idle_sleep_ms == 0 {
            errors.push("scheduler.idle_sleep_ms must be positive".into());
        }
        if s.queue_capacity == 0 {
            errors.push("scheduler.queue_capacity must be at least 1".into());
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let intervals = [
            ("rain", self.rain.interval_ms),
            ("soil_temp", self.soil_temp.interval_ms),
            ("atmospheric", self.atmospheric.interval_ms),
            ("battery", self.battery.interval_ms),
        ];
        for (name, interval) in intervals {
            if interval == 0 {
                errors.push(format!("{name}.interval_ms must be positive"));
            }
        }

        // ── Rain ────────────────────────────────────────────
        if !(self.rain.inches_per_tip.is_finite() && self.rain.inches_per_tip > 0.0) {
            errors.push(format!(
                "rain.inches_per_tip must be a positive number, got {}",
                self.rain.inches_per_tip
            ));
        }

        // ── Soil temperature ────────────────────────────────
        if self.soil_temp.discovery_attempts == 0 {
            errors.push("soil_temp.discovery_attempts must be at least 1".into());
        }

        // ── Battery calibration ─────────────────────────────
        let b = &self.battery;
        if b.samples == 0 {
            errors.push("battery.samples must be at least 1".into());
        }
        if !(b.reference_volts.is_finite() && b.reference_volts > 0.0) {
            errors.push(format!(
                "battery.reference_volts must be a positive number, got {}",
                b.reference_volts
            ));
        }
        if !(b.divider_ratio.is_finite() && b.divider_ratio >= 1.0) {
            errors.push(format!(
                "battery.divider_ratio must be at least 1.0, got {}",
                b.divider_ratio
            ));
        }
        if b.full_scale_counts == 0 {
            errors.push("battery.full_scale_counts must be non-zero".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file.  A missing file yields the defaults.
pub fn parse_file(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

/// Parse `path`, apply overrides from `lookup`, and validate the result.
pub fn load(path: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = parse_file(path)?;
    config
        .apply_overrides(lookup)
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
