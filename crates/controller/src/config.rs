//! TOML config file loading and validation for relay pins, the ADC bus,
//! engine timing and the forecast provider.
//!
//! Every section is optional; an empty file yields the stock four-relay
//! board wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::adc;
use crate::engine::Timing;
use crate::relay::RelayChannel;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_relays")]
    pub relays: Vec<RelayEntry>,
    #[serde(default)]
    pub sensor: SensorSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub forecast: ForecastSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub channel: i64,
    pub gpio_pin: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub spi_bus: u8,
    pub slave_select: u8,
    pub clock_hz: u32,
    pub adc_channel: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Delay between moisture reads while the soil is wet enough.
    pub poll_interval_ms: u64,
    /// Granularity at which a watering pulse checks its deadline and the
    /// activation flag.
    pub pulse_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    pub base_url: String,
    pub timeout_sec: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Stock 4-channel relay HAT wiring.
const DEFAULT_RELAY_PINS: [i64; 4] = [20, 21, 19, 26];

fn default_relays() -> Vec<RelayEntry> {
    DEFAULT_RELAY_PINS
        .iter()
        .enumerate()
        .map(|(i, &pin)| RelayEntry {
            channel: i as i64 + 1,
            gpio_pin: pin,
        })
        .collect()
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            spi_bus: 0,
            slave_select: 0,
            clock_hz: 1_350_000,
            adc_channel: 0,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            pulse_poll_ms: 100,
        }
    }
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.willyweather.com.au/v2".to_string(),
            timeout_sec: 10,
            max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            sensor: SensorSettings::default(),
            engine: EngineSettings::default(),
            forecast: ForecastSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM; 7-11 belong to SPI0, which
/// the moisture ADC needs.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_relays(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_engine(&mut errors);
        self.validate_forecast(&mut errors);

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

    fn validate_relays(&self, errors: &mut Vec<String>) {
        if self.relays.is_empty() {
            errors.push("relays: at least one relay must be configured".to_string());
        }

        let mut seen_channels: HashSet<i64> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, r) in self.relays.iter().enumerate() {
            let ctx = format!("relays[{i}]");

            if !(1..=i64::from(u8::MAX)).contains(&r.channel) {
                errors.push(format!(
                    "{ctx}: channel {} out of range [1, 255]",
                    r.channel
                ));
            } else if !seen_channels.insert(r.channel) {
                errors.push(format!("{ctx}: duplicate channel {}", r.channel));
            }

            if !VALID_GPIO_PINS.contains(&r.gpio_pin) {
                errors.push(format!(
                    "{ctx}: gpio_pin {} is not a usable BCM GPIO pin",
                    r.gpio_pin
                ));
            } else if !seen_pins.insert(r.gpio_pin) {
                errors.push(format!(
                    "{ctx}: gpio_pin {} is already used by another relay",
                    r.gpio_pin
                ));
            }
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        if s.spi_bus > 1 {
            errors.push(format!("sensor: spi_bus {} out of range [0, 1]", s.spi_bus));
        }
        if s.slave_select > 2 {
            errors.push(format!(
                "sensor: slave_select {} out of range [0, 2]",
                s.slave_select
            ));
        }
        if s.clock_hz == 0 {
            errors.push("sensor: clock_hz must be positive".to_string());
        }
        if s.adc_channel > adc::MAX_CHANNEL {
            errors.push(format!(
                "sensor: adc_channel {} out of range [0, {}]",
                s.adc_channel,
                adc::MAX_CHANNEL
            ));
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        if self.engine.poll_interval_ms == 0 {
            errors.push("engine: poll_interval_ms must be positive".to_string());
        }
        if self.engine.pulse_poll_ms == 0 {
            errors.push("engine: pulse_poll_ms must be positive".to_string());
        }
    }

    fn validate_forecast(&self, errors: &mut Vec<String>) {
        let f = &self.forecast;
        if !f.base_url.starts_with("http://") && !f.base_url.starts_with("https://") {
            errors.push(format!(
                "forecast: base_url '{}' must start with http:// or https://",
                f.base_url
            ));
        }
        if f.timeout_sec == 0 {
            errors.push("forecast: timeout_sec must be positive".to_string());
        }
        if f.max_attempts == 0 {
            errors.push("forecast: max_attempts must be at least 1".to_string());
        }
    }

    /// Channel -> BCM pin pairs. Only meaningful after `validate`.
    pub fn relay_map(&self) -> Vec<(RelayChannel, u8)> {
        self.relays
            .iter()
            .filter_map(|r| {
                let channel = RelayChannel::new(u8::try_from(r.channel).ok()?)?;
                Some((channel, u8::try_from(r.gpio_pin).ok()?))
            })
            .collect()
    }

    pub fn timing(&self) -> Timing {
        Timing {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            pulse_poll: Duration::from_millis(self.engine.pulse_poll_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents).with_context(|| format!("failed to parse config: {path}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "config file not found, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        relays = config.relays.len(),
        adc_channel = config.sensor.adc_channel,
        poll_interval_ms = config.engine.poll_interval_ms,
        "config loaded"
    );
    Ok(config)
}

fn parse(contents: &str) -> Result<Config> {
    Ok(toml::from_str(contents)?)
}

// ===========================================================================
// Tests
// ===========================================================================
