//! Relay (solenoid valve) outputs. The `gpio` feature gates the real rppal
//! driver; without it every write is tracked in memory and logged.
//!
//! Writes are open-loop: there is no read-back of the actual coil state, and
//! writing the same state twice still performs the write.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Channel identity
// ---------------------------------------------------------------------------

/// One of the configured valve outputs, numbered from 1 as on the control form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RelayChannel(u8);

impl RelayChannel {
    /// Channel ordinals start at 1; 0 is never a valid relay.
    pub fn new(ordinal: u8) -> Option<Self> {
        (ordinal >= 1).then_some(Self(ordinal))
    }
}

impl fmt::Display for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub channel: RelayChannel,
    pub gpio_pin: u8,
    pub on: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

struct Relay {
    gpio_pin: u8,
    on: bool,
    last_changed: Option<OffsetDateTime>,
    #[cfg(feature = "gpio")]
    pin: OutputPin,
}

pub struct RelayBoard {
    relays: BTreeMap<RelayChannel, Relay>,
    active_low: bool, // many relay boards are active-low
    #[cfg(test)]
    pub(crate) writes: Vec<(RelayChannel, bool, tokio::time::Instant)>,
}

impl RelayBoard {
    /// Claim every configured pin as an output and drive it OFF.
    pub fn new(channel_to_gpio: &[(RelayChannel, u8)], active_low: bool) -> Result<Self> {
        #[cfg(feature = "gpio")]
        let gpio = Gpio::new()?;

        let mut relays = BTreeMap::new();
        for &(channel, gpio_pin) in channel_to_gpio {
            #[cfg(feature = "gpio")]
            let pin = gpio.get(gpio_pin)?.into_output();

            #[cfg(not(feature = "gpio"))]
            tracing::info!("[mock-gpio] registered relay={channel} (gpio {gpio_pin} not wired)");

            relays.insert(
                channel,
                Relay {
                    gpio_pin,
                    on: false,
                    last_changed: None,
                    #[cfg(feature = "gpio")]
                    pin,
                },
            );
        }

        let mut board = Self {
            relays,
            active_low,
            #[cfg(test)]
            writes: Vec::new(),
        };
        // Fail-safe: every valve starts closed.
        for relay in board.relays.values_mut() {
            Self::drive(relay, false, active_low);
        }
        Ok(board)
    }

    pub fn contains(&self, channel: RelayChannel) -> bool {
        self.relays.contains_key(&channel)
    }

    #[cfg(test)]
    pub fn is_on(&self, channel: RelayChannel) -> bool {
        self.relays.get(&channel).is_some_and(|r| r.on)
    }

    /// Drive one relay. Unknown channels are logged and ignored; callers
    /// validate channels before they get here.
    pub fn set(&mut self, channel: RelayChannel, on: bool) {
        let active_low = self.active_low;
        let Some(relay) = self.relays.get_mut(&channel) else {
            tracing::warn!(%channel, "unknown relay channel, write ignored");
            return;
        };
        Self::drive(relay, on, active_low);
        relay.on = on;
        relay.last_changed = Some(OffsetDateTime::now_utc());

        #[cfg(test)]
        self.writes.push((channel, on, tokio::time::Instant::now()));

        tracing::info!(
            %channel,
            gpio = relay.gpio_pin,
            "relay set {}",
            if on { "ON" } else { "OFF" }
        );
    }

    pub fn all_off(&mut self) {
        let channels: Vec<RelayChannel> = self.relays.keys().copied().collect();
        for channel in channels {
            self.set(channel, false);
        }
    }

    pub fn snapshot(&self) -> Vec<RelaySnapshot> {
        self.relays
            .iter()
            .map(|(&channel, r)| RelaySnapshot {
                channel,
                gpio_pin: r.gpio_pin,
                on: r.on,
                last_changed: r.last_changed,
            })
            .collect()
    }

    #[cfg(feature = "gpio")]
    fn drive(relay: &mut Relay, on: bool, active_low: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != active_low {
            relay.pin.set_high();
        } else {
            relay.pin.set_low();
        }
    }

    #[cfg(not(feature = "gpio"))]
    fn drive(relay: &mut Relay, on: bool, active_low: bool) {
        let level = if on != active_low { "HIGH" } else { "LOW" };
        tracing::debug!("[mock-gpio] gpio {} -> {level}", relay.gpio_pin);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
