//! The single owner of the bus and GPIO handles. Opened once at startup,
//! handed to the engine, released (all relays OFF) on shutdown.

use anyhow::{Context, Result};

use crate::adc::Mcp3008;
use crate::config::Config;
use crate::error::SensorError;
use crate::relay::{RelayBoard, RelayChannel, RelaySnapshot};

pub struct Hardware {
    adc: Mcp3008,
    sensor_channel: u8,
    relays: RelayBoard,
}

impl Hardware {
    pub fn new(adc: Mcp3008, sensor_channel: u8, relays: RelayBoard) -> Self {
        Self {
            adc,
            sensor_channel,
            relays,
        }
    }

    /// Open the ADC bus and claim relay pins described by `config`.
    pub fn open(config: &Config, active_low: bool) -> Result<Self> {
        let relays = RelayBoard::new(&config.relay_map(), active_low)
            .context("failed to initialise relay board")?;

        #[cfg(feature = "gpio")]
        let bus = crate::adc::SpiBus::open(
            config.sensor.spi_bus,
            config.sensor.slave_select,
            config.sensor.clock_hz,
        )
        .context("failed to open mcp3008 spi bus")?;

        #[cfg(not(feature = "gpio"))]
        let bus = crate::adc::SimulatedProbe::new(600);

        Ok(Self::new(
            Mcp3008::new(Box::new(bus)),
            config.sensor.adc_channel,
            relays,
        ))
    }

    pub fn read_moisture(&mut self) -> Result<u16, SensorError> {
        self.adc.read_channel(self.sensor_channel)
    }

    pub fn has_relay(&self, channel: RelayChannel) -> bool {
        self.relays.contains(channel)
    }

    pub fn set_relay(&mut self, channel: RelayChannel, on: bool) {
        self.relays.set(channel, on);
    }

    #[cfg(test)]
    pub fn relay_is_on(&self, channel: RelayChannel) -> bool {
        self.relays.is_on(channel)
    }

    pub fn relay_snapshot(&self) -> Vec<RelaySnapshot> {
        self.relays.snapshot()
    }

    /// Drive every relay OFF ahead of shutdown.
    pub fn release(&mut self) {
        self.relays.all_off();
        tracing::info!("hardware released, all relays off");
    }

    #[cfg(test)]
    pub(crate) fn relay_writes(&self) -> &[(RelayChannel, bool, tokio::time::Instant)] {
        &self.relays.writes
    }
}
