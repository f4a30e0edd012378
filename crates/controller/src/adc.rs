//! MCP3008 10-bit ADC over SPI for soil moisture sensing.
//!
//! Each read is one 3-byte full-duplex exchange:
//!
//! ```text
//!   tx: [ 0x01 (start) | SGL + channel << 4 | don't care ]
//!   rx: [ ignored      | .... ..B9 B8       | B7 .. B0    ]
//! ```
//!
//! The `gpio` feature wires the real rppal SPI bus; without it a simulated
//! soil probe answers the same frames so the controller runs on a laptop.

use crate::error::SensorError;

/// Start bit, first byte of every command frame.
const START_BIT: u8 = 0x01;
/// Single-ended mode flag, OR-ed with the channel in the second byte.
const SINGLE_ENDED: u8 = 0x08;
/// Highest single-ended input on the MCP3008.
pub const MAX_CHANNEL: u8 = 7;
/// Full-scale reading for a 10-bit converter.
pub const ADC_MAX: u16 = 1023;

// ── Bus seam ────────────────────────────────────────────────────────────────

/// One full-duplex SPI exchange. Implemented by the rppal bus on the Pi and by
/// the simulator / test doubles elsewhere.
pub trait AnalogBus: Send {
    /// Clock `tx` out while filling `rx`; returns the number of bytes read.
    fn transfer(&mut self, tx: &[u8; 3], rx: &mut [u8; 3]) -> Result<usize, SensorError>;
}

/// Build the command frame selecting single-ended input `channel`.
pub fn command_for_channel(channel: u8) -> [u8; 3] {
    [START_BIT, (SINGLE_ENDED + channel) << 4, 0]
}

/// Extract the 10-bit conversion result from a response frame.
pub fn decode(rx: &[u8; 3]) -> u16 {
    (u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2])
}

/// Inverse of [`decode`], used by bus doubles to answer a read.
pub fn encode(value: u16) -> [u8; 3] {
    let value = value.min(ADC_MAX);
    [0, (value >> 8) as u8 & 0x03, (value & 0xFF) as u8]
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Mcp3008 {
    bus: Box<dyn AnalogBus>,
}

impl Mcp3008 {
    pub fn new(bus: Box<dyn AnalogBus>) -> Self {
        Self { bus }
    }

    /// Read one input. Bus failures propagate; they are never mapped to 0.
    pub fn read_channel(&mut self, channel: u8) -> Result<u16, SensorError> {
        if channel > MAX_CHANNEL {
            return Err(SensorError::InvalidChannel(channel));
        }

        let tx = command_for_channel(channel);
        let mut rx = [0u8; 3];
        let n = self.bus.transfer(&tx, &mut rx)?;
        if n < rx.len() {
            return Err(SensorError::ShortRead(n));
        }

        let value = decode(&rx);
        tracing::trace!(channel, raw = value, "adc read");
        Ok(value)
    }
}

// ── rppal SPI bus ───────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
pub struct SpiBus {
    spi: rppal::spi::Spi,
}

#[cfg(feature = "gpio")]
impl SpiBus {
    /// Open `/dev/spidevB.S` in SPI mode 0.
    pub fn open(bus: u8, slave_select: u8, clock_hz: u32) -> anyhow::Result<Self> {
        use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

        let bus_id = match bus {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            other => anyhow::bail!("unsupported spi bus {other}"),
        };
        let ss = match slave_select {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            2 => SlaveSelect::Ss2,
            other => anyhow::bail!("unsupported spi slave select {other}"),
        };

        let spi = Spi::new(bus_id, ss, clock_hz, Mode::Mode0)?;
        tracing::info!(bus, slave_select, clock_hz, "mcp3008 spi bus opened");
        Ok(Self { spi })
    }
}

#[cfg(feature = "gpio")]
impl AnalogBus for SpiBus {
    fn transfer(&mut self, tx: &[u8; 3], rx: &mut [u8; 3]) -> Result<usize, SensorError> {
        self.spi
            .transfer(rx, tx)
            .map_err(|e| SensorError::Bus(e.to_string()))
    }
}

// ── Simulated probe ─────────────────────────────────────────────────────────

/// Soil probe simulator for development without hardware.
///
/// Models a slow random walk between the wet and dry ends of the 10-bit range
/// with per-read noise. Lower readings mean drier soil, matching the probe
/// orientation the engine expects.
#[cfg(not(feature = "gpio"))]
pub struct SimulatedProbe {
    level: f64,
    drift_per_read: f64,
    noise: f64,
}

#[cfg(not(feature = "gpio"))]
impl SimulatedProbe {
    pub fn new(start: u16) -> Self {
        tracing::info!(start, "[sim-adc] simulated soil probe (no hardware)");
        Self {
            level: f64::from(start.min(ADC_MAX)),
            drift_per_read: -0.5,
            noise: 4.0,
        }
    }

    fn next_value(&mut self) -> u16 {
        // Drying drift with a mild pull back toward mid-range.
        let center = f64::from(ADC_MAX) / 2.0;
        self.level += self.drift_per_read + (center - self.level) * 0.001;
        let jitter = (fastrand::f64() - 0.5) * 2.0 * self.noise;
        (self.level + jitter).clamp(0.0, f64::from(ADC_MAX)).round() as u16
    }
}

#[cfg(not(feature = "gpio"))]
impl AnalogBus for SimulatedProbe {
    fn transfer(&mut self, tx: &[u8; 3], rx: &mut [u8; 3]) -> Result<usize, SensorError> {
        if tx[0] != START_BIT {
            return Err(SensorError::Bus(format!("bad start byte {:#04x}", tx[0])));
        }
        *rx = encode(self.next_value());
        Ok(3)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
