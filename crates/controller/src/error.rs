//! Error taxonomy for the irrigation engine and its collaborators.
//!
//! Hardware and provider failures are caught at the engine boundary and turn
//! into an abandoned cycle; configuration errors (unknown crop, bad channel,
//! unknown action) are returned before any hardware write happens.

use thiserror::Error;

use crate::relay::RelayChannel;

// ---------------------------------------------------------------------------
// Sensor bus
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SensorError {
    /// The SPI transaction itself failed.
    #[error("spi transfer failed: {0}")]
    Bus(String),
    /// The bus returned fewer bytes than the 3-byte frame.
    #[error("short spi response ({0} of 3 bytes)")]
    ShortRead(usize),
    /// Requested ADC input does not exist on the chip.
    #[error("adc channel {0} out of range (0-7)")]
    InvalidChannel(u8),
}

// ---------------------------------------------------------------------------
// Forecast provider
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ForecastError {
    /// Network-level failure (DNS, connect, timeout, TLS).
    #[error("forecast request failed: {0}")]
    Transport(String),
    /// Provider answered with a non-success status.
    #[error("forecast provider returned {status}: {message}")]
    Status { status: u16, message: String },
    /// Body was not the JSON shape we expect.
    #[error("malformed forecast response: {0}")]
    Malformed(String),
    /// JSON parsed but the value we need is absent.
    #[error("forecast response missing {0}")]
    MissingField(&'static str),
    /// No postcode has been configured for this session yet.
    #[error("no postcode configured")]
    NoPostcode,
}

impl ForecastError {
    /// Transport failures, rate limiting and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sensor i/o error: {0}")]
    Sensor(#[from] SensorError),
    #[error("unknown crop '{0}'")]
    UnknownCrop(String),
    #[error("forecast unavailable: {0}")]
    ForecastUnavailable(#[from] ForecastError),
    #[error("invalid relay channel '{0}'")]
    InvalidChannel(String),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("relay channel {0} already has a live activation cycle")]
    ChannelBusy(RelayChannel),
}

// ===========================================================================
// Tests
// ===========================================================================
