//! Cached next-day rain forecast and its staleness rule.
//!
//! The record lives in the caller's session. It is only ever replaced whole,
//! and a failed fetch still produces a record (with unknown probability) so
//! the engine always has something to evaluate.

use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};

use crate::error::{EngineError, ForecastError};
use crate::provider::ForecastProvider;
use crate::session::{self, SharedSession};

/// A cached forecast older than this is refreshed before use.
pub const STALE_AFTER: time::Duration = time::Duration::hours(24);

/// Watering is skipped when tomorrow's rain probability is at least this.
pub const RAIN_SKIP_PERCENT: u8 = 75;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForecastRecord {
    /// `None` when the provider could not establish a probability.
    pub rain_probability_percent: Option<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

impl ForecastRecord {
    pub fn new(rain_probability_percent: Option<u8>, fetched_at: OffsetDateTime) -> Self {
        Self {
            rain_probability_percent,
            fetched_at,
        }
    }

    /// Only a known probability at or above the skip level holds watering
    /// back. An unknown probability is permissive.
    pub fn suppresses_watering(&self) -> bool {
        matches!(self.rain_probability_percent, Some(p) if p >= RAIN_SKIP_PERCENT)
    }
}

/// True when there is no record, or it was fetched more than 24h before `now`.
/// Exactly 24h is still fresh; a record stamped in the future is fresh.
pub fn is_stale(record: Option<&ForecastRecord>, now: OffsetDateTime) -> bool {
    match record {
        None => true,
        Some(r) => now - r.fetched_at > STALE_AFTER,
    }
}

// ---------------------------------------------------------------------------
// Clock seam
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock reported in the installation's local offset, so "tomorrow"
/// means the local calendar day.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

// ---------------------------------------------------------------------------
// Fetch / refresh
// ---------------------------------------------------------------------------

/// Two-step resolution: postcode -> location -> tomorrow's rain probability.
async fn fetch_probability(
    provider: &dyn ForecastProvider,
    postcode: Option<&str>,
    now: OffsetDateTime,
) -> Result<u8, EngineError> {
    let postcode = postcode
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or(ForecastError::NoPostcode)?;
    let location = provider.resolve_location(postcode).await?;
    Ok(provider.tomorrow_rain_probability(location, now).await?)
}

/// Fetch a fresh record. Provider failures degrade to an unknown probability.
pub async fn fetch(
    provider: &dyn ForecastProvider,
    postcode: Option<&str>,
    now: OffsetDateTime,
) -> ForecastRecord {
    match fetch_probability(provider, postcode, now).await {
        Ok(percent) => {
            info!(postcode, rain_probability = percent, "forecast fetched");
            ForecastRecord::new(Some(percent), now)
        }
        Err(e) => {
            warn!(postcode, "{e}; rain probability unknown");
            ForecastRecord::new(None, now)
        }
    }
}

/// Return the session's cached record, refreshing it first when stale.
pub async fn refresh_if_stale(
    session: &SharedSession,
    provider: &dyn ForecastProvider,
    now: OffsetDateTime,
) -> ForecastRecord {
    let (cached, postcode) = {
        let s = session::lock(session);
        (s.forecast, s.postcode.clone())
    };

    if let Some(record) = cached.filter(|r| !is_stale(Some(r), now)) {
        return record;
    }

    let record = fetch(provider, postcode.as_deref(), now).await;
    session::lock(session).store_forecast(record);
    record
}

// ===========================================================================
// Tests
// ===========================================================================
