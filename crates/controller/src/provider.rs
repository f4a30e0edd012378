//! Forecast provider: resolves a postcode to a location and fetches
//! tomorrow's rain probability for it.
//!
//! The production implementation talks to the WillyWeather v2 JSON API with
//! a blocking `ureq` agent on tokio's blocking pool. Transport errors, 429
//! and 5xx are retried with exponential backoff; anything else fails at once.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::ForecastSettings;
use crate::error::ForecastError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub u64);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn resolve_location(&self, postcode: &str) -> Result<LocationId, ForecastError>;

    /// Rain probability, 0-100, for the calendar day after `now`. The date is
    /// taken in `now`'s own offset, so pass local time.
    async fn tomorrow_rain_probability(
        &self,
        location: LocationId,
        now: OffsetDateTime,
    ) -> Result<u8, ForecastError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    locations: Vec<SearchLocation>,
}

#[derive(Debug, Deserialize)]
struct SearchLocation {
    id: Option<LocationId>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    forecasts: Forecasts,
}

#[derive(Debug, Deserialize)]
struct Forecasts {
    rainfallprobability: Option<RainForecast>,
}

#[derive(Debug, Deserialize)]
struct RainForecast {
    #[serde(default)]
    days: Vec<RainDay>,
}

#[derive(Debug, Deserialize)]
struct RainDay {
    #[serde(default)]
    entries: Vec<RainEntry>,
}

#[derive(Debug, Deserialize)]
struct RainEntry {
    probability: Option<f64>,
}

fn parse_location(body: &str) -> Result<LocationId, ForecastError> {
    let resp: SearchResponse =
        serde_json::from_str(body).map_err(|e| ForecastError::Malformed(e.to_string()))?;
    resp.locations
        .first()
        .and_then(|l| l.id)
        .ok_or(ForecastError::MissingField("locations[0].id"))
}

fn parse_probability(body: &str) -> Result<u8, ForecastError> {
    let resp: WeatherResponse =
        serde_json::from_str(body).map_err(|e| ForecastError::Malformed(e.to_string()))?;
    let percent = resp
        .forecasts
        .rainfallprobability
        .and_then(|f| f.days.into_iter().next())
        .and_then(|d| d.entries.into_iter().next())
        .and_then(|e| e.probability)
        .ok_or(ForecastError::MissingField(
            "forecasts.rainfallprobability.days[0].entries[0].probability",
        ))?;
    Ok(percent.clamp(0.0, 100.0).round() as u8)
}

/// `YYYY-MM-DD` of the day after `now`.
fn tomorrow(now: OffsetDateTime) -> String {
    (now.date() + time::Duration::days(1)).to_string()
}

// ---------------------------------------------------------------------------
// WillyWeather client
// ---------------------------------------------------------------------------

pub struct WillyWeather {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl WillyWeather {
    pub fn new(settings: &ForecastSettings, api_key: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_sec))
            .user_agent(concat!("solenoid-controller/", env!("CARGO_PKG_VERSION")))
            .build();

        Self {
            agent,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_attempts: settings.max_attempts.max(1),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.api_key)
    }

    /// Run one request on the blocking pool, retrying transient failures.
    async fn send(
        &self,
        request: ureq::Request,
        body: Option<String>,
    ) -> Result<String, ForecastError> {
        let mut delay = self.retry_backoff;
        let mut attempt = 1;

        loop {
            let (req, payload) = (request.clone(), body.clone());
            let result = tokio::task::spawn_blocking(move || execute(req, payload))
                .await
                .map_err(|e| ForecastError::Transport(format!("forecast worker failed: {e}")))?;

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        "forecast request failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn execute(request: ureq::Request, body: Option<String>) -> Result<String, ForecastError> {
    let response = match body {
        Some(json) => request.send_string(&json),
        None => request.call(),
    };

    match response {
        Ok(resp) => resp
            .into_string()
            .map_err(|e| ForecastError::Malformed(e.to_string())),
        Err(ureq::Error::Status(status, resp)) => Err(ForecastError::Status {
            status,
            message: resp.into_string().unwrap_or_default(),
        }),
        Err(ureq::Error::Transport(t)) => Err(ForecastError::Transport(t.to_string())),
    }
}

#[async_trait]
impl ForecastProvider for WillyWeather {
    async fn resolve_location(&self, postcode: &str) -> Result<LocationId, ForecastError> {
        let request = self
            .agent
            .post(&self.url("search.json"))
            .set("Content-Type", "application/json");
        let body = serde_json::json!({ "query": postcode, "limit": 1 }).to_string();

        let text = self.send(request, Some(body)).await?;
        let location = parse_location(&text)?;
        debug!(postcode, %location, "postcode resolved");
        Ok(location)
    }

    async fn tomorrow_rain_probability(
        &self,
        location: LocationId,
        now: OffsetDateTime,
    ) -> Result<u8, ForecastError> {
        let request = self
            .agent
            .get(&self.url(&format!("locations/{location}/weather.json")))
            .set("Content-Type", "application/json")
            .query("forecasts", "rainfallprobability")
            .query("days", "1")
            .query("startDate", &tomorrow(now));

        let text = self.send(request, None).await?;
        parse_probability(&text)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
