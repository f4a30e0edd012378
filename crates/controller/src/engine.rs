//! Irrigation decision and actuation engine.
//!
//! One `activate` call runs one monitoring cycle on one relay channel until
//! the process-wide activation flag is cleared:
//!
//! ```text
//! Idle ──[trigger]──▶ AwaitingAction
//!                        │ on/off      ──▶ relay write, back to Idle
//!                        │ deactivate  ──▶ flag := false (Deactivated)
//!                        │ activate
//!                        ▼
//!                   Monitoring ──[dry && rain unlikely]──▶ Watering
//!                        ▲                                    │
//!                        └──────[runtime elapsed]─────────────┘
//!                        │
//!                   [flag false] ──▶ Idle
//! ```
//!
//! The flag is a single `AtomicBool` shared by every channel. Once cleared it
//! stays cleared until [`Engine::reactivate`] is called; a pulse in progress
//! observes it at the next pulse-poll boundary and closes its valve.
//!
//! Sensor failures abandon the cycle and return to idle; they never leave a
//! relay on. Bad input (unknown crop, channel or action) is rejected before
//! any hardware write.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::error::{EngineError, SensorError};
use crate::forecast::{self, Clock};
use crate::hardware::Hardware;
use crate::policy;
use crate::provider::ForecastProvider;
use crate::relay::{RelayChannel, RelaySnapshot};
use crate::session::{self, SharedSession};
use crate::state::{CyclePhase, EventKind, SharedState};

// ---------------------------------------------------------------------------
// Trigger vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
    Activate,
    Deactivate,
    Settings,
}

impl FromStr for Action {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "activate" => Ok(Self::Activate),
            "deactivate" => Ok(Self::Deactivate),
            "settings" => Ok(Self::Settings),
            _ => Err(EngineError::UnknownAction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Caller should route to the settings flow.
    ShowSettings,
    Deactivated,
    RelaySet { channel: RelayChannel, on: bool },
    /// The activation flag is cleared; nothing was done.
    Inactive,
    /// The monitoring loop ran until the flag was cleared.
    CycleStopped { pulses: u32 },
    /// A hardware failure ended the cycle early; the engine is idle again.
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsSummary {
    pub sensor_threshold: u32,
    pub runtime_secs: u64,
    pub postcode: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Delay between reads when no watering was needed.
    pub poll_interval: Duration,
    /// Granularity of the timed hold during a pulse.
    pub pulse_poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PulseEnd {
    Completed,
    Interrupted,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    hardware: Mutex<Hardware>,
    active: AtomicBool,
    /// Channels with a live cycle. At most one cycle per channel.
    live: Mutex<BTreeMap<RelayChannel, CyclePhase>>,
    provider: Arc<dyn ForecastProvider>,
    clock: Arc<dyn Clock>,
    timing: Timing,
    state: SharedState,
}

impl Engine {
    pub fn new(
        hardware: Hardware,
        provider: Arc<dyn ForecastProvider>,
        clock: Arc<dyn Clock>,
        timing: Timing,
        state: SharedState,
    ) -> Self {
        Self {
            hardware: Mutex::new(hardware),
            active: AtomicBool::new(true),
            live: Mutex::new(BTreeMap::new()),
            provider,
            clock,
            timing,
            state,
        }
    }

    // ── Activation flag ─────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Clear the flag. Every live cycle on every channel winds down.
    pub async fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("system deactivated");
            self.record(EventKind::Engine, "system deactivated".into()).await;
        }
    }

    /// Set the flag again so channels may be activated.
    pub async fn reactivate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("system reactivated");
            self.record(EventKind::Engine, "system reactivated".into()).await;
        }
    }

    // ── Trigger interface ───────────────────────────────────────────

    /// Validate a relay selection from the control form.
    pub fn channel(&self, raw: &str) -> Result<RelayChannel, EngineError> {
        raw.trim()
            .parse::<u8>()
            .ok()
            .and_then(RelayChannel::new)
            .filter(|&ch| self.hardware().has_relay(ch))
            .ok_or_else(|| EngineError::InvalidChannel(raw.to_string()))
    }

    /// Dispatch one `(relay, action)` trigger. `activate` only returns once
    /// its cycle has ended.
    pub async fn submit_control(
        &self,
        relay: &str,
        action: Action,
        session: &SharedSession,
    ) -> Result<ControlOutcome, EngineError> {
        let channel = self.channel(relay)?;

        match action {
            Action::Settings => Ok(ControlOutcome::ShowSettings),
            Action::Deactivate => {
                self.deactivate().await;
                Ok(ControlOutcome::Deactivated)
            }
            Action::On | Action::Off if !self.is_active() => {
                info!(%channel, ?action, "system inactive, relay command ignored");
                Ok(ControlOutcome::Inactive)
            }
            Action::On | Action::Off => {
                // A live cycle owns its relay; manual writes would race the pulse.
                if self.live().contains_key(&channel) {
                    warn!(%channel, ?action, "relay command rejected, channel has a live cycle");
                    return Err(EngineError::ChannelBusy(channel));
                }
                let on = action == Action::On;
                self.set_relay(channel, on);
                self.record(
                    EventKind::Valve,
                    format!("relay {channel} set {}", if on { "ON" } else { "OFF" }),
                )
                .await;
                Ok(ControlOutcome::RelaySet { channel, on })
            }
            Action::Activate => self.activate(channel, session).await,
        }
    }

    /// Run a monitoring cycle on `channel` until the activation flag clears.
    pub async fn activate(
        &self,
        channel: RelayChannel,
        session: &SharedSession,
    ) -> Result<ControlOutcome, EngineError> {
        if !self.is_active() {
            info!(%channel, "system inactive, activation ignored");
            return Ok(ControlOutcome::Inactive);
        }

        let _lease = self.claim(channel)?;

        match self.run_cycle(channel, session).await {
            Ok(pulses) => {
                info!(%channel, pulses, "activation cycle stopped");
                self.record(
                    EventKind::Engine,
                    format!("relay {channel}: cycle stopped after {pulses} pulse(s)"),
                )
                .await;
                Ok(ControlOutcome::CycleStopped { pulses })
            }
            Err(e) => {
                error!(%channel, "activation cycle abandoned, returned to idle: {e}");
                self.record(
                    EventKind::Error,
                    format!("relay {channel}: cycle abandoned: {e}"),
                )
                .await;
                Ok(ControlOutcome::Abandoned {
                    reason: e.to_string(),
                })
            }
        }
    }

    // ── Settings interface ──────────────────────────────────────────

    /// Resolve the crop, fetch a fresh forecast for the postcode and store
    /// threshold, runtime and postcode in the session. An unknown crop fails
    /// before anything is written.
    pub async fn submit_settings(
        &self,
        crop: &str,
        postcode: &str,
        session: &SharedSession,
    ) -> Result<SettingsSummary, EngineError> {
        let profile = policy::resolve(crop)?;
        let postcode = postcode.trim().to_string();

        let record =
            forecast::fetch(&*self.provider, Some(postcode.as_str()), self.clock.now()).await;
        {
            let mut s = session::lock(session);
            s.store_forecast(record);
            s.apply_settings(&profile, postcode.clone());
        }

        info!(
            crop = profile.crop,
            sensor_threshold = profile.sensor_threshold,
            runtime_secs = profile.runtime_secs,
            rain_probability = record.rain_probability_percent,
            "settings saved"
        );
        let rain = match record.rain_probability_percent {
            Some(p) => format!("{p}%"),
            None => "unknown".to_string(),
        };
        self.record(
            EventKind::Forecast,
            format!("postcode {postcode}: rain probability tomorrow {rain}"),
        )
        .await;
        self.record(
            EventKind::Settings,
            format!(
                "{} selected: threshold {}, runtime {}s",
                profile.crop, profile.sensor_threshold, profile.runtime_secs
            ),
        )
        .await;

        Ok(SettingsSummary {
            sensor_threshold: profile.sensor_threshold,
            runtime_secs: profile.runtime_secs,
            postcode,
        })
    }

    // ── Status ──────────────────────────────────────────────────────

    pub fn relay_snapshot(&self) -> Vec<RelaySnapshot> {
        self.hardware().relay_snapshot()
    }

    pub fn cycles(&self) -> BTreeMap<RelayChannel, CyclePhase> {
        self.live().clone()
    }

    /// Clear the flag and close every valve.
    pub async fn shutdown(&self) {
        self.deactivate().await;
        self.hardware().release();
    }

    // ── Cycle internals ─────────────────────────────────────────────

    async fn run_cycle(
        &self,
        channel: RelayChannel,
        session: &SharedSession,
    ) -> Result<u32, EngineError> {
        let forecast =
            forecast::refresh_if_stale(session, &*self.provider, self.clock.now()).await;
        let (threshold, runtime) = {
            let s = session::lock(session);
            (s.sensor_threshold(), s.runtime())
        };

        info!(
            %channel,
            threshold,
            runtime_secs = runtime.as_secs(),
            rain_probability = forecast.rain_probability_percent,
            "activation cycle started"
        );
        self.record(
            EventKind::Engine,
            format!(
                "relay {channel}: monitoring (threshold {threshold}, runtime {}s)",
                runtime.as_secs()
            ),
        )
        .await;

        let mut pulses = 0;
        while self.is_active() {
            let raw = self.read_moisture()?;
            self.state.write().await.record_reading(channel, raw);

            // Picks up a record replaced by a settings submission, and keeps a
            // cycle that outlives the staleness window on a current forecast.
            let rain_likely =
                forecast::refresh_if_stale(session, &*self.provider, self.clock.now())
                    .await
                    .suppresses_watering();

            if u32::from(raw) < threshold && !rain_likely {
                pulses += 1;
                self.pulse(channel, runtime, raw).await;
            } else {
                if u32::from(raw) < threshold {
                    info!(%channel, raw, threshold, "soil dry but rain likely, not watering");
                }
                sleep(self.timing.poll_interval).await;
            }
        }

        Ok(pulses)
    }

    /// Hold the valve open for `runtime`, checking the deadline and the
    /// activation flag every `pulse_poll`.
    async fn pulse(&self, channel: RelayChannel, runtime: Duration, raw: u16) -> PulseEnd {
        self.set_phase(channel, CyclePhase::Watering);
        let valve = OpenValve::open(self, channel);
        self.record(
            EventKind::Valve,
            format!(
                "relay {channel} ON for {}s (moisture {raw})",
                runtime.as_secs()
            ),
        )
        .await;

        let started = Instant::now();
        let end = loop {
            let elapsed = started.elapsed();
            if elapsed >= runtime {
                break PulseEnd::Completed;
            }
            if !self.is_active() {
                break PulseEnd::Interrupted;
            }
            sleep(self.timing.pulse_poll.min(runtime - elapsed)).await;
        };
        drop(valve);

        let detail = match end {
            PulseEnd::Completed => format!("relay {channel} OFF, pulse complete"),
            PulseEnd::Interrupted => format!(
                "relay {channel} OFF, pulse cut short after {}s by deactivation",
                started.elapsed().as_secs()
            ),
        };
        info!(%channel, ?end, "watering pulse ended");
        self.record(EventKind::Valve, detail).await;
        self.set_phase(channel, CyclePhase::Monitoring);
        end
    }

    fn read_moisture(&self) -> Result<u16, SensorError> {
        self.hardware().read_moisture()
    }

    fn set_relay(&self, channel: RelayChannel, on: bool) {
        self.hardware().set_relay(channel, on);
    }

    fn claim(&self, channel: RelayChannel) -> Result<ChannelLease<'_>, EngineError> {
        let mut live = self.live();
        if live.contains_key(&channel) {
            warn!(%channel, "activation rejected, channel already live");
            return Err(EngineError::ChannelBusy(channel));
        }
        live.insert(channel, CyclePhase::Monitoring);
        Ok(ChannelLease {
            engine: self,
            channel,
        })
    }

    fn set_phase(&self, channel: RelayChannel, phase: CyclePhase) {
        if let Some(p) = self.live().get_mut(&channel) {
            *p = phase;
        }
    }

    fn hardware(&self) -> MutexGuard<'_, Hardware> {
        self.hardware.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, BTreeMap<RelayChannel, CyclePhase>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn record(&self, kind: EventKind, detail: String) {
        self.state.write().await.record(kind, detail);
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Marks a channel as live for the duration of one cycle.
struct ChannelLease<'a> {
    engine: &'a Engine,
    channel: RelayChannel,
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        self.engine.live().remove(&self.channel);
    }
}

/// Relay held ON; closes it when dropped, including when the cycle's future
/// is cancelled mid-pulse.
struct OpenValve<'a> {
    engine: &'a Engine,
    channel: RelayChannel,
}

impl<'a> OpenValve<'a> {
    fn open(engine: &'a Engine, channel: RelayChannel) -> Self {
        engine.set_relay(channel, true);
        Self { engine, channel }
    }
}

impl Drop for OpenValve<'_> {
    fn drop(&mut self) {
        self.engine.set_relay(self.channel, false);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::tests::ScriptedBus;
    use crate::adc::Mcp3008;
    use crate::forecast::tests::{FixedClock, SettableClock, StubProvider};
    use crate::forecast::ForecastRecord;
    use crate::relay::RelayBoard;
    use crate::session::Session;
    use crate::state::SystemState;
    use time::macros::datetime;
    use time::OffsetDateTime;

    const NOW: OffsetDateTime = datetime!(2026-10-16 06:00 UTC);

    fn ch(n: u8) -> RelayChannel {
        RelayChannel::new(n).unwrap()
    }

    fn timing() -> Timing {
        Timing {
            poll_interval: Duration::from_secs(1),
            pulse_poll: Duration::from_millis(100),
        }
    }

    fn engine_with(bus: ScriptedBus, provider: Arc<StubProvider>) -> Arc<Engine> {
        let relays = RelayBoard::new(&[(ch(1), 20), (ch(2), 21)], true).unwrap();
        let hw = Hardware::new(Mcp3008::new(Box::new(bus)), 0, relays);
        Arc::new(Engine::new(
            hw,
            provider,
            Arc::new(FixedClock(NOW)),
            timing(),
            SystemState::shared(),
        ))
    }

    fn engine(raw: u16, probability: Option<u8>) -> Arc<Engine> {
        engine_with(
            ScriptedBus::constant(raw),
            Arc::new(StubProvider::new(probability)),
        )
    }

    /// Session set up for garlic (threshold 500, runtime 300s) with a fresh
    /// cached forecast.
    fn garlic_session(rain: Option<u8>) -> SharedSession {
        let mut s = Session::default();
        s.apply_settings(&policy::resolve("garlic").unwrap(), "2000".into());
        s.store_forecast(ForecastRecord::new(rain, NOW - time::Duration::hours(1)));
        Arc::new(Mutex::new(s))
    }

    fn writes(e: &Engine) -> Vec<(RelayChannel, bool, Instant)> {
        e.hardware().relay_writes().to_vec()
    }

    /// Start an activation on a background task, let it run for `run_for`
    /// of virtual time, then deactivate and collect the outcome.
    async fn run_then_deactivate(
        e: &Arc<Engine>,
        session: &SharedSession,
        run_for: Duration,
    ) -> ControlOutcome {
        let task = {
            let e = Arc::clone(e);
            let session = Arc::clone(session);
            tokio::spawn(async move { e.submit_control("1", Action::Activate, &session).await })
        };
        sleep(run_for).await;
        e.deactivate().await;
        task.await.unwrap().unwrap()
    }

    // -- Action parsing -----------------------------------------------------

    #[test]
    fn action_parses_form_values() {
        assert_eq!("activate".parse::<Action>().unwrap(), Action::Activate);
        assert_eq!(" OFF ".parse::<Action>().unwrap(), Action::Off);
        assert!(matches!(
            "water".parse::<Action>(),
            Err(EngineError::UnknownAction(_))
        ));
    }

    // -- Channel validation -------------------------------------------------

    #[tokio::test]
    async fn invalid_channels_fail_before_any_write() {
        let e = engine(300, Some(10));
        let session = garlic_session(Some(10));

        for raw in ["0", "3", "-1", "one", ""] {
            let err = e.submit_control(raw, Action::On, &session).await.unwrap_err();
            assert!(matches!(err, EngineError::InvalidChannel(_)), "{raw}");
        }
        assert!(writes(&e).is_empty());
    }

    // -- Direct relay actions ------------------------------------------------

    #[tokio::test]
    async fn on_and_off_write_the_relay() {
        let e = engine(300, Some(10));
        let session = garlic_session(Some(10));

        let out = e.submit_control("2", Action::On, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::RelaySet { channel: ch(2), on: true });
        assert!(e.hardware().relay_is_on(ch(2)));

        e.submit_control("2", Action::Off, &session).await.unwrap();
        assert!(!e.hardware().relay_is_on(ch(2)));
        assert!(e.cycles().is_empty());
    }

    #[tokio::test]
    async fn settings_action_changes_nothing() {
        let e = engine(300, Some(10));
        let out = e
            .submit_control("1", Action::Settings, &garlic_session(None))
            .await
            .unwrap();
        assert_eq!(out, ControlOutcome::ShowSettings);
        assert!(e.is_active());
        assert!(writes(&e).is_empty());
    }

    // -- Activation flag ----------------------------------------------------

    #[tokio::test]
    async fn inactive_system_never_writes_relay() {
        let e = engine(300, Some(10));
        let session = garlic_session(Some(10));

        let out = e.submit_control("1", Action::Deactivate, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::Deactivated);
        assert!(!e.is_active());

        let out = e.submit_control("1", Action::Activate, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::Inactive);
        let out = e.submit_control("1", Action::On, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::Inactive);

        assert!(writes(&e).is_empty());
        assert!(e.cycles().is_empty());
    }

    #[tokio::test]
    async fn deactivation_is_global_until_reactivated() {
        let e = engine(600, Some(10));
        let session = garlic_session(Some(10));

        e.submit_control("1", Action::Deactivate, &session).await.unwrap();
        let out = e.submit_control("2", Action::On, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::Inactive);

        e.reactivate().await;
        let out = e.submit_control("2", Action::On, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::RelaySet { channel: ch(2), on: true });
    }

    // -- Monitoring loop: scenarios ------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dry_soil_and_unlikely_rain_waters_for_runtime() {
        let e = engine(300, Some(40));
        let session = garlic_session(Some(40));

        // The first pulse runs its full 300s; deactivation lands in the second.
        let out = run_then_deactivate(&e, &session, Duration::from_secs(310)).await;
        assert!(matches!(out, ControlOutcome::CycleStopped { pulses } if pulses >= 1));

        let w = writes(&e);
        assert_eq!(w[0].0, ch(1));
        assert!(w[0].1, "first write turns the valve on");
        assert!(!w[1].1, "second write turns it off");
        let held = w[1].2 - w[0].2;
        assert!(
            held >= Duration::from_secs(300) && held < Duration::from_millis(300_200),
            "held for {held:?}"
        );
        assert!(!e.hardware().relay_is_on(ch(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn wet_soil_leaves_relay_off() {
        let e = engine(600, Some(10));
        let session = garlic_session(Some(10));

        let out = run_then_deactivate(&e, &session, Duration::from_secs(30)).await;

        assert_eq!(out, ControlOutcome::CycleStopped { pulses: 0 });
        assert!(writes(&e).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn likely_rain_suppresses_watering_of_dry_soil() {
        let e = engine(300, Some(90));
        let session = garlic_session(Some(90));

        let out = run_then_deactivate(&e, &session, Duration::from_secs(30)).await;

        assert_eq!(out, ControlOutcome::CycleStopped { pulses: 0 });
        assert!(writes(&e).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_forecast_defaults_to_watering() {
        let provider = Arc::new(StubProvider::new(None));
        let e = engine_with(ScriptedBus::constant(300), Arc::clone(&provider));
        // No cached record: the cycle must fetch, fail, and treat rain as unknown.
        let session = garlic_session(None);
        session::lock(&session).forecast = None;

        let out = run_then_deactivate(&e, &session, Duration::from_secs(5)).await;

        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            session::lock(&session).forecast.unwrap().rain_probability_percent,
            None
        );
        assert!(matches!(out, ControlOutcome::CycleStopped { pulses: 1 }));
        assert!(writes(&e)[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn defaults_apply_without_settings() {
        // Threshold 2000 is above the whole 10-bit range, so any reading is dry.
        let e = engine(1023, Some(10));
        let session = SharedSession::default();
        session::lock(&session).store_forecast(ForecastRecord::new(Some(10), NOW));

        let out = run_then_deactivate(&e, &session, Duration::from_secs(60)).await;
        assert!(matches!(out, ControlOutcome::CycleStopped { pulses: 1 }));

        let w = writes(&e);
        let held = w[1].2 - w[0].2;
        assert!(held < Duration::from_secs(120), "cut short by deactivation");
    }

    // -- Deactivation timing ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn deactivation_mid_pulse_closes_valve_within_one_poll() {
        let e = engine(300, Some(40));
        let session = garlic_session(Some(40));

        let started = Instant::now();
        let out = run_then_deactivate(&e, &session, Duration::from_secs(10)).await;
        assert_eq!(out, ControlOutcome::CycleStopped { pulses: 1 });

        let w = writes(&e);
        assert_eq!(w.len(), 2);
        let off_at = w[1].2 - started;
        assert!(off_at >= Duration::from_secs(10));
        assert!(off_at <= Duration::from_secs(10) + timing().pulse_poll);
        assert!(!e.hardware().relay_is_on(ch(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_between_reads_exits_within_poll_interval() {
        let e = engine(600, Some(10));
        let session = garlic_session(Some(10));

        let task = {
            let e = Arc::clone(&e);
            let session = Arc::clone(&session);
            tokio::spawn(async move { e.activate(ch(1), &session).await })
        };
        sleep(Duration::from_millis(2500)).await;
        e.deactivate().await;
        let deactivated_at = Instant::now();
        task.await.unwrap().unwrap();

        assert!(deactivated_at.elapsed() <= timing().poll_interval);
        assert!(e.cycles().is_empty());
    }

    // -- Channel exclusivity -----------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn second_activation_on_live_channel_is_rejected() {
        let e = engine(600, Some(10));
        let session = garlic_session(Some(10));

        let task = {
            let e = Arc::clone(&e);
            let session = Arc::clone(&session);
            tokio::spawn(async move { e.activate(ch(1), &session).await })
        };
        sleep(Duration::from_secs(2)).await;
        assert_eq!(e.cycles().get(&ch(1)), Some(&CyclePhase::Monitoring));

        let err = e.activate(ch(1), &session).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelBusy(c) if c == ch(1)));

        e.deactivate().await;
        task.await.unwrap().unwrap();
        assert!(e.cycles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn phase_reports_watering_during_pulse() {
        let e = engine(300, Some(10));
        let session = garlic_session(Some(10));

        let task = {
            let e = Arc::clone(&e);
            let session = Arc::clone(&session);
            tokio::spawn(async move { e.activate(ch(1), &session).await })
        };
        sleep(Duration::from_secs(5)).await;
        assert_eq!(e.cycles().get(&ch(1)), Some(&CyclePhase::Watering));
        assert!(e.hardware().relay_is_on(ch(1)));

        e.deactivate().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_relay_commands_rejected_on_live_channel() {
        let e = engine(300, Some(10));
        let session = garlic_session(Some(10));

        let task = {
            let e = Arc::clone(&e);
            let session = Arc::clone(&session);
            tokio::spawn(async move { e.activate(ch(1), &session).await })
        };
        sleep(Duration::from_secs(5)).await;
        assert!(e.hardware().relay_is_on(ch(1)));

        for action in [Action::Off, Action::On] {
            let err = e.submit_control("1", action, &session).await.unwrap_err();
            assert!(matches!(err, EngineError::ChannelBusy(c) if c == ch(1)));
        }
        assert!(e.hardware().relay_is_on(ch(1)), "pulse keeps its valve open");
        assert_eq!(writes(&e).len(), 1);

        // Other channels stay under manual control.
        let out = e.submit_control("2", Action::On, &session).await.unwrap();
        assert_eq!(out, ControlOutcome::RelaySet { channel: ch(2), on: true });

        e.deactivate().await;
        task.await.unwrap().unwrap();
    }

    // -- Failure handling ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_abandons_cycle_with_relay_off() {
        // One good dry read (pulse), then the bus fails.
        let e = engine_with(
            ScriptedBus::new(&[Some(300), None]),
            Arc::new(StubProvider::new(Some(10))),
        );
        let session = garlic_session(Some(10));

        let out = e.activate(ch(1), &session).await.unwrap();

        assert!(matches!(out, ControlOutcome::Abandoned { ref reason } if reason.contains("sensor")));
        let w = writes(&e);
        assert_eq!(w.len(), 2);
        assert!(!w.last().unwrap().1);
        assert!(e.cycles().is_empty());
        assert!(e.is_active(), "a failure does not clear the flag");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cycle_closes_open_valve() {
        let e = engine(300, Some(10));
        let session = garlic_session(Some(10));

        let task = {
            let e = Arc::clone(&e);
            let session = Arc::clone(&session);
            tokio::spawn(async move { e.activate(ch(1), &session).await })
        };
        sleep(Duration::from_secs(5)).await;
        assert!(e.hardware().relay_is_on(ch(1)));

        task.abort();
        let _ = task.await;
        assert!(!e.hardware().relay_is_on(ch(1)));
        assert!(e.cycles().is_empty());
    }

    // -- Forecast refresh at activation -------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stale_forecast_is_refreshed_on_activate() {
        let provider = Arc::new(StubProvider::new(Some(95)));
        let e = engine_with(ScriptedBus::constant(300), Arc::clone(&provider));
        let session = garlic_session(Some(10));
        session::lock(&session).store_forecast(ForecastRecord::new(
            Some(10),
            NOW - time::Duration::hours(30),
        ));

        let out = run_then_deactivate(&e, &session, Duration::from_secs(5)).await;

        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Refreshed to 95%: dry soil is no longer watered.
        assert_eq!(out, ControlOutcome::CycleStopped { pulses: 0 });
        assert!(writes(&e).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_cycle_refreshes_forecast_once_stale() {
        let provider = Arc::new(StubProvider::new(Some(95)));
        let clock = Arc::new(SettableClock::new(NOW));
        let relays = RelayBoard::new(&[(ch(1), 20)], true).unwrap();
        let hw = Hardware::new(
            Mcp3008::new(Box::new(ScriptedBus::constant(300))),
            0,
            relays,
        );
        let e = Arc::new(Engine::new(
            hw,
            Arc::clone(&provider) as Arc<dyn ForecastProvider>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            timing(),
            SystemState::shared(),
        ));
        // Fresh 10% at start: the first pulse goes ahead.
        let session = garlic_session(Some(10));

        let task = {
            let e = Arc::clone(&e);
            let session = Arc::clone(&session);
            tokio::spawn(async move { e.activate(ch(1), &session).await })
        };
        sleep(Duration::from_secs(10)).await;
        clock.set(NOW + time::Duration::hours(25));

        // First pulse ends at 300s; the next iteration sees the stale record.
        sleep(Duration::from_secs(400)).await;
        e.deactivate().await;
        let out = task.await.unwrap().unwrap();

        assert_eq!(out, ControlOutcome::CycleStopped { pulses: 1 });
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            session::lock(&session).forecast.unwrap().rain_probability_percent,
            Some(95)
        );
        assert_eq!(writes(&e).len(), 2);
    }

    // -- Settings ------------------------------------------------------------

    #[tokio::test]
    async fn settings_store_profile_and_forecast() {
        let e = engine(300, Some(35));
        let session = SharedSession::default();

        let summary = e.submit_settings("garlic", " 2000 ", &session).await.unwrap();

        assert_eq!(
            summary,
            SettingsSummary {
                sensor_threshold: 500,
                runtime_secs: 300,
                postcode: "2000".into(),
            }
        );
        let s = session::lock(&session);
        assert_eq!(s.sensor_threshold, Some(500));
        assert_eq!(s.runtime_secs, Some(300));
        assert_eq!(s.forecast, Some(ForecastRecord::new(Some(35), NOW)));
    }

    #[tokio::test]
    async fn unknown_crop_writes_nothing() {
        let provider = Arc::new(StubProvider::new(Some(35)));
        let e = engine_with(ScriptedBus::constant(300), Arc::clone(&provider));
        let session = SharedSession::default();

        let err = e.submit_settings("kale", "2000", &session).await.unwrap_err();

        assert!(matches!(err, EngineError::UnknownCrop(ref c) if c == "kale"));
        let s = session::lock(&session);
        assert!(s.sensor_threshold.is_none());
        assert!(s.runtime_secs.is_none());
        assert!(s.postcode.is_none());
        assert!(s.forecast.is_none());
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    // -- Shutdown -------------------------------------------------------------

    #[tokio::test]
    async fn shutdown_clears_flag_and_closes_valves() {
        let e = engine(300, Some(10));
        let session = garlic_session(None);
        e.submit_control("1", Action::On, &session).await.unwrap();
        e.submit_control("2", Action::On, &session).await.unwrap();

        e.shutdown().await;

        assert!(!e.is_active());
        assert!(!e.hardware().relay_is_on(ch(1)));
        assert!(!e.hardware().relay_is_on(ch(2)));
    }
}
