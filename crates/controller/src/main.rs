mod adc;
mod config;
mod engine;
mod error;
mod forecast;
mod hardware;
mod policy;
mod provider;
mod relay;
mod session;
mod state;
mod web;

use anyhow::Result;
use std::env;
use std::sync::Arc;
use time::error::IndeterminateOffset;
use time::UtcOffset;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::Engine;
use forecast::SystemClock;
use hardware::Hardware;
use provider::WillyWeather;
use session::SessionStore;
use state::{EventKind, SystemState};
use web::AppState;

fn main() -> Result<()> {
    // The local offset can only be read soundly while the process is still
    // single-threaded, so resolve it before the runtime starts.
    let local_offset = UtcOffset::current_local_offset();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(local_offset))
}

async fn run(local_offset: Result<UtcOffset, IndeterminateOffset>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let local_offset = local_offset.unwrap_or_else(|e| {
        warn!("local utc offset unavailable, forecast dates will use UTC: {e}");
        UtcOffset::UTC
    });
    info!(%local_offset, "clock offset resolved");

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let api_key = env::var("FORECAST_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("FORECAST_API_KEY not set, forecasts will be unknown and never block watering");
    }

    // ── Hardware (all relays driven OFF on open) ────────────────────
    let hardware = Hardware::open(&cfg, active_low)?;

    // ── Shared state (ephemeral, for the control view) ──────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record(EventKind::System, "controller started".to_string());

    let engine = Arc::new(Engine::new(
        hardware,
        Arc::new(WillyWeather::new(&cfg.forecast, api_key)),
        Arc::new(SystemClock::new(local_offset)),
        cfg.timing(),
        Arc::clone(&shared),
    ));

    // ── Web server (runs until Ctrl-C / SIGTERM) ────────────────────
    let app = AppState {
        engine: Arc::clone(&engine),
        sessions: Arc::new(SessionStore::new()),
        state: shared,
    };
    let served = web::serve(app, shutdown_signal()).await;

    // Fail-safe: stop every cycle and close every valve before exiting.
    engine.shutdown().await;
    info!("controller stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
