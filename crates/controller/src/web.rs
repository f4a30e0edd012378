use anyhow::{Context, Result};
use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::engine::{Action, ControlOutcome, Engine};
use crate::policy::{self, CropProfile};
use crate::session::{self, Session, SessionStore, SharedSession};
use crate::state::{EventKind, SharedState, StatusResponse};

const SESSION_COOKIE: &str = "sessionid";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: Arc<SessionStore>,
    pub state: SharedState,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/settings", get(settings))
        .route("/submit_settings", post(submit_settings))
        .route("/submit", post(submit))
        .route("/reactivate", post(reactivate))
        .route("/api/status", get(api_status))
        .with_state(app)
}

#[derive(Serialize)]
struct ControlView {
    status: StatusResponse,
    session: Session,
}

#[derive(Serialize)]
struct SettingsView {
    crops: Vec<CropProfile>,
    session: Session,
}

#[derive(Deserialize)]
struct SettingsForm {
    vegetables: String,
    postcode: String,
}

#[derive(Deserialize)]
struct ControlForm {
    relay: String,
    action: String,
}

async fn index(State(app): State<AppState>, headers: HeaderMap) -> Response {
    let caller = Caller::resolve(&app, &headers);
    let session = session::lock(&caller.session).clone();

    // Nothing to control until the caller has chosen a crop and postcode.
    if session.postcode.is_none() {
        return caller.respond(Redirect::to("/settings"));
    }

    let status = status(&app).await;
    caller.respond(Json(ControlView { status, session }))
}

async fn settings(State(app): State<AppState>, headers: HeaderMap) -> Response {
    let caller = Caller::resolve(&app, &headers);
    let session = session::lock(&caller.session).clone();
    caller.respond(Json(SettingsView {
        crops: policy::all(),
        session,
    }))
}

async fn submit_settings(
    State(app): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<SettingsForm>,
) -> Response {
    let caller = Caller::resolve(&app, &headers);

    match app
        .engine
        .submit_settings(&form.vegetables, &form.postcode, &caller.session)
        .await
    {
        Ok(_) => caller.respond(Redirect::to("/")),
        Err(e) => {
            warn!("settings rejected: {e}");
            record_error(&app, e.to_string()).await;
            caller.respond(Redirect::to("/settings"))
        }
    }
}

async fn submit(
    State(app): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ControlForm>,
) -> Response {
    let caller = Caller::resolve(&app, &headers);

    let action = match form.action.parse::<Action>() {
        Ok(a) => a,
        Err(e) => {
            warn!("control rejected: {e}");
            record_error(&app, e.to_string()).await;
            return caller.respond(Redirect::to("/"));
        }
    };

    // A cycle runs until deactivation, so it cannot hold the request open.
    if action == Action::Activate {
        if let Err(e) = spawn_activation(&app, &form.relay, &caller.session) {
            warn!("activation rejected: {e}");
            record_error(&app, e.to_string()).await;
        }
        return caller.respond(Redirect::to("/"));
    }

    match app
        .engine
        .submit_control(&form.relay, action, &caller.session)
        .await
    {
        Ok(ControlOutcome::ShowSettings) => caller.respond(Redirect::to("/settings")),
        Ok(_) => caller.respond(Redirect::to("/")),
        Err(e) => {
            warn!("control rejected: {e}");
            record_error(&app, e.to_string()).await;
            caller.respond(Redirect::to("/"))
        }
    }
}

fn spawn_activation(
    app: &AppState,
    relay: &str,
    session: &SharedSession,
) -> Result<(), crate::error::EngineError> {
    let channel = app.engine.channel(relay)?;
    let engine = Arc::clone(&app.engine);
    let session = Arc::clone(session);
    let state = Arc::clone(&app.state);

    tokio::spawn(async move {
        match engine.activate(channel, &session).await {
            Ok(outcome) => info!(%channel, ?outcome, "activation finished"),
            Err(e) => {
                warn!(%channel, "activation rejected: {e}");
                state.write().await.record(EventKind::Error, e.to_string());
            }
        }
    });
    Ok(())
}

async fn reactivate(State(app): State<AppState>) -> Redirect {
    app.engine.reactivate().await;
    Redirect::to("/")
}

async fn api_status(State(app): State<AppState>) -> Json<StatusResponse> {
    Json(status(&app).await)
}

async fn status(app: &AppState) -> StatusResponse {
    let relays = app.engine.relay_snapshot();
    let cycles = app.engine.cycles();
    app.state
        .read()
        .await
        .to_status(app.engine.is_active(), app.sessions.len(), relays, cycles)
}

async fn record_error(app: &AppState, detail: String) {
    app.state.write().await.record(EventKind::Error, detail);
}

// ---------------------------------------------------------------------------
// Session cookie
// ---------------------------------------------------------------------------

struct Caller {
    id: String,
    session: SharedSession,
    is_new: bool,
}

impl Caller {
    fn resolve(app: &AppState, headers: &HeaderMap) -> Self {
        let presented = session_cookie(headers);
        let (id, session) = app.sessions.get_or_create(presented);
        let is_new = presented != Some(id.as_str());
        Self {
            id,
            session,
            is_new,
        }
    }

    /// Attach a `Set-Cookie` when the caller was issued a new session.
    fn respond(&self, body: impl IntoResponse) -> Response {
        let mut resp = body.into_response();
        if self.is_new {
            let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", self.id);
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                resp.headers_mut().insert(header::SET_COOKIE, v);
            }
        }
        resp
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then_some(value)
        })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
