//! Caller-owned session storage.
//!
//! Each browser session carries the values the engine reads back: sensor
//! threshold, runtime, postcode and the cached forecast. Sessions live in
//! memory only and are keyed by the `sessionid` cookie.

use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::forecast::ForecastRecord;
use crate::policy::CropProfile;

/// Fallbacks used when a session has never submitted settings. Both sit far
/// outside realistic ADC / duration ranges and are kept as documented.
pub const DEFAULT_SENSOR_THRESHOLD: u32 = 2000;
pub const DEFAULT_RUNTIME_SECS: u64 = 120;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Session {
    pub sensor_threshold: Option<u32>,
    pub runtime_secs: Option<u64>,
    pub postcode: Option<String>,
    pub forecast: Option<ForecastRecord>,
}

impl Session {
    pub fn sensor_threshold(&self) -> u32 {
        self.sensor_threshold.unwrap_or(DEFAULT_SENSOR_THRESHOLD)
    }

    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs.unwrap_or(DEFAULT_RUNTIME_SECS))
    }

    /// Replace the cached forecast wholesale.
    pub fn store_forecast(&mut self, record: ForecastRecord) {
        self.forecast = Some(record);
    }

    pub fn apply_settings(&mut self, profile: &CropProfile, postcode: String) {
        self.sensor_threshold = Some(profile.sensor_threshold);
        self.runtime_secs = Some(profile.runtime_secs);
        self.postcode = Some(postcode);
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Lock a session, recovering from a poisoned lock (the data is plain values).
pub fn lock(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Sessions not seen for this long are dropped when a new one is created.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Hard ceiling on live sessions; the least recently seen go first.
pub const MAX_SESSIONS: usize = 1024;

struct Entry {
    session: SharedSession,
    last_seen: Instant,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Entry>>,
    idle_ttl: Duration,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_limits(SESSION_IDLE_TTL, MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(idle_ttl: Duration, capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
            capacity: capacity.max(1),
        }
    }

    /// Return the session for `id`, or start a new one under a fresh id.
    /// Creating a session first evicts idle ones.
    pub fn get_or_create(&self, id: Option<&str>) -> (String, SharedSession) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(id) = id {
            if let Some(entry) = sessions.get_mut(id) {
                if now.duration_since(entry.last_seen) < self.idle_ttl {
                    entry.last_seen = now;
                    return (id.to_string(), Arc::clone(&entry.session));
                }
            }
        }

        self.evict(&mut sessions, now);

        let id = new_session_id();
        let session = SharedSession::default();
        sessions.insert(
            id.clone(),
            Entry {
                session: Arc::clone(&session),
                last_seen: now,
            },
        );
        tracing::debug!(session = %id, live = sessions.len(), "session created");
        (id, session)
    }

    /// Drop idle sessions, then the least recently seen until a new one fits.
    fn evict(&self, sessions: &mut HashMap<String, Entry>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, e| now.duration_since(e.last_seen) < self.idle_ttl);

        while sessions.len() >= self.capacity {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => sessions.remove(&id),
                None => break,
            };
        }

        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, live = sessions.len(), "idle sessions evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// 128 bits from the OS generator; the id is the only thing guarding a session.
fn new_session_id() -> String {
    format!("{:032x}", OsRng.gen::<u128>())
}

// ===========================================================================
// Tests
// ===========================================================================
