//! Drives a whole session from a recorded sample file.
//!
//! Simulated time follows the sample timestamps: the engine runs on a
//! [`ManualClock`] that is moved to each sample before it is posted, and
//! ticks are issued by hand. After the last sample the session is stopped
//! and time keeps advancing until every upload, including the completion
//! call, has reached the backend.

use chrono::{DateTime, Duration, Utc};
use fs_err as fs;
use ruck_session_engine::{
    load_engine_config, Collaborators, EngineHandle, EngineMessage, HeartRateSample,
    HeartRateSourceKind, LocationSample, ManualClock, SessionBackend, SessionEngine,
    SessionState, SessionStatus, StorageConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::{debug, info};

use crate::backend::{DeliveryCounts, LoggingBackend, Outage};
use crate::error::RuckdError;

const DRAIN_STEP_SECS: i64 = 5;
const DRAIN_LIMIT_SECS: i64 = 3_600;
const WORKER_POLL_MS: u64 = 5;
const SETTLE: StdDuration = StdDuration::from_millis(15);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayFile {
    pub ruck_weight_kg: Option<f64>,
    pub user_weight_kg: Option<f64>,
    pub locations: Vec<LocationSample>,
    pub heart_rates: Vec<HeartRateSample>,
}

impl ReplayFile {
    pub fn load(path: &Path) -> Result<Self, RuckdError> {
        let content = fs::read_to_string(path).map_err(|source| RuckdError::ReadReplay {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ReplayFile =
            serde_json::from_str(&content).map_err(|source| RuckdError::ParseReplay {
                path: path.to_path_buf(),
                source,
            })?;
        if file.locations.is_empty() && file.heart_rates.is_empty() {
            return Err(RuckdError::EmptyReplay(path.to_path_buf()));
        }
        Ok(file)
    }

    /// Samples of both kinds in timestamp order.
    fn timeline(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .locations
            .iter()
            .cloned()
            .map(Event::Location)
            .chain(self.heart_rates.iter().cloned().map(Event::HeartRate))
            .collect();
        events.sort_by_key(Event::at);
        events
    }
}

enum Event {
    Location(LocationSample),
    HeartRate(HeartRateSample),
}

impl Event {
    fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Location(sample) => sample.timestamp,
            Event::HeartRate(sample) => sample.timestamp,
        }
    }

    fn into_message(self) -> EngineMessage {
        match self {
            Event::Location(sample) => EngineMessage::Location(sample),
            Event::HeartRate(sample) => EngineMessage::HeartRate {
                source: HeartRateSourceKind::Local,
                sample,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub file: PathBuf,
    pub ruck_weight_kg: Option<f64>,
    pub user_weight_kg: Option<f64>,
    /// Seconds after the first sample at which the backend goes down.
    pub outage_from_secs: Option<i64>,
    pub outage_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub elapsed_secs: i64,
    pub distance_km: f64,
    pub calories_burned: f64,
    pub elevation_gain_m: f64,
    pub samples_replayed: usize,
    pub delivered: DeliveryCounts,
    pub pending_uploads: usize,
}

pub fn run(options: &ReplayOptions, storage: &StorageConfig) -> Result<ReplaySummary, RuckdError> {
    let replay = ReplayFile::load(&options.file)?;
    let timeline = replay.timeline();
    let first_at = timeline.first().map(Event::at).unwrap_or_else(Utc::now);

    let mut config = load_engine_config(Some(&storage.config_file()))?;
    config.lifecycle.auto_tick = false;
    config.location.reorder_window_ms = 0;
    config.upload.worker_poll_ms = WORKER_POLL_MS;

    let clock = Arc::new(ManualClock::new(first_at));
    let outage = options.outage_from_secs.map(|from| {
        Outage::new(
            first_at + Duration::seconds(from),
            Duration::seconds(options.outage_secs),
        )
    });
    let backend = Arc::new(LoggingBackend::new(clock.clone(), outage));
    let shared: Arc<dyn SessionBackend> = backend.clone();

    let collaborators = Collaborators::new(shared, storage.session_db()).with_clock(clock.clone());
    let engine = SessionEngine::spawn(config, collaborators)?;

    if let Some(session) = engine.recover() {
        let label = session
            .session_id
            .map(|session_id| session_id.to_string())
            .unwrap_or_else(|| session.state.to_string());
        return Err(RuckdError::SessionInProgress(label));
    }

    let ruck = options
        .ruck_weight_kg
        .or(replay.ruck_weight_kg)
        .unwrap_or(20.0);
    let user = options
        .user_weight_kg
        .or(replay.user_weight_kg)
        .unwrap_or(80.0);
    let handle = engine.request_start(ruck, user, None)?;
    info!(session_id = %handle.session_id, samples = timeline.len(), "Replay started");

    let samples_replayed = timeline.len();
    let inbox = engine.sender();
    for event in timeline {
        clock.set(event.at());
        if inbox.send(event.into_message()).is_err() {
            break;
        }
        engine.tick();
    }
    engine.sync();

    engine.stop(true);
    let status = drain(&engine, &clock, &backend)?;

    Ok(ReplaySummary {
        session_id: status.session_id.map(|session_id| session_id.to_string()),
        state: status.state,
        elapsed_secs: status.elapsed_secs,
        distance_km: status.distance_km,
        calories_burned: status.calories_burned,
        elevation_gain_m: status.elevation_gain_m,
        samples_replayed,
        delivered: backend.counts(),
        pending_uploads: status.pending_uploads,
    })
}

/// Advances simulated time until the session is completed and the backend
/// has everything, or the drain limit passes.
fn drain(
    engine: &EngineHandle,
    clock: &ManualClock,
    backend: &LoggingBackend,
) -> Result<SessionStatus, RuckdError> {
    let mut waited = 0;
    loop {
        thread::sleep(SETTLE);
        let status = engine.sync();
        let done = status.state == SessionState::Completed
            && status.pending_uploads == 0
            && backend.counts().completion.is_some();
        if done {
            return Ok(status);
        }
        if waited >= DRAIN_LIMIT_SECS {
            return Err(RuckdError::CompletionStalled(waited));
        }
        debug!(waited, pending = status.pending_uploads, state = %status.state, "Draining");
        clock.advance(Duration::seconds(DRAIN_STEP_SECS));
        waited += DRAIN_STEP_SECS;
        engine.tick();
    }
}
