//! Session lifecycle controller.
//!
//! The controller is the single writer of [`Session`]. It runs on the engine's
//! actor thread and reacts to [`EngineMessage`]s in arrival order; every other
//! component only ever talks to it through the inbox. Side effects that may
//! block (backend calls) happen on other threads and report back as messages.

use chrono::{DateTime, Duration, Utc};
use ruck_companion_protocol::{
    CommandBody, CompanionCommand, HandheldMessage, ReasonCode, StartSessionPayload,
    StateMirror,
};
use std::mem;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::backend::{CompletionAggregates, CreateSessionPayload, SessionBackend};
use crate::clock::Clock;
use crate::companion::{Admission, CompanionChannel};
use crate::config::EngineConfig;
use crate::error::{CompanionError, IngestionFault, StartError};
use crate::health::{fill_gaps, GapTracker, HealthSource};
use crate::heart_rate::{HeartRateArbiter, HeartRateSourceKind};
use crate::location::{LocationControl, TrackingMode};
use crate::message::{EngineMessage, StartReply};
use crate::metrics::{pace_min_per_km, EnergyInput, EnergyModel, RouteMetrics};
use crate::resource::{Directive, MemoryPressure};
use crate::status::{Degradation, SessionStatus, StatusBoard};
use crate::store::{PersistedSnapshot, SessionStore, SnapshotWriter};
use crate::types::{
    HeartRateSample, LocationSample, Session, SessionHandle, SessionId, SessionState,
    StartParams,
};
use crate::upload::{UploadReport, UploadShared};

/// Everything the controller needs, assembled by the engine.
pub(crate) struct ControllerParts {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub backend: Arc<dyn SessionBackend>,
    pub store: SessionStore,
    pub writer: SnapshotWriter,
    pub uploads: Arc<UploadShared>,
    pub status: Arc<StatusBoard>,
    pub location: Arc<dyn LocationControl>,
    pub companion: Option<CompanionChannel>,
    pub health: Option<Box<dyn HealthSource>>,
    pub energy: Box<dyn EnergyModel>,
    pub inbox: Sender<EngineMessage>,
}

struct PendingStart {
    attempt: u64,
    deadline: DateTime<Utc>,
    waiters: Vec<StartReply>,
    companion_ids: Vec<String>,
    timed_out: bool,
}

pub(crate) struct SessionController {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn SessionBackend>,
    store: SessionStore,
    writer: SnapshotWriter,
    uploads: Arc<UploadShared>,
    status: Arc<StatusBoard>,
    location: Arc<dyn LocationControl>,
    companion: Option<CompanionChannel>,
    health: Option<Box<dyn HealthSource>>,
    energy: Box<dyn EnergyModel>,
    inbox: Sender<EngineMessage>,

    session: Option<Session>,
    route: RouteMetrics,
    arbiter: HeartRateArbiter,
    gaps: GapTracker,
    attempts: u64,
    pending_start: Option<PendingStart>,
    completion_deadline: Option<DateTime<Utc>>,
    elapsed_high_water: Duration,
    pressure: MemoryPressure,
    tracking_mode: TrackingMode,
    degraded: Degradation,
    last_error: Option<String>,
    last_location_at: Option<DateTime<Utc>>,
    rebase_next: bool,
    dirty: bool,
    last_snapshot_at: Option<DateTime<Utc>>,
    recovered: bool,
}

impl SessionController {
    pub fn new(parts: ControllerParts) -> Self {
        let pace_window = Duration::seconds(parts.config.lifecycle.pace_window_secs);
        let gap_threshold = Duration::seconds(parts.config.heart_rate.gap_fill_threshold_secs);
        let arbiter = HeartRateArbiter::new(&parts.config.heart_rate);
        let tracking_mode = parts.config.location.preferred_mode;

        Self {
            config: parts.config,
            clock: parts.clock,
            backend: parts.backend,
            store: parts.store,
            writer: parts.writer,
            uploads: parts.uploads,
            status: parts.status,
            location: parts.location,
            companion: parts.companion,
            health: parts.health,
            energy: parts.energy,
            inbox: parts.inbox,
            session: None,
            route: RouteMetrics::new(pace_window),
            arbiter,
            gaps: GapTracker::new(gap_threshold),
            attempts: 0,
            pending_start: None,
            completion_deadline: None,
            elapsed_high_water: Duration::zero(),
            pressure: MemoryPressure::Normal,
            tracking_mode,
            degraded: Degradation::default(),
            last_error: None,
            last_location_at: None,
            rebase_next: false,
            dirty: false,
            last_snapshot_at: None,
            recovered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |session| session.state)
    }

    /// Handles one inbox message and republishes status.
    pub fn handle(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Recover(reply) => {
                let restored = self.recover();
                let _ = reply.send(restored);
            }
            EngineMessage::Start { params, reply } => self.handle_start(params, reply),
            EngineMessage::Pause => {
                self.pause();
            }
            EngineMessage::Resume => {
                self.resume();
            }
            EngineMessage::Stop { finalize } => self.stop(finalize),
            EngineMessage::Tick => self.tick(),
            EngineMessage::StartResolved { attempt, result } => {
                self.handle_start_resolved(attempt, result)
            }
            EngineMessage::Location(sample) => self.handle_location(sample),
            EngineMessage::LocationFault(fault) => self.handle_location_fault(fault),
            EngineMessage::HeartRate { source, sample } => self.handle_heart_rate(source, sample),
            EngineMessage::HeartRateFault { source, fault } => {
                warn!(source = source.as_str(), fault = %fault, "Heart-rate source degraded");
                self.degraded.heart_rate_fault = Some(fault);
            }
            EngineMessage::Companion(command) => self.handle_companion(command),
            EngineMessage::CompanionInvalid { command_id, error } => {
                self.send_companion(HandheldMessage::CommandRejected { command_id, error });
            }
            EngineMessage::CompanionReachability(reachable) => {
                if let Some(channel) = self.companion.as_mut() {
                    channel.set_reachable(reachable);
                }
            }
            EngineMessage::Resource(directive) => self.handle_directive(directive),
            EngineMessage::UploadProgress(report) => self.handle_upload_progress(report),
            EngineMessage::PersistenceFailed(reason) => self.handle_persistence_failure(reason),
            EngineMessage::Sync(reply) => {
                self.writer.flush();
                let _ = reply.send(self.build_status(self.clock.now()));
            }
            EngineMessage::Shutdown => self.shutdown(),
        }
        self.publish();
    }

    /// Writes a final snapshot and waits for it to reach disk. A live session
    /// stays in the snapshot so the next process can recover it.
    pub fn shutdown(&mut self) {
        let now = self.clock.now();
        self.location.set_enabled(false);
        self.persist(now);
        self.writer.flush();
        info!(state = %self.state(), "Session controller stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════════

    fn recover(&mut self) -> Option<Session> {
        if self.recovered {
            warn!("Recovery already ran; ignoring");
            return self.session.clone();
        }
        self.recovered = true;
        let now = self.clock.now();

        let snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable snapshot");
                None
            }
        };
        let Some(snapshot) = snapshot else {
            info!("No snapshot found; engine idle");
            return None;
        };

        let lanes = snapshot.uploads;
        self.uploads.update(|coordinator| coordinator.restore(lanes));

        let restored = match snapshot.session {
            None => None,
            Some(session) => match session.state {
                SessionState::Active | SessionState::Paused | SessionState::Recovered => {
                    Some(self.resume_recovered(session, now))
                }
                SessionState::Completing => Some(self.complete_recovered(session, now)),
                SessionState::Starting
                | SessionState::Idle
                | SessionState::Completed
                | SessionState::Discarded => {
                    info!(state = %session.state, "Dropping unconfirmed session from snapshot");
                    None
                }
            },
        };

        self.persist(now);
        restored
    }

    fn resume_recovered(&mut self, mut session: Session, now: DateTime<Utc>) -> Session {
        let settled = if session.paused_at.is_some() {
            SessionState::Paused
        } else {
            SessionState::Active
        };

        session.state = SessionState::Recovered;
        self.session = Some(session.clone());
        self.publish();

        session.state = settled;
        self.route = RouteMetrics::resume_from(
            Duration::seconds(self.config.lifecycle.pace_window_secs),
            session.last_location.clone(),
            session.total_distance_km,
        );
        self.last_location_at = session.last_location.as_ref().map(|fix| fix.timestamp);
        self.elapsed_high_water = Duration::zero();
        self.gaps.reset();
        if settled == SessionState::Active {
            self.gaps.open(now);
        }
        info!(
            session_id = ?session.session_id,
            state = %settled,
            distance_km = session.total_distance_km,
            "Session recovered"
        );
        self.session = Some(session.clone());
        self.location.set_enabled(true);
        self.apply_tracking_mode();
        // The companion keeps streaming across a handheld restart; reopen
        // the gate without asking it for a new handshake.
        if let Some(session_id) = session.session_id.as_ref() {
            self.announce_session(session_id);
            self.push_mirror(now, true);
        }
        session
    }

    fn complete_recovered(&mut self, mut session: Session, now: DateTime<Utc>) -> Session {
        if session.ended_at.is_none() {
            session.end(now);
        }
        session.state = SessionState::Completed;
        self.session = Some(session.clone());

        if let Some(session_id) = session.session_id.clone() {
            let queued = self.uploads.read(|coordinator| {
                coordinator
                    .lane(&session_id)
                    .map_or(false, |lane| lane.completion.is_some())
            });
            if !queued {
                if let Some(aggregates) = self.completion_aggregates(now) {
                    let grace = Duration::seconds(self.config.upload.stop_grace_secs);
                    self.uploads.update(|coordinator| {
                        coordinator.queue_completion(&session_id, aggregates, now + grace)
                    });
                }
            }
        }
        info!(session_id = ?session.session_id, "Recovered a completing session; finishing delivery in background");
        session
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Start
    // ═══════════════════════════════════════════════════════════════════════════

    fn handle_start(&mut self, params: StartParams, reply: Option<StartReply>) {
        if !self.state().is_quiescent() {
            debug!(state = %self.state(), "Start rejected; session in progress");
            if let Some(reply) = reply {
                let _ = reply.send(Err(StartError::AlreadyActive));
            }
            return;
        }
        if let Err(err) = params.validate() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }
        self.begin_start(params, reply, None);
    }

    fn companion_start(&mut self, command_id: String, payload: StartSessionPayload) {
        let state = self.state();
        if !state.is_quiescent() {
            let reason_code = match state {
                SessionState::Starting | SessionState::Completing | SessionState::Recovered => {
                    ReasonCode::Busy
                }
                _ => ReasonCode::AlreadyActive,
            };
            self.reply_companion(
                &command_id,
                HandheldMessage::SessionStartFailed {
                    command_id: command_id.clone(),
                    reason_code,
                },
            );
            return;
        }

        let params = StartParams {
            ruck_weight_kg: payload.ruck_weight_kg,
            user_weight_kg: payload.user_weight_kg,
            planned_route_id: None,
        };
        if let Err(err) = params.validate() {
            self.reply_companion(
                &command_id,
                HandheldMessage::SessionStartFailed {
                    command_id: command_id.clone(),
                    reason_code: reason_for(&err),
                },
            );
            return;
        }
        self.begin_start(params, None, Some(command_id));
    }

    fn begin_start(
        &mut self,
        params: StartParams,
        reply: Option<StartReply>,
        companion_id: Option<String>,
    ) {
        let now = self.clock.now();
        self.attempts += 1;
        let attempt = self.attempts;
        // Starting fresh supersedes whatever an earlier process left behind.
        self.recovered = true;

        self.session = Some(Session::provisional(&params, now));
        self.route = RouteMetrics::new(Duration::seconds(self.config.lifecycle.pace_window_secs));
        self.arbiter = HeartRateArbiter::new(&self.config.heart_rate);
        self.gaps.reset();
        self.elapsed_high_water = Duration::zero();
        self.last_location_at = None;
        self.rebase_next = false;
        self.completion_deadline = None;
        self.degraded.location_fault = None;
        self.degraded.heart_rate_fault = None;
        self.degraded.heart_rate_source = None;
        self.degraded.heart_rate_fallback = false;
        self.last_error = None;

        let timeout = Duration::milliseconds(self.config.lifecycle.start_timeout_ms as i64);
        self.pending_start = Some(PendingStart {
            attempt,
            deadline: now + timeout,
            waiters: reply.into_iter().collect(),
            companion_ids: companion_id.into_iter().collect(),
            timed_out: false,
        });
        info!(
            attempt,
            ruck_weight_kg = params.ruck_weight_kg,
            user_weight_kg = params.user_weight_kg,
            "Session starting"
        );

        // The provisional snapshot must be on disk before the backend call.
        self.persist(now);
        self.writer.flush();

        let backend = Arc::clone(&self.backend);
        let inbox = self.inbox.clone();
        let payload = CreateSessionPayload::from_params(&params, now);
        thread::spawn(move || {
            let result = backend.create_session(&payload);
            let _ = inbox.send(EngineMessage::StartResolved { attempt, result });
        });
    }

    fn handle_start_resolved(&mut self, attempt: u64, result: Result<SessionId, StartError>) {
        let current = self.state() == SessionState::Starting
            && self
                .pending_start
                .as_ref()
                .map_or(false, |pending| pending.attempt == attempt);
        if !current {
            match &result {
                Ok(session_id) => warn!(
                    attempt,
                    session_id = %session_id,
                    "Backend session created for a superseded start; ignoring"
                ),
                Err(err) => debug!(attempt, error = %err, "Superseded start failed"),
            }
            return;
        }
        let Some(pending) = self.pending_start.take() else {
            return;
        };
        let now = self.clock.now();

        match result {
            Ok(session_id) => {
                if let Some(session) = self.session.as_mut() {
                    session.session_id = Some(session_id.clone());
                    session.started_at = Some(now);
                    session.state = SessionState::Active;
                }
                self.gaps.open(now);
                self.location.set_enabled(true);
                self.apply_tracking_mode();
                info!(
                    session_id = %session_id,
                    attempt,
                    late = pending.timed_out,
                    "Session active"
                );

                let handle = SessionHandle {
                    session_id: session_id.clone(),
                    started_at: now,
                };
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(handle.clone()));
                }

                // A start the companion did not ask for (or already gave up
                // on) is still announced so it begins streaming.
                if pending.companion_ids.is_empty() {
                    self.announce_session(&session_id);
                }
                for command_id in pending.companion_ids {
                    self.reply_companion(
                        &command_id,
                        HandheldMessage::StartConfirmed {
                            command_id: command_id.clone(),
                            session_id: session_id.to_string(),
                        },
                    );
                }
                self.persist(now);
            }
            Err(err) => {
                warn!(attempt, error = %err, "Session start failed");
                self.session = None;
                self.last_error = Some(err.to_string());
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                for command_id in pending.companion_ids {
                    self.reply_companion(
                        &command_id,
                        HandheldMessage::SessionStartFailed {
                            command_id: command_id.clone(),
                            reason_code: reason_for(&err),
                        },
                    );
                }
                self.persist(now);
            }
        }
    }

    fn check_start_deadline(&mut self, now: DateTime<Utc>) {
        let (waiters, command_ids) = match self.pending_start.as_mut() {
            Some(pending) if !pending.timed_out && now >= pending.deadline => {
                pending.timed_out = true;
                (
                    mem::take(&mut pending.waiters),
                    mem::take(&mut pending.companion_ids),
                )
            }
            _ => return,
        };
        warn!("Session start timed out; still waiting for the backend in the background");
        for waiter in waiters {
            let _ = waiter.send(Err(StartError::Timeout));
        }
        for command_id in command_ids {
            self.reply_companion(
                &command_id,
                HandheldMessage::SessionStartFailed {
                    command_id: command_id.clone(),
                    reason_code: ReasonCode::Timeout,
                },
            );
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Pause / resume / stop
    // ═══════════════════════════════════════════════════════════════════════════

    fn pause(&mut self) -> bool {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != SessionState::Active {
            debug!(state = %session.state, "Pause ignored");
            return false;
        }
        session.pause(now);
        self.gaps.close(now);
        info!(session_id = ?session.session_id, "Session paused");
        self.push_mirror(now, true);
        self.persist(now);
        true
    }

    fn resume(&mut self) -> bool {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != SessionState::Paused {
            debug!(state = %session.state, "Resume ignored");
            return false;
        }
        session.resume(now);
        info!(
            session_id = ?session.session_id,
            paused_secs = session.accumulated_paused().num_seconds(),
            "Session resumed"
        );
        self.gaps.open(now);
        // Movement while paused is not part of the route.
        self.rebase_next = true;
        self.push_mirror(now, true);
        self.persist(now);
        true
    }

    fn stop(&mut self, finalize: bool) {
        let now = self.clock.now();
        match self.state() {
            SessionState::Starting => self.abandon_start(now),
            SessionState::Active | SessionState::Paused | SessionState::Recovered => {
                if finalize {
                    self.begin_completion(now);
                } else {
                    self.discard(now);
                }
            }
            SessionState::Completing => debug!("Stop ignored; already completing"),
            SessionState::Idle | SessionState::Completed | SessionState::Discarded => {
                debug!("Stop ignored; no session")
            }
        }
    }

    fn abandon_start(&mut self, now: DateTime<Utc>) {
        if let Some(pending) = self.pending_start.take() {
            info!(attempt = pending.attempt, "Start abandoned");
            // Dropping the UI waiters wakes them; the handle reports a timeout.
            for command_id in pending.companion_ids {
                self.reply_companion(
                    &command_id,
                    HandheldMessage::SessionStartFailed {
                        command_id: command_id.clone(),
                        reason_code: ReasonCode::Unknown,
                    },
                );
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.state = SessionState::Discarded;
        }
        self.persist(now);
    }

    fn begin_completion(&mut self, now: DateTime<Utc>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.end(now);
        session.state = SessionState::Completing;
        let session_id = session.session_id.clone();

        self.gaps.close(now);
        self.location.set_enabled(false);
        self.refresh_calories(now);
        self.fill_heart_rate_gaps(session_id.as_ref());

        let grace = Duration::seconds(self.config.upload.stop_grace_secs);
        match (session_id, self.completion_aggregates(now)) {
            (Some(session_id), Some(aggregates)) => {
                info!(
                    session_id = %session_id,
                    distance_km = aggregates.distance_km,
                    duration_secs = aggregates.duration_seconds,
                    "Session completing"
                );
                self.uploads.update(|coordinator| {
                    coordinator.queue_completion(&session_id, aggregates, now + grace)
                });
                self.completion_deadline = Some(now + grace);
                self.push_mirror(now, true);
                self.persist(now);
            }
            _ => self.finish_completion(now),
        }
    }

    fn check_completion(&mut self, now: DateTime<Utc>) {
        if self.state() != SessionState::Completing {
            return;
        }
        let drained = self
            .session
            .as_ref()
            .and_then(|session| session.session_id.clone())
            .map_or(true, |session_id| {
                self.uploads
                    .read(|coordinator| coordinator.is_lane_drained(&session_id))
            });
        let expired = self.completion_deadline.map_or(true, |deadline| now >= deadline);
        if drained || expired {
            self.finish_completion(now);
        }
    }

    fn finish_completion(&mut self, now: DateTime<Utc>) {
        self.completion_deadline = None;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.state = SessionState::Completed;
        let session_id = session.session_id.clone();
        let pending = session_id.as_ref().map_or(0, |session_id| {
            self.uploads.read(|coordinator| {
                coordinator
                    .lane(session_id)
                    .map_or(0, |lane| lane.pending_samples())
            })
        });
        info!(
            session_id = ?session_id,
            pending_uploads = pending,
            "Session completed"
        );
        self.push_mirror(now, true);
        self.persist(now);
    }

    fn discard(&mut self, now: DateTime<Utc>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.state = SessionState::Discarded;
        let session_id = session.session_id.clone();
        self.location.set_enabled(false);
        self.gaps.reset();
        self.completion_deadline = None;

        if let Some(session_id) = &session_id {
            let grace = Duration::seconds(self.config.upload.stop_grace_secs);
            self.uploads
                .update(|coordinator| coordinator.cancel_after(session_id, now + grace));
        }
        info!(session_id = ?session_id, "Session discarded");
        self.push_mirror(now, true);
        self.persist(now);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Tick
    // ═══════════════════════════════════════════════════════════════════════════

    fn tick(&mut self) {
        let now = self.clock.now();
        if let Some(channel) = self.companion.as_mut() {
            channel.cache().prune(now);
        }
        self.check_start_deadline(now);
        self.check_completion(now);
        self.apply_tracking_mode();
        self.update_heart_rate_health(now);

        match self.state() {
            SessionState::Active => {
                let elapsed = self.elapsed(now);
                self.elapsed_high_water = elapsed;
                self.refresh_calories(now);
                self.dirty = true;
                self.push_mirror(now, false);
            }
            SessionState::Paused => self.push_mirror(now, false),
            _ => {}
        }

        let interval = Duration::seconds(self.config.persistence.snapshot_interval_secs);
        let due = self
            .last_snapshot_at
            .map_or(true, |at| now - at >= interval);
        if self.dirty && due {
            self.persist(now);
        }
    }

    fn update_heart_rate_health(&mut self, now: DateTime<Utc>) {
        let streaming = self
            .companion
            .as_ref()
            .map_or(false, CompanionChannel::is_streaming);
        let fallback = streaming && self.arbiter.companion_stalled(now);
        if fallback && !self.degraded.heart_rate_fallback {
            warn!("Companion heart rate stalled; using local sensor");
        }
        self.degraded.heart_rate_fallback = fallback;
        self.degraded.heart_rate_source = self.arbiter.active_source(now);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Samples
    // ═══════════════════════════════════════════════════════════════════════════

    fn handle_location(&mut self, sample: LocationSample) {
        if let Some(last) = self.last_location_at {
            if sample.timestamp <= last {
                debug!(timestamp = %sample.timestamp, "Dropping non-increasing location sample");
                return;
            }
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        // The ingestor flushes its held fixes only after tracking is switched
        // off, so the route end can arrive while completing.
        let closing = session.state == SessionState::Completing
            && session
                .ended_at
                .map_or(false, |ended_at| sample.timestamp <= ended_at);

        if session.state == SessionState::Active || closing {
            if mem::take(&mut self.rebase_next) {
                self.route.rebase(&sample);
            } else {
                let delta = self.route.ingest(&sample);
                session.total_distance_km += delta.distance_m / 1000.0;
                session.elevation_gain_m += delta.gain_m;
                session.elevation_loss_m += delta.loss_m;
            }
            session.last_location = Some(sample.clone());
            if let Some(session_id) = session.session_id.clone() {
                self.uploads.update(|coordinator| {
                    coordinator.enqueue_location(&session_id, sample.clone())
                });
            }
            self.last_location_at = Some(sample.timestamp);
            self.degraded.location_fault = None;
            self.dirty = true;
            if closing {
                self.refresh_completion();
            }
        } else if session.state == SessionState::Paused {
            self.route.rebase(&sample);
            session.last_location = Some(sample.clone());
            self.last_location_at = Some(sample.timestamp);
        }
    }

    /// Re-derives the queued completion call after a late route fix.
    fn refresh_completion(&mut self) {
        let now = self.clock.now();
        self.refresh_calories(now);
        let session_id = self
            .session
            .as_ref()
            .and_then(|session| session.session_id.clone());
        if let (Some(session_id), Some(aggregates)) = (session_id, self.completion_aggregates(now)) {
            self.uploads.update(|coordinator| {
                coordinator.refresh_completion(&session_id, aggregates)
            });
        }
    }

    fn handle_location_fault(&mut self, fault: IngestionFault) {
        warn!(fault = %fault, state = %self.state(), "Location tracking degraded");
        self.last_error = Some(fault.to_string());
        self.degraded.location_fault = Some(fault);
    }

    fn handle_heart_rate(&mut self, source: HeartRateSourceKind, sample: HeartRateSample) {
        if self.state() != SessionState::Active {
            return;
        }
        if source == HeartRateSourceKind::Companion
            && !self
                .companion
                .as_ref()
                .map_or(false, CompanionChannel::is_streaming)
        {
            debug!("Ignoring companion heart rate before startConfirmed");
            return;
        }

        let now = self.clock.now();
        let Some(accepted) = self.arbiter.offer(source, sample, now) else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.heart_rate.record(accepted.bpm);
        self.gaps.record(accepted.timestamp);
        let hold = self.health.is_some() && !self.gaps.gaps().is_empty();
        if let Some(session_id) = session.session_id.clone() {
            self.uploads.update(|coordinator| {
                if hold {
                    coordinator.hold_heart_rates(&session_id);
                }
                coordinator.enqueue_heart_rate(&session_id, accepted)
            });
        }
        self.degraded.heart_rate_fault = None;
        self.degraded.heart_rate_source = Some(source);
        if source == HeartRateSourceKind::Companion {
            self.degraded.heart_rate_fallback = false;
        }
        self.dirty = true;
    }

    /// Backfills heart-rate gaps and releases the held heart-rate stream.
    fn fill_heart_rate_gaps(&mut self, session_id: Option<&SessionId>) {
        let gaps = self.gaps.gaps().to_vec();
        let filled = match self.health.as_mut() {
            Some(health) if !gaps.is_empty() => fill_gaps(
                health.as_mut(),
                &gaps,
                self.config.heart_rate.min_bpm,
                self.config.heart_rate.max_bpm,
            ),
            _ => Vec::new(),
        };
        if !filled.is_empty() {
            info!(
                samples = filled.len(),
                gaps = gaps.len(),
                "Filled heart-rate gaps from health platform"
            );
            if let Some(session) = self.session.as_mut() {
                let live = session.heart_rate.last;
                for sample in &filled {
                    session.heart_rate.record(sample.bpm);
                }
                session.heart_rate.last = live;
            }
        }
        if let Some(session_id) = session_id {
            self.uploads
                .update(|coordinator| coordinator.merge_heart_rates(session_id, filled));
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Companion
    // ═══════════════════════════════════════════════════════════════════════════

    fn handle_companion(&mut self, command: CompanionCommand) {
        let now = self.clock.now();
        let body = match command.body() {
            Ok(body) => body,
            Err(error) => {
                self.send_companion(HandheldMessage::CommandRejected {
                    command_id: Some(command.command_id.clone()),
                    error,
                });
                return;
            }
        };

        if command.command_type.expects_reply() {
            let Some(channel) = self.companion.as_mut() else {
                return;
            };
            match channel.cache().admit(&command.command_id, now) {
                Admission::New => {}
                Admission::Joined => {
                    debug!(command_id = %command.command_id, "Duplicate command joined in-flight handling");
                    return;
                }
                Admission::Replay(reply) => {
                    debug!(command_id = %command.command_id, "Replaying cached reply");
                    channel.send(&reply);
                    return;
                }
            }
        }

        let command_id = command.command_id;
        match body {
            CommandBody::Start(payload) => self.companion_start(command_id, payload),
            CommandBody::Pause => {
                self.pause();
                self.reply_companion(
                    &command_id,
                    HandheldMessage::PauseConfirmed {
                        command_id: command_id.clone(),
                    },
                );
            }
            CommandBody::Resume => {
                self.resume();
                self.reply_companion(
                    &command_id,
                    HandheldMessage::ResumeConfirmed {
                        command_id: command_id.clone(),
                    },
                );
            }
            CommandBody::End => {
                self.stop(true);
                self.reply_companion(
                    &command_id,
                    HandheldMessage::EndConfirmed {
                        command_id: command_id.clone(),
                    },
                );
            }
            CommandBody::HeartRate { bpm, recorded_at } => self.handle_heart_rate(
                HeartRateSourceKind::Companion,
                HeartRateSample {
                    bpm,
                    timestamp: recorded_at,
                },
            ),
            CommandBody::Steps { steps, .. } => {
                if let Some(session) = self.session.as_mut() {
                    if session.state == SessionState::Active && steps > session.steps {
                        session.steps = steps;
                        self.dirty = true;
                    }
                }
            }
        }
    }

    /// Unsolicited `startConfirmed` under a fresh command id.
    fn announce_session(&mut self, session_id: &SessionId) {
        if self.companion.is_none() {
            return;
        }
        let command_id = Ulid::new().to_string();
        self.reply_companion(
            &command_id,
            HandheldMessage::StartConfirmed {
                command_id: command_id.clone(),
                session_id: session_id.to_string(),
            },
        );
    }

    fn reply_companion(&mut self, command_id: &str, message: HandheldMessage) {
        let now = self.clock.now();
        if let Some(channel) = self.companion.as_mut() {
            channel.reply(command_id, message, now);
        }
    }

    fn send_companion(&mut self, message: HandheldMessage) {
        if let Some(channel) = self.companion.as_mut() {
            channel.send(&message);
        }
    }

    fn push_mirror(&mut self, now: DateTime<Utc>, force: bool) {
        if self.companion.is_none() {
            return;
        }
        let mirror = self.build_mirror(now);
        if let Some(channel) = self.companion.as_mut() {
            channel.push_mirror(mirror, now, force);
        }
    }

    fn build_mirror(&self, now: DateTime<Utc>) -> StateMirror {
        let state = self.state();
        let session = self.session.as_ref();
        StateMirror {
            is_active: state == SessionState::Active,
            is_paused: state == SessionState::Paused,
            duration_sec: self.elapsed(now).num_seconds().max(0) as u64,
            distance_km: session.map_or(0.0, |session| session.total_distance_km),
            pace: if state == SessionState::Active {
                self.route.current_pace(now)
            } else {
                None
            },
            hr_bpm: session.and_then(|session| session.heart_rate.last),
            session_id: session
                .and_then(|session| session.session_id.as_ref())
                .map(|session_id| session_id.to_string()),
            sent_at: now.to_rfc3339(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Resources and uploads
    // ═══════════════════════════════════════════════════════════════════════════

    fn handle_directive(&mut self, directive: Directive) {
        match directive {
            Directive::Pressure(pressure) => {
                info!(
                    severity = pressure.as_str(),
                    previous = self.pressure.as_str(),
                    "Applying memory pressure"
                );
                self.pressure = pressure;
                self.uploads
                    .update(|coordinator| coordinator.set_pressure(pressure));
                self.apply_tracking_mode();
            }
            Directive::Connectivity(online) => {
                self.uploads.update(|coordinator| coordinator.set_online(online));
                self.degraded.offline = !online;
            }
        }
    }

    fn apply_tracking_mode(&mut self) {
        let over_capacity = self
            .uploads
            .read(|coordinator| coordinator.over_soft_capacity());
        let target = if self.pressure.is_severe() && over_capacity {
            TrackingMode::Emergency
        } else {
            self.pressure
                .tracking_mode(self.config.location.preferred_mode)
        };
        if target != self.tracking_mode {
            info!(
                from = self.tracking_mode.as_str(),
                to = target.as_str(),
                "Tracking mode changed"
            );
            self.tracking_mode = target;
            self.location.set_mode(target);
        }
    }

    fn handle_upload_progress(&mut self, report: UploadReport) {
        let now = self.clock.now();
        if let UploadReport::Failed { error, .. } = &report {
            debug!(error = %error, "Delivery failing; samples retained");
        }
        self.degraded.delivery_failing = self.uploads.read(|coordinator| coordinator.is_retrying());
        self.check_completion(now);
        self.persist(now);
    }

    fn handle_persistence_failure(&mut self, reason: String) {
        let now = self.clock.now();
        error!(reason = %reason, state = %self.state(), "Session persistence failed");
        self.last_error = Some(format!("persistence failed: {}", reason));
        match self.state() {
            SessionState::Starting => {
                self.pending_start = None;
                if let Some(session) = self.session.as_mut() {
                    session.state = SessionState::Discarded;
                }
            }
            SessionState::Active
            | SessionState::Paused
            | SessionState::Recovered
            | SessionState::Completing => {
                if let Some(session) = self.session.as_mut() {
                    if session.ended_at.is_none() {
                        session.end(now);
                    }
                    session.state = SessionState::Discarded;
                }
                self.location.set_enabled(false);
                self.completion_deadline = None;
                self.gaps.reset();
                if let Some(session_id) = self.session.as_ref().and_then(|s| s.session_id.clone()) {
                    self.uploads.update(|coordinator| {
                        coordinator.merge_heart_rates(&session_id, Vec::new())
                    });
                }
                self.push_mirror(now, true);
            }
            SessionState::Idle | SessionState::Completed | SessionState::Discarded => {}
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Derived values, snapshots, status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Active time, never reported lower than a value already published.
    fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let Some(session) = self.session.as_ref() else {
            return Duration::zero();
        };
        let elapsed = session.elapsed_active(now);
        if session.state == SessionState::Active {
            elapsed.max(self.elapsed_high_water)
        } else {
            elapsed
        }
    }

    fn refresh_calories(&mut self, now: DateTime<Utc>) {
        let duration = self.elapsed(now);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let calories = self.energy.calories(&EnergyInput {
            user_weight_kg: session.user_weight_kg,
            ruck_weight_kg: session.ruck_weight_kg,
            distance_km: session.total_distance_km,
            elevation_gain_m: session.elevation_gain_m,
            elevation_loss_m: session.elevation_loss_m,
            duration,
        });
        if calories.is_finite() && calories >= 0.0 {
            session.calories_burned = calories;
        }
    }

    fn completion_aggregates(&self, now: DateTime<Utc>) -> Option<CompletionAggregates> {
        let session = self.session.as_ref()?;
        let ended_at = session.ended_at.unwrap_or(now);
        let duration = session.elapsed_active(ended_at);
        Some(CompletionAggregates {
            duration_seconds: duration.num_seconds(),
            distance_km: session.total_distance_km,
            calories_burned: session.calories_burned,
            average_pace_min_per_km: pace_min_per_km(session.total_distance_km, duration),
            elevation_gain_m: session.elevation_gain_m,
            elevation_loss_m: session.elevation_loss_m,
            avg_heart_rate: session.heart_rate.average(),
            max_heart_rate: (session.heart_rate.count > 0).then_some(session.heart_rate.max),
            steps: session.steps,
            ended_at,
        })
    }

    /// Queues a snapshot of the live session plus undelivered uploads. When
    /// neither exists the slot is cleared.
    fn persist(&mut self, now: DateTime<Utc>) {
        // An idle engine must not overwrite a snapshot nobody has recovered yet.
        if !self.recovered && self.session.is_none() {
            return;
        }
        let session = self
            .session
            .as_ref()
            .filter(|session| !session.state.is_quiescent())
            .cloned();
        let uploads = self
            .uploads
            .read(|coordinator| coordinator.lanes().to_vec());
        let snapshot = PersistedSnapshot::new(session, uploads, now);
        if snapshot.is_empty() {
            self.writer.clear();
        } else {
            self.writer.save(snapshot);
        }
        self.dirty = false;
        self.last_snapshot_at = Some(now);
    }

    fn build_status(&self, now: DateTime<Utc>) -> SessionStatus {
        let (pending_uploads, online, retrying) = self.uploads.read(|coordinator| {
            (
                coordinator.queue_len(),
                coordinator.is_online(),
                coordinator.is_retrying(),
            )
        });
        let mut degraded = self.degraded.clone();
        degraded.offline = !online;
        degraded.delivery_failing = retrying;
        degraded.companion_error = self
            .companion
            .as_ref()
            .and_then(|channel| channel.last_error().cloned())
            .or_else(|| {
                self.degraded
                    .heart_rate_fallback
                    .then_some(CompanionError::Stale)
            });
        degraded.companion_reachable = self
            .companion
            .as_ref()
            .map(CompanionChannel::is_reachable);

        let mut status = SessionStatus {
            tracking_mode: self.tracking_mode,
            pressure: self.pressure,
            pending_uploads,
            degraded,
            last_error: self.last_error.clone(),
            ..SessionStatus::default()
        };

        if let Some(session) = self.session.as_ref() {
            let elapsed = self.elapsed(now);
            status.state = session.state;
            status.session_id = session.session_id.clone();
            status.elapsed_secs = elapsed.num_seconds();
            status.accumulated_paused_secs = session.accumulated_paused().num_seconds();
            status.distance_km = session.total_distance_km;
            status.pace_min_per_km = if session.state == SessionState::Active {
                self.route.current_pace(now)
            } else {
                None
            };
            status.average_pace_min_per_km = pace_min_per_km(session.total_distance_km, elapsed);
            status.calories_burned = session.calories_burned;
            status.elevation_gain_m = session.elevation_gain_m;
            status.elevation_loss_m = session.elevation_loss_m;
            status.heart_rate_bpm = session.heart_rate.last;
            status.steps = session.steps;
        }
        status
    }

    fn publish(&self) {
        self.status.publish(self.build_status(self.clock.now()));
    }
}

/// Companion-facing reason for a failed start.
pub(crate) fn reason_for(error: &StartError) -> ReasonCode {
    match error {
        StartError::AlreadyActive => ReasonCode::AlreadyActive,
        StartError::Network(_) => ReasonCode::NotReachable,
        StartError::Unauthorized => ReasonCode::NeedsPermission("auth".to_string()),
        StartError::Validation(_) => ReasonCode::Unknown,
        StartError::Timeout => ReasonCode::Timeout,
    }
}
