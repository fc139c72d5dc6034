//! Upload coordination: per-session pending queues, batching, retry.
//!
//! Samples are grouped into one [`SessionLane`] per backend session so that a
//! finished session can keep draining in the background while a new one
//! starts. Each stream in a lane is delivered strictly in timestamp order and
//! at least once: a batch leaves the queue only after the backend acks it.
//!
//! The coordinator is plain state guarded by [`UploadShared`]. The
//! [`UploadWorker`] thread takes a job under the lock, releases the lock for
//! the backend call, then reports the outcome back under the lock.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::backend::{CompletionAggregates, SessionBackend};
use crate::clock::Clock;
use crate::config::UploadConfig;
use crate::error::DeliveryError;
use crate::message::EngineMessage;
use crate::resource::MemoryPressure;
use crate::types::{HeartRateSample, LocationSample, SessionId, Timestamped};

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_ms: i64,
    max_ms: i64,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial_ms: i64, max_ms: i64, jitter: f64) -> Self {
        Self {
            initial_ms: initial_ms.max(1),
            max_ms: max_ms.max(initial_ms.max(1)),
            jitter: jitter.clamp(0.0, 0.9),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.backoff_initial_ms,
            config.backoff_max_ms,
            config.backoff_jitter,
        )
    }

    /// Delay before retry number `attempt` (1-based): doubling from the
    /// initial delay, jittered, never above the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let base = self
            .initial_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.max_ms);
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = (base as f64 * (1.0 + spread)).round() as i64;
        Duration::milliseconds(jittered.clamp(1, self.max_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl RetryState {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn is_retrying(&self) -> bool {
        self.attempt_count > 0
    }

    fn record_failure(&mut self, now: DateTime<Utc>, backoff: &Backoff) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_attempt_at = Some(now + backoff.delay(self.attempt_count));
    }

    fn reset(&mut self) {
        self.attempt_count = 0;
        self.next_attempt_at = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queues and lanes
// ═══════════════════════════════════════════════════════════════════════════════

/// Timestamp-ordered queue with an in-flight prefix.
///
/// Items `[0, in_flight)` have been handed to the backend and are removed only
/// on ack. New items are always inserted after that prefix, so a late sample
/// can never slip in front of a batch that is already on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQueue<T> {
    items: VecDeque<T>,
    #[serde(skip)]
    in_flight: usize,
    #[serde(default)]
    retry: RetryState,
    /// Newest timestamp the backend has acked.
    #[serde(default)]
    delivered_until: Option<DateTime<Utc>>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            in_flight: 0,
            retry: RetryState::default(),
            delivered_until: None,
        }
    }
}

impl<T: Timestamped + Clone> PendingQueue<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Newest timestamp that has been acked or is on the wire. Anything at or
    /// before it can no longer be delivered in order.
    pub fn sent_until(&self) -> Option<DateTime<Utc>> {
        let on_the_wire = self
            .in_flight
            .checked_sub(1)
            .and_then(|last| self.items.get(last))
            .map(|item| item.timestamp());
        on_the_wire.max(self.delivered_until)
    }

    pub fn push(&mut self, item: T) {
        let ts = item.timestamp();
        let in_order = self
            .items
            .back()
            .map_or(true, |last| last.timestamp() <= ts);
        if in_order || self.items.len() == self.in_flight {
            self.items.push_back(item);
            return;
        }
        let offset = self
            .items
            .range(self.in_flight..)
            .position(|queued| queued.timestamp() > ts)
            .unwrap_or(self.items.len() - self.in_flight);
        self.items.insert(self.in_flight + offset, item);
    }

    fn take_batch(&mut self, max: usize) -> Option<Vec<T>> {
        if self.in_flight > 0 || self.items.is_empty() {
            return None;
        }
        let count = max.max(1).min(self.items.len());
        self.in_flight = count;
        Some(self.items.iter().take(count).cloned().collect())
    }

    fn ack(&mut self) -> usize {
        let delivered = self.in_flight;
        let newest = self.sent_until();
        self.items.drain(..delivered);
        self.delivered_until = newest;
        self.in_flight = 0;
        self.retry.reset();
        delivered
    }

    fn fail(&mut self, now: DateTime<Utc>, backoff: &Backoff) {
        self.in_flight = 0;
        self.retry.record_failure(now, backoff);
    }

    fn is_sendable(&self, now: DateTime<Utc>) -> bool {
        !self.items.is_empty() && self.in_flight == 0 && self.retry.is_due(now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionJob {
    pub aggregates: CompletionAggregates,
    #[serde(default)]
    pub retry: RetryState,
    #[serde(skip)]
    in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLane {
    pub session_id: SessionId,
    #[serde(default)]
    pub location: PendingQueue<LocationSample>,
    #[serde(default)]
    pub heart_rate: PendingQueue<HeartRateSample>,
    #[serde(default)]
    pub completion: Option<CompletionJob>,
    /// Discarded session: retries stop once this passes.
    #[serde(default)]
    pub cancel_at: Option<DateTime<Utc>>,
    /// Emergency flush window (stop grace period).
    #[serde(default)]
    pub emergency_until: Option<DateTime<Utc>>,
    /// Heart rates wait for gap backfill so the stream reaches the backend in
    /// timestamp order.
    #[serde(default)]
    pub heart_rate_held: bool,
}

impl SessionLane {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            location: PendingQueue::default(),
            heart_rate: PendingQueue::default(),
            completion: None,
            cancel_at: None,
            emergency_until: None,
            heart_rate_held: false,
        }
    }

    pub fn samples_drained(&self) -> bool {
        self.location.is_empty() && self.heart_rate.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.samples_drained() && self.completion.is_none()
    }

    pub fn pending_samples(&self) -> usize {
        self.location.len() + self.heart_rate.len()
    }

    fn in_emergency(&self, now: DateTime<Utc>) -> bool {
        self.cancel_at.is_some() || self.emergency_until.map_or(false, |until| now < until)
    }

    fn completion_sendable(&self, now: DateTime<Utc>) -> bool {
        self.samples_drained()
            && self
                .completion
                .as_ref()
                .map_or(false, |job| !job.in_flight && job.retry.is_due(now))
    }

    fn heart_rate_sendable(&self, now: DateTime<Utc>) -> bool {
        !self.heart_rate_held && self.heart_rate.is_sendable(now)
    }

    fn has_due_retry(&self, now: DateTime<Utc>) -> bool {
        let queue_due = |retry: &RetryState, pending: bool| {
            pending && retry.is_retrying() && retry.is_due(now)
        };
        queue_due(&self.location.retry, !self.location.is_empty())
            || queue_due(
                &self.heart_rate.retry,
                !self.heart_rate_held && !self.heart_rate.is_empty(),
            )
            || self.completion_sendable(now)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs and reports
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Location,
    HeartRate,
    Completion,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Location => "location",
            StreamKind::HeartRate => "heart_rate",
            StreamKind::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadPayload {
    Locations(Vec<LocationSample>),
    HeartRates(Vec<HeartRateSample>),
    Completion(CompletionAggregates),
}

impl UploadPayload {
    pub fn stream(&self) -> StreamKind {
        match self {
            UploadPayload::Locations(_) => StreamKind::Location,
            UploadPayload::HeartRates(_) => StreamKind::HeartRate,
            UploadPayload::Completion(_) => StreamKind::Completion,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UploadPayload::Locations(samples) => samples.len(),
            UploadPayload::HeartRates(samples) => samples.len(),
            UploadPayload::Completion(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadJob {
    pub session_id: SessionId,
    pub payload: UploadPayload,
    pub timeout: StdDuration,
    pub emergency: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadReport {
    Delivered {
        session_id: SessionId,
        stream: StreamKind,
        count: usize,
        lane_drained: bool,
    },
    Failed {
        session_id: SessionId,
        stream: StreamKind,
        error: DeliveryError,
        attempt: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    Cancelled {
        session_id: SessionId,
        dropped: usize,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct UploadCoordinator {
    config: UploadConfig,
    backoff: Backoff,
    lanes: Vec<SessionLane>,
    online: bool,
    pressure: MemoryPressure,
    emergency_requested: bool,
    draining: bool,
    last_flush_at: Option<DateTime<Utc>>,
    last_error: Option<DeliveryError>,
}

impl UploadCoordinator {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            backoff: Backoff::from_config(&config),
            config,
            lanes: Vec::new(),
            online: true,
            pressure: MemoryPressure::Normal,
            emergency_requested: false,
            draining: false,
            last_flush_at: None,
            last_error: None,
        }
    }

    /// Reinstates lanes from a snapshot. In-flight markers are not persisted,
    /// so anything that was on the wire is simply sent again.
    pub fn restore(&mut self, lanes: Vec<SessionLane>) {
        for mut lane in lanes {
            // Gap history does not survive a restart, so nothing will backfill.
            lane.heart_rate_held = false;
            if lane.is_drained() && lane.cancel_at.is_none() {
                continue;
            }
            info!(
                session_id = %lane.session_id,
                pending = lane.pending_samples(),
                completion = lane.completion.is_some(),
                "Restored pending uploads"
            );
            match self.lane_index(&lane.session_id) {
                Some(index) => self.lanes[index] = lane,
                None => self.lanes.push(lane),
            }
        }
        self.draining = !self.lanes.is_empty();
    }

    pub fn lanes(&self) -> &[SessionLane] {
        &self.lanes
    }

    pub fn lane(&self, session_id: &SessionId) -> Option<&SessionLane> {
        self.lanes.iter().find(|lane| &lane.session_id == session_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.lanes.is_empty()
    }

    pub fn is_lane_drained(&self, session_id: &SessionId) -> bool {
        self.lane(session_id).map_or(true, SessionLane::is_drained)
    }

    pub fn queue_len(&self) -> usize {
        self.lanes.iter().map(SessionLane::pending_samples).sum()
    }

    pub fn over_soft_capacity(&self) -> bool {
        self.queue_len() > self.config.queue_soft_capacity
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.pressure
    }

    pub fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    /// True while any stream is waiting out a backoff after a failure.
    pub fn is_retrying(&self) -> bool {
        self.lanes.iter().any(|lane| {
            lane.location.retry.is_retrying()
                || lane.heart_rate.retry.is_retrying()
                || lane
                    .completion
                    .as_ref()
                    .map_or(false, |job| job.retry.is_retrying())
        })
    }

    pub fn enqueue_location(&mut self, session_id: &SessionId, sample: LocationSample) {
        self.lane_mut(session_id).location.push(sample);
    }

    pub fn enqueue_heart_rate(&mut self, session_id: &SessionId, sample: HeartRateSample) {
        self.lane_mut(session_id).heart_rate.push(sample);
    }

    /// Holds back heart-rate delivery for the lane until
    /// [`Self::merge_heart_rates`] releases it.
    pub fn hold_heart_rates(&mut self, session_id: &SessionId) {
        let lane = self.lane_mut(session_id);
        if !lane.heart_rate_held {
            debug!(session_id = %session_id, "Heart-rate delivery held for backfill");
            lane.heart_rate_held = true;
        }
    }

    /// Inserts backfilled samples in timestamp order and releases the hold.
    /// Samples not newer than what already left the queue are dropped.
    pub fn merge_heart_rates(&mut self, session_id: &SessionId, samples: Vec<HeartRateSample>) {
        if samples.is_empty() && self.lane_index(session_id).is_none() {
            return;
        }
        let lane = self.lane_mut(session_id);
        let floor = lane.heart_rate.sent_until();
        let mut dropped = 0;
        for sample in samples {
            if floor.map_or(false, |floor| sample.timestamp <= floor) {
                dropped += 1;
                continue;
            }
            lane.heart_rate.push(sample);
        }
        if dropped > 0 {
            warn!(session_id = %session_id, dropped, "Backfilled heart rates older than delivered ones");
        }
        lane.heart_rate_held = false;
        self.draining = true;
    }

    /// Queues the completion call and opens an emergency window for the lane
    /// so the remaining samples go out promptly.
    pub fn queue_completion(
        &mut self,
        session_id: &SessionId,
        aggregates: CompletionAggregates,
        emergency_until: DateTime<Utc>,
    ) {
        let lane = self.lane_mut(session_id);
        lane.completion = Some(CompletionJob {
            aggregates,
            retry: RetryState::default(),
            in_flight: false,
        });
        lane.emergency_until = Some(emergency_until);
        self.draining = true;
    }

    /// Replaces the queued completion payload unless it is already on the wire.
    pub fn refresh_completion(&mut self, session_id: &SessionId, aggregates: CompletionAggregates) {
        let Some(index) = self.lane_index(session_id) else {
            return;
        };
        if let Some(job) = self.lanes[index].completion.as_mut() {
            if !job.in_flight {
                job.aggregates = aggregates;
            }
        }
    }

    /// Discarded session: flush what we can until `at`, then stop retrying.
    pub fn cancel_after(&mut self, session_id: &SessionId, at: DateTime<Utc>) {
        if let Some(index) = self.lane_index(session_id) {
            let lane = &mut self.lanes[index];
            lane.cancel_at = Some(at);
            lane.completion = None;
            lane.heart_rate_held = false;
            self.draining = true;
        }
    }

    pub fn request_emergency_flush(&mut self) {
        self.emergency_requested = true;
        self.draining = true;
    }

    pub fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        self.online = online;
        if online {
            // Fresh link: retry everything now instead of waiting out backoff.
            for lane in &mut self.lanes {
                lane.location.retry.reset();
                lane.heart_rate.retry.reset();
                if let Some(job) = lane.completion.as_mut() {
                    job.retry.reset();
                }
            }
            self.draining = true;
        }
    }

    pub fn set_pressure(&mut self, pressure: MemoryPressure) {
        if pressure.is_severe() && !self.pressure.is_severe() {
            self.request_emergency_flush();
        }
        self.pressure = pressure;
    }

    pub fn effective_interval(&self) -> Duration {
        Duration::seconds(
            self.config
                .flush_interval_secs
                .saturating_mul(i64::from(self.pressure.upload_factor())),
        )
    }

    pub fn effective_batch(&self) -> usize {
        self.config
            .batch_size
            .saturating_mul(self.pressure.upload_factor() as usize)
    }

    /// Drops lanes whose cancellation window has passed.
    pub fn prune_cancelled(&mut self, now: DateTime<Utc>) -> Vec<UploadReport> {
        let mut reports = Vec::new();
        self.lanes.retain(|lane| match lane.cancel_at {
            Some(at) if now >= at => {
                info!(
                    session_id = %lane.session_id,
                    dropped = lane.pending_samples(),
                    "Cancelled pending uploads for discarded session"
                );
                reports.push(UploadReport::Cancelled {
                    session_id: lane.session_id.clone(),
                    dropped: lane.pending_samples(),
                });
                false
            }
            _ => true,
        });
        reports
    }

    /// Next batch to send, oldest lane first. Once a flush is triggered the
    /// coordinator keeps handing out jobs until nothing is sendable.
    pub fn next_job(&mut self, now: DateTime<Utc>) -> Option<UploadJob> {
        if !self.online || self.lanes.is_empty() {
            self.draining = false;
            return None;
        }

        if !self.draining {
            if !self.flush_due(now) {
                return None;
            }
            self.draining = true;
            self.last_flush_at = Some(now);
        }

        let normal_batch = self.effective_batch();
        let normal_timeout = StdDuration::from_millis(self.config.request_timeout_ms);
        let emergency_batch = self.config.emergency_batch_size;
        let emergency_timeout = StdDuration::from_millis(self.config.emergency_timeout_ms);
        let global_emergency = self.emergency_requested;

        for lane in &mut self.lanes {
            let emergency = global_emergency || lane.in_emergency(now);
            let (batch, timeout) = if emergency {
                (emergency_batch, emergency_timeout)
            } else {
                (normal_batch, normal_timeout)
            };

            let payload = if lane.location.is_sendable(now) {
                lane.location.take_batch(batch).map(UploadPayload::Locations)
            } else if lane.heart_rate_sendable(now) {
                lane.heart_rate.take_batch(batch).map(UploadPayload::HeartRates)
            } else if lane.completion_sendable(now) {
                lane.completion.as_mut().map(|job| {
                    job.in_flight = true;
                    UploadPayload::Completion(job.aggregates.clone())
                })
            } else {
                None
            };

            if let Some(payload) = payload {
                debug!(
                    session_id = %lane.session_id,
                    stream = payload.stream().as_str(),
                    count = payload.len(),
                    emergency,
                    "Upload job issued"
                );
                return Some(UploadJob {
                    session_id: lane.session_id.clone(),
                    payload,
                    timeout,
                    emergency,
                });
            }
        }

        self.draining = false;
        self.emergency_requested = false;
        None
    }

    /// Applies a backend outcome. Returns `None` when the lane was cancelled
    /// while the job was on the wire.
    pub fn complete(
        &mut self,
        job: &UploadJob,
        result: Result<(), DeliveryError>,
        now: DateTime<Utc>,
    ) -> Option<UploadReport> {
        let index = self.lane_index(&job.session_id)?;
        let backoff = self.backoff;
        let stream = job.payload.stream();
        let lane = &mut self.lanes[index];

        match result {
            Ok(()) => {
                let count = match stream {
                    StreamKind::Location => lane.location.ack(),
                    StreamKind::HeartRate => lane.heart_rate.ack(),
                    StreamKind::Completion => {
                        lane.completion = None;
                        1
                    }
                };
                let lane_drained = lane.is_drained();
                let session_id = lane.session_id.clone();
                if lane_drained {
                    info!(session_id = %session_id, "All uploads delivered for session");
                    self.lanes.remove(index);
                }
                self.last_error = None;
                Some(UploadReport::Delivered {
                    session_id,
                    stream,
                    count,
                    lane_drained,
                })
            }
            Err(error) => {
                let retry = match stream {
                    StreamKind::Location => {
                        lane.location.fail(now, &backoff);
                        lane.location.retry.clone()
                    }
                    StreamKind::HeartRate => {
                        lane.heart_rate.fail(now, &backoff);
                        lane.heart_rate.retry.clone()
                    }
                    StreamKind::Completion => match lane.completion.as_mut() {
                        Some(job) => {
                            job.in_flight = false;
                            job.retry.record_failure(now, &backoff);
                            job.retry.clone()
                        }
                        None => RetryState::default(),
                    },
                };
                warn!(
                    session_id = %lane.session_id,
                    stream = stream.as_str(),
                    attempt = retry.attempt_count,
                    error = %error,
                    "Upload failed; will retry"
                );
                self.last_error = Some(error.clone());
                Some(UploadReport::Failed {
                    session_id: lane.session_id.clone(),
                    stream,
                    error,
                    attempt: retry.attempt_count,
                    next_attempt_at: retry.next_attempt_at,
                })
            }
        }
    }

    fn flush_due(&self, now: DateTime<Utc>) -> bool {
        if self.emergency_requested {
            return true;
        }
        let batch = self.effective_batch();
        let timer_elapsed = self
            .last_flush_at
            .map_or(true, |at| now - at >= self.effective_interval());

        self.lanes.iter().any(|lane| {
            lane.in_emergency(now)
                || lane.has_due_retry(now)
                || lane.location.len() >= batch
                || (!lane.heart_rate_held && lane.heart_rate.len() >= batch)
                || (timer_elapsed && !lane.is_drained())
        })
    }

    fn lane_index(&self, session_id: &SessionId) -> Option<usize> {
        self.lanes
            .iter()
            .position(|lane| &lane.session_id == session_id)
    }

    fn lane_mut(&mut self, session_id: &SessionId) -> &mut SessionLane {
        let index = match self.lane_index(session_id) {
            Some(index) => index,
            None => {
                self.lanes.push(SessionLane::new(session_id.clone()));
                self.lanes.len() - 1
            }
        };
        &mut self.lanes[index]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Coordinator plus the condvar the worker sleeps on.
#[derive(Debug)]
pub struct UploadShared {
    coordinator: Mutex<UploadCoordinator>,
    wake: Condvar,
    stopped: AtomicBool,
}

impl UploadShared {
    pub fn new(coordinator: UploadCoordinator) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Mutex::new(coordinator),
            wake: Condvar::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Runs `op` under the lock and wakes the worker afterwards.
    pub fn update<T>(&self, op: impl FnOnce(&mut UploadCoordinator) -> T) -> T {
        let result = op(&mut self.lock());
        self.wake.notify_all();
        result
    }

    pub fn read<T>(&self, op: impl FnOnce(&UploadCoordinator) -> T) -> T {
        op(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, UploadCoordinator> {
        self.coordinator.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

pub struct UploadWorker {
    shared: Arc<UploadShared>,
    thread: Option<JoinHandle<()>>,
}

impl UploadWorker {
    pub fn spawn(
        shared: Arc<UploadShared>,
        backend: Arc<dyn SessionBackend>,
        clock: Arc<dyn Clock>,
        poll: StdDuration,
        sink: Sender<EngineMessage>,
    ) -> Self {
        let worker_shared = Arc::clone(&shared);
        let poll = poll.max(StdDuration::from_millis(1));

        let thread = thread::spawn(move || {
            let shared = worker_shared;
            while !shared.is_stopped() {
                let (job, mut reports) = {
                    let mut coordinator = shared.lock();
                    let now = clock.now();
                    let reports = coordinator.prune_cancelled(now);
                    let job = coordinator.next_job(now);
                    if job.is_none() && reports.is_empty() {
                        let _ = shared
                            .wake
                            .wait_timeout(coordinator, poll)
                            .unwrap_or_else(|e| e.into_inner());
                        continue;
                    }
                    (job, reports)
                };

                if let Some(job) = job {
                    let result = deliver(backend.as_ref(), &job);
                    let report = shared.lock().complete(&job, result, clock.now());
                    reports.extend(report);
                }

                for report in reports {
                    if sink.send(EngineMessage::UploadProgress(report)).is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.shared.stop();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Upload worker thread panicked");
            }
        }
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver(backend: &dyn SessionBackend, job: &UploadJob) -> Result<(), DeliveryError> {
    match &job.payload {
        UploadPayload::Locations(samples) => {
            backend.append_locations(&job.session_id, samples, job.timeout)
        }
        UploadPayload::HeartRates(samples) => {
            backend.append_heart_rates(&job.session_id, samples, job.timeout)
        }
        UploadPayload::Completion(aggregates) => {
            backend.complete_session(&job.session_id, aggregates, job.timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn fix(secs: i64) -> LocationSample {
        LocationSample {
            latitude: 51.5,
            longitude: -0.1,
            altitude: 10.0,
            horizontal_accuracy_m: 5.0,
            timestamp: at(secs),
        }
    }

    fn sid(value: &str) -> SessionId {
        SessionId::new(value)
    }

    fn aggregates() -> CompletionAggregates {
        CompletionAggregates {
            duration_seconds: 60,
            distance_km: 0.1,
            calories_burned: 10.0,
            average_pace_min_per_km: Some(10.0),
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            avg_heart_rate: None,
            max_heart_rate: None,
            steps: 0,
            ended_at: at(60),
        }
    }

    fn location_timestamps(job: &UploadJob) -> Vec<i64> {
        match &job.payload {
            UploadPayload::Locations(samples) => samples
                .iter()
                .map(|s| (s.timestamp - at(0)).num_seconds())
                .collect(),
            other => panic!("expected locations, got {:?}", other),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::new(1000, 60_000, 0.0);
        assert_eq!(backoff.delay(1), Duration::milliseconds(1000));
        assert_eq!(backoff.delay(2), Duration::milliseconds(2000));
        assert_eq!(backoff.delay(4), Duration::milliseconds(8000));
        assert_eq!(backoff.delay(40), Duration::milliseconds(60_000));

        let jittered = Backoff::new(1000, 60_000, 0.2);
        for _ in 0..50 {
            let delay = jittered.delay(1).num_milliseconds();
            assert!((800..=1200).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn late_sample_lands_after_in_flight_prefix() {
        let mut queue = PendingQueue::default();
        queue.push(fix(1));
        queue.push(fix(3));
        let batch = queue.take_batch(1).unwrap();
        assert_eq!(batch.len(), 1);

        queue.push(fix(0));
        queue.push(fix(2));
        let order: Vec<i64> = queue
            .items()
            .map(|s| (s.timestamp - at(0)).num_seconds())
            .collect();
        assert_eq!(order, vec![1, 0, 2, 3]);

        assert_eq!(queue.ack(), 1);
        let order: Vec<i64> = queue
            .items()
            .map(|s| (s.timestamp - at(0)).num_seconds())
            .collect();
        assert_eq!(order, vec![0, 2, 3]);
    }

    #[test]
    fn held_heart_rates_wait_for_backfill_then_go_out_in_order() {
        let hr = |secs: i64| HeartRateSample { bpm: 100, timestamp: at(secs) };
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        coordinator.enqueue_heart_rate(&id, hr(0));
        let first = coordinator.next_job(at(300)).unwrap();

        coordinator.hold_heart_rates(&id);
        coordinator.enqueue_heart_rate(&id, hr(50));
        coordinator.enqueue_heart_rate(&id, hr(51));
        coordinator.complete(&first, Ok(()), at(300));
        assert!(coordinator.next_job(at(600)).is_none());

        coordinator.merge_heart_rates(&id, vec![hr(0), hr(10), hr(20)]);
        let job = coordinator.next_job(at(600)).unwrap();
        let UploadPayload::HeartRates(samples) = &job.payload else {
            panic!("expected heart rates, got {:?}", job.payload);
        };
        let order: Vec<i64> = samples
            .iter()
            .map(|s| (s.timestamp - at(0)).num_seconds())
            .collect();
        assert_eq!(order, vec![10, 20, 50, 51]);
    }

    #[test]
    fn failed_batch_is_retained_and_retried_after_backoff() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        for secs in 0..5 {
            coordinator.enqueue_location(&id, fix(secs));
        }

        let job = coordinator.next_job(at(10)).unwrap();
        assert_eq!(location_timestamps(&job), vec![0, 1, 2, 3, 4]);
        let report = coordinator
            .complete(&job, Err(DeliveryError::Network("offline".into())), at(10))
            .unwrap();
        let UploadReport::Failed { attempt, next_attempt_at, .. } = report else {
            panic!("expected failure report");
        };
        assert_eq!(attempt, 1);
        assert_eq!(coordinator.queue_len(), 5);
        assert!(coordinator.is_retrying());

        // Nothing is due until the backoff elapses.
        assert!(coordinator.next_job(at(10)).is_none());
        let retry_at = next_attempt_at.unwrap();
        let job = coordinator.next_job(retry_at).unwrap();
        assert_eq!(location_timestamps(&job), vec![0, 1, 2, 3, 4]);
        coordinator.complete(&job, Ok(()), retry_at);
        assert_eq!(coordinator.queue_len(), 0);
        assert!(!coordinator.has_pending());
    }

    #[test]
    fn offline_holds_everything_and_reconnect_drains() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        coordinator.set_online(false);
        for secs in 0..120 {
            coordinator.enqueue_location(&id, fix(secs));
        }
        assert!(coordinator.next_job(at(200)).is_none());
        assert_eq!(coordinator.queue_len(), 120);

        coordinator.set_online(true);
        let mut delivered = 0;
        while let Some(job) = coordinator.next_job(at(201)) {
            delivered += job.payload.len();
            coordinator.complete(&job, Ok(()), at(201));
        }
        assert_eq!(delivered, 120);
        assert_eq!(coordinator.queue_len(), 0);
    }

    #[test]
    fn completion_waits_for_samples_to_drain() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        coordinator.enqueue_location(&id, fix(0));
        coordinator.enqueue_heart_rate(
            &id,
            HeartRateSample {
                bpm: 120,
                timestamp: at(0),
            },
        );
        coordinator.queue_completion(&id, aggregates(), at(65));

        let mut streams = Vec::new();
        while let Some(job) = coordinator.next_job(at(60)) {
            streams.push(job.payload.stream());
            assert!(job.emergency);
            coordinator.complete(&job, Ok(()), at(60));
        }
        assert_eq!(
            streams,
            vec![StreamKind::Location, StreamKind::HeartRate, StreamKind::Completion]
        );
        assert!(coordinator.is_lane_drained(&id));
    }

    #[test]
    fn severe_pressure_triggers_emergency_flush() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        coordinator.enqueue_location(&id, fix(0));
        let job = coordinator.next_job(at(0)).unwrap();
        coordinator.complete(&job, Ok(()), at(0));
        assert!(coordinator.next_job(at(0)).is_none());

        for secs in 1..40 {
            coordinator.enqueue_location(&id, fix(secs));
        }
        // Timer has not elapsed and the batch threshold is not reached.
        assert!(coordinator.next_job(at(2)).is_none());

        coordinator.set_pressure(MemoryPressure::Critical);
        assert_eq!(coordinator.effective_batch(), 200);
        let job = coordinator.next_job(at(2)).unwrap();
        assert!(job.emergency);
        assert_eq!(job.payload.len(), UploadConfig::default().emergency_batch_size);
    }

    #[test]
    fn discarded_lane_is_cancelled_after_grace() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        coordinator.set_online(false);
        coordinator.enqueue_location(&id, fix(0));
        coordinator.cancel_after(&id, at(5));

        assert!(coordinator.prune_cancelled(at(4)).is_empty());
        let reports = coordinator.prune_cancelled(at(5));
        assert_eq!(
            reports,
            vec![UploadReport::Cancelled {
                session_id: id.clone(),
                dropped: 1
            }]
        );
        assert!(!coordinator.has_pending());
    }

    #[test]
    fn lanes_drain_oldest_session_first() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        coordinator.enqueue_location(&sid("old"), fix(0));
        coordinator.enqueue_location(&sid("new"), fix(100));

        let first = coordinator.next_job(at(200)).unwrap();
        assert_eq!(first.session_id, sid("old"));
        coordinator.complete(&first, Ok(()), at(200));
        let second = coordinator.next_job(at(200)).unwrap();
        assert_eq!(second.session_id, sid("new"));
    }

    #[test]
    fn restored_lanes_resend_in_flight_items() {
        let mut coordinator = UploadCoordinator::new(UploadConfig::default());
        let id = sid("s-1");
        coordinator.enqueue_location(&id, fix(0));
        coordinator.enqueue_location(&id, fix(1));
        let _on_the_wire = coordinator.next_job(at(5)).unwrap();

        let json = serde_json::to_string(coordinator.lanes()).unwrap();
        let lanes: Vec<SessionLane> = serde_json::from_str(&json).unwrap();

        let mut restored = UploadCoordinator::new(UploadConfig::default());
        restored.restore(lanes);
        let job = restored.next_job(at(6)).unwrap();
        assert_eq!(location_timestamps(&job), vec![0, 1]);
    }
}
