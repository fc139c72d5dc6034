#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use ruck_companion_protocol::HandheldMessage;
use ruck_session_engine::{
    Collaborators, CompanionError, CompanionInbound, CompanionLink, CompanionOutbound,
    CompletionAggregates, CreateSessionPayload, DeliveryError, EngineConfig, EngineHandle,
    HealthSource, HeartRateSample, IngestionFault, LocationSample, LocationSource, ManualClock, MemoryProbe,
    SessionBackend, SessionEngine, SessionId, SessionStatus, SourceEvent, StartError,
    TrackingMode,
};
use ruck_session_engine::companion::InboundEvent;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration as StdDuration, Instant};
use tempfile::TempDir;

/// Metres per degree of latitude for the haversine radius in use.
pub const METRES_PER_DEGREE: f64 = 111_195.08;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

/// A fix `north_m` metres north of the origin, `secs` after `t0`.
pub fn fix(secs: i64, north_m: f64) -> LocationSample {
    LocationSample {
        latitude: 47.0 + north_m / METRES_PER_DEGREE,
        longitude: 8.0,
        altitude: 400.0,
        horizontal_accuracy_m: 5.0,
        timestamp: t0() + Duration::seconds(secs),
    }
}

pub fn heart_rate(secs: i64, bpm: u16) -> HeartRateSample {
    HeartRateSample {
        bpm,
        timestamp: t0() + Duration::seconds(secs),
    }
}

/// Deterministic settings: manual ticks, no reorder delay, fast polling.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.lifecycle.auto_tick = false;
    config.lifecycle.start_timeout_ms = 2_000;
    config.lifecycle.command_wait_ms = 2_000;
    config.location.reorder_window_ms = 0;
    config.location.poll_timeout_ms = 10;
    config.upload.worker_poll_ms = 10;
    config.resource.sample_interval_ms = 20;
    config.companion.poll_timeout_ms = 10;
    config
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct ScriptedBackend {
    create_calls: AtomicUsize,
    create_delay_ms: AtomicU64,
    create_error: Mutex<Option<StartError>>,
    outage: AtomicBool,
    failed_deliveries: AtomicUsize,
    locations: Mutex<Vec<LocationSample>>,
    heart_rates: Mutex<Vec<HeartRateSample>>,
    completions: Mutex<Vec<(SessionId, CompletionAggregates)>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: StdDuration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_create_with(&self, error: StartError) {
        *self.create_error.lock().unwrap() = Some(error);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn failed_deliveries(&self) -> usize {
        self.failed_deliveries.load(Ordering::SeqCst)
    }

    pub fn locations(&self) -> Vec<LocationSample> {
        self.locations.lock().unwrap().clone()
    }

    pub fn heart_rates(&self) -> Vec<HeartRateSample> {
        self.heart_rates.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<(SessionId, CompletionAggregates)> {
        self.completions.lock().unwrap().clone()
    }

    fn check_link(&self) -> Result<(), DeliveryError> {
        if self.outage.load(Ordering::SeqCst) {
            self.failed_deliveries.fetch_add(1, Ordering::SeqCst);
            return Err(DeliveryError::Network("backend unreachable".to_string()));
        }
        Ok(())
    }
}

impl SessionBackend for ScriptedBackend {
    fn create_session(&self, _payload: &CreateSessionPayload) -> Result<SessionId, StartError> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(StdDuration::from_millis(delay));
        }
        if let Some(error) = self.create_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(SessionId::new(format!("session-{}", call)))
    }

    fn append_locations(
        &self,
        _session_id: &SessionId,
        samples: &[LocationSample],
        _timeout: StdDuration,
    ) -> Result<(), DeliveryError> {
        self.check_link()?;
        self.locations.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn append_heart_rates(
        &self,
        _session_id: &SessionId,
        samples: &[HeartRateSample],
        _timeout: StdDuration,
    ) -> Result<(), DeliveryError> {
        self.check_link()?;
        self.heart_rates.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn complete_session(
        &self,
        session_id: &SessionId,
        aggregates: &CompletionAggregates,
        _timeout: StdDuration,
    ) -> Result<(), DeliveryError> {
        self.check_link()?;
        self.completions
            .lock()
            .unwrap()
            .push((session_id.clone(), aggregates.clone()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sensors and probes
// ═══════════════════════════════════════════════════════════════════════════════

/// Location hardware fed from the test through a channel.
pub struct ChannelLocationSource {
    rx: Receiver<LocationSample>,
    modes: Arc<Mutex<Vec<TrackingMode>>>,
}

impl ChannelLocationSource {
    pub fn new() -> (Self, Sender<LocationSample>, Arc<Mutex<Vec<TrackingMode>>>) {
        let (tx, rx) = mpsc::channel();
        let modes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                rx,
                modes: Arc::clone(&modes),
            },
            tx,
            modes,
        )
    }
}

impl LocationSource for ChannelLocationSource {
    fn configure(&mut self, mode: TrackingMode) -> Result<(), IngestionFault> {
        self.modes.lock().unwrap().push(mode);
        Ok(())
    }

    fn poll(&mut self, timeout: StdDuration) -> SourceEvent<LocationSample> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => SourceEvent::Sample(sample),
            Err(RecvTimeoutError::Timeout) => SourceEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => SourceEvent::Closed,
        }
    }
}

/// Health platform holding a fixed set of recorded samples.
pub struct ScriptedHealth(Vec<HeartRateSample>);

impl ScriptedHealth {
    pub fn new(samples: Vec<HeartRateSample>) -> Self {
        Self(samples)
    }
}

impl HealthSource for ScriptedHealth {
    fn query_range(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HeartRateSample>, IngestionFault> {
        Ok(self
            .0
            .iter()
            .filter(|sample| sample.timestamp >= from && sample.timestamp <= to)
            .cloned()
            .collect())
    }
}

/// Memory probe reporting whatever ratio the test last set.
#[derive(Clone)]
pub struct ScriptedMemory(Arc<Mutex<f64>>);

impl ScriptedMemory {
    pub fn new(ratio: f64) -> Self {
        Self(Arc::new(Mutex::new(ratio)))
    }

    pub fn set(&self, ratio: f64) {
        *self.0.lock().unwrap() = ratio;
    }
}

impl MemoryProbe for ScriptedMemory {
    fn usage_ratio(&mut self) -> Option<f64> {
        Some(*self.0.lock().unwrap())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Companion transport
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ChannelInbound(Receiver<InboundEvent>);

impl CompanionInbound for ChannelInbound {
    fn recv(&mut self, timeout: StdDuration) -> InboundEvent {
        match self.0.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => InboundEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => InboundEvent::Closed,
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingOutbound(Arc<Mutex<Vec<HandheldMessage>>>);

impl RecordingOutbound {
    pub fn sent(&self) -> Vec<HandheldMessage> {
        self.0.lock().unwrap().clone()
    }

    /// Replies only; state mirrors are filtered out.
    pub fn replies(&self) -> Vec<HandheldMessage> {
        self.sent()
            .into_iter()
            .filter(|message| !matches!(message, HandheldMessage::StateMirror(_)))
            .collect()
    }
}

impl CompanionOutbound for RecordingOutbound {
    fn send(&mut self, frame: &[u8]) -> Result<(), CompanionError> {
        let message: HandheldMessage =
            serde_json::from_slice(frame).expect("engine sent invalid JSON");
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

/// Companion link whose inbound side is driven by the returned sender.
pub fn companion_link() -> (CompanionLink, Sender<InboundEvent>, RecordingOutbound) {
    let (tx, rx) = mpsc::channel();
    let outbound = RecordingOutbound::default();
    let link = CompanionLink {
        inbound: Box::new(ChannelInbound(rx)),
        outbound: Box::new(outbound.clone()),
    };
    (link, tx, outbound)
}

pub fn command_frame(command_id: &str, command_type: &str, payload: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "commandId": command_id,
        "type": command_type,
        "payload": payload,
        "issuedAt": "2026-03-01T08:00:00Z",
    }))
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Harness {
    pub engine: EngineHandle,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<ScriptedBackend>,
    pub store_path: PathBuf,
    pub memory: ScriptedMemory,
    _temp: TempDir,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with(config, |collaborators| collaborators)
    }

    pub fn with(
        config: EngineConfig,
        customize: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let store_path = temp.path().join("session.db");
        let backend = ScriptedBackend::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let memory = ScriptedMemory::new(0.1);
        let engine = spawn_engine(config, &store_path, &backend, &clock, &memory, customize);
        Self {
            engine,
            clock,
            backend,
            store_path,
            memory,
            _temp: temp,
        }
    }

    /// Shuts the engine down and starts a fresh one on the same store.
    pub fn restart(&mut self, config: EngineConfig) {
        self.restart_with(config, |collaborators| collaborators);
    }

    pub fn restart_with(
        &mut self,
        config: EngineConfig,
        customize: impl FnOnce(Collaborators) -> Collaborators,
    ) {
        self.engine.shutdown();
        self.engine = spawn_engine(
            config,
            &self.store_path,
            &self.backend,
            &self.clock,
            &self.memory,
            customize,
        );
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    pub fn start(&self) -> SessionId {
        self.engine
            .request_start(20.0, 80.0, None)
            .expect("start session")
            .session_id
    }
}

fn spawn_engine(
    config: EngineConfig,
    store_path: &Path,
    backend: &Arc<ScriptedBackend>,
    clock: &Arc<ManualClock>,
    memory: &ScriptedMemory,
    customize: impl FnOnce(Collaborators) -> Collaborators,
) -> EngineHandle {
    let backend: Arc<dyn SessionBackend> = backend.clone();
    let collaborators = Collaborators::new(backend, store_path.to_path_buf())
        .with_clock(clock.clone())
        .with_memory_probe(Box::new(memory.clone()));
    SessionEngine::spawn(config, customize(collaborators)).expect("spawn engine")
}

/// Polls `sync()` until `predicate` holds or the deadline passes.
pub fn wait_for(
    engine: &EngineHandle,
    timeout: StdDuration,
    predicate: impl Fn(&SessionStatus) -> bool,
) -> SessionStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = engine.sync();
        if predicate(&status) {
            return status;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for engine status; last: {:?}", status);
        }
        sleep(StdDuration::from_millis(10));
    }
}

pub fn wait_until(timeout: StdDuration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(StdDuration::from_millis(10));
    }
    panic!("Timed out waiting for condition");
}
