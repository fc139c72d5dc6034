//! Engine runtime: wires collaborators, spawns the worker threads and runs
//! the controller actor.
//!
//! ```text
//!   EngineHandle ─┐
//!   Ticker ───────┤
//!   Ingestors ────┼──► inbox ──► SessionController ──► SnapshotWriter
//!   Companion ────┤                    │
//!   Resources ────┤                    └──► UploadShared ◄── UploadWorker
//!   UploadWorker ─┘
//! ```

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::clock::{Clock, SystemClock};
use crate::companion::{CompanionChannel, CompanionLink, CompanionReader};
use crate::config::EngineConfig;
use crate::controller::{ControllerParts, SessionController};
use crate::error::{StartError, StoreError};
use crate::health::HealthSource;
use crate::heart_rate::{HeartRateIngestor, HeartRateSource};
use crate::location::{IngestorSwitch, LocationIngestor, LocationSource};
use crate::message::EngineMessage;
use crate::metrics::{EnergyModel, MetEnergyModel};
use crate::resource::{AlwaysOnline, ConnectivityProbe, MemoryProbe, ResourceMonitor, SysinfoProbe};
use crate::status::{SessionStatus, StatusBoard};
use crate::store::{SessionStore, SnapshotWriter};
use crate::types::{Session, SessionHandle, StartParams};
use crate::upload::{UploadCoordinator, UploadShared, UploadWorker};

/// Everything the host plugs into the engine. Only the backend and the store
/// location are required.
pub struct Collaborators {
    backend: Arc<dyn SessionBackend>,
    store_path: PathBuf,
    clock: Arc<dyn Clock>,
    location: Option<Box<dyn LocationSource>>,
    heart_rate: Option<Box<dyn HeartRateSource>>,
    companion: Option<CompanionLink>,
    health: Option<Box<dyn HealthSource>>,
    memory: Option<Box<dyn MemoryProbe>>,
    connectivity: Option<Box<dyn ConnectivityProbe>>,
    energy: Option<Box<dyn EnergyModel>>,
}

impl Collaborators {
    pub fn new(backend: Arc<dyn SessionBackend>, store_path: PathBuf) -> Self {
        Self {
            backend,
            store_path,
            clock: Arc::new(SystemClock),
            location: None,
            heart_rate: None,
            companion: None,
            health: None,
            memory: None,
            connectivity: None,
            energy: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_location(mut self, source: Box<dyn LocationSource>) -> Self {
        self.location = Some(source);
        self
    }

    pub fn with_heart_rate(mut self, source: Box<dyn HeartRateSource>) -> Self {
        self.heart_rate = Some(source);
        self
    }

    pub fn with_companion(mut self, link: CompanionLink) -> Self {
        self.companion = Some(link);
        self
    }

    pub fn with_health(mut self, source: Box<dyn HealthSource>) -> Self {
        self.health = Some(source);
        self
    }

    /// Defaults to a `sysinfo` probe over the configured memory budget.
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.memory = Some(probe);
        self
    }

    pub fn with_connectivity(mut self, probe: Box<dyn ConnectivityProbe>) -> Self {
        self.connectivity = Some(probe);
        self
    }

    pub fn with_energy_model(mut self, model: Box<dyn EnergyModel>) -> Self {
        self.energy = Some(model);
        self
    }
}

pub struct SessionEngine;

impl SessionEngine {
    /// Opens the store, starts every worker thread and the controller actor.
    /// Nothing is restored until [`EngineHandle::recover`] is called.
    pub fn spawn(
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<EngineHandle, StoreError> {
        let Collaborators {
            backend,
            store_path,
            clock,
            location,
            heart_rate,
            companion,
            health,
            memory,
            connectivity,
            energy,
        } = collaborators;

        let store = SessionStore::open(store_path)?;
        let (inbox, rx) = mpsc::channel::<EngineMessage>();
        let status = Arc::new(StatusBoard::new());

        let writer = SnapshotWriter::spawn(
            store.clone(),
            config.persistence.write_attempts,
            inbox.clone(),
        );
        let uploads = UploadShared::new(UploadCoordinator::new(config.upload.clone()));

        let switch = Arc::new(IngestorSwitch::new(config.location.preferred_mode));
        let location_ingestor = location.map(|source| {
            LocationIngestor::spawn(source, &config.location, Arc::clone(&switch), inbox.clone())
        });
        let heart_rate_ingestor = heart_rate.map(|source| {
            HeartRateIngestor::spawn(
                source,
                StdDuration::from_millis(config.location.poll_timeout_ms),
                inbox.clone(),
            )
        });

        let (channel, reader) = match companion {
            Some(CompanionLink { inbound, outbound }) => (
                Some(CompanionChannel::new(outbound, &config.companion)),
                Some(CompanionReader::spawn(
                    inbound,
                    StdDuration::from_millis(config.companion.poll_timeout_ms),
                    inbox.clone(),
                )),
            ),
            None => (None, None),
        };

        let memory =
            memory.unwrap_or_else(|| Box::new(SysinfoProbe::new(config.resource.memory_budget_mb)));
        let connectivity = connectivity.unwrap_or_else(|| Box::new(AlwaysOnline));
        let monitor = ResourceMonitor::spawn(
            memory,
            connectivity,
            &config.resource,
            Arc::clone(&clock),
            inbox.clone(),
        );

        let upload_worker = UploadWorker::spawn(
            Arc::clone(&uploads),
            Arc::clone(&backend),
            Arc::clone(&clock),
            StdDuration::from_millis(config.upload.worker_poll_ms),
            inbox.clone(),
        );

        let ticker = config
            .lifecycle
            .auto_tick
            .then(|| Ticker::spawn(config.lifecycle.tick_interval(), inbox.clone()));

        let start_timeout = config.lifecycle.start_timeout();
        let command_wait = config.lifecycle.command_wait();

        let controller = SessionController::new(ControllerParts {
            config,
            clock,
            backend,
            store,
            writer,
            uploads,
            status: Arc::clone(&status),
            location: switch,
            companion: channel,
            health,
            energy: energy.unwrap_or_else(|| Box::new(MetEnergyModel::default())),
            inbox: inbox.clone(),
        });
        let actor = thread::spawn(move || run_actor(controller, rx));
        info!("Session engine started");

        Ok(EngineHandle {
            inbox,
            status,
            start_timeout,
            command_wait,
            actor: Some(actor),
            ticker,
            location: location_ingestor,
            heart_rate: heart_rate_ingestor,
            companion: reader,
            monitor: Some(monitor),
            uploads: Some(upload_worker),
        })
    }
}

fn run_actor(mut controller: SessionController, rx: Receiver<EngineMessage>) {
    while let Ok(message) = rx.recv() {
        let last = matches!(message, EngineMessage::Shutdown);
        controller.handle(message);
        if last {
            break;
        }
    }
}

/// Periodic `Tick` producer.
struct Ticker {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn(interval: StdDuration, sink: Sender<EngineMessage>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if sink.send(EngineMessage::Tick).is_err() {
                        break;
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Caller-facing side of a running engine. Every operation is a message to
/// the controller; nothing here touches session state directly.
pub struct EngineHandle {
    inbox: Sender<EngineMessage>,
    status: Arc<StatusBoard>,
    start_timeout: StdDuration,
    command_wait: StdDuration,
    actor: Option<JoinHandle<()>>,
    ticker: Option<Ticker>,
    location: Option<LocationIngestor>,
    heart_rate: Option<HeartRateIngestor>,
    companion: Option<CompanionReader>,
    monitor: Option<ResourceMonitor>,
    uploads: Option<UploadWorker>,
}

impl EngineHandle {
    /// Restores the persisted snapshot, if any. Runs once; later calls return
    /// the current session without touching the store.
    pub fn recover(&self) -> Option<Session> {
        let (tx, rx) = mpsc::channel();
        self.send(EngineMessage::Recover(tx));
        rx.recv_timeout(self.command_wait).ok().flatten()
    }

    /// Starts a session and waits (bounded) for the backend to confirm it. On
    /// `Timeout` the backend call keeps running and a late success still
    /// activates the session.
    pub fn request_start(
        &self,
        ruck_weight_kg: f64,
        user_weight_kg: f64,
        planned_route_id: Option<String>,
    ) -> Result<SessionHandle, StartError> {
        let params = StartParams {
            ruck_weight_kg,
            user_weight_kg,
            planned_route_id,
        };
        let (tx, rx) = mpsc::channel();
        if !self.send(EngineMessage::Start {
            params,
            reply: Some(tx),
        }) {
            return Err(StartError::Timeout);
        }
        match rx.recv_timeout(self.start_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(StartError::Timeout)
            }
        }
    }

    pub fn pause(&self) {
        self.send(EngineMessage::Pause);
    }

    pub fn resume(&self) {
        self.send(EngineMessage::Resume);
    }

    /// `finalize = false` discards the session.
    pub fn stop(&self, finalize: bool) {
        self.send(EngineMessage::Stop { finalize });
    }

    /// Manual tick for hosts that run with `auto_tick = false`.
    pub fn tick(&self) {
        self.send(EngineMessage::Tick);
    }

    /// Latest published status. Does not wait for queued messages.
    pub fn status(&self) -> SessionStatus {
        self.status.latest()
    }

    /// Waits until every message sent so far has been handled and the
    /// resulting snapshot writes are on disk.
    pub fn sync(&self) -> SessionStatus {
        let (tx, rx) = mpsc::channel();
        if !self.send(EngineMessage::Sync(tx)) {
            return self.status();
        }
        rx.recv_timeout(self.command_wait)
            .unwrap_or_else(|_| self.status())
    }

    pub fn subscribe(&self) -> Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Inbox for hosts that feed samples or commands without a source
    /// thread (replay, tests).
    pub fn sender(&self) -> Sender<EngineMessage> {
        self.inbox.clone()
    }

    /// Stops producers, lets the controller write its final snapshot, then
    /// stops the upload worker. A live session is left recoverable.
    pub fn shutdown(&mut self) {
        if self.actor.is_none() {
            return;
        }
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        if let Some(mut ingestor) = self.location.take() {
            ingestor.stop();
        }
        if let Some(mut ingestor) = self.heart_rate.take() {
            ingestor.stop();
        }
        if let Some(mut reader) = self.companion.take() {
            reader.stop();
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }

        let _ = self.inbox.send(EngineMessage::Shutdown);
        if let Some(actor) = self.actor.take() {
            if actor.join().is_err() {
                warn!("Session controller thread panicked");
            }
        }
        if let Some(mut worker) = self.uploads.take() {
            worker.stop();
        }
        info!("Session engine stopped");
    }

    fn send(&self, message: EngineMessage) -> bool {
        match self.inbox.send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(message = ?err.0, "Engine is not running; message dropped");
                false
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
