//! # ruck-session-engine
//!
//! Active session engine for ruck tracking: the part of the handheld app that
//! owns a workout from "start" to "completed" and survives process death in
//! between.
//!
//! ## Design Principles
//!
//! - **Single writer**: one controller thread owns the [`Session`]; sensors,
//!   timers, the companion link and the upload worker only post messages.
//! - **Synchronous**: std threads and channels, no async runtime.
//! - **Degrade, don't fail**: sensor, network and companion faults show up as
//!   degraded status. Only a start failure, an explicit discard or a lost
//!   snapshot ends a session.
//! - **At-least-once delivery**: samples leave the upload queue only after
//!   the backend acknowledged them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ruck_session_engine::{Collaborators, EngineConfig, SessionEngine, StorageConfig};
//!
//! let storage = StorageConfig::from_home()?;
//! let collaborators = Collaborators::new(backend, storage.session_db())
//!     .with_location(gps);
//! let mut engine = SessionEngine::spawn(EngineConfig::default(), collaborators)?;
//! engine.recover();
//! let handle = engine.request_start(20.0, 80.0, None)?;
//! ```

pub mod backend;
pub mod clock;
pub mod companion;
pub mod config;
mod controller;
pub mod engine;
pub mod error;
pub mod health;
pub mod heart_rate;
pub mod location;
pub mod message;
pub mod metrics;
pub mod resource;
pub mod status;
pub mod storage;
pub mod store;
pub mod types;
pub mod upload;

pub use backend::{CompletionAggregates, CreateSessionPayload, SessionBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use companion::{CompanionInbound, CompanionLink, CompanionOutbound, InboundEvent};
pub use config::{load_engine_config, EngineConfig};
pub use engine::{Collaborators, EngineHandle, SessionEngine};
pub use error::{CompanionError, ConfigError, DeliveryError, IngestionFault, StartError, StoreError};
pub use health::HealthSource;
pub use heart_rate::{HeartRateSource, HeartRateSourceKind};
pub use location::{LocationSource, SourceEvent, TrackingMode};
pub use message::EngineMessage;
pub use metrics::{EnergyInput, EnergyModel, MetEnergyModel};
pub use resource::{ConnectivityProbe, MemoryPressure, MemoryProbe};
pub use status::{Degradation, SessionStatus};
pub use storage::StorageConfig;
pub use store::{PersistedSnapshot, SessionStore};
pub use types::*;
