//! Messages consumed by the controller actor.
//!
//! Every producer (UI handle, ticker, ingestors, companion reader, resource
//! monitor, upload worker, snapshot writer) talks to the controller only by
//! sending one of these into its inbox.

use ruck_companion_protocol::{CompanionCommand, ErrorInfo};
use std::sync::mpsc::Sender;

use crate::error::{IngestionFault, StartError};
use crate::heart_rate::HeartRateSourceKind;
use crate::resource::Directive;
use crate::status::SessionStatus;
use crate::types::{
    HeartRateSample, LocationSample, Session, SessionHandle, SessionId, StartParams,
};
use crate::upload::UploadReport;

pub type StartReply = Sender<Result<SessionHandle, StartError>>;

#[derive(Debug)]
pub enum EngineMessage {
    /// Restore from the persisted snapshot; answered with the restored session.
    Recover(Sender<Option<Session>>),
    Start {
        params: StartParams,
        reply: Option<StartReply>,
    },
    Pause,
    Resume,
    Stop {
        finalize: bool,
    },
    Tick,
    StartResolved {
        attempt: u64,
        result: Result<SessionId, StartError>,
    },
    Location(LocationSample),
    LocationFault(IngestionFault),
    HeartRate {
        source: HeartRateSourceKind,
        sample: HeartRateSample,
    },
    HeartRateFault {
        source: HeartRateSourceKind,
        fault: IngestionFault,
    },
    Companion(CompanionCommand),
    CompanionInvalid {
        command_id: Option<String>,
        error: ErrorInfo,
    },
    CompanionReachability(bool),
    Resource(Directive),
    UploadProgress(UploadReport),
    PersistenceFailed(String),
    /// Barrier: answered with the current status once every earlier message
    /// has been handled and pending snapshot writes are on disk.
    Sync(Sender<SessionStatus>),
    Shutdown,
}
