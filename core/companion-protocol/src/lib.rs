//! Wire protocol for the handheld <-> companion (wrist device) channel.
//!
//! This crate is shared by the session engine and companion-side clients to
//! prevent schema drift. The handheld remains the authority on validation and on
//! session state; the companion only requests lifecycle actions and streams
//! sensor samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const MAX_COMMAND_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    StartSession,
    PauseSession,
    ResumeSession,
    EndSession,
    HeartRateUpdate,
    StepUpdate,
}

impl CommandType {
    /// Lifecycle commands get a `*Confirmed` (or failure) reply; sensor
    /// updates are fire-and-forget.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            CommandType::StartSession
                | CommandType::PauseSession
                | CommandType::ResumeSession
                | CommandType::EndSession
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::StartSession => "startSession",
            CommandType::PauseSession => "pauseSession",
            CommandType::ResumeSession => "resumeSession",
            CommandType::EndSession => "endSession",
            CommandType::HeartRateUpdate => "heartRateUpdate",
            CommandType::StepUpdate => "stepUpdate",
        }
    }
}

/// A command sent by the companion. `command_id` is echoed in the reply and is
/// the key used by the handheld to drop retransmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompanionCommand {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Option<Value>,
    pub issued_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionPayload {
    pub ruck_weight_kg: f64,
    pub user_weight_kg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartRatePayload {
    bpm: u16,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepPayload {
    steps: u64,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Typed view of a validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    Start(StartSessionPayload),
    Pause,
    Resume,
    End,
    HeartRate {
        bpm: u16,
        recorded_at: DateTime<Utc>,
    },
    Steps {
        steps: u64,
        recorded_at: DateTime<Utc>,
    },
}

impl CompanionCommand {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        self.body().map(|_| ())
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        parse_rfc3339(&self.issued_at)
    }

    /// Validates the envelope and decodes the payload for its command type.
    pub fn body(&self) -> Result<CommandBody, ErrorInfo> {
        if self.command_id.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_command_id",
                "commandId is required",
            ));
        }
        if self.command_id.len() > MAX_COMMAND_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_command_id",
                format!(
                    "commandId must be {} characters or fewer",
                    MAX_COMMAND_ID_LEN
                ),
            ));
        }
        let issued_at = self.issued_at().ok_or_else(|| {
            ErrorInfo::new("invalid_timestamp", "issuedAt must be RFC3339")
        })?;

        match self.command_type {
            CommandType::StartSession => {
                let payload: StartSessionPayload = decode_payload(&self.payload)?;
                require_weight(payload.ruck_weight_kg, "ruckWeightKg")?;
                require_weight(payload.user_weight_kg, "userWeightKg")?;
                Ok(CommandBody::Start(payload))
            }
            CommandType::PauseSession => Ok(CommandBody::Pause),
            CommandType::ResumeSession => Ok(CommandBody::Resume),
            CommandType::EndSession => Ok(CommandBody::End),
            CommandType::HeartRateUpdate => {
                let payload: HeartRatePayload = decode_payload(&self.payload)?;
                if payload.bpm == 0 {
                    return Err(ErrorInfo::new("invalid_bpm", "bpm must be positive"));
                }
                let recorded_at = sample_time(payload.timestamp.as_deref(), issued_at)?;
                Ok(CommandBody::HeartRate {
                    bpm: payload.bpm,
                    recorded_at,
                })
            }
            CommandType::StepUpdate => {
                let payload: StepPayload = decode_payload(&self.payload)?;
                let recorded_at = sample_time(payload.timestamp.as_deref(), issued_at)?;
                Ok(CommandBody::Steps {
                    steps: payload.steps,
                    recorded_at,
                })
            }
        }
    }
}

pub fn parse_command(value: Value) -> Result<CompanionCommand, ErrorInfo> {
    let command: CompanionCommand = serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new(
            "invalid_message",
            format!("command is invalid JSON: {}", err),
        )
    })?;
    command.validate()?;
    Ok(command)
}

pub fn decode_command(bytes: &[u8]) -> Result<CompanionCommand, ErrorInfo> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            format!("message exceeds {} bytes", MAX_MESSAGE_BYTES),
        ));
    }
    let value: Value = serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new("invalid_message", format!("message is not JSON: {}", err))
    })?;
    parse_command(value)
}

/// Why a companion-initiated start did not produce a session.
///
/// Serialized as a bare string; `NeedsPermission` carries the permission kind
/// after a colon (`needsPermission:location`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ReasonCode {
    AlreadyActive,
    NotReachable,
    NeedsPermission(String),
    HealthNotAvailable,
    Busy,
    Timeout,
    Unknown,
}

impl ReasonCode {
    pub fn as_wire(&self) -> String {
        match self {
            ReasonCode::AlreadyActive => "alreadyActive".to_string(),
            ReasonCode::NotReachable => "notReachable".to_string(),
            ReasonCode::NeedsPermission(kind) => format!("needsPermission:{}", kind),
            ReasonCode::HealthNotAvailable => "healthNotAvailable".to_string(),
            ReasonCode::Busy => "busy".to_string(),
            ReasonCode::Timeout => "timeout".to_string(),
            ReasonCode::Unknown => "unknown".to_string(),
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        if let Some(kind) = value.strip_prefix("needsPermission:") {
            if kind.trim().is_empty() {
                return None;
            }
            return Some(ReasonCode::NeedsPermission(kind.to_string()));
        }
        match value {
            "alreadyActive" => Some(ReasonCode::AlreadyActive),
            "notReachable" => Some(ReasonCode::NotReachable),
            "healthNotAvailable" => Some(ReasonCode::HealthNotAvailable),
            "busy" => Some(ReasonCode::Busy),
            "timeout" => Some(ReasonCode::Timeout),
            "unknown" => Some(ReasonCode::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

impl From<ReasonCode> for String {
    fn from(code: ReasonCode) -> Self {
        code.as_wire()
    }
}

impl TryFrom<String> for ReasonCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ReasonCode::from_wire(&value).ok_or_else(|| format!("unknown reasonCode: {}", value))
    }
}

/// Periodic push from the handheld so the companion can render without
/// computing anything locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMirror {
    pub is_active: bool,
    pub is_paused: bool,
    pub duration_sec: u64,
    pub distance_km: f64,
    #[serde(default)]
    pub pace: Option<f64>,
    #[serde(default)]
    pub hr_bpm: Option<u16>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub sent_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandheldMessage {
    #[serde(rename_all = "camelCase")]
    StartConfirmed {
        command_id: String,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionStartFailed {
        command_id: String,
        reason_code: ReasonCode,
    },
    #[serde(rename_all = "camelCase")]
    PauseConfirmed { command_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeConfirmed { command_id: String },
    #[serde(rename_all = "camelCase")]
    EndConfirmed { command_id: String },
    #[serde(rename_all = "camelCase")]
    CommandRejected {
        #[serde(default)]
        command_id: Option<String>,
        error: ErrorInfo,
    },
    StateMirror(StateMirror),
}

impl HandheldMessage {
    pub fn command_id(&self) -> Option<&str> {
        match self {
            HandheldMessage::StartConfirmed { command_id, .. }
            | HandheldMessage::SessionStartFailed { command_id, .. }
            | HandheldMessage::PauseConfirmed { command_id }
            | HandheldMessage::ResumeConfirmed { command_id }
            | HandheldMessage::EndConfirmed { command_id } => Some(command_id.as_str()),
            HandheldMessage::CommandRejected { command_id, .. } => command_id.as_deref(),
            HandheldMessage::StateMirror(_) => None,
        }
    }
}

pub fn encode_message(message: &HandheldMessage) -> Result<Vec<u8>, ErrorInfo> {
    serde_json::to_vec(message).map_err(|err| {
        ErrorInfo::new(
            "encode_failed",
            format!("failed to encode message: {}", err),
        )
    })
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Companion-side gate for sensor streaming.
///
/// Streaming starts only once a `startConfirmed` has been observed and stops
/// on `endConfirmed` or on a mirror reporting no running session. Mirrors
/// never start streaming on their own, so a reconnect needs no new handshake
/// but also cannot resurrect an ended session.
#[derive(Debug, Default, Clone)]
pub struct StreamingGate {
    streaming: bool,
    session_id: Option<String>,
}

impl StreamingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn observe(&mut self, message: &HandheldMessage) -> bool {
        match message {
            HandheldMessage::StartConfirmed { session_id, .. } => {
                self.streaming = true;
                self.session_id = Some(session_id.clone());
            }
            HandheldMessage::EndConfirmed { .. } => {
                self.streaming = false;
                self.session_id = None;
            }
            HandheldMessage::StateMirror(mirror) => {
                if !mirror.is_active && !mirror.is_paused {
                    self.streaming = false;
                    self.session_id = None;
                }
            }
            _ => {}
        }
        self.streaming
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &Option<Value>) -> Result<T, ErrorInfo> {
    let value = payload
        .clone()
        .ok_or_else(|| ErrorInfo::new("missing_field", "payload is required"))?;
    serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new("invalid_payload", format!("payload is invalid: {}", err))
    })
}

fn require_weight(value: f64, field: &str) -> Result<(), ErrorInfo> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(ErrorInfo::new(
        "invalid_payload",
        format!("{} must be a non-negative number", field),
    ))
}

fn sample_time(value: Option<&str>, fallback: DateTime<Utc>) -> Result<DateTime<Utc>, ErrorInfo> {
    match value {
        None => Ok(fallback),
        Some(raw) => parse_rfc3339(raw).ok_or_else(|| {
            ErrorInfo::new("invalid_timestamp", "timestamp must be RFC3339")
        }),
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_command(command_type: CommandType, payload: Option<Value>) -> CompanionCommand {
        CompanionCommand {
            command_id: "cmd-1".to_string(),
            command_type,
            payload,
            issued_at: "2026-03-01T08:00:00Z".to_string(),
        }
    }

    #[test]
    fn parses_start_command_from_wire_json() {
        let value = json!({
            "commandId": "watch-42",
            "type": "startSession",
            "payload": { "ruckWeightKg": 20.0, "userWeightKg": 80.0 },
            "issuedAt": "2026-03-01T08:00:00Z"
        });
        let command = parse_command(value).expect("parse");
        assert_eq!(command.command_id, "watch-42");
        match command.body().expect("body") {
            CommandBody::Start(payload) => {
                assert!((payload.ruck_weight_kg - 20.0).abs() < f64::EPSILON);
                assert!((payload.user_weight_kg - 80.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn rejects_start_without_payload() {
        let command = base_command(CommandType::StartSession, None);
        let err = command.validate().expect_err("missing payload");
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_negative_ruck_weight() {
        let command = base_command(
            CommandType::StartSession,
            Some(json!({ "ruckWeightKg": -1.0, "userWeightKg": 80.0 })),
        );
        assert!(command.validate().is_err());
    }

    #[test]
    fn rejects_empty_and_long_command_ids() {
        let mut command = base_command(CommandType::PauseSession, None);
        command.command_id = "  ".to_string();
        assert!(command.validate().is_err());
        command.command_id = "a".repeat(MAX_COMMAND_ID_LEN + 1);
        assert!(command.validate().is_err());
    }

    #[test]
    fn rejects_bad_issued_at() {
        let mut command = base_command(CommandType::EndSession, None);
        command.issued_at = "yesterday".to_string();
        let err = command.validate().expect_err("bad timestamp");
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn rejects_unknown_fields() {
        let value = json!({
            "commandId": "x",
            "type": "pauseSession",
            "issuedAt": "2026-03-01T08:00:00Z",
            "extra": true
        });
        assert!(parse_command(value).is_err());
    }

    #[test]
    fn heart_rate_defaults_to_issued_at() {
        let command = base_command(CommandType::HeartRateUpdate, Some(json!({ "bpm": 132 })));
        match command.body().expect("body") {
            CommandBody::HeartRate { bpm, recorded_at } => {
                assert_eq!(bpm, 132);
                assert_eq!(recorded_at.to_rfc3339(), "2026-03-01T08:00:00+00:00");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn rejects_zero_bpm() {
        let command = base_command(CommandType::HeartRateUpdate, Some(json!({ "bpm": 0 })));
        assert!(command.validate().is_err());
    }

    #[test]
    fn decode_rejects_oversized_messages() {
        let bytes = vec![b' '; MAX_MESSAGE_BYTES + 1];
        let err = decode_command(&bytes).expect_err("too large");
        assert_eq!(err.code, "message_too_large");
    }

    #[test]
    fn reason_codes_use_wire_strings() {
        let message = HandheldMessage::SessionStartFailed {
            command_id: "cmd-9".to_string(),
            reason_code: ReasonCode::NeedsPermission("location".to_string()),
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "sessionStartFailed");
        assert_eq!(value["commandId"], "cmd-9");
        assert_eq!(value["reasonCode"], "needsPermission:location");

        let back: HandheldMessage = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, message);
    }

    #[test]
    fn reason_code_rejects_unknown_and_empty_permission() {
        assert_eq!(ReasonCode::from_wire("busy"), Some(ReasonCode::Busy));
        assert_eq!(ReasonCode::from_wire("needsPermission:"), None);
        assert_eq!(ReasonCode::from_wire("sleepy"), None);
    }

    #[test]
    fn state_mirror_is_tagged() {
        let message = HandheldMessage::StateMirror(StateMirror {
            is_active: true,
            is_paused: false,
            duration_sec: 61,
            distance_km: 0.42,
            pace: Some(12.5),
            hr_bpm: Some(118),
            session_id: Some("s-1".to_string()),
            sent_at: "2026-03-01T08:01:01Z".to_string(),
        });
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "stateMirror");
        assert_eq!(value["isActive"], true);
        assert_eq!(value["durationSec"], 61);
        assert_eq!(value["hrBpm"], 118);
    }

    #[test]
    fn streaming_gate_follows_confirmations() {
        let mut gate = StreamingGate::new();
        let mirror = |is_active: bool| {
            HandheldMessage::StateMirror(StateMirror {
                is_active,
                is_paused: false,
                duration_sec: 0,
                distance_km: 0.0,
                pace: None,
                hr_bpm: None,
                session_id: None,
                sent_at: "2026-03-01T08:00:00Z".to_string(),
            })
        };

        assert!(!gate.observe(&mirror(true)), "mirror alone must not start streaming");
        assert!(gate.observe(&HandheldMessage::StartConfirmed {
            command_id: "c1".to_string(),
            session_id: "s-1".to_string(),
        }));
        assert_eq!(gate.session_id(), Some("s-1"));
        assert!(gate.observe(&mirror(true)));
        assert!(!gate.observe(&HandheldMessage::EndConfirmed {
            command_id: "c2".to_string(),
        }));
        assert!(!gate.is_streaming());
    }
}
