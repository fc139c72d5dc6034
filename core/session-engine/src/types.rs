//! Core data model: session aggregate and sensor samples.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StartError;

pub const MIN_RUCK_WEIGHT_KG: f64 = 0.0;
pub const MAX_RUCK_WEIGHT_KG: f64 = 100.0;
pub const MIN_USER_WEIGHT_KG: f64 = 20.0;
pub const MAX_USER_WEIGHT_KG: f64 = 500.0;

/// Backend-assigned session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Recovered,
    Active,
    Paused,
    Completing,
    Completed,
    Discarded,
}

impl SessionState {
    /// States from which a new session may be started.
    pub fn is_quiescent(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Completed | SessionState::Discarded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recovered => "recovered",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Discarded => "discarded",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub horizontal_accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

impl Timestamped for LocationSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub timestamp: DateTime<Utc>,
}

impl Timestamped for HeartRateSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    pub ruck_weight_kg: f64,
    pub user_weight_kg: f64,
    #[serde(default)]
    pub planned_route_id: Option<String>,
}

impl StartParams {
    pub fn validate(&self) -> Result<(), StartError> {
        if !self.ruck_weight_kg.is_finite()
            || !(MIN_RUCK_WEIGHT_KG..=MAX_RUCK_WEIGHT_KG).contains(&self.ruck_weight_kg)
        {
            return Err(StartError::Validation(format!(
                "ruck weight must be between {} and {} kg",
                MIN_RUCK_WEIGHT_KG, MAX_RUCK_WEIGHT_KG
            )));
        }
        if !self.user_weight_kg.is_finite()
            || !(MIN_USER_WEIGHT_KG..=MAX_USER_WEIGHT_KG).contains(&self.user_weight_kg)
        {
            return Err(StartError::Validation(format!(
                "user weight must be between {} and {} kg",
                MIN_USER_WEIGHT_KG, MAX_USER_WEIGHT_KG
            )));
        }
        if let Some(route_id) = &self.planned_route_id {
            if route_id.trim().is_empty() {
                return Err(StartError::Validation(
                    "planned route id must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Returned to the caller once the backend has confirmed the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateStats {
    pub count: u64,
    pub sum: u64,
    pub max: u16,
    pub last: Option<u16>,
}

impl HeartRateStats {
    pub fn record(&mut self, bpm: u16) {
        self.count += 1;
        self.sum += u64::from(bpm);
        self.max = self.max.max(bpm);
        self.last = Some(bpm);
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum as f64 / self.count as f64)
        }
    }
}

/// The tracked workout. Owned and mutated only by the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Option<SessionId>,
    pub state: SessionState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub accumulated_paused_ms: i64,
    pub ruck_weight_kg: f64,
    pub user_weight_kg: f64,
    #[serde(default)]
    pub planned_route_id: Option<String>,
    pub total_distance_km: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub calories_burned: f64,
    #[serde(default)]
    pub steps: u64,
    #[serde(default)]
    pub heart_rate: HeartRateStats,
    #[serde(default)]
    pub last_location: Option<LocationSample>,
}

impl Session {
    pub fn provisional(params: &StartParams, now: DateTime<Utc>) -> Self {
        Self {
            session_id: None,
            state: SessionState::Starting,
            requested_at: now,
            started_at: None,
            paused_at: None,
            ended_at: None,
            accumulated_paused_ms: 0,
            ruck_weight_kg: params.ruck_weight_kg,
            user_weight_kg: params.user_weight_kg,
            planned_route_id: params.planned_route_id.clone(),
            total_distance_km: 0.0,
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            calories_burned: 0.0,
            steps: 0,
            heart_rate: HeartRateStats::default(),
            last_location: None,
        }
    }

    pub fn accumulated_paused(&self) -> Duration {
        Duration::milliseconds(self.accumulated_paused_ms)
    }

    /// Time spent Active. Frozen at `paused_at` while paused and at
    /// `ended_at` once the session is completing.
    pub fn elapsed_active(&self, now: DateTime<Utc>) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::zero();
        };
        let end = self.paused_at.or(self.ended_at).unwrap_or(now);
        let elapsed = end - started_at - self.accumulated_paused();
        elapsed.max(Duration::zero())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) {
        self.paused_at = Some(now);
        self.state = SessionState::Paused;
    }

    pub fn resume(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.paused_at.take() {
            let paused_for = (now - paused_at).max(Duration::zero());
            self.accumulated_paused_ms += paused_for.num_milliseconds();
        }
        self.state = SessionState::Active;
    }

    /// Freezes the clock for completion; an open pause is folded into the
    /// accumulated paused time first.
    pub fn end(&mut self, now: DateTime<Utc>) {
        if self.paused_at.is_some() {
            self.resume(now);
        }
        self.ended_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn active_session() -> Session {
        let params = StartParams {
            ruck_weight_kg: 20.0,
            user_weight_kg: 80.0,
            planned_route_id: None,
        };
        let mut session = Session::provisional(&params, t0());
        session.started_at = Some(t0());
        session.state = SessionState::Active;
        session
    }

    #[test]
    fn elapsed_excludes_paused_time() {
        let mut session = active_session();
        session.pause(t0() + Duration::seconds(10));
        assert_eq!(
            session.elapsed_active(t0() + Duration::seconds(30)),
            Duration::seconds(10)
        );
        session.resume(t0() + Duration::seconds(15));
        assert_eq!(session.accumulated_paused(), Duration::seconds(5));
        assert_eq!(
            session.elapsed_active(t0() + Duration::seconds(20)),
            Duration::seconds(15)
        );
    }

    #[test]
    fn end_folds_open_pause_and_freezes() {
        let mut session = active_session();
        session.pause(t0() + Duration::seconds(60));
        session.end(t0() + Duration::seconds(90));
        assert!(session.paused_at.is_none());
        assert_eq!(session.accumulated_paused(), Duration::seconds(30));
        assert_eq!(
            session.elapsed_active(t0() + Duration::seconds(500)),
            Duration::seconds(60)
        );
    }

    #[test]
    fn validates_weights() {
        let mut params = StartParams {
            ruck_weight_kg: 20.0,
            user_weight_kg: 80.0,
            planned_route_id: None,
        };
        assert!(params.validate().is_ok());
        params.ruck_weight_kg = 150.0;
        assert!(matches!(params.validate(), Err(StartError::Validation(_))));
        params.ruck_weight_kg = 10.0;
        params.user_weight_kg = f64::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn heart_rate_stats_track_average_and_max() {
        let mut stats = HeartRateStats::default();
        assert_eq!(stats.average(), None);
        stats.record(100);
        stats.record(140);
        assert_eq!(stats.average(), Some(120.0));
        assert_eq!(stats.max, 140);
        assert_eq!(stats.last, Some(140));
    }
}
