//! Observable engine status.
//!
//! The controller publishes a [`SessionStatus`] after handling each message;
//! callers read the latest value or subscribe to changes.

use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::error::{CompanionError, IngestionFault};
use crate::heart_rate::HeartRateSourceKind;
use crate::location::TrackingMode;
use crate::resource::MemoryPressure;
use crate::types::{SessionId, SessionState};

/// Absorbed faults. None of these end a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Degradation {
    pub location_fault: Option<IngestionFault>,
    pub heart_rate_fault: Option<IngestionFault>,
    pub heart_rate_source: Option<HeartRateSourceKind>,
    pub heart_rate_fallback: bool,
    pub companion_error: Option<CompanionError>,
    /// `None` when no companion is attached.
    pub companion_reachable: Option<bool>,
    pub delivery_failing: bool,
    pub offline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<SessionId>,
    pub elapsed_secs: i64,
    pub accumulated_paused_secs: i64,
    pub distance_km: f64,
    pub pace_min_per_km: Option<f64>,
    pub average_pace_min_per_km: Option<f64>,
    pub calories_burned: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub heart_rate_bpm: Option<u16>,
    pub steps: u64,
    pub tracking_mode: TrackingMode,
    pub pressure: MemoryPressure,
    pub pending_uploads: usize,
    pub degraded: Degradation,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            elapsed_secs: 0,
            accumulated_paused_secs: 0,
            distance_km: 0.0,
            pace_min_per_km: None,
            average_pace_min_per_km: None,
            calories_burned: 0.0,
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            heart_rate_bpm: None,
            steps: 0,
            tracking_mode: TrackingMode::default(),
            pressure: MemoryPressure::default(),
            pending_uploads: 0,
            degraded: Degradation::default(),
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    latest: Mutex<SessionStatus>,
    subscribers: Mutex<Vec<Sender<SessionStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> SessionStatus {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stores `status` and fans it out if it differs from the last value.
    /// Subscribers whose receiver is gone are dropped.
    pub fn publish(&self, status: SessionStatus) {
        {
            let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
            if *latest == status {
                return;
            }
            *latest = status.clone();
        }
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Receiver<SessionStatus> {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(self.latest());
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_changes_only() {
        let board = StatusBoard::new();
        let rx = board.subscribe();
        assert_eq!(rx.try_recv().unwrap().state, SessionState::Idle);

        board.publish(SessionStatus::default());
        assert!(rx.try_recv().is_err());

        let status = SessionStatus {
            state: SessionState::Starting,
            ..SessionStatus::default()
        };
        board.publish(status);
        assert_eq!(rx.try_recv().unwrap().state, SessionState::Starting);
        assert_eq!(board.latest().state, SessionState::Starting);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let board = StatusBoard::new();
        drop(board.subscribe());
        board.publish(SessionStatus {
            state: SessionState::Active,
            ..SessionStatus::default()
        });
        assert!(board.subscribers.lock().unwrap().is_empty());
    }
}
