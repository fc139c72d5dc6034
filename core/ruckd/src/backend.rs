//! Backend stand-in for replays: logs every call, keeps counts, and can be
//! told to be unreachable for a window of simulated time.

use chrono::{DateTime, Duration, Utc};
use ruck_session_engine::{
    Clock, CompletionAggregates, CreateSessionPayload, DeliveryError, HeartRateSample,
    LocationSample, SessionBackend, SessionId, StartError,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::{info, warn};

/// Half-open interval of simulated time during which every call fails.
#[derive(Debug, Clone, Copy)]
pub struct Outage {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Outage {
    pub fn new(from: DateTime<Utc>, length: Duration) -> Self {
        Self {
            from,
            until: from + length,
        }
    }

    fn covers(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.until
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryCounts {
    pub locations: usize,
    pub heart_rates: usize,
    pub failed_calls: usize,
    pub completion: Option<CompletionAggregates>,
}

pub struct LoggingBackend {
    clock: Arc<dyn Clock>,
    outage: Option<Outage>,
    counts: Mutex<DeliveryCounts>,
}

impl LoggingBackend {
    pub fn new(clock: Arc<dyn Clock>, outage: Option<Outage>) -> Self {
        Self {
            clock,
            outage,
            counts: Mutex::new(DeliveryCounts::default()),
        }
    }

    pub fn counts(&self) -> DeliveryCounts {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_link(&self, call: &str) -> Result<(), DeliveryError> {
        let now = self.clock.now();
        let down = self.outage.map_or(false, |outage| outage.covers(now));
        if down {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            counts.failed_calls += 1;
            warn!(call, at = %now, "Simulated backend outage");
            return Err(DeliveryError::Network("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl SessionBackend for LoggingBackend {
    fn create_session(&self, payload: &CreateSessionPayload) -> Result<SessionId, StartError> {
        if self.check_link("createSession").is_err() {
            return Err(StartError::Network("simulated outage".to_string()));
        }
        let session_id = SessionId::new(format!("replay-{}", ulid::Ulid::new()));
        info!(
            session_id = %session_id,
            ruck_weight_kg = payload.ruck_weight_kg,
            user_weight_kg = payload.user_weight_kg,
            "createSession"
        );
        Ok(session_id)
    }

    fn append_locations(
        &self,
        session_id: &SessionId,
        samples: &[LocationSample],
        _timeout: StdDuration,
    ) -> Result<(), DeliveryError> {
        self.check_link("appendLocations")?;
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.locations += samples.len();
        info!(session_id = %session_id, batch = samples.len(), total = counts.locations, "appendLocations");
        Ok(())
    }

    fn append_heart_rates(
        &self,
        session_id: &SessionId,
        samples: &[HeartRateSample],
        _timeout: StdDuration,
    ) -> Result<(), DeliveryError> {
        self.check_link("appendHeartRates")?;
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.heart_rates += samples.len();
        info!(session_id = %session_id, batch = samples.len(), total = counts.heart_rates, "appendHeartRates");
        Ok(())
    }

    fn complete_session(
        &self,
        session_id: &SessionId,
        aggregates: &CompletionAggregates,
        _timeout: StdDuration,
    ) -> Result<(), DeliveryError> {
        self.check_link("completeSession")?;
        info!(
            session_id = %session_id,
            duration_seconds = aggregates.duration_seconds,
            distance_km = aggregates.distance_km,
            "completeSession"
        );
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.completion = Some(aggregates.clone());
        Ok(())
    }
}
