//! Remote backend seam.
//!
//! The engine never talks HTTP itself; the host supplies an implementation of
//! [`SessionBackend`]. Calls are blocking and are only ever made from the
//! start-resolution thread and the upload worker, never from the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use crate::error::{DeliveryError, StartError};
use crate::types::{HeartRateSample, LocationSample, SessionId, StartParams};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionPayload {
    pub ruck_weight_kg: f64,
    pub user_weight_kg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_route_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl CreateSessionPayload {
    pub fn from_params(params: &StartParams, requested_at: DateTime<Utc>) -> Self {
        Self {
            ruck_weight_kg: params.ruck_weight_kg,
            user_weight_kg: params.user_weight_kg,
            planned_route_id: params.planned_route_id.clone(),
            requested_at,
        }
    }
}

/// Final numbers sent with `completeSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionAggregates {
    pub duration_seconds: i64,
    pub distance_km: f64,
    pub calories_burned: f64,
    pub average_pace_min_per_km: Option<f64>,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub avg_heart_rate: Option<f64>,
    pub max_heart_rate: Option<u16>,
    pub steps: u64,
    pub ended_at: DateTime<Utc>,
}

pub trait SessionBackend: Send + Sync {
    fn create_session(&self, payload: &CreateSessionPayload) -> Result<SessionId, StartError>;

    fn append_locations(
        &self,
        session_id: &SessionId,
        samples: &[LocationSample],
        timeout: StdDuration,
    ) -> Result<(), DeliveryError>;

    fn append_heart_rates(
        &self,
        session_id: &SessionId,
        samples: &[HeartRateSample],
        timeout: StdDuration,
    ) -> Result<(), DeliveryError>;

    fn complete_session(
        &self,
        session_id: &SessionId,
        aggregates: &CompletionAggregates,
        timeout: StdDuration,
    ) -> Result<(), DeliveryError>;
}
