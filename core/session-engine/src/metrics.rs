//! Route metrics: distance, elevation, pace and energy expenditure.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::types::LocationSample;

const EARTH_RADIUS_M: f64 = 6_371_008.8;
/// Altitude changes smaller than this are treated as GPS noise.
const ELEVATION_NOISE_FLOOR_M: f64 = 1.0;
/// Below this much distance in the pace window, pace is not meaningful.
const MIN_PACE_DISTANCE_KM: f64 = 0.005;
const KG_TO_LBS: f64 = 2.20462;
const KMH_TO_MPH: f64 = 0.621371;

/// Great-circle distance between two samples, in metres.
pub fn haversine_m(a: &LocationSample, b: &LocationSample) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Minutes per kilometre; `None` when distance or duration is zero.
pub fn pace_min_per_km(distance_km: f64, duration: Duration) -> Option<f64> {
    let minutes = duration.num_milliseconds() as f64 / 60_000.0;
    if distance_km <= 0.0 || minutes <= 0.0 {
        return None;
    }
    Some(minutes / distance_km)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RouteDelta {
    pub distance_m: f64,
    pub gain_m: f64,
    pub loss_m: f64,
}

/// Incremental distance/elevation accumulator plus a rolling pace window.
#[derive(Debug, Clone)]
pub struct RouteMetrics {
    last: Option<LocationSample>,
    elevation_anchor: Option<f64>,
    cumulative_km: f64,
    window: VecDeque<(DateTime<Utc>, f64)>,
    window_span: Duration,
}

impl RouteMetrics {
    pub fn new(window_span: Duration) -> Self {
        Self {
            last: None,
            elevation_anchor: None,
            cumulative_km: 0.0,
            window: VecDeque::new(),
            window_span,
        }
    }

    /// Continues from a recovered session so the first post-recovery sample
    /// measures distance from the last persisted point.
    pub fn resume_from(
        window_span: Duration,
        last: Option<LocationSample>,
        cumulative_km: f64,
    ) -> Self {
        let mut metrics = Self::new(window_span);
        metrics.elevation_anchor = last.as_ref().map(|sample| sample.altitude);
        metrics.cumulative_km = cumulative_km;
        if let Some(sample) = &last {
            metrics.window.push_back((sample.timestamp, cumulative_km));
        }
        metrics.last = last;
        metrics
    }

    pub fn last(&self) -> Option<&LocationSample> {
        self.last.as_ref()
    }

    pub fn ingest(&mut self, sample: &LocationSample) -> RouteDelta {
        let mut delta = RouteDelta::default();

        if let Some(previous) = &self.last {
            delta.distance_m = haversine_m(previous, sample);
        }

        match self.elevation_anchor {
            Some(anchor) => {
                let change = sample.altitude - anchor;
                if change.abs() >= ELEVATION_NOISE_FLOOR_M {
                    if change > 0.0 {
                        delta.gain_m = change;
                    } else {
                        delta.loss_m = -change;
                    }
                    self.elevation_anchor = Some(sample.altitude);
                }
            }
            None => self.elevation_anchor = Some(sample.altitude),
        }

        self.cumulative_km += delta.distance_m / 1000.0;
        self.window.push_back((sample.timestamp, self.cumulative_km));
        self.trim_window(sample.timestamp);
        self.last = Some(sample.clone());
        delta
    }

    /// Moves the reference point without accruing distance (used while
    /// paused so the walk back to the route is not counted).
    pub fn rebase(&mut self, sample: &LocationSample) {
        self.elevation_anchor = Some(sample.altitude);
        self.window.clear();
        self.window.push_back((sample.timestamp, self.cumulative_km));
        self.last = Some(sample.clone());
    }

    /// Pace over the most recent window of samples.
    pub fn current_pace(&self, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - self.window_span;
        let first = self.window.iter().find(|(ts, _)| *ts >= cutoff)?;
        let last = self.window.back()?;
        let distance_km = last.1 - first.1;
        if distance_km < MIN_PACE_DISTANCE_KM {
            return None;
        }
        pace_min_per_km(distance_km, last.0 - first.0)
    }

    fn trim_window(&mut self, newest: DateTime<Utc>) {
        let cutoff = newest - self.window_span;
        while self.window.len() > 2 {
            match self.window.front() {
                Some((ts, _)) if *ts < cutoff => {
                    self.window.pop_front();
                }
                _ => break,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyInput {
    pub user_weight_kg: f64,
    pub ruck_weight_kg: f64,
    pub distance_km: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub duration: Duration,
}

/// Calorie estimate for a session so far. Implementations must return a
/// finite, non-negative value.
pub trait EnergyModel: Send {
    fn calories(&self, input: &EnergyInput) -> f64;
}

/// MET-based rucking estimate: speed band, grade and load adjustments.
#[derive(Debug, Clone, Copy)]
pub struct MetEnergyModel {
    /// Multiplier applied when sex is unspecified.
    pub sex_adjustment: f64,
    pub terrain_multiplier: f64,
}

impl Default for MetEnergyModel {
    fn default() -> Self {
        Self {
            sex_adjustment: 0.925,
            terrain_multiplier: 1.0,
        }
    }
}

impl MetEnergyModel {
    fn met(speed_mph: f64, grade_pct: f64, ruck_lbs: f64) -> f64 {
        let base = if speed_mph < 2.0 {
            2.5
        } else if speed_mph < 2.5 {
            3.0
        } else if speed_mph < 3.0 {
            3.5
        } else if speed_mph < 3.5 {
            4.0
        } else if speed_mph < 4.0 {
            4.5
        } else if speed_mph < 5.0 {
            5.0
        } else {
            6.0
        };

        let grade_adjustment = if grade_pct > 0.0 {
            grade_pct * 0.6 * (speed_mph / 4.0)
        } else if grade_pct < 0.0 {
            let descent = grade_pct.abs();
            if descent <= 10.0 {
                -descent * 0.1
            } else {
                (descent - 10.0) * 0.15
            }
        } else {
            0.0
        };

        let load_adjustment = if ruck_lbs > 0.0 {
            (ruck_lbs * 0.05).min(5.0)
        } else {
            0.0
        };

        (base + grade_adjustment + load_adjustment).clamp(2.0, 15.0)
    }
}

impl EnergyModel for MetEnergyModel {
    fn calories(&self, input: &EnergyInput) -> f64 {
        let valid = [
            input.user_weight_kg,
            input.ruck_weight_kg,
            input.distance_km,
            input.elevation_gain_m,
            input.elevation_loss_m,
        ]
        .iter()
        .all(|value| value.is_finite());
        if !valid
            || input.user_weight_kg <= 0.0
            || input.distance_km < 0.0
            || input.elevation_gain_m < 0.0
        {
            return 0.0;
        }

        let hours = input.duration.num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            return 0.0;
        }
        let speed_kmh = input.distance_km / hours;
        let grade_pct = if input.distance_km > 0.0 {
            (input.elevation_gain_m - input.elevation_loss_m) / (input.distance_km * 1000.0)
                * 100.0
        } else {
            0.0
        };

        let met = Self::met(
            speed_kmh * KMH_TO_MPH,
            grade_pct,
            input.ruck_weight_kg * KG_TO_LBS,
        );
        let kcal = met
            * (input.user_weight_kg + input.ruck_weight_kg)
            * hours
            * self.terrain_multiplier
            * self.sex_adjustment;
        kcal.max(0.0)
    }
}
