//! Post-session heart-rate gap filling from the health platform.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::IngestionFault;
use crate::types::HeartRateSample;

/// Health-platform seam. Only queried after a finalised stop.
pub trait HealthSource: Send {
    fn query_range(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HeartRateSample>, IngestionFault>;
}

/// Records holes in the live heart-rate stream while the session is Active.
/// Paused spans are never reported as gaps.
#[derive(Debug, Clone)]
pub struct GapTracker {
    threshold: Duration,
    anchor: Option<DateTime<Utc>>,
    gaps: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl GapTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            anchor: None,
            gaps: Vec::new(),
        }
    }

    /// Starts (or resumes) watching from `at`.
    pub fn open(&mut self, at: DateTime<Utc>) {
        self.anchor = Some(at);
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.close(at);
        self.anchor = Some(at);
    }

    /// Stops watching at `at`, recording a trailing gap if there is one.
    pub fn close(&mut self, at: DateTime<Utc>) {
        if let Some(anchor) = self.anchor.take() {
            if at - anchor > self.threshold {
                self.gaps.push((anchor, at));
            }
        }
    }

    pub fn gaps(&self) -> &[(DateTime<Utc>, DateTime<Utc>)] {
        &self.gaps
    }

    pub fn reset(&mut self) {
        self.anchor = None;
        self.gaps.clear();
    }
}

/// Queries each gap and returns plausible samples strictly inside the gaps,
/// sorted and without duplicate timestamps. Query failures skip that gap.
pub fn fill_gaps(
    source: &mut dyn HealthSource,
    gaps: &[(DateTime<Utc>, DateTime<Utc>)],
    min_bpm: u16,
    max_bpm: u16,
) -> Vec<HeartRateSample> {
    let mut filled = Vec::new();
    for &(from, to) in gaps {
        match source.query_range(from, to) {
            Ok(samples) => {
                let before = filled.len();
                filled.extend(samples.into_iter().filter(|sample| {
                    sample.timestamp > from
                        && sample.timestamp < to
                        && (min_bpm..=max_bpm).contains(&sample.bpm)
                }));
                debug!(
                    from = %from,
                    to = %to,
                    filled = filled.len() - before,
                    "Heart-rate gap queried"
                );
            }
            Err(fault) => {
                warn!(fault = %fault, from = %from, to = %to, "Health query failed; gap left open");
            }
        }
    }
    filled.sort_by_key(|sample| sample.timestamp);
    filled.dedup_by_key(|sample| sample.timestamp);
    filled
}
