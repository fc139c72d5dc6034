//! Location ingestion: hardware seam, sample filtering, adaptive tracking mode.
//!
//! The ingestor thread pulls fixes from a [`LocationSource`], runs them through
//! [`LocationFilter`] (accuracy gate, dedupe, reorder window, coalescing) and
//! forwards the survivors to the controller inbox in timestamp order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::config::LocationConfig;
use crate::error::IngestionFault;
use crate::message::EngineMessage;
use crate::metrics::haversine_m;
use crate::types::LocationSample;

/// Ordered from finest to coarsest sampling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TrackingMode {
    #[default]
    HighAccuracy,
    Balanced,
    PowerSave,
    Emergency,
}

impl TrackingMode {
    /// Minimum movement before a new fix is emitted.
    pub fn min_distance_m(self) -> f64 {
        match self {
            TrackingMode::HighAccuracy => 2.0,
            TrackingMode::Balanced => 5.0,
            TrackingMode::PowerSave => 10.0,
            TrackingMode::Emergency => 25.0,
        }
    }

    /// A fix is emitted at least this often even without movement.
    pub fn min_interval(self) -> Duration {
        match self {
            TrackingMode::HighAccuracy => Duration::seconds(1),
            TrackingMode::Balanced => Duration::seconds(3),
            TrackingMode::PowerSave => Duration::seconds(10),
            TrackingMode::Emergency => Duration::seconds(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackingMode::HighAccuracy => "highAccuracy",
            TrackingMode::Balanced => "balanced",
            TrackingMode::PowerSave => "powerSave",
            TrackingMode::Emergency => "emergency",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            TrackingMode::HighAccuracy => 0,
            TrackingMode::Balanced => 1,
            TrackingMode::PowerSave => 2,
            TrackingMode::Emergency => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => TrackingMode::Balanced,
            2 => TrackingMode::PowerSave,
            3 => TrackingMode::Emergency,
            _ => TrackingMode::HighAccuracy,
        }
    }
}

/// What a sensor poll produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent<T> {
    Sample(T),
    Fault(IngestionFault),
    Idle,
    Closed,
}

/// Positioning hardware seam.
pub trait LocationSource: Send {
    fn configure(&mut self, mode: TrackingMode) -> Result<(), IngestionFault>;
    fn poll(&mut self, timeout: StdDuration) -> SourceEvent<LocationSample>;
}

/// Controller-facing knobs for the ingestor. Advisory: setting them never
/// blocks, the ingestor picks changes up on its next poll.
pub trait LocationControl: Send + Sync {
    fn set_mode(&self, mode: TrackingMode);
    fn mode(&self) -> TrackingMode;
    fn set_enabled(&self, enabled: bool);
}

#[derive(Debug)]
pub struct IngestorSwitch {
    mode: AtomicU8,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl IngestorSwitch {
    pub fn new(mode: TrackingMode) -> Self {
        Self {
            mode: AtomicU8::new(mode.to_u8()),
            enabled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl LocationControl for IngestorSwitch {
    fn set_mode(&self, mode: TrackingMode) {
        self.mode.store(mode.to_u8(), Ordering::Release);
    }

    fn mode(&self) -> TrackingMode {
        TrackingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub accepted: u64,
    pub coalesced: u64,
    pub duplicates: u64,
    pub late: u64,
    pub rejected: u64,
}

/// Orders, dedupes and coalesces raw fixes.
///
/// Fixes are held for `reorder_window` so out-of-order hardware callbacks can
/// be sorted; anything older than the release watermark is too late to place
/// and is dropped.
#[derive(Debug)]
pub struct LocationFilter {
    max_accuracy_m: f64,
    reorder_window: Duration,
    pending: BTreeMap<DateTime<Utc>, LocationSample>,
    watermark: Option<DateTime<Utc>>,
    last_emitted: Option<LocationSample>,
    /// Newest fix swallowed by coalescing; it becomes the route end on flush.
    coalesced_tail: Option<LocationSample>,
    stats: FilterStats,
}

impl LocationFilter {
    pub fn new(max_accuracy_m: f64, reorder_window: Duration) -> Self {
        Self {
            max_accuracy_m,
            reorder_window,
            pending: BTreeMap::new(),
            watermark: None,
            last_emitted: None,
            coalesced_tail: None,
            stats: FilterStats::default(),
        }
    }

    pub fn from_config(config: &LocationConfig) -> Self {
        Self::new(
            config.max_accuracy_m,
            Duration::milliseconds(config.reorder_window_ms),
        )
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn push(&mut self, sample: LocationSample, mode: TrackingMode) -> Vec<LocationSample> {
        if !is_plausible(&sample) || sample.horizontal_accuracy_m > self.max_accuracy_m {
            self.stats.rejected += 1;
            debug!(
                accuracy_m = sample.horizontal_accuracy_m,
                "Dropping implausible or inaccurate fix"
            );
            return Vec::new();
        }

        if let Some(watermark) = self.watermark {
            if sample.timestamp <= watermark {
                if sample.timestamp == watermark {
                    self.stats.duplicates += 1;
                } else {
                    self.stats.late += 1;
                    debug!(timestamp = %sample.timestamp, "Dropping fix older than release watermark");
                }
                return Vec::new();
            }
        }
        if self.pending.contains_key(&sample.timestamp) {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        let newest = sample.timestamp.max(
            self.pending
                .keys()
                .next_back()
                .copied()
                .unwrap_or(sample.timestamp),
        );
        self.pending.insert(sample.timestamp, sample);
        self.release_until(newest - self.reorder_window, mode)
    }

    /// Releases everything still held, e.g. when tracking is suspended. The
    /// newest fix is always emitted so the route keeps its true end point.
    pub fn flush(&mut self, mode: TrackingMode) -> Vec<LocationSample> {
        let mut released = match self.pending.keys().next_back().copied() {
            Some(newest) => self.release_until(newest, mode),
            None => Vec::new(),
        };
        if let Some(tail) = self.coalesced_tail.take() {
            self.stats.coalesced = self.stats.coalesced.saturating_sub(1);
            self.stats.accepted += 1;
            self.last_emitted = Some(tail.clone());
            released.push(tail);
        }
        released
    }

    fn release_until(&mut self, cutoff: DateTime<Utc>, mode: TrackingMode) -> Vec<LocationSample> {
        let mut released = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > cutoff {
                break;
            }
            let sample = entry.remove();
            self.watermark = Some(sample.timestamp);
            if self.should_coalesce(&sample, mode) {
                self.stats.coalesced += 1;
                self.coalesced_tail = Some(sample);
                continue;
            }
            self.coalesced_tail = None;
            self.stats.accepted += 1;
            self.last_emitted = Some(sample.clone());
            released.push(sample);
        }
        released
    }

    fn should_coalesce(&self, sample: &LocationSample, mode: TrackingMode) -> bool {
        let Some(previous) = &self.last_emitted else {
            return false;
        };
        let moved = haversine_m(previous, sample);
        let waited = sample.timestamp - previous.timestamp;
        moved < mode.min_distance_m() && waited < mode.min_interval()
    }
}

fn is_plausible(sample: &LocationSample) -> bool {
    sample.latitude.is_finite()
        && sample.longitude.is_finite()
        && sample.altitude.is_finite()
        && sample.horizontal_accuracy_m.is_finite()
        && (-90.0..=90.0).contains(&sample.latitude)
        && (-180.0..=180.0).contains(&sample.longitude)
        && sample.horizontal_accuracy_m >= 0.0
}

/// Background thread feeding filtered fixes into the controller inbox.
pub struct LocationIngestor {
    switch: Arc<IngestorSwitch>,
    thread: Option<JoinHandle<()>>,
}

impl LocationIngestor {
    pub fn spawn(
        mut source: Box<dyn LocationSource>,
        config: &LocationConfig,
        switch: Arc<IngestorSwitch>,
        sink: Sender<EngineMessage>,
    ) -> Self {
        let poll_timeout = StdDuration::from_millis(config.poll_timeout_ms.max(1));
        let mut filter = LocationFilter::from_config(config);
        let thread_switch = Arc::clone(&switch);

        let thread = thread::spawn(move || {
            let switch = thread_switch;
            let mut applied_mode: Option<TrackingMode> = None;
            let mut last_fault: Option<IngestionFault> = None;

            while !switch.is_stopped() {
                let mode = switch.mode();
                if !switch.is_enabled() {
                    if !forward(&sink, filter.flush(mode)) {
                        break;
                    }
                    thread::sleep(poll_timeout);
                    continue;
                }

                if applied_mode != Some(mode) {
                    match source.configure(mode) {
                        Ok(()) => {
                            info!(mode = mode.as_str(), "Location tracking mode applied");
                            applied_mode = Some(mode);
                        }
                        Err(fault) => {
                            if !report_fault(&sink, &mut last_fault, fault) {
                                break;
                            }
                            thread::sleep(poll_timeout);
                            continue;
                        }
                    }
                }

                match source.poll(poll_timeout) {
                    SourceEvent::Sample(sample) => {
                        last_fault = None;
                        if !forward(&sink, filter.push(sample, mode)) {
                            break;
                        }
                    }
                    SourceEvent::Fault(fault) => {
                        if !report_fault(&sink, &mut last_fault, fault) {
                            break;
                        }
                        // Hardware may recover; re-apply the mode on the next pass.
                        applied_mode = None;
                        thread::sleep(poll_timeout);
                    }
                    SourceEvent::Idle => {}
                    SourceEvent::Closed => {
                        forward(&sink, filter.flush(mode));
                        info!("Location source closed");
                        break;
                    }
                }
            }

            let stats = filter.stats();
            debug!(
                accepted = stats.accepted,
                coalesced = stats.coalesced,
                duplicates = stats.duplicates,
                late = stats.late,
                rejected = stats.rejected,
                "Location ingestor stopped"
            );
        });

        Self {
            switch,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.switch.stop();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Location ingestor thread panicked");
            }
        }
    }
}

impl Drop for LocationIngestor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward(sink: &Sender<EngineMessage>, samples: Vec<LocationSample>) -> bool {
    for sample in samples {
        if sink.send(EngineMessage::Location(sample)).is_err() {
            return false;
        }
    }
    true
}

fn report_fault(
    sink: &Sender<EngineMessage>,
    last_fault: &mut Option<IngestionFault>,
    fault: IngestionFault,
) -> bool {
    if last_fault.as_ref() == Some(&fault) {
        return true;
    }
    warn!(fault = %fault, "Location ingestion fault");
    *last_fault = Some(fault.clone());
    sink.send(EngineMessage::LocationFault(fault)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn fix(north_m: f64, millis: i64) -> LocationSample {
        LocationSample {
            latitude: 47.0 + north_m / 111_195.0,
            longitude: 8.0,
            altitude: 400.0,
            horizontal_accuracy_m: 5.0,
            timestamp: t0() + Duration::milliseconds(millis),
        }
    }

    fn filter() -> LocationFilter {
        LocationFilter::new(50.0, Duration::seconds(2))
    }

    fn timestamps(samples: &[LocationSample]) -> Vec<i64> {
        samples
            .iter()
            .map(|s| (s.timestamp - t0()).num_milliseconds())
            .collect()
    }

    #[test]
    fn sorts_out_of_order_fixes_within_window() {
        let mut f = filter();
        let mut out = Vec::new();
        out.extend(f.push(fix(0.0, 0), TrackingMode::HighAccuracy));
        out.extend(f.push(fix(20.0, 2_000), TrackingMode::HighAccuracy));
        out.extend(f.push(fix(10.0, 1_000), TrackingMode::HighAccuracy));
        out.extend(f.push(fix(30.0, 3_000), TrackingMode::HighAccuracy));
        out.extend(f.flush(TrackingMode::HighAccuracy));
        assert_eq!(timestamps(&out), vec![0, 1_000, 2_000, 3_000]);
    }

    #[test]
    fn drops_duplicates_and_late_fixes() {
        let mut f = filter();
        f.push(fix(0.0, 0), TrackingMode::HighAccuracy);
        f.push(fix(0.0, 0), TrackingMode::HighAccuracy);
        let released = f.push(fix(50.0, 5_000), TrackingMode::HighAccuracy);
        assert_eq!(timestamps(&released), vec![0]);
        let late = f.push(fix(5.0, -1_000), TrackingMode::HighAccuracy);
        assert!(late.is_empty());
        let stats = f.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.late, 1);
    }

    #[test]
    fn rejects_inaccurate_fixes() {
        let mut f = filter();
        let mut bad = fix(0.0, 0);
        bad.horizontal_accuracy_m = 120.0;
        assert!(f.push(bad, TrackingMode::HighAccuracy).is_empty());
        assert_eq!(f.stats().rejected, 1);
    }

    #[test]
    fn power_save_coarsens_without_losing_route_ends() {
        let mut high = filter();
        let mut save = filter();
        let mut high_out = Vec::new();
        let mut save_out = Vec::new();
        // 1.5 m/s walk sampled at 1 Hz for 60 s.
        for i in 0..=60 {
            high_out.extend(high.push(fix(i as f64 * 1.5, i * 1_000), TrackingMode::HighAccuracy));
            save_out.extend(save.push(fix(i as f64 * 1.5, i * 1_000), TrackingMode::PowerSave));
        }
        high_out.extend(high.flush(TrackingMode::HighAccuracy));
        save_out.extend(save.flush(TrackingMode::PowerSave));

        assert_eq!(high_out.len(), 61);
        assert!(save_out.len() < high_out.len() / 4);
        assert!(save_out.len() >= 6);
        assert_eq!(save_out.first().map(|s| s.timestamp), Some(t0()));
        assert_eq!(
            save_out.last().map(|s| s.timestamp),
            Some(t0() + Duration::seconds(60))
        );
    }

    #[test]
    fn flush_emits_the_last_coalesced_fix_once() {
        let mut f = LocationFilter::new(50.0, Duration::zero());
        let mut out = Vec::new();
        out.extend(f.push(fix(0.0, 0), TrackingMode::Emergency));
        out.extend(f.push(fix(5.0, 5_000), TrackingMode::Emergency));
        out.extend(f.push(fix(12.0, 9_000), TrackingMode::Emergency));
        assert_eq!(timestamps(&out), vec![0]);

        out.extend(f.flush(TrackingMode::Emergency));
        assert_eq!(timestamps(&out), vec![0, 9_000]);
        assert!(f.flush(TrackingMode::Emergency).is_empty());
        assert_eq!(f.stats().accepted, 2);
        assert_eq!(f.stats().coalesced, 1);
    }

    #[test]
    fn switch_is_advisory_state() {
        let switch = IngestorSwitch::new(TrackingMode::HighAccuracy);
        assert!(!switch.is_enabled());
        switch.set_mode(TrackingMode::PowerSave);
        switch.set_enabled(true);
        assert_eq!(switch.mode(), TrackingMode::PowerSave);
        assert!(switch.is_enabled());
    }
}
