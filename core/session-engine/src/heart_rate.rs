//! Heart-rate ingestion and source arbitration.
//!
//! Samples arrive from the local sensor (via [`HeartRateIngestor`]) or from the
//! companion channel. [`HeartRateArbiter`] picks one stream: the companion
//! while it is fresh, otherwise whichever source updated most recently.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::config::HeartRateConfig;
use crate::error::IngestionFault;
use crate::location::SourceEvent;
use crate::message::EngineMessage;
use crate::types::HeartRateSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartRateSourceKind {
    Local,
    Companion,
}

impl HeartRateSourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HeartRateSourceKind::Local => "local",
            HeartRateSourceKind::Companion => "companion",
        }
    }
}

/// Local heart-rate sensor seam.
pub trait HeartRateSource: Send {
    fn poll(&mut self, timeout: StdDuration) -> SourceEvent<HeartRateSample>;
}

#[derive(Debug, Clone)]
pub struct HeartRateArbiter {
    stall: Duration,
    min_bpm: u16,
    max_bpm: u16,
    last_local: Option<DateTime<Utc>>,
    last_companion: Option<DateTime<Utc>>,
    last_accepted: Option<DateTime<Utc>>,
    active: Option<HeartRateSourceKind>,
}

impl HeartRateArbiter {
    pub fn new(config: &HeartRateConfig) -> Self {
        Self {
            stall: Duration::seconds(config.companion_stall_secs),
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
            last_local: None,
            last_companion: None,
            last_accepted: None,
            active: None,
        }
    }

    /// Offers a sample; returns it when it belongs to the winning stream and
    /// keeps the accepted stream strictly time-ordered.
    pub fn offer(
        &mut self,
        source: HeartRateSourceKind,
        sample: HeartRateSample,
        now: DateTime<Utc>,
    ) -> Option<HeartRateSample> {
        if sample.bpm < self.min_bpm || sample.bpm > self.max_bpm {
            debug!(bpm = sample.bpm, source = source.as_str(), "Dropping implausible heart rate");
            return None;
        }

        match source {
            HeartRateSourceKind::Local => self.last_local = Some(now),
            HeartRateSourceKind::Companion => self.last_companion = Some(now),
        }

        let chosen = self.select(now)?;
        if chosen != source {
            return None;
        }
        if self.active != Some(chosen) {
            info!(
                source = chosen.as_str(),
                previous = self.active.map(|kind| kind.as_str()),
                "Heart-rate source selected"
            );
            self.active = Some(chosen);
        }

        if let Some(last) = self.last_accepted {
            if sample.timestamp <= last {
                return None;
            }
        }
        self.last_accepted = Some(sample.timestamp);
        Some(sample)
    }

    /// Companion was feeding us but has gone quiet past the stall interval.
    pub fn companion_stalled(&self, now: DateTime<Utc>) -> bool {
        self.last_companion
            .map(|seen| now - seen > self.stall)
            .unwrap_or(false)
    }

    pub fn active_source(&self, now: DateTime<Utc>) -> Option<HeartRateSourceKind> {
        self.select(now)
    }

    fn select(&self, now: DateTime<Utc>) -> Option<HeartRateSourceKind> {
        let fresh = |seen: Option<DateTime<Utc>>| seen.map(|ts| now - ts <= self.stall).unwrap_or(false);
        if fresh(self.last_companion) {
            return Some(HeartRateSourceKind::Companion);
        }
        match (self.last_local, self.last_companion) {
            (Some(_), _) if fresh(self.last_local) => Some(HeartRateSourceKind::Local),
            (Some(local), Some(companion)) => Some(if companion > local {
                HeartRateSourceKind::Companion
            } else {
                HeartRateSourceKind::Local
            }),
            (Some(_), None) => Some(HeartRateSourceKind::Local),
            (None, Some(_)) => Some(HeartRateSourceKind::Companion),
            (None, None) => None,
        }
    }
}

/// Background thread forwarding local sensor samples to the controller.
pub struct HeartRateIngestor {
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HeartRateIngestor {
    pub fn spawn(
        mut source: Box<dyn HeartRateSource>,
        poll_timeout: StdDuration,
        sink: Sender<EngineMessage>,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let poll_timeout = poll_timeout.max(StdDuration::from_millis(1));

        let thread = thread::spawn(move || {
            let mut last_fault: Option<IngestionFault> = None;
            while !thread_stopped.load(Ordering::Acquire) {
                let message = match source.poll(poll_timeout) {
                    SourceEvent::Sample(sample) => {
                        last_fault = None;
                        EngineMessage::HeartRate {
                            source: HeartRateSourceKind::Local,
                            sample,
                        }
                    }
                    SourceEvent::Fault(fault) => {
                        if last_fault.as_ref() == Some(&fault) {
                            thread::sleep(poll_timeout);
                            continue;
                        }
                        warn!(fault = %fault, "Heart-rate ingestion fault");
                        last_fault = Some(fault.clone());
                        EngineMessage::HeartRateFault {
                            source: HeartRateSourceKind::Local,
                            fault,
                        }
                    }
                    SourceEvent::Idle => continue,
                    SourceEvent::Closed => {
                        info!("Local heart-rate source closed");
                        break;
                    }
                };
                if sink.send(message).is_err() {
                    break;
                }
            }
        });

        Self {
            stopped,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Heart-rate ingestor thread panicked");
            }
        }
    }
}

impl Drop for HeartRateIngestor {
    fn drop(&mut self) {
        self.stop();
    }
}
