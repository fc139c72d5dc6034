//! Resource monitor: memory pressure and connectivity.
//!
//! Severity only escalates after `sustain_samples` consecutive readings above
//! the current level and relaxes one step per cooldown, so a single spike or
//! dip never flaps the tracking mode.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ResourceConfig;
use crate::location::TrackingMode;
use crate::message::EngineMessage;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    #[default]
    Normal,
    Low,
    Moderate,
    High,
    Critical,
}

impl MemoryPressure {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryPressure::Normal => "normal",
            MemoryPressure::Low => "low",
            MemoryPressure::Moderate => "moderate",
            MemoryPressure::High => "high",
            MemoryPressure::Critical => "critical",
        }
    }

    /// Maps a usage ratio (0.0..=1.0 of budget) onto a level using ascending
    /// thresholds for low, moderate, high and critical.
    pub fn from_ratio(ratio: f64, thresholds: &[f64; 4]) -> Self {
        if ratio >= thresholds[3] {
            MemoryPressure::Critical
        } else if ratio >= thresholds[2] {
            MemoryPressure::High
        } else if ratio >= thresholds[1] {
            MemoryPressure::Moderate
        } else if ratio >= thresholds[0] {
            MemoryPressure::Low
        } else {
            MemoryPressure::Normal
        }
    }

    pub fn step_down(self) -> Self {
        match self {
            MemoryPressure::Critical => MemoryPressure::High,
            MemoryPressure::High => MemoryPressure::Moderate,
            MemoryPressure::Moderate => MemoryPressure::Low,
            MemoryPressure::Low | MemoryPressure::Normal => MemoryPressure::Normal,
        }
    }

    pub fn is_severe(self) -> bool {
        self >= MemoryPressure::High
    }

    /// Multiplier applied to the upload flush interval and batch size.
    pub fn upload_factor(self) -> u32 {
        match self {
            MemoryPressure::Normal | MemoryPressure::Low => 1,
            MemoryPressure::Moderate => 2,
            MemoryPressure::High => 3,
            MemoryPressure::Critical => 4,
        }
    }

    /// Coarsest mode allowed at this level. Pressure only ever coarsens the
    /// preferred mode.
    pub fn tracking_mode(self, preferred: TrackingMode) -> TrackingMode {
        let floor = match self {
            MemoryPressure::Normal | MemoryPressure::Low => TrackingMode::HighAccuracy,
            MemoryPressure::Moderate => TrackingMode::Balanced,
            MemoryPressure::High | MemoryPressure::Critical => TrackingMode::PowerSave,
        };
        preferred.max(floor)
    }
}

/// Advisory notifications from the monitor. Consumers may act late or not at
/// all; nothing ever blocks on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Pressure(MemoryPressure),
    Connectivity(bool),
}

pub trait MemoryProbe: Send {
    /// Current memory use as a fraction of the budget, if measurable.
    fn usage_ratio(&mut self) -> Option<f64>;
}

pub trait ConnectivityProbe: Send {
    fn is_online(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn is_online(&mut self) -> bool {
        true
    }
}

/// Resident memory of this process against a fixed budget.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
    budget_bytes: u64,
}

impl SysinfoProbe {
    pub fn new(budget_mb: u64) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(error = %err, "Unable to resolve current pid; memory probe disabled");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
            budget_bytes: budget_mb.saturating_mul(1024 * 1024).max(1),
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn usage_ratio(&mut self) -> Option<f64> {
        let pid = self.pid?;
        if !self
            .system
            .refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory())
        {
            return None;
        }
        let bytes = self.system.process(pid)?.memory();
        Some(bytes as f64 / self.budget_bytes as f64)
    }
}

#[derive(Debug, Clone)]
pub struct PressureTracker {
    thresholds: [f64; 4],
    sustain_samples: u32,
    cooldown: Duration,
    current: MemoryPressure,
    streak: u32,
    streak_floor: MemoryPressure,
    last_change: Option<DateTime<Utc>>,
}

impl PressureTracker {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            sustain_samples: config.sustain_samples.max(1),
            cooldown: Duration::seconds(config.cooldown_secs),
            current: MemoryPressure::Normal,
            streak: 0,
            streak_floor: MemoryPressure::Critical,
            last_change: None,
        }
    }

    pub fn current(&self) -> MemoryPressure {
        self.current
    }

    /// Feeds one reading; returns the new level when it changed.
    pub fn observe(&mut self, ratio: f64, now: DateTime<Utc>) -> Option<MemoryPressure> {
        let raw = MemoryPressure::from_ratio(ratio, &self.thresholds);

        if raw > self.current {
            self.streak += 1;
            self.streak_floor = self.streak_floor.min(raw);
            if self.streak >= self.sustain_samples {
                // Escalate only as far as every reading in the streak justified.
                let target = self.streak_floor;
                self.reset_streak();
                return self.change_to(target, now);
            }
            return None;
        }

        self.reset_streak();
        if raw < self.current {
            let cooled = self
                .last_change
                .map(|at| now - at >= self.cooldown)
                .unwrap_or(true);
            if cooled {
                let target = self.current.step_down().max(raw);
                return self.change_to(target, now);
            }
        }
        None
    }

    fn reset_streak(&mut self) {
        self.streak = 0;
        self.streak_floor = MemoryPressure::Critical;
    }

    fn change_to(&mut self, target: MemoryPressure, now: DateTime<Utc>) -> Option<MemoryPressure> {
        if target == self.current {
            return None;
        }
        self.current = target;
        self.last_change = Some(now);
        Some(target)
    }
}

pub struct ResourceMonitor {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn spawn(
        mut memory: Box<dyn MemoryProbe>,
        mut connectivity: Box<dyn ConnectivityProbe>,
        config: &ResourceConfig,
        clock: Arc<dyn Clock>,
        sink: Sender<EngineMessage>,
    ) -> Self {
        let interval = StdDuration::from_millis(config.sample_interval_ms.max(1));
        let mut tracker = PressureTracker::new(config);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::spawn(move || {
            let mut online: Option<bool> = None;
            loop {
                if let Some(ratio) = memory.usage_ratio() {
                    debug!(ratio, "Memory sample");
                    if let Some(level) = tracker.observe(ratio, clock.now()) {
                        info!(severity = level.as_str(), ratio, "Memory pressure changed");
                        if sink
                            .send(EngineMessage::Resource(Directive::Pressure(level)))
                            .is_err()
                        {
                            break;
                        }
                    }
                }

                let reachable = connectivity.is_online();
                if online != Some(reachable) {
                    info!(online = reachable, "Connectivity changed");
                    online = Some(reachable);
                    if sink
                        .send(EngineMessage::Resource(Directive::Connectivity(reachable)))
                        .is_err()
                    {
                        break;
                    }
                }

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Resource monitor thread panicked");
            }
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
