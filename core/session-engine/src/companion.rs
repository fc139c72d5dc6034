//! Companion sync channel.
//!
//! The handheld is authoritative: the companion only requests lifecycle
//! actions and streams sensor samples. Inbound frames are decoded on a reader
//! thread and posted to the controller; replies and state mirrors go out
//! through [`CompanionChannel`], which the controller owns.

use chrono::{DateTime, Duration, Utc};
use ruck_companion_protocol::{
    decode_command, encode_message, HandheldMessage, StateMirror, StreamingGate,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::config::CompanionConfig;
use crate::error::CompanionError;
use crate::message::EngineMessage;

pub enum InboundEvent {
    Frame(Vec<u8>),
    Reachability(bool),
    Idle,
    Closed,
}

pub trait CompanionInbound: Send {
    fn recv(&mut self, timeout: StdDuration) -> InboundEvent;
}

pub trait CompanionOutbound: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), CompanionError>;
}

/// Both halves of a companion link, as supplied by the host.
pub struct CompanionLink {
    pub inbound: Box<dyn CompanionInbound>,
    pub outbound: Box<dyn CompanionOutbound>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command-id cache
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum CommandEntry {
    Pending { waiters: u32, seen_at: DateTime<Utc> },
    Done { reply: HandheldMessage, seen_at: DateTime<Utc> },
}

impl CommandEntry {
    fn seen_at(&self) -> DateTime<Utc> {
        match self {
            CommandEntry::Pending { seen_at, .. } | CommandEntry::Done { seen_at, .. } => *seen_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// First sighting; the caller must act and later resolve it.
    New,
    /// Same id is still being processed; one more reply will be sent.
    Joined,
    /// Already handled; resend this reply and do nothing else.
    Replay(HandheldMessage),
}

/// Remembers processed command ids for a bounded window so retransmissions
/// are answered without repeating side effects.
#[derive(Debug, Clone)]
pub struct CommandCache {
    window: Duration,
    entries: HashMap<String, CommandEntry>,
}

impl CommandCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn admit(&mut self, command_id: &str, now: DateTime<Utc>) -> Admission {
        match self.entries.get_mut(command_id) {
            Some(CommandEntry::Pending { waiters, .. }) => {
                *waiters += 1;
                Admission::Joined
            }
            Some(CommandEntry::Done { reply, .. }) => Admission::Replay(reply.clone()),
            None => {
                self.entries.insert(
                    command_id.to_string(),
                    CommandEntry::Pending {
                        waiters: 1,
                        seen_at: now,
                    },
                );
                Admission::New
            }
        }
    }

    /// Records the reply and returns how many times it must be sent.
    pub fn resolve(&mut self, command_id: &str, reply: HandheldMessage, now: DateTime<Utc>) -> u32 {
        let waiters = match self.entries.get(command_id) {
            Some(CommandEntry::Pending { waiters, .. }) => *waiters,
            _ => 1,
        };
        self.entries.insert(
            command_id.to_string(),
            CommandEntry::Done {
                reply,
                seen_at: now,
            },
        );
        waiters
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.entries
            .retain(|_, entry| now - entry.seen_at() <= window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outbound side
// ═══════════════════════════════════════════════════════════════════════════════

pub struct CompanionChannel {
    outbound: Box<dyn CompanionOutbound>,
    cache: CommandCache,
    gate: StreamingGate,
    mirror_interval: Duration,
    last_mirror_at: Option<DateTime<Utc>>,
    reachable: bool,
    last_error: Option<CompanionError>,
}

impl CompanionChannel {
    pub fn new(outbound: Box<dyn CompanionOutbound>, config: &CompanionConfig) -> Self {
        Self {
            outbound,
            cache: CommandCache::new(Duration::seconds(config.command_cache_secs)),
            gate: StreamingGate::new(),
            mirror_interval: Duration::seconds(config.mirror_interval_secs),
            last_mirror_at: None,
            reachable: true,
            last_error: None,
        }
    }

    pub fn cache(&mut self) -> &mut CommandCache {
        &mut self.cache
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn last_error(&self) -> Option<&CompanionError> {
        self.last_error.as_ref()
    }

    /// Whether the companion has been told a session is running, i.e. its
    /// sensor stream is expected.
    pub fn is_streaming(&self) -> bool {
        self.gate.is_streaming()
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        if reachable == self.reachable {
            return;
        }
        info!(reachable, "Companion reachability changed");
        self.reachable = reachable;
        if reachable {
            self.last_error = None;
            // Resume mirrors immediately on reconnect.
            self.last_mirror_at = None;
        } else {
            self.last_error = Some(CompanionError::NotReachable);
        }
    }

    /// Resolves a cached command and sends the reply once per waiter.
    pub fn reply(&mut self, command_id: &str, reply: HandheldMessage, now: DateTime<Utc>) {
        let copies = self.cache.resolve(command_id, reply.clone(), now);
        for _ in 0..copies {
            self.send(&reply);
        }
    }

    /// Pushes a mirror if the interval has elapsed (or `force`).
    pub fn push_mirror(&mut self, mirror: StateMirror, now: DateTime<Utc>, force: bool) {
        let due = self
            .last_mirror_at
            .map_or(true, |at| now - at >= self.mirror_interval);
        if !force && (!due || !self.reachable) {
            return;
        }
        self.last_mirror_at = Some(now);
        self.send(&HandheldMessage::StateMirror(mirror));
    }

    pub fn send(&mut self, message: &HandheldMessage) {
        self.gate.observe(message);
        let frame = match encode_message(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Failed to encode companion message");
                return;
            }
        };
        match self.outbound.send(&frame) {
            Ok(()) => {
                if !self.reachable {
                    self.set_reachable(true);
                }
            }
            Err(err) => {
                debug!(error = %err, command_id = message.command_id(), "Companion send failed");
                self.reachable = false;
                self.last_error = Some(err);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Inbound side
// ═══════════════════════════════════════════════════════════════════════════════

pub struct CompanionReader {
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CompanionReader {
    pub fn spawn(
        mut inbound: Box<dyn CompanionInbound>,
        poll_timeout: StdDuration,
        sink: Sender<EngineMessage>,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let poll_timeout = poll_timeout.max(StdDuration::from_millis(1));

        let thread = thread::spawn(move || {
            while !thread_stopped.load(Ordering::Acquire) {
                let message = match inbound.recv(poll_timeout) {
                    InboundEvent::Frame(bytes) => match decode_command(&bytes) {
                        Ok(command) => {
                            debug!(
                                command_id = %command.command_id,
                                command_type = command.command_type.as_str(),
                                "Companion command received"
                            );
                            EngineMessage::Companion(command)
                        }
                        Err(error) => {
                            warn!(error = %error, "Rejected companion frame");
                            EngineMessage::CompanionInvalid {
                                command_id: extract_command_id(&bytes),
                                error,
                            }
                        }
                    },
                    InboundEvent::Reachability(reachable) => {
                        EngineMessage::CompanionReachability(reachable)
                    }
                    InboundEvent::Idle => continue,
                    InboundEvent::Closed => {
                        info!("Companion link closed");
                        let _ = sink.send(EngineMessage::CompanionReachability(false));
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
                warn!("Companion reader thread panicked");
            }
        }
    }
}

impl Drop for CompanionReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn extract_command_id(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("commandId")?
        .as_str()
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}
