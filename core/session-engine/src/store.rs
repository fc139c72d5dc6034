//! Durable session snapshot.
//!
//! One row in `current_session` holds the latest [`PersistedSnapshot`]. It is
//! the only thing recovery looks at after process death. Writes are funnelled
//! through [`SnapshotWriter`] so the controller never blocks on disk.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::message::EngineMessage;
use crate::types::Session;
use crate::upload::SessionLane;

pub const SNAPSHOT_VERSION: u32 = 1;

const SLOT: &str = "current";
const RETRY_PAUSE: StdDuration = StdDuration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub session: Option<Session>,
    /// Undelivered uploads, including lanes of sessions that already ended.
    #[serde(default)]
    pub uploads: Vec<SessionLane>,
}

impl PersistedSnapshot {
    pub fn new(session: Option<Session>, uploads: Vec<SessionLane>, saved_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            session,
            uploads,
        }
    }

    /// Nothing left worth recovering.
    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.uploads.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot).map_err(|source| StoreError::Json {
            context: "serialize snapshot".to_string(),
            source,
        })?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO current_session (slot, version, saved_at, payload) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(slot) DO UPDATE SET \
                    version = excluded.version, \
                    saved_at = excluded.saved_at, \
                    payload = excluded.payload",
                params![
                    SLOT,
                    snapshot.version,
                    snapshot.saved_at.to_rfc3339(),
                    payload
                ],
            )
            .map_err(|err| StoreError::sqlite("upsert snapshot", err))?;
            Ok(())
        })
    }

    pub fn load(&self) -> Result<Option<PersistedSnapshot>, StoreError> {
        let row: Option<(u32, String)> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT version, payload FROM current_session WHERE slot = ?1",
                params![SLOT],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| StoreError::sqlite("read snapshot", err))
        })?;

        let Some((version, payload)) = row else {
            return Ok(None);
        };
        if version > SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let snapshot = serde_json::from_str(&payload).map_err(|source| StoreError::Json {
            context: "parse snapshot".to_string(),
            source,
        })?;
        Ok(Some(snapshot))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM current_session WHERE slot = ?1", params![SLOT])
                .map_err(|err| StoreError::sqlite("delete snapshot", err))?;
            Ok(())
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS current_session (
                    slot TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    saved_at TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );",
            )
            .map_err(|err| StoreError::sqlite("create schema", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.connect()?;
        op(&mut conn)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| StoreError::Io {
                context: "create session store dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::sqlite("open session store", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::sqlite("enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| StoreError::sqlite("set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| StoreError::sqlite("set busy_timeout", err))?;

        Ok(conn)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Writer thread
// ═══════════════════════════════════════════════════════════════════════════════

enum WriteRequest {
    Save(Box<PersistedSnapshot>),
    Clear,
    Flush(Sender<()>),
    Shutdown,
}

enum PendingWrite {
    Save(Box<PersistedSnapshot>),
    Clear,
}

/// Background writer. Queued writes coalesce to the newest one; a failed
/// write is retried `attempts` times before the controller is told.
pub struct SnapshotWriter {
    tx: Sender<WriteRequest>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn(store: SessionStore, attempts: u32, sink: Sender<EngineMessage>) -> Self {
        let (tx, rx) = mpsc::channel();
        let attempts = attempts.max(1);
        let thread = thread::spawn(move || run_writer(store, attempts, rx, sink));
        Self {
            tx,
            thread: Some(thread),
        }
    }

    pub fn save(&self, snapshot: PersistedSnapshot) {
        if self.tx.send(WriteRequest::Save(Box::new(snapshot))).is_err() {
            warn!("Snapshot writer is gone; dropping save");
        }
    }

    pub fn clear(&self) {
        if self.tx.send(WriteRequest::Clear).is_err() {
            warn!("Snapshot writer is gone; dropping clear");
        }
    }

    /// Blocks until every write queued before this call has been attempted.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.tx.send(WriteRequest::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(WriteRequest::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Snapshot writer thread panicked");
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(
    store: SessionStore,
    attempts: u32,
    rx: Receiver<WriteRequest>,
    sink: Sender<EngineMessage>,
) {
    while let Ok(first) = rx.recv() {
        let mut pending: Option<PendingWrite> = None;
        let mut waiters: Vec<Sender<()>> = Vec::new();
        let mut shutdown = false;

        let mut absorb = |request: WriteRequest| match request {
            WriteRequest::Save(snapshot) => pending = Some(PendingWrite::Save(snapshot)),
            WriteRequest::Clear => pending = Some(PendingWrite::Clear),
            WriteRequest::Flush(done) => waiters.push(done),
            WriteRequest::Shutdown => shutdown = true,
        };
        absorb(first);
        while let Ok(next) = rx.try_recv() {
            absorb(next);
        }

        if let Some(write) = pending {
            if let Err(err) = write_with_retry(&store, &write, attempts) {
                error!(error = %err, attempts, "Snapshot persistence failed");
                let _ = sink.send(EngineMessage::PersistenceFailed(err.to_string()));
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
        if shutdown {
            break;
        }
    }
    debug!("Snapshot writer stopped");
}

fn write_with_retry(
    store: &SessionStore,
    write: &PendingWrite,
    attempts: u32,
) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        let result = match write {
            PendingWrite::Save(snapshot) => store.save(snapshot),
            PendingWrite::Clear => store.clear(),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                warn!(error = %err, attempt, "Snapshot write failed; retrying");
                attempt += 1;
                thread::sleep(RETRY_PAUSE);
            }
        }
    }
}
