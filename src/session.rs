//! Host-side session manager: one PTY process per session id.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{mpsc, Notify},
    time::{Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    batcher::run_batched,
    config::SessionConfig,
    error::SessionError,
    protocol::{ResizeResult, SessionInfo},
    pty::{PtyCommand, PtyProcess},
};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

pub const REASON_NOT_MASTER: &str = "not_master";
pub const REASON_INVALID_SIZE: &str = "invalid_size";

/// How often the pump checks whether the child has exited. A background job
/// can keep the terminal open after its parent is gone, so reader EOF alone
/// is not a reliable end-of-session signal.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Output still in flight from the reader thread when the child exits.
const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Closed,
}

/// Output leaving the manager. Every `Output` for a session precedes its
/// single `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output { session_id: String, data: String },
    Closed { session_id: String },
}

struct SessionEntry {
    process: Arc<PtyProcess>,
    closing: Arc<Notify>,
    cols: u16,
    rows: u16,
    working_dir: PathBuf,
    master_device_id: Option<String>,
    status: SessionStatus,
    output_bytes: Arc<AtomicU64>,
    created_at: Instant,
}

impl SessionEntry {
    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            cols: self.cols,
            rows: self.rows,
            working_dir: self.working_dir.display().to_string(),
            master_device_id: self.master_device_id.clone(),
        }
    }
}

struct Inner {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (manager, rx)
    }

    /// Spawn a new session. Must be called from within a tokio runtime.
    pub fn create(
        &self,
        working_dir: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<SessionInfo, SessionError> {
        let working_dir = self.resolve_working_dir(working_dir)?;
        let cols = if cols == 0 { DEFAULT_COLS } else { cols };
        let rows = if rows == 0 { DEFAULT_ROWS } else { rows };

        let command = PtyCommand::new(self.inner.config.program.clone(), working_dir.clone(), cols, rows)
            .args(self.inner.config.args.iter().cloned());
        let (process, output) = PtyProcess::spawn(&command)?;
        let pid = process.pid();
        let process = Arc::new(process);
        let closing = Arc::new(Notify::new());

        let session_id = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            process: process.clone(),
            closing: closing.clone(),
            cols,
            rows,
            working_dir,
            master_device_id: None,
            status: SessionStatus::Created,
            output_bytes: Arc::new(AtomicU64::new(0)),
            created_at: Instant::now(),
        };
        let info = entry.info(&session_id);
        let output_bytes = entry.output_bytes.clone();
        self.inner.sessions.lock().insert(session_id.clone(), entry);

        tracing::info!(
            target = "session_relay::session",
            session_id = %session_id,
            pid = ?pid,
            cols,
            rows,
            working_dir = %info.working_dir,
            "session created"
        );
        self.spawn_pump(session_id, output, output_bytes, process, closing);
        Ok(info)
    }

    fn resolve_working_dir(&self, requested: Option<&str>) -> Result<PathBuf, SessionError> {
        let base = &self.inner.config.default_working_dir;
        let path = match requested.map(str::trim).filter(|dir| !dir.is_empty()) {
            None => base.clone(),
            Some(dir) if dir == "~" || dir.starts_with("~/") => {
                let home = dirs::home_dir()
                    .ok_or_else(|| SessionError::InvalidWorkingDir(dir.to_string()))?;
                home.join(dir.trim_start_matches('~').trim_start_matches('/'))
            }
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => base.join(dir),
        };
        if !path.is_dir() {
            return Err(SessionError::InvalidWorkingDir(path.display().to_string()));
        }
        Ok(path)
    }

    /// Feed process output through a batcher until the reader hits EOF, the
    /// child exits, or the session is closed. The batcher is disposed before
    /// the session is removed.
    fn spawn_pump(
        &self,
        session_id: String,
        output: mpsc::Receiver<Vec<u8>>,
        output_bytes: Arc<AtomicU64>,
        process: Arc<PtyProcess>,
        closing: Arc<Notify>,
    ) {
        let manager = self.clone();
        let events = self.inner.events.clone();
        let batcher = self.inner.config.batcher.clone();
        tokio::spawn(async move {
            manager.set_status(&session_id, SessionStatus::Running);
            let id = session_id.clone();
            let on_flush = move |data: String| {
                output_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                let _ = events.send(SessionEvent::Output {
                    session_id: id.clone(),
                    data,
                });
            };
            run_batched(output, batcher, on_flush, wait_for_end(&process, &closing)).await;
            drop(process);
            manager.finish(&session_id);
        });
    }

    fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(entry) = self.inner.sessions.lock().get_mut(session_id) {
            if entry.status != SessionStatus::Closed {
                entry.status = status;
            }
        }
    }

    fn finish(&self, session_id: &str) {
        let Some(entry) = self.inner.sessions.lock().remove(session_id) else {
            return;
        };
        entry.process.terminate();
        tracing::info!(
            target = "session_relay::session",
            session_id,
            output_bytes = entry.output_bytes.load(Ordering::Relaxed),
            "session closed"
        );
        let _ = self.inner.events.send(SessionEvent::Closed {
            session_id: session_id.to_string(),
        });
    }

    fn live_process(&self, session_id: &str) -> Result<Arc<PtyProcess>, SessionError> {
        let sessions = self.inner.sessions.lock();
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if entry.status == SessionStatus::Closed {
            return Err(SessionError::Closed(session_id.to_string()));
        }
        Ok(entry.process.clone())
    }

    pub fn write(&self, session_id: &str, bytes: &[u8]) -> Result<(), SessionError> {
        let process = self.live_process(session_id)?;
        process.write_all(bytes)?;
        Ok(())
    }

    /// Apply a resize from `requester`. The first requester becomes master;
    /// anyone else is refused and told the current size.
    pub fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
        requester: &str,
    ) -> Result<ResizeResult, SessionError> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if entry.status == SessionStatus::Closed {
            return Err(SessionError::Closed(session_id.to_string()));
        }

        let rejected = |entry: &SessionEntry, reason: &str| ResizeResult {
            success: false,
            cols: entry.cols,
            rows: entry.rows,
            reason: Some(reason.to_string()),
        };
        if cols == 0 || rows == 0 {
            return Ok(rejected(entry, REASON_INVALID_SIZE));
        }
        if let Some(master) = &entry.master_device_id {
            if master != requester {
                tracing::debug!(
                    target = "session_relay::session",
                    session_id,
                    requester,
                    master = %master,
                    "resize refused"
                );
                return Ok(rejected(entry, REASON_NOT_MASTER));
            }
        }

        entry.process.resize(cols, rows)?;
        if entry.master_device_id.is_none() {
            tracing::info!(target = "session_relay::session", session_id, requester, "resize master assigned");
            entry.master_device_id = Some(requester.to_string());
        }
        entry.cols = cols;
        entry.rows = rows;
        Ok(ResizeResult {
            success: true,
            cols,
            rows,
            reason: None,
        })
    }

    /// Hand resize authority to another device, or release it with `None`.
    pub fn transfer_master(
        &self,
        session_id: &str,
        device_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        entry.master_device_id = device_id.map(str::to_string);
        Ok(())
    }

    /// Terminate the process. The `Closed` event follows once the remaining
    /// output has been flushed.
    pub fn close(&self, session_id: &str) -> Result<(), SessionError> {
        let (process, closing) = {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            if entry.status == SessionStatus::Closed {
                return Err(SessionError::Closed(session_id.to_string()));
            }
            entry.status = SessionStatus::Closed;
            (entry.process.clone(), entry.closing.clone())
        };
        process.terminate();
        closing.notify_one();
        Ok(())
    }

    pub fn close_all(&self) {
        for session_id in self.ids() {
            let _ = self.close(&session_id);
        }
    }

    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.info(session_id))
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.status)
    }

    pub fn output_bytes(&self, session_id: &str) -> Option<u64> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.output_bytes.load(Ordering::Relaxed))
    }

    /// Live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.lock();
        let mut live: Vec<_> = sessions
            .iter()
            .filter(|(_, entry)| entry.status != SessionStatus::Closed)
            .collect();
        live.sort_by_key(|(_, entry)| entry.created_at);
        live.into_iter().map(|(id, entry)| entry.info(id)).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().into_iter().map(|info| info.session_id).collect()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves once the session is closed or its child has exited.
async fn wait_for_end(process: &PtyProcess, closing: &Notify) {
    let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = closing.notified() => return,
            _ = poll.tick() => {
                if process.has_exited() {
                    tokio::time::sleep(EXIT_OUTPUT_GRACE).await;
                    return;
                }
            }
        }
    }
}
