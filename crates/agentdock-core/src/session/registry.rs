//! In-memory session registry
//!
//! The map itself sits behind one coarse `RwLock` that is held only for
//! insert/remove/lookup and never across driver I/O. Each session has its own
//! async mutex, so deliveries and teardowns for one session id serialize while
//! different sessions proceed independently. Expected session concurrency is
//! low, which is what makes the single map lock acceptable.

use super::handle::SessionHandle;
use crate::error::{Error, Result};
use crate::types::{AgentKind, SessionInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Registry entry: immutable session metadata plus the lockable handle
#[derive(Debug)]
pub struct SessionSlot {
    pub session_id: String,
    pub agent_id: String,
    pub kind: AgentKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Mirrors the transport port, 0 when there is none
    port: AtomicU16,
    handle: Mutex<SessionHandle>,
}

impl SessionSlot {
    fn new(handle: SessionHandle) -> Self {
        Self {
            session_id: handle.session_id.clone(),
            agent_id: handle.descriptor_id.clone(),
            kind: handle.kind,
            created_at: handle.created_at,
            port: AtomicU16::new(handle.transport.port().unwrap_or(0)),
            handle: Mutex::new(handle),
        }
    }

    /// Lock the handle for the duration of one driver call
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, SessionHandle> {
        self.handle.lock().await
    }

    /// Refresh the mirrored port after the transport changed
    pub fn sync_port(&self, handle: &SessionHandle) {
        self.port
            .store(handle.transport.port().unwrap_or(0), Ordering::Relaxed);
    }

    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let uptime = chrono::Utc::now() - self.created_at;
        SessionInfo {
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            kind: self.kind,
            created_at: self.created_at,
            uptime_ms: uptime.num_milliseconds().max(0),
            port: self.port(),
        }
    }
}

/// Single source of truth for what is running right now
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, replacing any slot with the same session id
    pub fn put(&self, handle: SessionHandle) -> Arc<SessionSlot> {
        let slot = Arc::new(SessionSlot::new(handle));
        self.sessions
            .write()
            .insert(slot.session_id.clone(), Arc::clone(&slot));
        slot
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::session_not_found(session_id))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.write().remove(session_id)
    }

    pub fn list(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Remove and return every slot
    pub fn drain(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions.write().drain().map(|(_, slot)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
