//! Explicit registry of live sessions.
//!
//! The host defers unrelated asynchronous UI work (update notifications and the
//! like) while a request is streaming. Instead of an ambient global flag, callers
//! share a [`SessionRegistry`] value: sessions hold a [`SessionTicket`] while they
//! run, and deferred callbacks are flushed when the last ticket is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which kind of session holds a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Incremental session.
    Stream,
    /// Non-incremental session.
    Bulk,
}

type Deferred = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct RegistryInner {
    active: HashMap<Uuid, SessionKind>,
    deferred: Vec<Deferred>,
}

/// Shared, cloneable registry of running sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionRegistry")
            .field("active", &inner.active)
            .field("deferred", &inner.deferred.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a running session. The session is active until the ticket drops.
    pub fn register(&self, id: Uuid, kind: SessionKind) -> SessionTicket {
        self.lock().active.insert(id, kind);
        tracing::debug!(session_id = %id, kind = ?kind, "session registered");
        SessionTicket {
            registry: self.clone(),
            id,
        }
    }

    /// Returns true while any session is registered.
    pub fn is_active(&self) -> bool {
        !self.lock().active.is_empty()
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Kind of the given session, if it is registered.
    pub fn kind_of(&self, id: Uuid) -> Option<SessionKind> {
        self.lock().active.get(&id).copied()
    }

    /// Runs `f` now if no session is active, otherwise once the last one ends.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.active.is_empty() {
            drop(inner);
            f();
        } else {
            inner.deferred.push(Box::new(f));
        }
    }

    /// Number of callbacks waiting for the registry to go idle.
    pub fn deferred_count(&self) -> usize {
        self.lock().deferred.len()
    }

    fn release(&self, id: Uuid) {
        let flushed = {
            let mut inner = self.lock();
            inner.active.remove(&id);
            if inner.active.is_empty() {
                std::mem::take(&mut inner.deferred)
            } else {
                Vec::new()
            }
        };

        tracing::debug!(session_id = %id, flushed = flushed.len(), "session released");
        for f in flushed {
            f();
        }
    }
}

/// Proof of registration; unregisters its session on drop.
pub struct SessionTicket {
    registry: SessionRegistry,
    id: Uuid,
}

impl SessionTicket {
    /// Id of the registered session.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTicket").field("id", &self.id).finish()
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
