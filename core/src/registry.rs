//! Registry of connected sessions.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::sync::Notify;
use tracing::info;

use crate::error::Result;
use crate::error::ShellError;
use crate::outbox::Outbox;
use crate::session_id::SessionId;
use crate::user_pipe::UserPipeRegistry;

/// Name shown for sessions that never ran `name`.
pub const UNNAMED: &str = "(no name)";

/// How the rest of the server reaches a session: its output channel and the
/// wake-up its mailbox consumer waits on.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub outbox: Outbox,
    pub wake: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            wake: Arc::new(Notify::new()),
        }
    }
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: Option<String>,
    pub addr: SocketAddr,
}

impl SessionInfo {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED)
    }
}

#[derive(Debug)]
struct Entry {
    name: Option<String>,
    addr: SocketAddr,
    handle: SessionHandle,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: BTreeMap<SessionId, Entry>,
    pending_removal: Vec<SessionId>,
    // Consumer stopped: no longer addressed, removable.
    released: BTreeSet<SessionId>,
}

impl Inner {
    /// Registered and not on its way out.
    fn active(&self) -> impl Iterator<Item = (&SessionId, &Entry)> {
        self.sessions
            .iter()
            .filter(|(id, _)| !self.pending_removal.contains(id))
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    limit: usize,
}

impl SessionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            limit,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session under the lowest free id in `1..=limit`.
    pub fn create(&self, addr: SocketAddr, handle: SessionHandle) -> Result<SessionId> {
        let mut inner = self.inner();
        let id = (1..=self.limit)
            .filter_map(|n| u32::try_from(n).ok())
            .map(SessionId::new)
            .find(|id| !inner.sessions.contains_key(id))
            .ok_or(ShellError::CapacityExceeded { limit: self.limit })?;
        inner.sessions.insert(
            id,
            Entry {
                name: None,
                addr,
                handle,
            },
        );
        info!(%id, %addr, "session registered");
        Ok(id)
    }

    /// Sessions queued for removal are no longer found.
    pub fn lookup_by_id(&self, id: SessionId) -> Option<SessionInfo> {
        self.inner()
            .active()
            .find(|(candidate, _)| **candidate == id)
            .map(|(_, entry)| SessionInfo {
                id,
                name: entry.name.clone(),
                addr: entry.addr,
            })
    }

    /// Find the session fed by `outbox`.
    pub fn lookup_by_handle(&self, outbox: &Outbox) -> Option<SessionId> {
        self.inner()
            .active()
            .find(|(_, entry)| entry.handle.outbox.same_session(outbox))
            .map(|(id, _)| *id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lookup_by_id(id).is_some()
    }

    /// Active sessions, ascending by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.inner()
            .active()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                name: entry.name.clone(),
                addr: entry.addr,
            })
            .collect()
    }

    /// Set the nickname of `id`. The uniqueness check covers every active
    /// session, the caller included.
    pub fn rename(&self, id: SessionId, name: &str) -> Result<SessionInfo> {
        let mut inner = self.inner();
        if inner
            .active()
            .any(|(_, entry)| entry.name.as_deref() == Some(name))
        {
            return Err(ShellError::NameCollision {
                name: name.to_string(),
            });
        }
        let entry = inner
            .sessions
            .get_mut(&id)
            .ok_or(ShellError::PeerNotFound { id })?;
        entry.name = Some(name.to_string());
        Ok(SessionInfo {
            id,
            name: entry.name.clone(),
            addr: entry.addr,
        })
    }

    /// Wake-ups for every session the audience selects, taken as a snapshot.
    /// Sessions queued for removal still receive notices until released.
    pub fn recipients(&self, only: Option<SessionId>) -> Vec<(SessionId, Arc<Notify>)> {
        let inner = self.inner();
        inner
            .sessions
            .iter()
            .filter(|(id, _)| !inner.released.contains(id))
            .filter(|(id, _)| only.is_none_or(|target| target == **id))
            .map(|(id, entry)| (*id, Arc::clone(&entry.handle.wake)))
            .collect()
    }

    /// Queue `id` for removal. From now on lookups skip it, but it keeps
    /// receiving notices until [`Self::release`] and its id stays taken
    /// until the [`Self::apply_removals`] after that.
    pub fn mark_for_removal(&self, id: SessionId) {
        let mut inner = self.inner();
        if !inner.pending_removal.contains(&id) {
            inner.pending_removal.push(id);
        }
    }

    /// The mailbox consumer of `id` is gone: stop addressing it and let the
    /// next [`Self::apply_removals`] free the id.
    pub fn release(&self, id: SessionId) {
        let mut inner = self.inner();
        if !inner.pending_removal.contains(&id) {
            inner.pending_removal.push(id);
        }
        inner.released.insert(id);
    }

    /// Remove every queued session that has been released and purge user
    /// pipes that reference it. Queued sessions still draining stay put.
    pub fn apply_removals(&self, user_pipes: &UserPipeRegistry) -> Vec<SessionId> {
        let removed: Vec<SessionId> = {
            let mut inner = self.inner();
            let Inner {
                sessions,
                pending_removal,
                released,
            } = &mut *inner;
            let mut removed = Vec::new();
            pending_removal.retain(|id| {
                if !released.remove(id) {
                    return true;
                }
                if sessions.remove(id).is_some() {
                    removed.push(*id);
                }
                false
            });
            removed
        };
        if !removed.is_empty() {
            user_pipes.purge(&removed);
            info!(?removed, "sessions removed");
        }
        removed
    }
}
