//! Registry of user pipes: one-shot buffered links between two sessions.
//!
//! A link is the read end of an anonymous pipe whose write end was handed to
//! the producing stage. The kernel pipe buffer holds the producer's output
//! until the destination consumes the link with `<N`.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::error::ShellError;
use crate::fd::anon_pipe;
use crate::fd::discard_in_background;
use crate::fd::with_retries;
use crate::session_id::SessionId;

#[derive(Debug, Default)]
pub struct UserPipeRegistry {
    links: Mutex<HashMap<(SessionId, SessionId), OwnedFd>>,
}

impl UserPipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> std::sync::MutexGuard<'_, HashMap<(SessionId, SessionId), OwnedFd>> {
        self.links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create the link `src -> dst` and return the write end for the producer.
    /// Pipe creation is retried `attempts` times on transient failures.
    pub async fn create(
        &self,
        src: SessionId,
        dst: SessionId,
        attempts: u32,
        delay: Duration,
    ) -> Result<OwnedFd> {
        if self.find(src, dst) {
            return Err(ShellError::DuplicateLink { src, dst });
        }
        let (reader, writer) = with_retries("user pipe", attempts, delay, anon_pipe)
            .await
            .map_err(|err| ShellError::resource_exhaustion("cannot create user pipe", err))?;
        self.insert(src, dst, reader)?;
        Ok(writer)
    }

    /// Register an already created pipe read end as the link `src -> dst`.
    /// The check and the insert happen under one lock, so of two racing
    /// producers exactly one wins.
    fn insert(&self, src: SessionId, dst: SessionId, reader: OwnedFd) -> Result<()> {
        let mut links = self.links();
        if links.contains_key(&(src, dst)) {
            return Err(ShellError::DuplicateLink { src, dst });
        }
        links.insert((src, dst), reader);
        debug!(%src, %dst, "user pipe created");
        Ok(())
    }

    pub fn find(&self, src: SessionId, dst: SessionId) -> bool {
        self.links().contains_key(&(src, dst))
    }

    /// Remove the link `src -> dst`, transferring its read end to the caller.
    pub fn consume(&self, src: SessionId, dst: SessionId) -> Result<OwnedFd> {
        let reader = self
            .links()
            .remove(&(src, dst))
            .ok_or(ShellError::LinkNotFound { src, dst })?;
        debug!(%src, %dst, "user pipe consumed");
        Ok(reader)
    }

    /// Drop every link that has `session` as either end. Unread contents are
    /// read to EOF in the background so blocked producers can finish.
    pub fn drain_for(&self, session: SessionId) -> usize {
        self.purge(&[session])
    }

    /// [`Self::drain_for`] over several sessions at once.
    pub fn purge(&self, sessions: &[SessionId]) -> usize {
        let removed: Vec<OwnedFd> = {
            let mut links = self.links();
            let keys: Vec<_> = links
                .keys()
                .filter(|(src, dst)| sessions.contains(src) || sessions.contains(dst))
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| links.remove(&key))
                .collect()
        };
        let count = removed.len();
        for reader in removed {
            discard_in_background(reader);
        }
        if count > 0 {
            debug!(?sessions, count, "user pipes drained");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.links().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
