//! Exclusive-session arbitration for the recorder and player.
//!
//! At most one capture or replay session may run per actuator set. Starting
//! a second session is an explicit rejected transition, not a race.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// What kind of background session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Recording,
    Playback,
}

impl SessionKind {
    fn label(self) -> &'static str {
        match self {
            SessionKind::Recording => "recording",
            SessionKind::Playback => "playback",
        }
    }
}

/// Shared lock handed to both the recorder and the player of one arm.
#[derive(Debug, Clone, Default)]
pub struct SessionLock {
    active: Arc<Mutex<Option<SessionKind>>>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session slot, or fail with [`Error::SessionActive`] naming
    /// the session that already holds it.
    pub fn try_begin(&self, kind: SessionKind) -> Result<SessionGuard> {
        let mut active = self.lock();
        if let Some(current) = *active {
            return Err(Error::SessionActive(current.label()));
        }
        *active = Some(kind);
        Ok(SessionGuard {
            lock: self.clone(),
        })
    }

    /// The currently active session, if any.
    pub fn active(&self) -> Option<SessionKind> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionKind>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases the session slot when dropped (normally by the worker thread at
/// the end of its loop).
#[derive(Debug)]
pub struct SessionGuard {
    lock: SessionLock,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self.lock.lock() = None;
    }
}
