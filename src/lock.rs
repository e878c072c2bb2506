//! Advisory lock state machine, arbitrated by the authority.
//!
//! ```text
//! Unlocked ──lock()──► LockPending ──grant──► Locked
//!    ▲                     │                    │
//!    └──────denied─────────┘                    │
//!    ▲                                          ▼
//!    └──grant── UnlockPending ◄──unlock()───────┘
//!                   │
//!                   └──denied──► Locked
//! ```
//!
//! The authority is the single arbiter: of two simultaneous lock requests
//! for the same record exactly one wins. Locking is cooperative; nothing
//! here prevents a non-compliant client from mutating a locked record.

/// Lock lifecycle states of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockPending,
    Locked,
    UnlockPending,
}

/// Outcome of a lock or unlock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The authority granted the lock.
    Acquired,
    /// The authority released the lock.
    Released,
    /// The authority refused the request.
    Denied,
    /// The record was not in the required source state; nothing was sent.
    Ignored,
}

/// Per-record coordinator for exclusive edit rights.
///
/// Local requests go `begin_* -> ack_*`; broadcasts about other clients'
/// locks bypass the request path via [`apply_remote`], since the
/// arbitration already happened server-side.
///
/// [`apply_remote`]: LockCoordinator::apply_remote
#[derive(Debug, Clone, Copy)]
pub struct LockCoordinator {
    state: LockState,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self { state: LockState::Unlocked }
    }
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    /// Start a lock request. Returns `false` (a no-op) unless currently
    /// `Unlocked`; in-flight requests are never queued or cancelled.
    pub fn begin_lock(&mut self) -> bool {
        if self.state != LockState::Unlocked {
            return false;
        }
        self.state = LockState::LockPending;
        true
    }

    /// Start an unlock request. No-op unless currently `Locked`.
    pub fn begin_unlock(&mut self) -> bool {
        if self.state != LockState::Locked {
            return false;
        }
        self.state = LockState::UnlockPending;
        true
    }

    /// Resolve a lock request. Only acts while still `LockPending`: a
    /// broadcast that raced ahead (the winner's lock announcement) has
    /// already settled the state and a late denial must not bounce it.
    pub fn ack_lock(&mut self, granted: bool) -> LockOutcome {
        if self.state != LockState::LockPending {
            return LockOutcome::Ignored;
        }
        if granted {
            self.state = LockState::Locked;
            LockOutcome::Acquired
        } else {
            self.state = LockState::Unlocked;
            LockOutcome::Denied
        }
    }

    /// Resolve an unlock request. Denial reverts to the prior state.
    pub fn ack_unlock(&mut self, granted: bool) -> LockOutcome {
        if self.state != LockState::UnlockPending {
            return LockOutcome::Ignored;
        }
        if granted {
            self.state = LockState::Unlocked;
            LockOutcome::Released
        } else {
            self.state = LockState::Locked;
            LockOutcome::Denied
        }
    }

    /// Apply a broadcast lock/unlock decision directly.
    pub fn apply_remote(&mut self, locked: bool) {
        self.state = if locked { LockState::Locked } else { LockState::Unlocked };
    }
}
