//! Change signals consumed by the rendering layer.
//!
//! The core never touches presentation state. Every observable mutation
//! raises a [`Signal`] on an unbounded stream; a view layer drains the
//! receiver and re-renders. One hub is shared by a collection and all of
//! its records so the consumer sees a single ordered stream.

use tokio::sync::mpsc;
use uuid::Uuid;

/// Where a mutation came from.
///
/// Threaded through `Record::set` as a parameter, never stored: a remote
/// application is marked for the duration of that one call so listeners
/// can tell "the network told me" from "the user typed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Signals raised by records and collections.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A record entered the collection. `id` is `None` for an optimistic
    /// local create that has not been acknowledged yet.
    Added { id: Option<Uuid> },
    /// A record left the collection (or a standalone record was deleted).
    Removed { id: Option<Uuid> },
    /// The initial record set finished loading; consumers should re-render.
    Reset,
    /// A record's attributes changed.
    Changed { id: Option<Uuid>, origin: Origin },
    /// A record became locked (locally acquired or remotely announced).
    Locked { id: Uuid },
    /// A record became unlocked.
    Unlocked { id: Uuid },
}

/// Sender half of the signal stream.
///
/// Cheap to clone; emitting never blocks and never fails visibly. A
/// dropped receiver simply makes signals vanish, which is fine: the core
/// does not depend on anyone watching.
#[derive(Clone)]
pub struct SignalHub {
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalHub {
    /// Create a hub and the receiver the rendering layer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }
}
