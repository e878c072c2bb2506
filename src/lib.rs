//! # tandem — real-time shared-record synchronization
//!
//! Keeps an ordered collection of records consistent across multiple
//! concurrently connected clients and a central authority, with
//! advisory locking to keep two clients from editing the same record
//! at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket / local    ┌─────────────┐
//! │ RealtimeChannel  │ ◄─────────────────────► │  Authority  │
//! │ (per client)     │      binary frames      │  (central)  │
//! └───┬──────────┬───┘                         └──────┬──────┘
//!     │ dispatch │ request/ack                        │
//!     ▼          ▼                              fan-out to all
//! ┌──────────────────┐                          clients, echo
//! │ OrderedCollection│ ◄── Reconciler ◄──────── included
//! │  └─ Record (×N)  │     (idempotent merge)
//! └──────────────────┘
//! ```
//!
//! A local mutation is applied optimistically, sent to the authority,
//! persisted there and rebroadcast to every client including the
//! originator; each client's reconciler merges the event back into
//! local state idempotently, marked with a remote origin to suppress
//! feedback loops. Lock and unlock are request/response calls on the
//! same channel, arbitrated first-come-first-served by the authority.
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded frames)
//! - [`signal`] — change signals consumed by the rendering layer
//! - [`channel`] — subscription registry and request/ack plumbing
//! - [`lock`] — advisory lock state machine
//! - [`record`] — a single mutable record
//! - [`collection`] — ordered, deduplicated record set
//! - [`reconcile`] — inbound event pump and merge rules
//! - [`authority`] — the central arbiter and WebSocket server
//! - [`transport`] — WebSocket client transport

pub mod authority;
pub mod channel;
pub mod collection;
pub mod lock;
pub mod protocol;
pub mod reconcile;
pub mod record;
pub mod signal;
pub mod transport;

// Re-exports for convenience
pub use authority::{Authority, AuthorityConfig, AuthorityStats};
pub use channel::{RealtimeChannel, SubscriberId, SyncError};
pub use collection::OrderedCollection;
pub use lock::{LockCoordinator, LockOutcome, LockState};
pub use protocol::{
    ClientFrame, Event, EventKind, ProtocolError, RecordBody, RecordPatch, ReplyBody,
    Refusal, Request, ServerFrame, Topic,
};
pub use reconcile::{bootstrap, Reconciler};
pub use record::{Attributes, Record, DEFAULT_TITLE};
pub use signal::{Origin, Signal, SignalHub};
pub use transport::{ConnState, WsTransport};
