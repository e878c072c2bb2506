//! Reconciliation of authority frames into local state.
//!
//! The pump drains one connection's inbound stream in wire order:
//! replies resolve their pending request (running any merge hook) and
//! broadcast events are dispatched to the bound handlers. Merge rules:
//!
//! - create: idempotent merge by id into the collection
//! - update: `Record::set` with remote origin
//! - delete: remove via the owning collection, or signal a standalone
//! - lock/unlock: apply the arbitration result directly
//! - unknown id: dropped silently; the record may already be gone
//!   locally from a racing delete
//!
//! Because delivery is only ordered per connection, not across clients,
//! every rule is idempotent rather than order-dependent: receiving an
//! update before its create, or a duplicated create, must not corrupt
//! the collection.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{RealtimeChannel, SyncError};
use crate::collection::OrderedCollection;
use crate::protocol::{ReplyBody, Request, ServerFrame};

/// The inbound pump for one connection.
pub struct Reconciler {
    channel: RealtimeChannel,
}

impl Reconciler {
    pub fn new(channel: RealtimeChannel) -> Self {
        Self { channel }
    }

    /// Process frames until the stream ends, then fail any requests
    /// still in flight so no caller suspends on a dead connection.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<ServerFrame>) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                ServerFrame::Reply { seq, result } => self.channel.resolve(seq, result),
                ServerFrame::Event(event) => self.channel.dispatch(&event),
            }
        }
        log::info!("inbound stream ended, failing in-flight requests");
        self.channel.fail_all_pending();
    }

    /// Run the pump on a background task.
    pub fn spawn(self, inbound: mpsc::UnboundedReceiver<ServerFrame>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }
}

/// One-shot startup sequence for a collection: announce the client,
/// load the current record set, then apply the handshake's lock
/// snapshot. Returns the number of records loaded.
pub async fn bootstrap(
    channel: &RealtimeChannel,
    collection: &OrderedCollection,
    client_id: Uuid,
) -> Result<usize, SyncError> {
    let welcome = channel
        .request(Request::Hello {
            client_id,
            resources: vec![collection.resource().to_string()],
        })
        .await?;
    let ReplyBody::Welcome { locked } = welcome else {
        return Err(SyncError::UnexpectedReply);
    };

    let loaded = collection.fetch().await?;
    apply_lock_snapshot(collection, &locked);
    log::info!(
        "client {client_id} joined {}: {loaded} records, {} locked",
        collection.resource(),
        locked.len()
    );
    Ok(loaded)
}

/// Mark the records the handshake reported as currently locked.
/// Consumed once at startup; unknown ids are dropped.
pub fn apply_lock_snapshot(collection: &OrderedCollection, locked: &[(String, Uuid)]) {
    for (resource, id) in locked {
        if resource != collection.resource() {
            continue;
        }
        match collection.get(*id) {
            Some(record) => record.apply_remote_lock(true),
            None => log::debug!("lock snapshot references unknown record {id}"),
        }
    }
}
