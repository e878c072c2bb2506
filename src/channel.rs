//! The realtime channel: single point of truth for event subscriptions
//! and for routing local intents to the authority.
//!
//! Inbound: the reconciler feeds broadcast [`Event`]s into [`dispatch`],
//! which invokes every handler bound to the event's topic in registration
//! order. Handlers filter by payload id themselves; the registry does not
//! route per-instance.
//!
//! Outbound: [`request`] sends a sequenced frame and suspends until the
//! authority acknowledges it, exactly once, with either a canonical
//! payload or a structured refusal. [`send`] is the fire-and-forget
//! variant for intents whose outcome the caller ignores.
//!
//! [`dispatch`]: RealtimeChannel::dispatch
//! [`request`]: RealtimeChannel::request
//! [`send`]: RealtimeChannel::send

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::{ClientFrame, Event, ReplyBody, Refusal, Request, Topic};

/// Identity of a subscription owner (one record or one collection).
///
/// Unbinding is scoped to the owner: `unbind_all` removes every
/// registration the owner holds and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Hook invoked in the reconciler's frame order when a request resolves,
/// before any later broadcast is dispatched. `Some` carries the granted
/// reply body; `None` means refused or failed.
pub(crate) type AckHook = Box<dyn FnOnce(Option<&ReplyBody>) + Send>;

struct Registration {
    owner: SubscriberId,
    topic: Topic,
    handler: Handler,
}

struct Pending {
    hook: Option<AckHook>,
    tx: oneshot::Sender<Result<ReplyBody, Refusal>>,
}

struct ChannelInner {
    registry: Mutex<Vec<Registration>>,
    pending: Mutex<HashMap<u64, Pending>>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    seq: AtomicU64,
}

/// Errors surfaced by channel operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The transport is gone; the request was never acknowledged.
    ChannelClosed,
    /// The authority refused the request.
    Refused(Refusal),
    /// The authority acknowledged with an unexpected payload shape.
    UnexpectedReply,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::ChannelClosed => write!(f, "channel closed"),
            SyncError::Refused(r) => write!(f, "refused: {r}"),
            SyncError::UnexpectedReply => write!(f, "unexpected reply payload"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Handle to the channel. Cheap to clone; all clones share one registry
/// and one outbound stream.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    /// Create a channel and the outbound frame stream a transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(ChannelInner {
                registry: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                outbound: tx,
                seq: AtomicU64::new(1),
            }),
        };
        (channel, rx)
    }

    /// Register a handler for `(owner, topic)`.
    ///
    /// Idempotent: if the identical registration already exists this
    /// silently returns without creating a duplicate.
    pub fn bind(
        &self,
        owner: SubscriberId,
        topic: Topic,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        let mut registry = self.inner.registry.lock().unwrap();
        if registry.iter().any(|r| r.owner == owner && r.topic == topic) {
            return;
        }
        registry.push(Registration {
            owner,
            topic,
            handler: Arc::new(handler),
        });
    }

    /// Remove one registration. Safe to call when none exists.
    pub fn unbind(&self, owner: SubscriberId, topic: &Topic) {
        let mut registry = self.inner.registry.lock().unwrap();
        registry.retain(|r| !(r.owner == owner && r.topic == *topic));
    }

    /// Remove every registration the owner holds. Idempotent.
    pub fn unbind_all(&self, owner: SubscriberId) {
        let mut registry = self.inner.registry.lock().unwrap();
        registry.retain(|r| r.owner != owner);
    }

    /// Number of live registrations.
    pub fn bound_count(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    /// Invoke every handler bound to the event's topic, in registration
    /// order. Handlers are cloned out first so they may bind or unbind
    /// without deadlocking the registry.
    pub fn dispatch(&self, event: &Event) {
        let topic = event.topic();
        let handlers: Vec<Handler> = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .iter()
                .filter(|r| r.topic == topic)
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };
        if handlers.is_empty() {
            // Stale reference: the record may already be gone locally.
            log::debug!("no handler bound for {topic}, event dropped");
            return;
        }
        for handler in handlers {
            handler(event);
        }
    }

    /// Send a request and await its acknowledgment.
    pub async fn request(&self, request: Request) -> Result<ReplyBody, SyncError> {
        self.request_with(request, None).await
    }

    /// Send a request with an ack hook.
    ///
    /// The hook runs inside the reconciler's frame loop, strictly before
    /// any broadcast that follows the reply on the wire. State merges
    /// that must beat the echo of their own request (a create's assigned
    /// id, a lock grant) belong in the hook, not after the await.
    pub(crate) async fn request_with(
        &self,
        request: Request,
        hook: Option<AckHook>,
    ) -> Result<ReplyBody, SyncError> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(seq, Pending { hook, tx });

        if self.inner.outbound.send(ClientFrame { seq, request }).is_err() {
            if let Some(p) = self.inner.pending.lock().unwrap().remove(&seq) {
                if let Some(hook) = p.hook {
                    hook(None);
                }
            }
            return Err(SyncError::ChannelClosed);
        }

        match rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(refusal)) => Err(SyncError::Refused(refusal)),
            Err(_) => Err(SyncError::ChannelClosed),
        }
    }

    /// Fire-and-forget: send without awaiting the acknowledgment.
    pub fn send(&self, request: Request) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        if self.inner.outbound.send(ClientFrame { seq, request }).is_err() {
            log::debug!("outbound channel closed, request dropped");
        }
    }

    /// Resolve a pending request by sequence number. Unknown sequences
    /// (fire-and-forget acks) are dropped silently.
    pub(crate) fn resolve(&self, seq: u64, result: Result<ReplyBody, Refusal>) {
        let pending = self.inner.pending.lock().unwrap().remove(&seq);
        let Some(p) = pending else {
            log::debug!("ack for unknown seq {seq}, dropped");
            return;
        };
        if let Some(hook) = p.hook {
            hook(result.as_ref().ok());
        }
        let _ = p.tx.send(result);
    }

    /// Fail every in-flight request. Called when the transport ends so
    /// no caller suspends forever on a dead connection.
    pub(crate) fn fail_all_pending(&self) {
        let drained: Vec<Pending> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            if let Some(hook) = p.hook {
                hook(None);
            }
            // Dropping tx wakes the caller with ChannelClosed.
        }
    }
}
