//! A single shared record: identity, attributes, lock status, and the
//! channel subscriptions it owns.
//!
//! Local mutations are applied optimistically and sent to the authority;
//! the authority's canonical answer (assigned id, corrected order) is
//! merged back on acknowledgment. Remote mutations arrive through the
//! record's bound topic handlers and are applied with
//! [`Origin::Remote`] so listeners can suppress feedback loops.

use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::channel::{AckHook, RealtimeChannel, SubscriberId, SyncError};
use crate::collection::{CollectionCore, OrderedCollection};
use crate::lock::{LockCoordinator, LockOutcome, LockState};
use crate::protocol::{Event, EventKind, RecordBody, RecordPatch, ReplyBody, Request, Topic};
use crate::signal::{Origin, Signal, SignalHub};

/// Placeholder title for records created without one.
pub const DEFAULT_TITLE: &str = "untitled";

/// Current time as epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The full attribute set of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub title: String,
    pub order: i64,
    pub done: bool,
    pub created_ms: u64,
    pub due_ms: Option<u64>,
}

impl Attributes {
    /// Build attributes from a patch, filling defaults for unset fields.
    pub(crate) fn from_patch(patch: &RecordPatch, fallback_order: i64) -> Self {
        Self {
            title: patch.title.clone().unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            order: patch.order.unwrap_or(fallback_order),
            done: patch.done.unwrap_or(false),
            created_ms: patch.created_ms.unwrap_or_else(now_ms),
            due_ms: patch.due_ms,
        }
    }

    /// Merge a patch into this attribute set. Identity is not an
    /// attribute; a patch's `id` field is ignored here.
    pub(crate) fn apply(&mut self, patch: &RecordPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(order) = patch.order {
            self.order = order;
        }
        if let Some(done) = patch.done {
            self.done = done;
        }
        if let Some(created_ms) = patch.created_ms {
            self.created_ms = created_ms;
        }
        if let Some(due_ms) = patch.due_ms {
            self.due_ms = Some(due_ms);
        }
    }

    /// The full attribute set as a patch (no identity).
    pub fn as_patch(&self) -> RecordPatch {
        RecordPatch {
            id: None,
            title: Some(self.title.clone()),
            order: Some(self.order),
            done: Some(self.done),
            created_ms: Some(self.created_ms),
            due_ms: self.due_ms,
        }
    }
}

impl From<&RecordBody> for Attributes {
    fn from(body: &RecordBody) -> Self {
        Self {
            title: body.title.clone(),
            order: body.order,
            done: body.done,
            created_ms: body.created_ms,
            due_ms: body.due_ms,
        }
    }
}

struct RecordState {
    id: Option<Uuid>,
    attrs: Attributes,
    lock: LockCoordinator,
    cleaned: bool,
}

pub(crate) struct RecordInner {
    resource: String,
    channel: RealtimeChannel,
    signals: SignalHub,
    subscriber: SubscriberId,
    /// Owning collection, if any. Standalone records carry a dead Weak.
    collection: Weak<CollectionCore>,
    state: Mutex<RecordState>,
}

/// Handle to a shared record. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    pub(crate) fn build(
        channel: &RealtimeChannel,
        signals: &SignalHub,
        resource: &str,
        collection: Weak<CollectionCore>,
        id: Option<Uuid>,
        attrs: Attributes,
        bind_remote: bool,
    ) -> Self {
        let record = Self {
            inner: Arc::new(RecordInner {
                resource: resource.to_string(),
                channel: channel.clone(),
                signals: signals.clone(),
                subscriber: SubscriberId::new(),
                collection,
                state: Mutex::new(RecordState {
                    id,
                    attrs,
                    lock: LockCoordinator::new(),
                    cleaned: false,
                }),
            }),
        };
        if bind_remote {
            record.bind_remote();
        }
        record
    }

    pub(crate) fn from_inner(inner: Arc<RecordInner>) -> Self {
        Self { inner }
    }

    /// Create a record that owns itself (no collection), e.g. a detail
    /// editor. Pass `no_bind` to opt out of remote event binding.
    pub fn standalone(
        channel: &RealtimeChannel,
        signals: &SignalHub,
        resource: &str,
        patch: &RecordPatch,
        no_bind: bool,
    ) -> Self {
        let attrs = Attributes::from_patch(patch, 1);
        Self::build(channel, signals, resource, Weak::new(), patch.id, attrs, !no_bind)
    }

    /// Register handlers for the four remote topics of this resource.
    /// The handlers filter by record id; re-binding is idempotent at the
    /// channel level.
    fn bind_remote(&self) {
        for kind in [EventKind::Update, EventKind::Delete, EventKind::Lock, EventKind::Unlock] {
            let weak = Arc::downgrade(&self.inner);
            let topic = Topic::new(self.inner.resource.clone(), kind);
            self.inner.channel.bind(self.inner.subscriber, topic, move |event| {
                if let Some(inner) = weak.upgrade() {
                    Record::from_inner(inner).on_remote(event);
                }
            });
        }
    }

    fn on_remote(&self, event: &Event) {
        let mine = match (event.id(), self.id()) {
            (Some(evt), Some(own)) => evt == own,
            _ => false,
        };
        if !mine {
            return;
        }
        match event {
            Event::Updated { patch, .. } => self.set(patch, Origin::Remote),
            Event::Deleted { .. } => self.apply_remote_delete(),
            Event::Locked { .. } => self.apply_remote_lock(true),
            Event::Unlocked { .. } => self.apply_remote_lock(false),
            Event::Created { .. } => {}
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        self.inner.state.lock().unwrap().id
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    pub fn attrs(&self) -> Attributes {
        self.inner.state.lock().unwrap().attrs.clone()
    }

    pub fn title(&self) -> String {
        self.inner.state.lock().unwrap().attrs.title.clone()
    }

    pub fn order(&self) -> i64 {
        self.inner.state.lock().unwrap().attrs.order
    }

    pub fn done(&self) -> bool {
        self.inner.state.lock().unwrap().attrs.done
    }

    pub fn lock_state(&self) -> LockState {
        self.inner.state.lock().unwrap().lock.state()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().unwrap().lock.is_locked()
    }

    pub(crate) fn same(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Merge attributes into the record and raise a change signal.
    ///
    /// `origin` marks this one application only; it is not stored.
    pub fn set(&self, patch: &RecordPatch, origin: Origin) {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            st.attrs.apply(patch);
            st.id
        };
        self.inner.signals.emit(Signal::Changed { id, origin });
    }

    /// Send the current attribute set to the authority and merge its
    /// canonical answer.
    ///
    /// On failure the optimistic local state is kept; the returned error
    /// is the caller's divergence marker.
    pub async fn save(&self) -> Result<RecordBody, SyncError> {
        let request = {
            let st = self.inner.state.lock().unwrap();
            let attrs = st.attrs.as_patch();
            match st.id {
                Some(id) => Request::Update {
                    resource: self.inner.resource.clone(),
                    id,
                    attrs,
                },
                None => Request::Create {
                    resource: self.inner.resource.clone(),
                    attrs,
                },
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let hook: AckHook = Box::new(move |reply| {
            if let (Some(inner), Some(ReplyBody::Record(body))) = (weak.upgrade(), reply) {
                Record::from_inner(inner).merge_canonical(body);
            }
        });
        match self.inner.channel.request_with(request, Some(hook)).await? {
            ReplyBody::Record(body) => Ok(body),
            _ => Err(SyncError::UnexpectedReply),
        }
    }

    /// Flip the completion flag and save.
    pub async fn toggle(&self) -> Result<RecordBody, SyncError> {
        let flipped = !self.done();
        self.set(&RecordPatch::done(flipped), Origin::Local);
        self.save().await
    }

    /// Request deletion from the authority, then perform local cleanup
    /// unconditionally. The network outcome is not awaited; the caller
    /// must not need acknowledgment to drop the record.
    pub fn destroy(&self) {
        let (id, cleaned) = {
            let st = self.inner.state.lock().unwrap();
            (st.id, st.cleaned)
        };
        if cleaned {
            return;
        }
        if let Some(id) = id {
            self.inner.channel.send(Request::Delete {
                resource: self.inner.resource.clone(),
                id,
            });
        }
        self.detach();
    }

    /// Request exclusive edit rights from the authority.
    pub async fn lock(&self) -> Result<LockOutcome, SyncError> {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            let Some(id) = st.id else {
                // Unsaved records are invisible to other clients.
                return Ok(LockOutcome::Ignored);
            };
            if !st.lock.begin_lock() {
                return Ok(LockOutcome::Ignored);
            }
            id
        };
        let weak = Arc::downgrade(&self.inner);
        let hook: AckHook = Box::new(move |reply| {
            let Some(inner) = weak.upgrade() else { return };
            let outcome = inner.state.lock().unwrap().lock.ack_lock(reply.is_some());
            if outcome == LockOutcome::Acquired {
                inner.signals.emit(Signal::Locked { id });
            }
        });
        let request = Request::Lock {
            resource: self.inner.resource.clone(),
            id,
        };
        match self.inner.channel.request_with(request, Some(hook)).await {
            Ok(_) => Ok(LockOutcome::Acquired),
            Err(SyncError::Refused(refusal)) => {
                log::debug!("lock refused for {id}: {refusal}");
                Ok(LockOutcome::Denied)
            }
            Err(e) => Err(e),
        }
    }

    /// Release exclusive edit rights.
    pub async fn unlock(&self) -> Result<LockOutcome, SyncError> {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            let Some(id) = st.id else {
                return Ok(LockOutcome::Ignored);
            };
            if !st.lock.begin_unlock() {
                return Ok(LockOutcome::Ignored);
            }
            id
        };
        let weak = Arc::downgrade(&self.inner);
        let hook: AckHook = Box::new(move |reply| {
            let Some(inner) = weak.upgrade() else { return };
            let outcome = inner.state.lock().unwrap().lock.ack_unlock(reply.is_some());
            if outcome == LockOutcome::Released {
                inner.signals.emit(Signal::Unlocked { id });
            }
        });
        let request = Request::Unlock {
            resource: self.inner.resource.clone(),
            id,
        };
        match self.inner.channel.request_with(request, Some(hook)).await {
            Ok(_) => Ok(LockOutcome::Released),
            Err(SyncError::Refused(refusal)) => {
                log::debug!("unlock refused for {id}: {refusal}");
                Ok(LockOutcome::Denied)
            }
            Err(e) => Err(e),
        }
    }

    /// Merge the authority's canonical record state.
    ///
    /// Runs inside the ack hook, so a create's assigned id lands before
    /// the broadcast echo of that create is dispatched.
    pub(crate) fn merge_canonical(&self, body: &RecordBody) {
        let newly_identified = {
            let mut st = self.inner.state.lock().unwrap();
            let newly = st.id.is_none();
            st.id = Some(body.id);
            st.attrs.apply(&body.as_patch());
            newly
        };
        if newly_identified {
            if let Some(core) = self.inner.collection.upgrade() {
                OrderedCollection::from_core(core).index_identified(self);
            }
        }
        self.inner.signals.emit(Signal::Changed {
            id: Some(body.id),
            origin: Origin::Remote,
        });
    }

    /// Apply a broadcast lock decision without going through the local
    /// request path.
    pub(crate) fn apply_remote_lock(&self, locked: bool) {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            st.lock.apply_remote(locked);
            st.id
        };
        if let Some(id) = id {
            self.inner.signals.emit(if locked {
                Signal::Locked { id }
            } else {
                Signal::Unlocked { id }
            });
        }
    }

    /// React to a remote delete: the owning collection removes the
    /// record; a standalone record raises its own removed signal.
    pub(crate) fn apply_remote_delete(&self) {
        self.detach();
    }

    fn detach(&self) {
        if let Some(core) = self.inner.collection.upgrade() {
            OrderedCollection::from_core(core).remove(self);
        } else {
            self.release(true);
        }
    }

    /// Release the record's channel subscriptions, once. `emit_removed`
    /// raises the removed signal; the flag guard makes the signal fire
    /// at most once over the record's lifetime.
    pub(crate) fn release(&self, emit_removed: bool) {
        let (already, id) = {
            let mut st = self.inner.state.lock().unwrap();
            let was = st.cleaned;
            st.cleaned = true;
            (was, st.id)
        };
        if already {
            return;
        }
        self.inner.channel.unbind_all(self.inner.subscriber);
        if emit_removed {
            self.inner.signals.emit(Signal::Removed { id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientFrame;
    use tokio::sync::mpsc;

    fn harness() -> (
        RealtimeChannel,
        mpsc::UnboundedReceiver<ClientFrame>,
        SignalHub,
        mpsc::UnboundedReceiver<Signal>,
    ) {
        let (channel, outbound) = RealtimeChannel::new();
        let (hub, signals) = SignalHub::new();
        (channel, outbound, hub, signals)
    }

    fn body_for(id: Uuid, title: &str, order: i64) -> RecordBody {
        RecordBody {
            id,
            title: title.to_string(),
            order,
            done: false,
            created_ms: 1,
            due_ms: None,
        }
    }

    #[test]
    fn test_standalone_defaults() {
        let (channel, _out, hub, _sig) = harness();
        let record = Record::standalone(&channel, &hub, "card", &RecordPatch::new(), false);

        assert_eq!(record.id(), None);
        assert_eq!(record.title(), DEFAULT_TITLE);
        assert_eq!(record.order(), 1);
        assert!(!record.done());
        assert_eq!(record.lock_state(), LockState::Unlocked);
        assert!(record.attrs().created_ms > 0);
    }

    #[test]
    fn test_standalone_binds_four_topics() {
        let (channel, _out, hub, _sig) = harness();
        let _record = Record::standalone(&channel, &hub, "card", &RecordPatch::new(), false);
        assert_eq!(channel.bound_count(), 4);
    }

    #[test]
    fn test_no_bind_opts_out() {
        let (channel, _out, hub, _sig) = harness();
        let _record = Record::standalone(&channel, &hub, "card", &RecordPatch::new(), true);
        assert_eq!(channel.bound_count(), 0);
    }

    #[test]
    fn test_set_signals_origin() {
        let (channel, _out, hub, mut signals) = harness();
        let record = Record::standalone(&channel, &hub, "card", &RecordPatch::new(), true);

        record.set(&RecordPatch::title("local edit"), Origin::Local);
        record.set(&RecordPatch::title("remote edit"), Origin::Remote);

        assert_eq!(
            signals.try_recv().unwrap(),
            Signal::Changed { id: None, origin: Origin::Local }
        );
        assert_eq!(
            signals.try_recv().unwrap(),
            Signal::Changed { id: None, origin: Origin::Remote }
        );
        assert_eq!(record.title(), "remote edit");
    }

    #[test]
    fn test_remote_update_filters_by_id() {
        let (channel, _out, hub, _sig) = harness();
        let id = Uuid::new_v4();
        let patch = RecordPatch { id: Some(id), ..RecordPatch::title("mine") };
        let record = Record::standalone(&channel, &hub, "card", &patch, false);

        // An update for some other record must not touch this one.
        channel.dispatch(&Event::Updated {
            resource: "card".to_string(),
            patch: RecordPatch {
                id: Some(Uuid::new_v4()),
                title: Some("other".to_string()),
                ..RecordPatch::default()
            },
        });
        assert_eq!(record.title(), "mine");

        channel.dispatch(&Event::Updated {
            resource: "card".to_string(),
            patch: RecordPatch {
                id: Some(id),
                title: Some("renamed".to_string()),
                ..RecordPatch::default()
            },
        });
        assert_eq!(record.title(), "renamed");
    }

    #[test]
    fn test_remote_lock_unlock() {
        let (channel, _out, hub, mut signals) = harness();
        let id = Uuid::new_v4();
        let patch = RecordPatch { id: Some(id), ..RecordPatch::default() };
        let record = Record::standalone(&channel, &hub, "card", &patch, false);

        channel.dispatch(&Event::Locked { resource: "card".to_string(), id });
        assert!(record.is_locked());
        assert_eq!(signals.try_recv().unwrap(), Signal::Locked { id });

        channel.dispatch(&Event::Unlocked { resource: "card".to_string(), id });
        assert!(!record.is_locked());
        assert_eq!(signals.try_recv().unwrap(), Signal::Unlocked { id });
    }

    #[test]
    fn test_remote_delete_standalone_signals_removed() {
        let (channel, _out, hub, mut signals) = harness();
        let id = Uuid::new_v4();
        let patch = RecordPatch { id: Some(id), ..RecordPatch::default() };
        let record = Record::standalone(&channel, &hub, "card", &patch, false);

        channel.dispatch(&Event::Deleted { resource: "card".to_string(), id });
        assert_eq!(signals.try_recv().unwrap(), Signal::Removed { id: Some(id) });
        assert_eq!(channel.bound_count(), 0);

        // A second delete finds no handler and changes nothing.
        channel.dispatch(&Event::Deleted { resource: "card".to_string(), id });
        assert!(signals.try_recv().is_err());
        let _ = record;
    }

    #[tokio::test]
    async fn test_save_create_merges_canonical_id() {
        let (channel, mut outbound, hub, _sig) = harness();
        let record = Record::standalone(&channel, &hub, "card", &RecordPatch::title("draft"), false);
        assert_eq!(record.id(), None);

        let responder = channel.clone();
        let assigned = Uuid::new_v4();
        tokio::spawn(async move {
            let frame = outbound.recv().await.unwrap();
            assert!(matches!(frame.request, Request::Create { .. }));
            // The authority corrects the order and assigns the id.
            responder.resolve(frame.seq, Ok(ReplyBody::Record(body_for(assigned, "draft", 7))));
        });

        let body = record.save().await.unwrap();
        assert_eq!(body.id, assigned);
        assert_eq!(record.id(), Some(assigned));
        assert_eq!(record.order(), 7);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_optimistic_state() {
        let (channel, mut outbound, hub, _sig) = harness();
        let id = Uuid::new_v4();
        let patch = RecordPatch { id: Some(id), ..RecordPatch::title("kept") };
        let record = Record::standalone(&channel, &hub, "card", &patch, true);

        let responder = channel.clone();
        tokio::spawn(async move {
            let frame = outbound.recv().await.unwrap();
            responder.resolve(frame.seq, Err(crate::protocol::Refusal::NotFound { id }));
        });

        let err = record.save().await.unwrap_err();
        assert!(matches!(err, SyncError::Refused(_)));
        assert_eq!(record.title(), "kept");
    }

    #[tokio::test]
    async fn test_lock_grant_and_denial() {
        let (channel, mut outbound, hub, _sig) = harness();
        let id = Uuid::new_v4();
        let patch = RecordPatch { id: Some(id), ..RecordPatch::default() };
        let record = Record::standalone(&channel, &hub, "card", &patch, true);

        let responder = channel.clone();
        tokio::spawn(async move {
            let frame = outbound.recv().await.unwrap();
            responder.resolve(frame.seq, Ok(ReplyBody::Done));
            let frame = outbound.recv().await.unwrap();
            responder.resolve(frame.seq, Ok(ReplyBody::Done));
            let frame = outbound.recv().await.unwrap();
            responder.resolve(frame.seq, Err(crate::protocol::Refusal::LockHeld { id }));
        });

        assert_eq!(record.lock().await.unwrap(), LockOutcome::Acquired);
        assert!(record.is_locked());

        // Already locked: nothing is sent.
        assert_eq!(record.lock().await.unwrap(), LockOutcome::Ignored);

        assert_eq!(record.unlock().await.unwrap(), LockOutcome::Released);
        assert_eq!(record.lock_state(), LockState::Unlocked);

        assert_eq!(record.lock().await.unwrap(), LockOutcome::Denied);
        assert_eq!(record.lock_state(), LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_lock_on_unsaved_record_is_ignored() {
        let (channel, _out, hub, _sig) = harness();
        let record = Record::standalone(&channel, &hub, "card", &RecordPatch::new(), true);
        assert_eq!(record.lock().await.unwrap(), LockOutcome::Ignored);
        assert_eq!(record.unlock().await.unwrap(), LockOutcome::Ignored);
    }

    #[test]
    fn test_destroy_unsaved_sends_nothing() {
        let (channel, mut outbound, hub, mut signals) = harness();
        let record = Record::standalone(&channel, &hub, "card", &RecordPatch::new(), false);

        record.destroy();
        assert!(outbound.try_recv().is_err());
        assert_eq!(signals.try_recv().unwrap(), Signal::Removed { id: None });
        assert_eq!(channel.bound_count(), 0);
    }

    #[test]
    fn test_destroy_sends_delete_and_cleans_up() {
        let (channel, mut outbound, hub, mut signals) = harness();
        let id = Uuid::new_v4();
        let patch = RecordPatch { id: Some(id), ..RecordPatch::default() };
        let record = Record::standalone(&channel, &hub, "card", &patch, false);

        record.destroy();
        let frame = outbound.try_recv().unwrap();
        assert!(matches!(frame.request, Request::Delete { id: did, .. } if did == id));
        assert_eq!(signals.try_recv().unwrap(), Signal::Removed { id: Some(id) });

        // Cleanup is idempotent: a second destroy emits nothing new.
        record.destroy();
        assert!(signals.try_recv().is_err());
    }

    #[test]
    fn test_attributes_apply_ignores_unset_fields() {
        let mut attrs = Attributes::from_patch(&RecordPatch::title("original"), 3);
        attrs.apply(&RecordPatch::done(true));
        assert_eq!(attrs.title, "original");
        assert_eq!(attrs.order, 3);
        assert!(attrs.done);
    }
}
