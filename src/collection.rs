//! An ordered, deduplicated set of records, keyed by identity.
//!
//! The collection owns its records and the single remote-create
//! subscription for its resource. Iteration order is ascending `order`;
//! equal orders keep insertion order. `add` is an idempotent merge by
//! id, which is what makes the authority's create echo harmless: the
//! originator's optimistic copy is merged into, never duplicated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::channel::{AckHook, RealtimeChannel, SubscriberId, SyncError};
use crate::protocol::{Event, EventKind, RecordBody, RecordPatch, ReplyBody, Request, Topic};
use crate::record::{Attributes, Record};
use crate::signal::{Origin, Signal, SignalHub};

struct CollectionState {
    /// Insertion order; sorted views are derived on demand.
    ordered: Vec<Record>,
    /// Identity index. Unacknowledged records are absent until their
    /// create is confirmed.
    by_id: HashMap<Uuid, Record>,
    cleaned: bool,
}

pub(crate) struct CollectionCore {
    resource: String,
    channel: RealtimeChannel,
    signals: SignalHub,
    subscriber: SubscriberId,
    state: Mutex<CollectionState>,
}

/// Handle to an ordered record collection. Cheap to clone.
#[derive(Clone)]
pub struct OrderedCollection {
    core: Arc<CollectionCore>,
}

impl OrderedCollection {
    /// Create an empty collection for `resource` and subscribe it to
    /// remote create events.
    pub fn new(channel: &RealtimeChannel, signals: &SignalHub, resource: &str) -> Self {
        let collection = Self {
            core: Arc::new(CollectionCore {
                resource: resource.to_string(),
                channel: channel.clone(),
                signals: signals.clone(),
                subscriber: SubscriberId::new(),
                state: Mutex::new(CollectionState {
                    ordered: Vec::new(),
                    by_id: HashMap::new(),
                    cleaned: false,
                }),
            }),
        };
        collection.bind_create();
        collection
    }

    pub(crate) fn from_core(core: Arc<CollectionCore>) -> Self {
        Self { core }
    }

    fn bind_create(&self) {
        let weak = Arc::downgrade(&self.core);
        let topic = Topic::new(self.core.resource.clone(), EventKind::Create);
        self.core.channel.bind(self.core.subscriber, topic, move |event| {
            let Some(core) = weak.upgrade() else { return };
            if let Event::Created { body, .. } = event {
                OrderedCollection::from_core(core).add(body.clone());
            }
        });
    }

    pub fn resource(&self) -> &str {
        &self.core.resource
    }

    /// Create a record locally, insert it optimistically, and raise
    /// `Added`. The record has no id until `save` is acknowledged.
    pub fn create(&self, patch: &RecordPatch) -> Record {
        let attrs = Attributes::from_patch(patch, self.next_order());
        let record = Record::build(
            &self.core.channel,
            &self.core.signals,
            &self.core.resource,
            Arc::downgrade(&self.core),
            patch.id,
            attrs,
            true,
        );
        {
            let mut st = self.core.state.lock().unwrap();
            st.ordered.push(record.clone());
            if let Some(id) = record.id() {
                st.by_id.insert(id, record.clone());
            }
        }
        self.core.signals.emit(Signal::Added { id: record.id() });
        record
    }

    /// Idempotent merge by id.
    ///
    /// Unknown id: insert a new record and raise `Added` once. Known id:
    /// merge the body into the existing record as a remote update and do
    /// not raise `Added` again.
    pub fn add(&self, body: RecordBody) -> Record {
        let existing = self.core.state.lock().unwrap().by_id.get(&body.id).cloned();
        if let Some(record) = existing {
            record.set(&body.as_patch(), Origin::Remote);
            return record;
        }

        let id = body.id;
        let record = Record::build(
            &self.core.channel,
            &self.core.signals,
            &self.core.resource,
            Arc::downgrade(&self.core),
            Some(id),
            Attributes::from(&body),
            true,
        );
        {
            let mut st = self.core.state.lock().unwrap();
            st.ordered.push(record.clone());
            st.by_id.insert(id, record.clone());
        }
        self.core.signals.emit(Signal::Added { id: Some(id) });
        record
    }

    /// Register a freshly identified record in the id index. Called from
    /// the save ack path once the authority has assigned the id.
    pub(crate) fn index_identified(&self, record: &Record) {
        if let Some(id) = record.id() {
            let mut st = self.core.state.lock().unwrap();
            st.by_id.entry(id).or_insert_with(|| record.clone());
        }
    }

    /// Remove a record: drop it from the index and the ordered sequence,
    /// release its subscriptions, raise `Removed` exactly once.
    pub fn remove(&self, record: &Record) -> bool {
        let was_present = {
            let mut st = self.core.state.lock().unwrap();
            let before = st.ordered.len();
            st.ordered.retain(|r| !r.same(record));
            if let Some(id) = record.id() {
                let points_here = st.by_id.get(&id).map(|r| r.same(record)).unwrap_or(false);
                if points_here {
                    st.by_id.remove(&id);
                }
            }
            st.ordered.len() != before
        };
        record.release(true);
        was_present
    }

    pub fn get(&self, id: Uuid) -> Option<Record> {
        self.core.state.lock().unwrap().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.core.state.lock().unwrap().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.state.lock().unwrap().ordered.is_empty()
    }

    /// Snapshot of the records in iteration order: ascending `order`,
    /// ties in insertion order (stable sort).
    pub fn records(&self) -> Vec<Record> {
        let mut records = self.core.state.lock().unwrap().ordered.clone();
        records.sort_by_key(|r| r.order());
        records
    }

    /// Records whose completion flag is set. Recomputed on demand.
    pub fn done(&self) -> Vec<Record> {
        self.records().into_iter().filter(|r| r.done()).collect()
    }

    /// Complement of [`done`]: records still open.
    ///
    /// [`done`]: OrderedCollection::done
    pub fn remaining(&self) -> Vec<Record> {
        self.records().into_iter().filter(|r| !r.done()).collect()
    }

    /// Next position for a new record: 1 when empty, else the maximum
    /// existing order plus one. Advisory only; the authority may correct
    /// it on create.
    pub fn next_order(&self) -> i64 {
        let st = self.core.state.lock().unwrap();
        st.ordered
            .iter()
            .map(|r| r.order())
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Load the authority's current record set and merge it in. Raises
    /// `Reset` once the merge is complete.
    pub async fn fetch(&self) -> Result<usize, SyncError> {
        let weak = Arc::downgrade(&self.core);
        let hook: AckHook = Box::new(move |reply| {
            let (Some(core), Some(ReplyBody::Records(bodies))) = (weak.upgrade(), reply) else {
                return;
            };
            let collection = OrderedCollection::from_core(core);
            for body in bodies {
                collection.add(body.clone());
            }
            collection.core.signals.emit(Signal::Reset);
        });
        let request = Request::Fetch {
            resource: self.core.resource.clone(),
        };
        match self.core.channel.request_with(request, Some(hook)).await? {
            ReplyBody::Records(bodies) => Ok(bodies.len()),
            _ => Err(SyncError::UnexpectedReply),
        }
    }

    /// Unsubscribe the collection's create listener and cascade cleanup
    /// to every contained record. Safe to call once per lifetime;
    /// calling twice is a no-op.
    pub fn cleanup(&self) {
        let records = {
            let mut st = self.core.state.lock().unwrap();
            if st.cleaned {
                return;
            }
            st.cleaned = true;
            st.ordered.clone()
        };
        self.core.channel.unbind_all(self.core.subscriber);
        for record in records {
            record.release(false);
        }
        log::debug!("collection {} cleaned up", self.core.resource);
    }
}
