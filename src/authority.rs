//! The central authority: persists records in memory, arbitrates
//! advisory locks first-come-first-served, and rebroadcasts every
//! accepted mutation to all connected clients including the originator.
//!
//! ```text
//! Client A ──┐                        ┌──► Client A (reply, then echo)
//!             ├──► shared state ──────┼──► Client B
//! Client B ──┘    (records + locks)   └──► Client C
//! ```
//!
//! Per connection the authority writes frames in decision order: the
//! reply to a request always precedes that request's broadcast echo.
//! Clients rely on this to merge a create's assigned id before the echo
//! arrives. Cross-client ordering follows arbitration order because
//! broadcasts are sent while the state lock is held.
//!
//! Clients connect over WebSocket ([`serve`]) or in-process
//! ([`attach_local`]), which is what unit and integration tests use.
//!
//! [`serve`]: Authority::serve
//! [`attach_local`]: Authority::attach_local

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    ClientFrame, Event, RecordBody, RecordPatch, ReplyBody, Refusal, Request, ServerFrame,
};
use crate::record::now_ms;

/// Authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,
    /// Release a client's locks when its connection closes.
    pub release_locks_on_disconnect: bool,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9460".to_string(),
            release_locks_on_disconnect: true,
        }
    }
}

/// Authority statistics.
#[derive(Debug, Clone, Default)]
pub struct AuthorityStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub refused_requests: u64,
    pub broadcast_events: u64,
}

#[derive(Default)]
struct ResourceStore {
    records: HashMap<Uuid, RecordBody>,
    /// Lock holder per record, keyed by connection.
    locks: HashMap<Uuid, Uuid>,
}

impl ResourceStore {
    fn next_order(&self) -> i64 {
        self.records
            .values()
            .map(|r| r.order)
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Honor the client's proposed order unless it collides; on
    /// conflict or absence assign the next free position.
    fn assign_order(&self, proposed: Option<i64>) -> i64 {
        match proposed {
            Some(order) if !self.records.values().any(|r| r.order == order) => order,
            _ => self.next_order(),
        }
    }
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
}

struct AuthorityState {
    resources: HashMap<String, ResourceStore>,
    conns: HashMap<Uuid, ConnHandle>,
    stats: AuthorityStats,
}

/// Handle to the authority. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Authority {
    state: Arc<Mutex<AuthorityState>>,
    config: AuthorityConfig,
}

impl Authority {
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(AuthorityState {
                resources: HashMap::new(),
                conns: HashMap::new(),
                stats: AuthorityStats::default(),
            })),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AuthorityConfig::default())
    }

    pub fn stats(&self) -> AuthorityStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Attach an in-process client. The returned stream carries the
    /// client's replies and every broadcast, in order.
    pub fn attach_local(
        &self,
        mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    ) -> mpsc::UnboundedReceiver<ServerFrame> {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(conn_id, tx);

        let authority = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                authority.handle_frame(conn_id, frame);
            }
            authority.disconnect(conn_id);
        });
        rx
    }

    /// Listen for WebSocket connections. Runs the accept loop forever;
    /// call from an async runtime.
    pub async fn serve(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("authority listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new tcp connection from {addr}");
            let authority = self.clone();
            tokio::spawn(async move {
                if let Err(e) = authority.handle_socket(stream).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_socket(
        &self,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        self.register(conn_id, tx);
        log::info!("connection {conn_id} established");

        // Writer task: forward this connection's frames to the socket.
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("frame encode failed: {e}");
                        continue;
                    }
                };
                if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match ClientFrame::decode(&bytes) {
                        Ok(frame) => self.handle_frame(conn_id, frame),
                        Err(e) => log::error!("bad frame on {conn_id}: {e}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        self.disconnect(conn_id);
        writer.abort();
        Ok(())
    }

    fn register(&self, conn_id: Uuid, tx: mpsc::UnboundedSender<ServerFrame>) {
        let mut state = self.state.lock().unwrap();
        state.conns.insert(conn_id, ConnHandle { tx });
        state.stats.total_connections += 1;
        state.stats.active_connections += 1;
    }

    fn disconnect(&self, conn_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.conns.remove(&conn_id);
        state.stats.active_connections = state.stats.active_connections.saturating_sub(1);

        if self.config.release_locks_on_disconnect {
            let mut released = Vec::new();
            for (resource, store) in state.resources.iter_mut() {
                let held: Vec<Uuid> = store
                    .locks
                    .iter()
                    .filter(|(_, holder)| **holder == conn_id)
                    .map(|(id, _)| *id)
                    .collect();
                for id in held {
                    store.locks.remove(&id);
                    released.push((resource.clone(), id));
                }
            }
            for (resource, id) in released {
                Self::broadcast(&mut state, Event::Unlocked { resource, id });
            }
        }
        log::info!("connection {conn_id} closed");
    }

    /// Handle one request: mutate state, reply to the originator, then
    /// broadcast the accepted mutation. All under the state lock so
    /// broadcast order matches arbitration order.
    fn handle_frame(&self, conn_id: Uuid, frame: ClientFrame) {
        let mut state = self.state.lock().unwrap();
        state.stats.total_requests += 1;

        let ClientFrame { seq, request } = frame;
        let (result, event) = Self::process(&mut state, conn_id, request);
        Self::reply(&mut state, conn_id, seq, result);
        if let Some(event) = event {
            Self::broadcast(&mut state, event);
        }
    }

    fn process(
        state: &mut AuthorityState,
        conn_id: Uuid,
        request: Request,
    ) -> (Result<ReplyBody, Refusal>, Option<Event>) {
        match request {
            Request::Hello { client_id, resources } => {
                let locked = resources
                    .iter()
                    .flat_map(|resource| {
                        state
                            .resources
                            .get(resource)
                            .map(|store| {
                                store
                                    .locks
                                    .keys()
                                    .map(|id| (resource.clone(), *id))
                                    .collect::<Vec<_>>()
                            })
                            .unwrap_or_default()
                    })
                    .collect();
                log::info!("client {client_id} said hello for {resources:?}");
                (Ok(ReplyBody::Welcome { locked }), None)
            }

            Request::Fetch { resource } => {
                let mut bodies: Vec<RecordBody> = state
                    .resources
                    .get(&resource)
                    .map(|store| store.records.values().cloned().collect())
                    .unwrap_or_default();
                bodies.sort_by_key(|b| b.order);
                (Ok(ReplyBody::Records(bodies)), None)
            }

            Request::Create { resource, attrs } => {
                let store = state.resources.entry(resource.clone()).or_default();
                let body = RecordBody {
                    id: Uuid::new_v4(),
                    title: attrs
                        .title
                        .unwrap_or_else(|| crate::record::DEFAULT_TITLE.to_string()),
                    order: store.assign_order(attrs.order),
                    done: attrs.done.unwrap_or(false),
                    created_ms: attrs.created_ms.unwrap_or_else(now_ms),
                    due_ms: attrs.due_ms,
                };
                store.records.insert(body.id, body.clone());
                log::debug!("created {} in {resource} at order {}", body.id, body.order);
                (
                    Ok(ReplyBody::Record(body.clone())),
                    Some(Event::Created { resource, body }),
                )
            }

            Request::Update { resource, id, attrs } => {
                let Some(record) = state
                    .resources
                    .get_mut(&resource)
                    .and_then(|store| store.records.get_mut(&id))
                else {
                    return (Err(Refusal::NotFound { id }), None);
                };
                apply_patch(record, &attrs);
                let body = record.clone();
                let patch = RecordPatch { id: Some(id), ..body.as_patch() };
                (
                    Ok(ReplyBody::Record(body)),
                    Some(Event::Updated { resource, patch }),
                )
            }

            Request::Delete { resource, id } => {
                let Some(store) = state.resources.get_mut(&resource) else {
                    return (Err(Refusal::NotFound { id }), None);
                };
                if store.records.remove(&id).is_none() {
                    return (Err(Refusal::NotFound { id }), None);
                }
                store.locks.remove(&id);
                (Ok(ReplyBody::Done), Some(Event::Deleted { resource, id }))
            }

            Request::Lock { resource, id } => {
                let Some(store) = state.resources.get_mut(&resource) else {
                    return (Err(Refusal::NotFound { id }), None);
                };
                if !store.records.contains_key(&id) {
                    return (Err(Refusal::NotFound { id }), None);
                }
                match store.locks.get(&id).copied() {
                    None => {
                        store.locks.insert(id, conn_id);
                        log::debug!("lock granted on {id} to {conn_id}");
                        (Ok(ReplyBody::Done), Some(Event::Locked { resource, id }))
                    }
                    Some(holder) if holder == conn_id => (Ok(ReplyBody::Done), None),
                    Some(_) => (Err(Refusal::LockHeld { id }), None),
                }
            }

            Request::Unlock { resource, id } => {
                let Some(store) = state.resources.get_mut(&resource) else {
                    return (Err(Refusal::NotHolder { id }), None);
                };
                if store.locks.get(&id) == Some(&conn_id) {
                    store.locks.remove(&id);
                    (Ok(ReplyBody::Done), Some(Event::Unlocked { resource, id }))
                } else {
                    (Err(Refusal::NotHolder { id }), None)
                }
            }
        }
    }

    fn reply(
        state: &mut AuthorityState,
        conn_id: Uuid,
        seq: u64,
        result: Result<ReplyBody, Refusal>,
    ) {
        if result.is_err() {
            state.stats.refused_requests += 1;
        }
        if let Some(handle) = state.conns.get(&conn_id) {
            let _ = handle.tx.send(ServerFrame::Reply { seq, result });
        }
    }

    fn broadcast(state: &mut AuthorityState, event: Event) {
        state.stats.broadcast_events += 1;
        for handle in state.conns.values() {
            let _ = handle.tx.send(ServerFrame::Event(event.clone()));
        }
    }
}

/// Merge a patch into a stored record. Identity never changes.
fn apply_patch(record: &mut RecordBody, patch: &RecordPatch) {
    if let Some(title) = &patch.title {
        record.title = title.clone();
    }
    if let Some(order) = patch.order {
        record.order = order;
    }
    if let Some(done) = patch.done {
        record.done = done;
    }
    if let Some(created_ms) = patch.created_ms {
        record.created_ms = created_ms;
    }
    if let Some(due_ms) = patch.due_ms {
        record.due_ms = Some(due_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    struct TestConn {
        tx: mpsc::UnboundedSender<ClientFrame>,
        rx: mpsc::UnboundedReceiver<ServerFrame>,
        seq: u64,
    }

    impl TestConn {
        fn attach(authority: &Authority) -> Self {
            let (tx, outbound) = mpsc::unbounded_channel();
            let rx = authority.attach_local(outbound);
            Self { tx, rx, seq: 0 }
        }

        /// Send a request and read frames until its reply, returning any
        /// events seen on the way.
        async fn roundtrip(
            &mut self,
            request: Request,
        ) -> (Result<ReplyBody, Refusal>, Vec<Event>) {
            self.seq += 1;
            let seq = self.seq;
            self.tx.send(ClientFrame { seq, request }).unwrap();
            let mut events = Vec::new();
            loop {
                let frame = timeout(Duration::from_secs(1), self.rx.recv())
                    .await
                    .expect("reply timeout")
                    .expect("stream ended");
                match frame {
                    ServerFrame::Reply { seq: got, result } if got == seq => {
                        return (result, events);
                    }
                    ServerFrame::Reply { .. } => {}
                    ServerFrame::Event(event) => events.push(event),
                }
            }
        }

        async fn next_event(&mut self) -> Event {
            loop {
                let frame = timeout(Duration::from_secs(1), self.rx.recv())
                    .await
                    .expect("event timeout")
                    .expect("stream ended");
                if let ServerFrame::Event(event) = frame {
                    return event;
                }
            }
        }
    }

    fn create_req(title: &str, order: Option<i64>) -> Request {
        Request::Create {
            resource: "card".to_string(),
            attrs: RecordPatch {
                title: Some(title.to_string()),
                order,
                ..RecordPatch::default()
            },
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_order() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        let (result, _) = conn.roundtrip(create_req("first", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!("expected record") };
        assert_eq!(body.order, 1);
        assert_eq!(body.title, "first");

        let (result, _) = conn.roundtrip(create_req("second", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!("expected record") };
        assert_eq!(body.order, 2);
    }

    #[tokio::test]
    async fn test_create_honors_uncontended_proposed_order() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        let (result, _) = conn.roundtrip(create_req("a", Some(5))).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        assert_eq!(body.order, 5);

        // Conflicting proposal is corrected to the next free position.
        let (result, _) = conn.roundtrip(create_req("b", Some(5))).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        assert_eq!(body.order, 6);
    }

    #[tokio::test]
    async fn test_reply_precedes_echo_for_originator() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        // Any event seen before the reply would show up in `events`.
        let (result, events) = conn.roundtrip(create_req("ordered", None)).await;
        assert!(result.is_ok());
        assert!(events.is_empty(), "echo must not precede the reply");

        // The echo follows.
        let event = conn.next_event().await;
        assert!(matches!(event, Event::Created { .. }));
    }

    #[tokio::test]
    async fn test_update_broadcasts_to_all_connections() {
        let authority = Authority::with_defaults();
        let mut a = TestConn::attach(&authority);
        let mut b = TestConn::attach(&authority);

        let (result, _) = a.roundtrip(create_req("shared", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        let _ = b.next_event().await; // b sees the create

        let (result, _) = a
            .roundtrip(Request::Update {
                resource: "card".to_string(),
                id: body.id,
                attrs: RecordPatch::title("renamed"),
            })
            .await;
        assert!(result.is_ok());

        match b.next_event().await {
            Event::Updated { patch, .. } => {
                assert_eq!(patch.id, Some(body.id));
                assert_eq!(patch.title.as_deref(), Some("renamed"));
            }
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_unknown_id_refused() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        let id = Uuid::new_v4();
        let (result, _) = conn
            .roundtrip(Request::Update {
                resource: "card".to_string(),
                id,
                attrs: RecordPatch::title("ghost"),
            })
            .await;
        assert_eq!(result, Err(Refusal::NotFound { id }));
    }

    #[tokio::test]
    async fn test_lock_is_first_come_first_served() {
        let authority = Authority::with_defaults();
        let mut a = TestConn::attach(&authority);
        let mut b = TestConn::attach(&authority);

        let (result, _) = a.roundtrip(create_req("contested", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        let _ = b.next_event().await;

        let lock = Request::Lock { resource: "card".to_string(), id: body.id };
        let (result, _) = a.roundtrip(lock.clone()).await;
        assert_eq!(result, Ok(ReplyBody::Done));

        let (result, _) = b.roundtrip(lock).await;
        assert_eq!(result, Err(Refusal::LockHeld { id: body.id }));

        // The loser cannot unlock either.
        let (result, _) = b
            .roundtrip(Request::Unlock { resource: "card".to_string(), id: body.id })
            .await;
        assert_eq!(result, Err(Refusal::NotHolder { id: body.id }));

        // The holder can.
        let (result, _) = a
            .roundtrip(Request::Unlock { resource: "card".to_string(), id: body.id })
            .await;
        assert_eq!(result, Ok(ReplyBody::Done));
    }

    #[tokio::test]
    async fn test_relock_by_holder_is_idempotent() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        let (result, _) = conn.roundtrip(create_req("mine", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };

        let lock = Request::Lock { resource: "card".to_string(), id: body.id };
        assert_eq!(conn.roundtrip(lock.clone()).await.0, Ok(ReplyBody::Done));
        assert_eq!(conn.roundtrip(lock).await.0, Ok(ReplyBody::Done));
    }

    #[tokio::test]
    async fn test_delete_clears_record_and_lock() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        let (result, _) = conn.roundtrip(create_req("doomed", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        let lock = Request::Lock { resource: "card".to_string(), id: body.id };
        conn.roundtrip(lock).await.0.unwrap();

        let (result, _) = conn
            .roundtrip(Request::Delete { resource: "card".to_string(), id: body.id })
            .await;
        assert_eq!(result, Ok(ReplyBody::Done));

        // Gone: a second delete is refused.
        let (result, _) = conn
            .roundtrip(Request::Delete { resource: "card".to_string(), id: body.id })
            .await;
        assert_eq!(result, Err(Refusal::NotFound { id: body.id }));
    }

    #[tokio::test]
    async fn test_fetch_returns_records_sorted_by_order() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        conn.roundtrip(create_req("b", Some(2))).await.0.unwrap();
        conn.roundtrip(create_req("a", Some(1))).await.0.unwrap();

        let (result, _) = conn
            .roundtrip(Request::Fetch { resource: "card".to_string() })
            .await;
        let Ok(ReplyBody::Records(bodies)) = result else { panic!() };
        let titles: Vec<&str> = bodies.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_hello_reports_current_locks() {
        let authority = Authority::with_defaults();
        let mut holder = TestConn::attach(&authority);

        let (result, _) = holder.roundtrip(create_req("held", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        holder
            .roundtrip(Request::Lock { resource: "card".to_string(), id: body.id })
            .await
            .0
            .unwrap();

        let mut late = TestConn::attach(&authority);
        let (result, _) = late
            .roundtrip(Request::Hello {
                client_id: Uuid::new_v4(),
                resources: vec!["card".to_string()],
            })
            .await;
        let Ok(ReplyBody::Welcome { locked }) = result else { panic!() };
        assert_eq!(locked, vec![("card".to_string(), body.id)]);
    }

    #[tokio::test]
    async fn test_disconnect_releases_held_locks() {
        let authority = Authority::with_defaults();
        let mut holder = TestConn::attach(&authority);
        let mut watcher = TestConn::attach(&authority);

        let (result, _) = holder.roundtrip(create_req("abandoned", None)).await;
        let Ok(ReplyBody::Record(body)) = result else { panic!() };
        let _ = watcher.next_event().await; // create

        holder
            .roundtrip(Request::Lock { resource: "card".to_string(), id: body.id })
            .await
            .0
            .unwrap();
        assert!(matches!(watcher.next_event().await, Event::Locked { .. }));

        drop(holder.tx);
        match watcher.next_event().await {
            Event::Unlocked { id, .. } => assert_eq!(id, body.id),
            other => panic!("expected Unlocked, got {other:?}"),
        }

        // The lock is free again.
        let (result, _) = watcher
            .roundtrip(Request::Lock { resource: "card".to_string(), id: body.id })
            .await;
        assert_eq!(result, Ok(ReplyBody::Done));
    }

    #[tokio::test]
    async fn test_stats_track_traffic() {
        let authority = Authority::with_defaults();
        let mut conn = TestConn::attach(&authority);

        conn.roundtrip(create_req("x", None)).await.0.unwrap();
        let id = Uuid::new_v4();
        let _ = conn
            .roundtrip(Request::Delete { resource: "card".to_string(), id })
            .await;

        let stats = authority.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.refused_requests, 1);
        assert_eq!(stats.broadcast_events, 1);
    }
}
