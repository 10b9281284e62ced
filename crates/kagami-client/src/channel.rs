//! The worker channel: one connection, many logical exchanges.
//!
//! [`ChannelClient`] owns the single persistent connection to the worker
//! and turns its fire-and-forget message stream into request/response
//! semantics. Outgoing correlated requests register a pending call keyed
//! by [`RequestId`]; the reader task matches inbound messages against the
//! pending table first, then against standing subscribers, and counts
//! whatever matches neither.
//!
//! # State Machine
//!
//! ```text
//! Disconnected --connect(token)--> Connecting --(transport open)--> Connected
//!      ▲                               │                               │
//!      │        (open refused)         │      (transport error)        │
//!      ◀───────────────────────────────┘              Erroring ◀───────┘
//!      ◀──────── disconnect() ────────────────────────────│
//! ```
//!
//! `Erroring` is transient: it always fires an error event and resolves
//! to `Disconnected`, failing every outstanding call on the way.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use kagami_types::{RequestId, WireMessage, now_millis};

use crate::constants::EVENT_BUFFER;
use crate::transport::{Connector, TransportError};

/// Channel-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// An operation was attempted while not `Connected`. Fails fast; the
    /// channel never queues.
    #[error("channel unavailable: not connected")]
    Unavailable,
    /// The connection dropped while the call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
    /// A call for this correlation id is already pending. Logic error in
    /// the caller; the first call is untouched.
    #[error("request id {0} already has a pending call")]
    DuplicateRequestId(RequestId),
    /// The per-call deadline elapsed. The pending call is discarded and a
    /// late response, if any, goes to standing subscribers only.
    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: RequestId, timeout: Duration },
    /// `request()` was handed a message that carries no correlation id.
    #[error("message carries no correlation id")]
    NotCorrelated,
    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Connection lifecycle state. Exactly one per client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Erroring,
}

/// Lifecycle event delivered to every registered observer.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Handle for removing a standing subscriber. Unsubscribing twice is a
/// no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// What kind of response settles a pending call. Inbound matching checks
/// kind as well as id, so an id collision across kinds cannot steal a
/// response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    FileList,
}

impl RequestKind {
    fn of(msg: &WireMessage) -> Option<Self> {
        match msg {
            WireMessage::FileListRequest { .. } => Some(Self::FileList),
            _ => None,
        }
    }
}

struct PendingCall {
    kind: RequestKind,
    tx: oneshot::Sender<Result<WireMessage, ChannelError>>,
    sent_at: u64,
}

type Filter = Arc<dyn Fn(&WireMessage) -> bool + Send + Sync>;
type Handler = Arc<dyn Fn(&WireMessage) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Filter,
    handler: Handler,
}

/// Connection state plus the live link when connected.
enum Link {
    Down(ConnectionState),
    Up {
        outbound: mpsc::Sender<WireMessage>,
        reader: tokio::task::JoinHandle<()>,
    },
}

struct Inner {
    connector: Box<dyn Connector>,
    link: Mutex<Link>,
    /// Insertion-ordered so an id-less fileListResponse can match the
    /// oldest outstanding list call.
    pending: Mutex<IndexMap<RequestId, PendingCall>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
    /// Inbound messages that matched no pending call and no subscriber.
    dropped: AtomicU64,
}

/// Multiplexes many logical request/response exchanges over one worker
/// connection. Cheap to clone; all clones share the connection, the
/// pending table, and the subscriber list.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
    /// Serializes connect attempts: a second `connect` while `Connecting`
    /// awaits the first instead of opening a second transport.
    connect_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ChannelClient {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                connector,
                link: Mutex::new(Link::Down(ConnectionState::Disconnected)),
                pending: Mutex::new(IndexMap::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                events,
                dropped: AtomicU64::new(0),
            }),
            connect_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionState {
        match &*self.inner.link.lock() {
            Link::Down(state) => *state,
            Link::Up { .. } => ConnectionState::Connected,
        }
    }

    /// Observe lifecycle transitions. Every receiver sees every event.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Messages that matched neither a pending call nor a subscriber.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Open the connection, presenting `token` with the handshake.
    ///
    /// A no-op when already `Connected`. Rejected opens leave the channel
    /// `Disconnected` after firing an error event.
    pub async fn connect(&self, token: &str) -> Result<(), ChannelError> {
        let _gate = self.connect_gate.lock().await;
        {
            let mut link = self.inner.link.lock();
            if matches!(*link, Link::Up { .. }) {
                return Ok(());
            }
            *link = Link::Down(ConnectionState::Connecting);
        }

        match self.inner.connector.connect(token).await {
            Ok(handle) => {
                let mut link = self.inner.link.lock();
                // disconnect() may have raced the open; honor it.
                if !matches!(*link, Link::Down(ConnectionState::Connecting)) {
                    return Err(ChannelError::ConnectionClosed);
                }
                let reader =
                    tokio::spawn(read_loop(Arc::clone(&self.inner), handle.inbound));
                *link = Link::Up { outbound: handle.outbound, reader };
                drop(link);
                info!("channel connected");
                let _ = self.inner.events.send(ChannelEvent::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("channel connect failed: {e}");
                // Transient Erroring, then settle Disconnected.
                *self.inner.link.lock() = Link::Down(ConnectionState::Erroring);
                let _ = self.inner.events.send(ChannelEvent::Error(e.to_string()));
                *self.inner.link.lock() = Link::Down(ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Close the connection. Valid from any state, no-op from
    /// `Disconnected`. Every outstanding call is failed with
    /// `ConnectionClosed` before this returns.
    pub fn disconnect(&self) {
        self.inner.teardown(true);
    }

    /// Send a correlated request and await its response.
    ///
    /// `msg` must carry a [`RequestId`]; a duplicate id for an
    /// already-pending call rejects immediately without touching the
    /// first. On timeout the pending call is removed, so a late response
    /// is delivered to standing subscribers only.
    pub async fn request(
        &self,
        msg: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage, ChannelError> {
        let id = msg.request_id().cloned().ok_or(ChannelError::NotCorrelated)?;
        let kind = RequestKind::of(&msg).ok_or(ChannelError::NotCorrelated)?;

        // Register under the link lock: a racing disconnect either rejects
        // this call here or finds the entry when it drains. An entry must
        // never land after the drain and wait out its full timeout.
        let (outbound, rx) = {
            let link = self.inner.link.lock();
            let Link::Up { outbound, .. } = &*link else {
                return Err(ChannelError::Unavailable);
            };
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(ChannelError::DuplicateRequestId(id));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id.clone(), PendingCall { kind, tx, sent_at: now_millis() });
            (outbound.clone(), rx)
        };

        if outbound.send(msg).await.is_err() {
            self.inner.pending.lock().shift_remove(&id);
            return Err(ChannelError::Unavailable);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // The pending entry was dropped without settling. Only
            // teardown removes entries besides us, and teardown settles
            // them, so this is a closed-connection race.
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_elapsed) => {
                if let Some(call) = self.inner.pending.lock().shift_remove(&id) {
                    debug!(
                        id = %id,
                        elapsed_ms = now_millis().saturating_sub(call.sent_at),
                        "request timed out; late responses will be ignored"
                    );
                }
                Err(ChannelError::RequestTimeout { id, timeout })
            }
        }
    }

    /// Fire-and-forget send, for operations confirmed by push messages
    /// (read/write/delete) rather than a correlated response.
    pub async fn send(&self, msg: WireMessage) -> Result<(), ChannelError> {
        let outbound = self.connected_sender()?;
        outbound.send(msg).await.map_err(|_| ChannelError::Unavailable)
    }

    /// Register a standing handler for inbound messages not claimed by a
    /// pending call. Handlers run in registration order.
    pub fn subscribe<F, H>(&self, filter: F, handler: H) -> SubscriptionId
    where
        F: Fn(&WireMessage) -> bool + Send + Sync + 'static,
        H: Fn(&WireMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push(Subscriber {
            id,
            filter: Arc::new(filter),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a standing handler. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.lock().retain(|s| s.id != id);
    }

    fn connected_sender(&self) -> Result<mpsc::Sender<WireMessage>, ChannelError> {
        match &*self.inner.link.lock() {
            Link::Up { outbound, .. } => Ok(outbound.clone()),
            Link::Down(_) => Err(ChannelError::Unavailable),
        }
    }
}

impl Inner {
    /// Tear the link down: fail every pending call, then report the
    /// transition. `abort_reader` is false when the reader task itself is
    /// the caller.
    fn teardown(&self, abort_reader: bool) {
        let link = {
            let mut link = self.link.lock();
            match std::mem::replace(&mut *link, Link::Down(ConnectionState::Disconnected)) {
                Link::Up { outbound, reader } => Some((outbound, reader)),
                Link::Down(_) => None,
            }
        };
        let Some((outbound, reader)) = link else {
            return; // already down: disconnect() is a no-op
        };
        if abort_reader {
            reader.abort();
        }
        drop(outbound); // closes the write pump
        self.drain_pending();
        info!("channel disconnected");
        let _ = self.events.send(ChannelEvent::Disconnected);
    }

    /// Fail every outstanding call with `ConnectionClosed`, synchronously.
    fn drain_pending(&self) {
        let drained: Vec<PendingCall> =
            self.pending.lock().drain(..).map(|(_, call)| call).collect();
        if drained.is_empty() {
            return;
        }
        debug!("failing {} pending calls on disconnect", drained.len());
        for call in drained {
            let _ = call.tx.send(Err(ChannelError::ConnectionClosed));
        }
    }

    /// Transport-level failure while up: transient `Erroring`, error
    /// event, then resolve to `Disconnected` and drain. The reader task is
    /// the only caller, so nothing aborts it.
    fn enter_error(&self, err: &TransportError) {
        let outbound = {
            let mut link = self.link.lock();
            match std::mem::replace(&mut *link, Link::Down(ConnectionState::Erroring)) {
                Link::Up { outbound, reader: _ } => Some(outbound),
                down => {
                    *link = down;
                    None
                }
            }
        };
        let Some(outbound) = outbound else {
            return; // already torn down
        };
        warn!("transport error: {err}");
        let _ = self.events.send(ChannelEvent::Error(err.to_string()));
        *self.link.lock() = Link::Down(ConnectionState::Disconnected);
        drop(outbound);
        self.drain_pending();
        let _ = self.events.send(ChannelEvent::Disconnected);
    }

    /// Route one inbound message: pending call first, then subscribers in
    /// registration order, else count and drop.
    fn dispatch(&self, msg: WireMessage) {
        if let Some(call) = self.take_pending(&msg) {
            let _ = call.tx.send(Ok(msg));
            return;
        }

        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|s| (s.filter)(&msg))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        if handlers.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(?msg, "dropping unmatched inbound message");
            return;
        }
        for handler in handlers {
            handler(&msg);
        }
    }

    /// Claim the pending call this message settles, if any. Removal here
    /// is what makes late responses invisible to the original caller.
    fn take_pending(&self, msg: &WireMessage) -> Option<PendingCall> {
        let mut pending = self.pending.lock();
        match msg {
            WireMessage::FileListResponse { request_id: Some(id), .. } => {
                match pending.get(id) {
                    Some(call) if call.kind == RequestKind::FileList => {
                        pending.shift_remove(id)
                    }
                    _ => None,
                }
            }
            // Workers predating request ids never echo one; match the
            // oldest outstanding list call.
            WireMessage::FileListResponse { request_id: None, .. } => {
                let key = pending
                    .iter()
                    .find(|(_, call)| call.kind == RequestKind::FileList)
                    .map(|(k, _)| k.clone());
                key.and_then(|k| pending.shift_remove(&k))
            }
            _ => None,
        }
    }
}

/// Reader task: drains the transport until it closes or fails.
async fn read_loop(
    inner: Arc<Inner>,
    mut inbound: mpsc::Receiver<Result<WireMessage, TransportError>>,
) {
    while let Some(item) = inbound.recv().await {
        match item {
            Ok(msg) => inner.dispatch(msg),
            Err(e) if !e.is_fatal() => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("dropping undecodable frame: {e}");
            }
            Err(e) => {
                inner.enter_error(&e);
                return;
            }
        }
    }
    // Clean close from the worker side.
    inner.teardown(false);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;
    use kagami_types::RequestId;

    fn list_request(id: &str) -> WireMessage {
        WireMessage::FileListRequest { request_id: RequestId::from_string(id) }
    }

    fn list_response(id: Option<&str>, files: &[&str]) -> WireMessage {
        WireMessage::FileListResponse {
            request_id: id.map(RequestId::from_string),
            files: files.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let (connector, _workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        assert_eq!(channel.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_while_disconnected_fails_fast() {
        let (connector, _workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        let err = channel
            .request(list_request("r1"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_when_connected() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let _end = workers.recv().await.expect("worker end");

        // Second connect: no-op, and no second worker end appears.
        channel.connect("t1").await.expect("reconnect no-op");
        assert!(workers.try_recv().is_err());
        assert_eq!(channel.status(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));

        let (a, b) = tokio::join!(channel.connect("t1"), channel.connect("t1"));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(channel.status(), ConnectionState::Connected);

        // The gate serialized the attempts: exactly one transport opened.
        let _end = workers.recv().await.expect("worker end");
        assert!(workers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refused_connect_leaves_disconnected() {
        let (connector, _workers) = MemoryConnector::new();
        connector.refuse_connections(true);
        let channel = ChannelClient::new(Box::new(connector));
        let mut events = channel.events();

        assert!(channel.connect("t1").await.is_err());
        assert_eq!(channel.status(), ConnectionState::Disconnected);
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_request_response_by_correlation_id() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");

        let worker = tokio::spawn(async move {
            let req = end.rx.recv().await.expect("request");
            assert_eq!(req.request_id().map(|r| r.as_str()), Some("r1"));
            end.push(list_response(Some("r1"), &["a.txt", "b.txt"])).await;
            end
        });

        let response = channel
            .request(list_request("r1"), Duration::from_secs(2))
            .await
            .expect("response");
        assert_eq!(response, list_response(Some("r1"), &["a.txt", "b.txt"]));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.request(list_request("rX"), Duration::from_secs(2)).await
            })
        };
        // Wait until the first request is on the wire (and so pending).
        let _ = end.rx.recv().await.expect("first request");

        let err = channel
            .request(list_request("rX"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::DuplicateRequestId(_)));

        // First call is untouched and still settles normally.
        end.push(list_response(Some("rX"), &[])).await;
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_response() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");

        let err = channel
            .request(list_request("r1"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::RequestTimeout { .. }));
        let _ = end.rx.recv().await; // the request did go out

        // Late response: no pending call and no subscriber — counted drop.
        end.push(list_response(Some("r1"), &["late.txt"])).await;
        tokio::task::yield_now().await;
        let mut waited = 0;
        while channel.dropped_count() == 0 && waited < 100 {
            tokio::task::yield_now().await;
            waited += 1;
        }
        assert_eq!(channel.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_absent_request_id_matches_oldest_list_call() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");

        let oldest = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.request(list_request("r1"), Duration::from_secs(2)).await
            })
        };
        let _ = end.rx.recv().await.expect("first on the wire");
        let newest = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.request(list_request("r2"), Duration::from_secs(2)).await
            })
        };
        let _ = end.rx.recv().await.expect("second on the wire");

        end.push(list_response(None, &["for-oldest"])).await;
        let got = oldest.await.unwrap().expect("oldest settles");
        assert_eq!(got, list_response(None, &["for-oldest"]));

        end.push(list_response(Some("r2"), &["for-newest"])).await;
        assert!(newest.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_drains_pending_calls() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");

        let mut calls = Vec::new();
        for i in 0..5 {
            let channel = channel.clone();
            calls.push(tokio::spawn(async move {
                channel
                    .request(list_request(&format!("r{i}")), Duration::from_secs(30))
                    .await
            }));
            let _ = end.rx.recv().await.expect("on the wire");
        }

        channel.disconnect();
        // Pending table is already empty when disconnect returns.
        assert_eq!(channel.status(), ConnectionState::Disconnected);
        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, ChannelError::ConnectionClosed));
        }
    }

    #[tokio::test]
    async fn test_disconnect_racing_requests_never_strands_a_call() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let _end = workers.recv().await.expect("worker end");

        // Requests issued concurrently with the disconnect must settle
        // with Unavailable or ConnectionClosed, never by timing out.
        let mut calls = Vec::new();
        for i in 0..32 {
            let channel = channel.clone();
            calls.push(tokio::spawn(async move {
                channel
                    .request(list_request(&format!("r{i}")), Duration::from_millis(200))
                    .await
            }));
        }
        let closer = {
            let channel = channel.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                channel.disconnect();
            })
        };

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(
                matches!(err, ChannelError::Unavailable | ChannelError::ConnectionClosed),
                "call settled with {err:?} instead of failing from the disconnect"
            );
        }
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_from_disconnected_is_noop() {
        let (connector, _workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.disconnect();
        channel.disconnect();
        assert_eq!(channel.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribers_run_in_registration_order() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let end = workers.recv().await.expect("worker end");

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            channel.subscribe(
                |msg| matches!(msg, WireMessage::FileOperation { .. }),
                move |_| order.lock().push(tag),
            );
        }

        end.push(WireMessage::FileOperation {
            operation: kagami_types::FileOp::Read,
            path: "/a".into(),
            content: None,
            error: None,
        })
        .await;
        let mut spins = 0;
        while order.lock().len() < 3 && spins < 100 {
            tokio::task::yield_now().await;
            spins += 1;
        }
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (connector, _workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        let id = channel.subscribe(|_| true, |_| {});
        channel.unsubscribe(id);
        channel.unsubscribe(id); // second call: no effect, no panic
    }

    #[tokio::test]
    async fn test_worker_close_fires_disconnect_and_drains() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");
        let mut events = channel.events();

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.request(list_request("r1"), Duration::from_secs(30)).await
            })
        };
        let _ = end.rx.recv().await.expect("on the wire");

        drop(end); // worker goes away
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionClosed));
        // Subscribed after connect, so the first observable event is the
        // disconnect.
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Disconnected)));
        assert_eq!(channel.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_error_fires_error_then_disconnect() {
        let (connector, mut workers) = MemoryConnector::new();
        let channel = ChannelClient::new(Box::new(connector));
        channel.connect("t1").await.expect("connect");
        let end = workers.recv().await.expect("worker end");
        let mut events = channel.events();

        end.fail("socket reset").await;
        // Error precedes Disconnected.
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Error(_))));
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Disconnected)));
        assert_eq!(channel.status(), ConnectionState::Disconnected);
    }
}
