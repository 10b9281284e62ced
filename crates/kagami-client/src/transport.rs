//! Message transport to the worker.
//!
//! A transport is a pair of mpsc pipes produced by a [`Connector`]: the
//! caller pushes [`WireMessage`]s into `outbound` and drains `inbound`.
//! Pump tasks own the actual socket, so the channel layer never touches
//! WebSocket types directly and tests can substitute an in-memory pair
//! (see [`memory`]).
//!
//! The bearer token accompanies the connect attempt — an `Authorization`
//! header on the WebSocket upgrade — before any file operation is issued.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;

use kagami_types::{WireError, WireMessage};

use crate::constants::{CONNECT_TIMEOUT, TRANSPORT_BUFFER};

/// Transport-level failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The open attempt failed or was refused by the worker.
    #[error("connection refused: {0}")]
    Refused(String),
    /// The open attempt did not complete within the deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The socket failed while the connection was up.
    #[error("transport error: {0}")]
    Io(String),
    /// A frame arrived that is not a usable wire message. Non-fatal: the
    /// channel counts and drops these.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the connection is still usable after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// Live pipes for one connection.
///
/// Dropping `outbound` closes the connection from our side; `inbound`
/// ending means the worker side closed (cleanly, or after an `Err` item).
pub struct TransportHandle {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<Result<WireMessage, TransportError>>,
}

/// Opens connections to a worker.
///
/// One logical connection at a time is the caller's responsibility (the
/// channel serializes its connect path); a connector only knows how to
/// open a single transport with the given token attached.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<TransportHandle, TransportError>;
}

// ============================================================================
// WebSocket connector
// ============================================================================

/// Production connector: WebSocket with a bearer token on the upgrade.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<TransportHandle, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        let bearer = format!("Bearer {token}")
            .parse()
            .map_err(|_| TransportError::Refused("token is not header-safe".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))?
            .map_err(|e| TransportError::Refused(e.to_string()))?;

        log::info!("worker channel open: {}", self.url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(TRANSPORT_BUFFER);
        let (in_tx, in_rx) =
            mpsc::channel::<Result<WireMessage, TransportError>>(TRANSPORT_BUFFER);

        // Write pump: outbound mpsc → socket. Ends when the channel drops
        // its sender (disconnect) or the socket rejects a write.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg.encode().into())).await {
                    log::debug!("write pump stopping: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Read pump: socket → inbound mpsc. Decode failures are forwarded
        // as non-fatal Protocol items; socket errors end the pump after a
        // final fatal item.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let item = match frame {
                    Ok(Message::Text(text)) => match WireMessage::decode(text.as_str()) {
                        Ok(msg) => Ok(msg),
                        Err(WireError::UnknownType(t)) => {
                            Err(TransportError::Protocol(format!("unknown type {t}")))
                        }
                        Err(e) => Err(TransportError::Protocol(e.to_string())),
                    },
                    Ok(Message::Close(_)) => break,
                    // tungstenite answers pings internally; nothing to do.
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(Err(TransportError::Io(e.to_string()))).await;
                        break;
                    }
                };
                if in_tx.send(item).await.is_err() {
                    break;
                }
            }
            log::debug!("read pump stopping: worker side closed");
        });

        Ok(TransportHandle { outbound: out_tx, inbound: in_rx })
    }
}

// ============================================================================
// In-memory connector (for testing)
// ============================================================================

/// In-process transport for tests and dry-runs.
///
/// Each successful `connect` hands a [`WorkerEnd`] to whoever holds the
/// receiver returned by [`MemoryConnector::new`], so a test can script the
/// worker side of the conversation without a socket.
pub mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// The worker's side of an in-memory connection.
    pub struct WorkerEnd {
        /// Messages the client sent.
        pub rx: mpsc::Receiver<WireMessage>,
        /// Push messages (or injected transport errors) back to the client.
        pub tx: mpsc::Sender<Result<WireMessage, TransportError>>,
        /// The token the client presented at connect time.
        pub token: String,
    }

    impl WorkerEnd {
        /// Send a message to the client, ignoring a closed pipe.
        pub async fn push(&self, msg: WireMessage) {
            let _ = self.tx.send(Ok(msg)).await;
        }

        /// Inject a fatal transport error, as if the socket died.
        pub async fn fail(&self, reason: &str) {
            let _ = self.tx.send(Err(TransportError::Io(reason.into()))).await;
        }
    }

    /// Connector whose connections terminate in-process.
    pub struct MemoryConnector {
        worker_tx: mpsc::Sender<WorkerEnd>,
        refuse: AtomicBool,
    }

    impl MemoryConnector {
        /// Create a connector and the stream of worker ends it will
        /// produce (one per successful connect, so reconnects are
        /// observable).
        pub fn new() -> (Self, mpsc::Receiver<WorkerEnd>) {
            let (worker_tx, worker_rx) = mpsc::channel(4);
            (Self { worker_tx, refuse: AtomicBool::new(false) }, worker_rx)
        }

        /// Make subsequent connect attempts fail, as a refusing worker.
        pub fn refuse_connections(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, token: &str) -> Result<TransportHandle, TransportError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Refused("worker refused connection".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(TRANSPORT_BUFFER);
            let (in_tx, in_rx) = mpsc::channel(TRANSPORT_BUFFER);
            let end = WorkerEnd { rx: out_rx, tx: in_tx, token: token.to_string() };
            self.worker_tx
                .send(end)
                .await
                .map_err(|_| TransportError::Refused("no worker attached".into()))?;
            Ok(TransportHandle { outbound: out_tx, inbound: in_rx })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::memory::MemoryConnector;
    use super::*;
    use kagami_types::RequestId;

    #[tokio::test]
    async fn test_memory_connect_carries_token() {
        let (connector, mut workers) = MemoryConnector::new();
        let _handle = connector.connect("t1").await.expect("connect");
        let end = workers.recv().await.expect("worker end");
        assert_eq!(end.token, "t1");
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let (connector, mut workers) = MemoryConnector::new();
        let mut handle = connector.connect("t1").await.expect("connect");
        let mut end = workers.recv().await.expect("worker end");

        let req = WireMessage::FileListRequest { request_id: RequestId::from_string("r1") };
        handle.outbound.send(req.clone()).await.unwrap();
        assert_eq!(end.rx.recv().await, Some(req));

        end.push(WireMessage::FileListResponse {
            request_id: Some(RequestId::from_string("r1")),
            files: vec![],
        })
        .await;
        assert!(matches!(
            handle.inbound.recv().await,
            Some(Ok(WireMessage::FileListResponse { .. }))
        ));
    }

    #[tokio::test]
    async fn test_memory_refused() {
        let (connector, _workers) = MemoryConnector::new();
        connector.refuse_connections(true);
        let Err(err) = connector.connect("t1").await else {
            panic!("refused connector must not hand out a transport");
        };
        assert!(matches!(err, TransportError::Refused(_)));
    }

    #[tokio::test]
    async fn test_worker_close_ends_inbound() {
        let (connector, mut workers) = MemoryConnector::new();
        let mut handle = connector.connect("t1").await.expect("connect");
        let end = workers.recv().await.expect("worker end");
        drop(end);
        assert!(handle.inbound.recv().await.is_none());
    }

    #[test]
    fn test_protocol_errors_are_not_fatal() {
        assert!(!TransportError::Protocol("x".into()).is_fatal());
        assert!(TransportError::Io("x".into()).is_fatal());
        assert!(TransportError::ConnectTimeout(Duration::from_secs(1)).is_fatal());
    }
}
