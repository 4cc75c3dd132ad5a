//! IPC client: the gateway side of the framed Unix-socket protocol.
//!
//! One duplex stream carries both lanes. Requests mint a correlation id,
//! park a pending record, and wait (with a timeout) for the reader task to
//! route the matching response back; fire-and-forget sends register nothing
//! and never fail the caller. Responses for distinct ids may arrive in any
//! order; the pending table does the matching.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, info, warn};

use rslive_shared::frame::{
    decode_response, encode_request, peek_correlation_id, ResponseFrame, IPC_HIGH_WATER,
};
use rslive_shared::schema::{Lane, MessageType};
use rslive_shared::ErrorKind;

type FramedSink = SplitSink<Framed<UnixStream, LengthDelimitedCodec>, Bytes>;
type FramedStream = SplitStream<Framed<UnixStream, LengthDelimitedCodec>>;

struct PendingRequest {
    expected: MessageType,
    reply: oneshot::Sender<Result<ResponseFrame, ErrorKind>>,
}

struct Inner {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    out_tx: mpsc::Sender<String>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    request_timeout: Duration,
}

impl Inner {
    /// Rejects every pending request. Idempotent; runs on explicit destroy
    /// and when the transport dies underneath us.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(ErrorKind::InternalZmqDestroyed));
            }
        }
    }
}

#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<Inner>,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path, request_timeout: Duration) -> Result<IpcClient> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("connecting to {}", socket_path.display()))?;
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (sink, stream) = framed.split();

        let (out_tx, out_rx) = mpsc::channel(IPC_HIGH_WATER);
        let inner = Arc::new(Inner {
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            out_tx,
            connected: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            request_timeout,
        });

        tokio::spawn(run_writer(out_rx, sink, inner.clone()));
        tokio::spawn(run_reader(stream, inner.clone()));

        Ok(IpcClient { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Sends a request-lane frame and waits for its response.
    ///
    /// The pending record is inserted before the frame is queued so a fast
    /// response can never race past its own table entry.
    pub async fn request(
        &self,
        msg_type: MessageType,
        args: &[&str],
    ) -> Result<ResponseFrame, ErrorKind> {
        debug_assert_eq!(msg_type.lane(), Lane::Request);
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ErrorKind::InternalZmqDestroyed);
        }
        if !self.is_connected() {
            return Err(ErrorKind::InternalZmqNotConnected);
        }

        let correlation_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(
            correlation_id,
            PendingRequest {
                expected: msg_type,
                reply: reply_tx,
            },
        );

        let frame = encode_request(correlation_id, msg_type, args);
        if let Err(e) = self.inner.out_tx.try_send(frame) {
            self.inner.pending.remove(&correlation_id);
            return match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("IPC send queue full, failing {msg_type}");
                    Err(ErrorKind::InternalError)
                }
                mpsc::error::TrySendError::Closed(_) => Err(ErrorKind::InternalZmqNotConnected),
            };
        }

        match tokio::time::timeout(self.inner.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // Reply sender dropped without an answer: transport went away.
            Ok(Err(_)) => Err(ErrorKind::InternalZmqDestroyed),
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                Err(ErrorKind::InternalZmqRequestTimeout)
            }
        }
    }

    /// Queues a fire-and-forget frame. Never raises: a missing transport or
    /// a full queue drops the frame with a log line.
    pub fn send_oneway(&self, msg_type: MessageType, args: &[&str]) {
        debug_assert_eq!(msg_type.lane(), Lane::Oneway);
        if self.inner.destroyed.load(Ordering::SeqCst) || !self.is_connected() {
            warn!("IPC not connected, dropping {msg_type}");
            return;
        }
        let correlation_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = encode_request(correlation_id, msg_type, args);
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inner.out_tx.try_send(frame) {
            warn!("IPC send queue full, dropping {msg_type}");
        }
    }

    /// Tears the transport down, rejecting everything in flight with
    /// `INTERNAL_ZMQ_DESTROYED`.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// A client wired to a bare channel instead of a socket, so handler
    /// tests can assert on the frames it would have sent.
    #[cfg(test)]
    pub(crate) fn test_pair(capacity: usize) -> (IpcClient, mpsc::Receiver<String>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let client = IpcClient {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                next_id: AtomicU64::new(0),
                out_tx,
                connected: AtomicBool::new(true),
                destroyed: AtomicBool::new(false),
                request_timeout: Duration::from_millis(200),
            }),
        };
        (client, out_rx)
    }
}

async fn run_writer(mut out_rx: mpsc::Receiver<String>, mut sink: FramedSink, inner: Arc<Inner>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = sink.send(Bytes::from(frame)).await {
            error!("IPC write failed: {e}");
            break;
        }
    }
    inner.connected.store(false, Ordering::SeqCst);
}

async fn run_reader(mut stream: FramedStream, inner: Arc<Inner>) {
    while let Some(next) = stream.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("IPC read failed: {e}");
                break;
            }
        };
        match std::str::from_utf8(&bytes) {
            Ok(raw) => route_frame(&inner, raw),
            Err(_) => warn!("{}: non-UTF-8 frame", ErrorKind::InternalZmqDecodeFailed),
        }
    }
    info!("IPC transport closed");
    // Anyone still waiting will never get an answer.
    inner.destroy();
}

fn route_frame(inner: &Inner, raw: &str) {
    let correlation_id = match peek_correlation_id(raw) {
        Ok(id) => id,
        Err(e) => {
            warn!("{}: {e}", ErrorKind::InternalZmqDecodeFailed);
            return;
        }
    };
    let Some((_, pending)) = inner.pending.remove(&correlation_id) else {
        warn!(
            "{}: correlation id {correlation_id}",
            ErrorKind::InternalZmqNoPendingRequest
        );
        return;
    };
    let result = decode_response(raw, pending.expected).map_err(|e| {
        warn!("{}: {e}", ErrorKind::InternalZmqInvalidResponse);
        ErrorKind::InternalZmqInvalidResponse
    });
    let _ = pending.reply.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rslive_shared::frame::{decode_request, encode_response};
    use tokio::net::UnixListener;

    /// Spawns a datastore-shaped peer that answers GET_CREDITS with a fixed
    /// balance and stays silent on everything else.
    async fn spawn_stub_server(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            while let Some(Ok(bytes)) = framed.next().await {
                let raw = String::from_utf8(bytes.to_vec()).unwrap();
                let request = decode_request(&raw).unwrap();
                if request.msg_type == MessageType::GetCredits {
                    let reply = encode_response(request.correlation_id, "", &["750"]);
                    framed.send(Bytes::from(reply)).await.unwrap();
                }
            }
        });
        path
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = spawn_stub_server(&dir).await;

        let client = IpcClient::connect(&path, Duration::from_secs(1)).await.unwrap();
        let response = client
            .request(MessageType::GetCredits, &["acct-1"])
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.num_field(0), 750);
        assert!(client.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = spawn_stub_server(&dir).await;

        let client = IpcClient::connect(&path, Duration::from_millis(50)).await.unwrap();
        // The stub never answers VALIDATE_AND_LOAD.
        let err = client
            .request(MessageType::ValidateAndLoad, &["key", "S1"])
            .await
            .unwrap_err();
        assert_eq!(err, ErrorKind::InternalZmqRequestTimeout);
        assert!(client.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_rejects_in_flight_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = spawn_stub_server(&dir).await;

        let client = IpcClient::connect(&path, Duration::from_secs(5)).await.unwrap();
        let racing = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request(MessageType::ValidateAndLoad, &["key", "S1"])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.destroy();

        let err = racing.await.unwrap().unwrap_err();
        assert_eq!(err, ErrorKind::InternalZmqDestroyed);

        // And everything after the teardown fails fast.
        let err = client
            .request(MessageType::GetCredits, &["acct-1"])
            .await
            .unwrap_err();
        assert_eq!(err, ErrorKind::InternalZmqDestroyed);
    }

    #[tokio::test]
    async fn test_oneway_reaches_the_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oneway.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let received = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let bytes = framed.next().await.unwrap().unwrap();
            String::from_utf8(bytes.to_vec()).unwrap()
        });

        let client = IpcClient::connect(&path, Duration::from_secs(1)).await.unwrap();
        client.send_oneway(
            MessageType::UpdateUsage,
            &["acct-1", "S1", "OPENAI", "50", "100"],
        );

        let raw = received.await.unwrap();
        let frame = decode_request(&raw).unwrap();
        assert_eq!(frame.msg_type, MessageType::UpdateUsage);
        assert_eq!(frame.num_arg(3), 50);
        assert_eq!(frame.num_arg(4), 100);
    }

    #[tokio::test]
    async fn test_oneway_after_destroy_is_dropped_silently() {
        let (client, mut out_rx) = IpcClient::test_pair(4);
        client.destroy();
        client.send_oneway(MessageType::SaveSession, &["a", "s", "{}"]);
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_fails_requests_and_drops_oneways() {
        let (client, _out_rx) = IpcClient::test_pair(1);
        // Fill the single slot.
        client.send_oneway(MessageType::SaveSession, &["a", "s", "{}"]);
        // Oneway overflow: dropped without error.
        client.send_oneway(MessageType::SaveSession, &["a", "s", "{}"]);
        // Request overflow: fails the caller.
        let err = client
            .request(MessageType::GetCredits, &["acct-1"])
            .await
            .unwrap_err();
        assert_eq!(err, ErrorKind::InternalError);
        assert!(client.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ooo.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let first = framed.next().await.unwrap().unwrap();
            let second = framed.next().await.unwrap().unwrap();
            let first = decode_request(std::str::from_utf8(&first).unwrap()).unwrap();
            let second = decode_request(std::str::from_utf8(&second).unwrap()).unwrap();
            // Answer in reverse arrival order.
            for frame in [second, first] {
                let credits = if frame.arg(0) == "acct-a" { "1" } else { "2" };
                let reply = encode_response(frame.correlation_id, "", &[credits]);
                framed.send(Bytes::from(reply)).await.unwrap();
            }
        });

        let client = IpcClient::connect(&path, Duration::from_secs(1)).await.unwrap();
        let a = {
            let client = client.clone();
            tokio::spawn(async move { client.request(MessageType::GetCredits, &["acct-a"]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = client.request(MessageType::GetCredits, &["acct-b"]).await.unwrap();
        let a = a.await.unwrap().unwrap();
        assert_eq!(a.num_field(0), 1);
        assert_eq!(b.num_field(0), 2);
    }
}
