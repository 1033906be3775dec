use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::Metadata;
use crate::error::RpcError;
use crate::server::interceptors::AUTHORIZATION_KEY;
use crate::wire::{DEFAULT_MAX_FRAME_LENGTH, FrameReader, FrameWriter, RequestFrame, ResponseFrame};

type Pending = DashMap<u64, oneshot::Sender<ResponseFrame>, ahash::RandomState>;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Sent to the server as the call deadline and enforced locally.
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Authenticate the call with a bearer token.
    pub fn with_token(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.with_metadata(AUTHORIZATION_KEY, value)
    }

    /// Propagate `cx` as W3C `traceparent`/`tracestate` metadata, so the
    /// server span joins the caller's trace.
    pub fn with_trace_context(mut self, cx: &opentelemetry::Context) -> Self {
        TraceContextPropagator::new().inject_context(cx, &mut self.metadata);
        self
    }
}

/// A client connection that multiplexes concurrent calls, correlated by
/// call id.
///
/// # Example
/// ```ignore
/// let client = RpcClient::connect("127.0.0.1:8080").await?;
/// let pong: Pong = client
///     .unary("user.User/Ping", &Empty {}, CallOptions::new().with_timeout(Duration::from_secs(1)))
///     .await?;
/// ```
pub struct RpcClient {
    peer: SocketAddr,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    outbound: mpsc::UnboundedSender<RequestFrame>,
    closed: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();

        let pending: Arc<Pending> = Arc::new(DashMap::default());
        let closed = CancellationToken::new();
        let (outbound, mut requests) = mpsc::unbounded_channel::<RequestFrame>();

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut frames = FrameReader::<ResponseFrame>::new(read, DEFAULT_MAX_FRAME_LENGTH);
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(resp) => match pending.remove(&resp.call_id) {
                            Some((_, tx)) => {
                                let _ = tx.send(resp);
                            }
                            None => debug!(call_id = resp.call_id, "Response for unknown call"),
                        },
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to read response");
                            break;
                        }
                    }
                }

                // Cancel first so calls registering from now on see the close.
                closed.cancel();
                pending.clear();
                debug!(peer = %peer, "Connection closed");
            })
        };

        let writer = {
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut out = FrameWriter::new(write, DEFAULT_MAX_FRAME_LENGTH);
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = requests.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    if let Err(e) = out.send(&frame).await {
                        warn!(peer = %peer, error = %e, "Failed to write request");
                        closed.cancel();
                        break;
                    }
                }
            })
        };

        debug!(peer = %peer, "Connected");
        Ok(Self {
            peer,
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            closed,
            reader,
            writer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Send a raw payload to `method` and wait for the raw response.
    pub async fn call(
        &self,
        method: &str,
        payload: Bytes,
        options: CallOptions,
    ) -> Result<Bytes, RpcError> {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        if self.closed.is_cancelled() {
            self.pending.remove(&call_id);
            return Err(RpcError::ConnectionClosed);
        }

        let frame = RequestFrame {
            call_id,
            method: method.to_string(),
            timeout_ms: options
                .timeout
                .map(|t| (t.as_millis() as u64).max(1))
                .unwrap_or(0),
            metadata: options.metadata,
            payload,
        };
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&call_id);
            return Err(RpcError::ConnectionClosed);
        }

        let response = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.pending.remove(&call_id);
                    return Err(RpcError::DeadlineExceeded);
                }
            },
            None => rx.await,
        };

        response
            .map_err(|_| RpcError::ConnectionClosed)?
            .into_result()
    }

    /// Call a method whose request and response are protobuf messages.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        req: &Req,
        options: CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let raw = self
            .call(method, Bytes::from(req.encode_to_vec()), options)
            .await?;
        Ok(Resp::decode(raw)?)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
        self.reader.abort();
        self.writer.abort();
    }
}
