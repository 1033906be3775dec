use futures::StreamExt;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::error::{BoxError, RpcError};
use crate::lifecycle::Resource;
use crate::server::connections::{ConnectionGuard, ConnectionMap};
use crate::server::dispatcher::Dispatcher;
use crate::wire::{DEFAULT_MAX_FRAME_LENGTH, FrameReader, FrameWriter, RequestFrame, ResponseFrame};

/// Configuration for the TCP server.
#[derive(Debug, Clone, bon::Builder)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    #[builder(into, default = String::from("127.0.0.1:8080"))]
    pub listen_on: String,

    /// How long shutdown waits for in-flight calls before cancelling them.
    #[builder(default = Duration::from_secs(5))]
    pub drain_timeout: Duration,

    /// Deadline applied to calls that arrive without one.
    pub default_timeout: Option<Duration>,

    #[builder(default = DEFAULT_MAX_FRAME_LENGTH)]
    pub max_frame_length: usize,

    /// Responses buffered per connection before call tasks wait on the writer.
    #[builder(default = 64)]
    pub response_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// State shared by the accept loop and every connection task.
struct Shared<S> {
    dispatcher: Arc<Dispatcher<S>>,
    connections: Arc<ConnectionMap>,
    config: ServerConfig,
    /// Stops accepting and reading new frames.
    shutdown: CancellationToken,
    /// Parent of every call's cancellation signal.
    calls: CancellationToken,
    tracker: TaskTracker,
}

/// A TCP server dispatching framed calls.
///
/// Each connection runs on its own task and each call on its own task, so
/// calls on one connection proceed concurrently and responses are written in
/// completion order.
pub struct RpcServer {
    local_addr: SocketAddr,
    connections: Arc<ConnectionMap>,
    drain_timeout: Duration,
    shutdown: CancellationToken,
    calls: CancellationToken,
    tracker: TaskTracker,
}

impl RpcServer {
    /// Bind the listen address and start accepting connections.
    pub async fn bind<S: Send + Sync + 'static>(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher<S>>,
    ) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(&config.listen_on).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            dispatcher,
            connections: Arc::new(ConnectionMap::new()),
            config: config.clone(),
            shutdown: CancellationToken::new(),
            calls: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let server = Self {
            local_addr,
            connections: Arc::clone(&shared.connections),
            drain_timeout: config.drain_timeout,
            shutdown: shared.shutdown.clone(),
            calls: shared.calls.clone(),
            tracker: shared.tracker.clone(),
        };

        shared.tracker.spawn(accept_loop(listener, shared.clone()));
        info!(addr = %local_addr, "RPC server listening");

        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the number of open connections.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connection and call tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting, drain in-flight calls, then cancel whatever is left.
    ///
    /// Calling this more than once only waits for the first shutdown to finish.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(addr = %self.local_addr, "RPC server shutting down");
            self.shutdown.cancel();
            self.tracker.close();
        }

        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timeout elapsed, cancelling remaining calls"
            );
            self.calls.cancel();
            self.tracker.wait().await;
        }

        info!(addr = %self.local_addr, "RPC server stopped");
    }
}

impl Resource for RpcServer {
    fn name(&self) -> &str {
        "listener"
    }

    fn release(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.calls.cancel();
    }
}

async fn accept_loop<S: Send + Sync + 'static>(listener: TcpListener, shared: Arc<Shared<S>>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                debug!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    let guard = shared.connections.track(peer);
                    shared
                        .tracker
                        .spawn(serve_connection(stream, guard, Arc::clone(&shared)));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

async fn serve_connection<S: Send + Sync + 'static>(
    stream: TcpStream,
    guard: ConnectionGuard,
    shared: Arc<Shared<S>>,
) {
    let peer = guard.peer();
    let max_frame_length = shared.config.max_frame_length;
    let (read, write) = stream.into_split();
    let mut frames = FrameReader::<RequestFrame>::new(read, max_frame_length);

    let (tx, mut rx) = mpsc::channel::<ResponseFrame>(shared.config.response_buffer);
    let writer = tokio::spawn(async move {
        let mut out = FrameWriter::new(write, max_frame_length);
        while let Some(frame) = rx.recv().await {
            if let Err(e) = out.send(&frame).await {
                warn!(peer = %peer, error = %e, "Failed to write response");
                break;
            }
        }
    });

    // Calls on this connection are cancelled if the peer goes away, and by the
    // server once the drain timeout elapses.
    let conn_calls = shared.calls.child_token();

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(req)) => spawn_call(req, &shared, &conn_calls, tx.clone()),
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Dropping connection after unreadable frame");
                conn_calls.cancel();
                break;
            }
            None => {
                debug!(peer = %peer, "Peer closed connection");
                conn_calls.cancel();
                break;
            }
        }
    }

    // The writer finishes once every call task has dropped its sender.
    drop(tx);
    if let Err(e) = writer.await {
        warn!(peer = %peer, error = %e, "Response writer task failed");
    }
    drop(guard);
}

fn spawn_call<S: Send + Sync + 'static>(
    req: RequestFrame,
    shared: &Arc<Shared<S>>,
    conn_calls: &CancellationToken,
    tx: mpsc::Sender<ResponseFrame>,
) {
    let timeout = req.timeout().or(shared.config.default_timeout);
    let RequestFrame {
        call_id,
        method,
        metadata,
        payload,
        ..
    } = req;

    let ctx = CallContext::new(call_id, method.as_str())
        .with_metadata(metadata)
        .with_cancellation(conn_calls.child_token());
    let ctx = match timeout {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    };

    let dispatcher = Arc::clone(&shared.dispatcher);
    shared.tracker.spawn(async move {
        let result = dispatcher.dispatch(&method, payload, ctx).await;
        if let Err(e) = &result {
            debug!(method = %method, call_id, code = ?e.code(), error = %e, "Call returned error");
        }

        if tx.send(ResponseFrame::from_result(call_id, &result)).await.is_err() {
            debug!(method = %method, call_id, "Connection closed before response was written");
        }
    });
}
