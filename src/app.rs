//! Process lifecycle: acquire resources in order, serve, release in reverse.

use anyhow::Context;
use rpc_lite::server::interceptors::{
    AuthInterceptor, LoggingInterceptor, RecoverInterceptor, StaticTokens, TimeoutInterceptor,
    TracingInterceptor,
};
use rpc_lite::{
    BoxError, Dispatcher, InterceptorChain, Lifecycle, MethodRegistry, RpcServer, ServerConfig,
    ServerState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::resources::{Cache, Database, LogSink, TraceExporter};
use crate::service::{ServiceContext, register_user_server};

/// A started server. Dropping it without [`stop`](Self::stop) leaves the
/// resources to their own drop impls.
pub struct App {
    lifecycle: Lifecycle,
    server: Arc<RpcServer>,
}

impl App {
    /// Acquire log sink, trace exporter, database, cache and listener in that
    /// order, then enter `Running`.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let mut lifecycle = Lifecycle::new();
        lifecycle.start()?;

        let log = lifecycle
            .acquire("log sink", async { LogSink::open(&config.log) })
            .await?;
        let exporter = lifecycle
            .acquire(
                "trace exporter",
                TraceExporter::open(&config.telemetry, config.telemetry_name(), log.tracer_slot()),
            )
            .await?;
        let db = lifecycle
            .acquire("database", Database::connect(&config.mysql.data_source))
            .await?;
        let cache = lifecycle
            .acquire("cache", Cache::connect(&config.redis))
            .await?;

        let dispatcher = match build_dispatcher(&config, db, cache) {
            Ok(dispatcher) => Arc::new(dispatcher),
            Err(e) => {
                lifecycle.stop().await?;
                return Err(e);
            }
        };

        let server_config = ServerConfig::builder()
            .listen_on(config.listen_on.clone())
            .drain_timeout(config.drain_timeout())
            .maybe_default_timeout(config.call_timeout())
            .build();
        let server = lifecycle
            .acquire("listener", async move {
                RpcServer::bind(server_config, dispatcher)
                    .await
                    .map_err(BoxError::from)
            })
            .await?;

        lifecycle.running()?;
        info!(
            name = %config.name,
            addr = %server.local_addr(),
            trace_export = exporter.is_enabled(),
            "Starting rpc server"
        );

        Ok(Self { lifecycle, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.lifecycle.subscribe()
    }

    /// Stop accepting, drain, and release every resource in reverse order.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.lifecycle.stop().await?;
        Ok(())
    }
}

/// Run until ctrl-c, SIGTERM, or until `shutdown` is cancelled.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut signals = ShutdownSignal::register();
    let app = App::start(config).await.context("server startup failed")?;

    tokio::select! {
        signal = signals.recv() => info!(signal, "Received signal, shutting down"),
        _ = shutdown.cancelled() => info!("Shutdown requested"),
    }

    app.stop().await
}

/// Process signals that start a graceful stop.
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl ShutdownSignal {
    /// SIGTERM is caught from here on, not only while [`recv`](Self::recv)
    /// is polled.
    pub fn register() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let terminate = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGTERM handler");
                    None
                }
            };
            Self { terminate }
        }
        #[cfg(not(unix))]
        Self {}
    }

    /// Wait for ctrl-c or SIGTERM and name the one received.
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        let terminate = async {
            match self.terminate.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for interrupt");
                }
                "interrupt"
            }
            () = terminate => "terminate",
        }
    }
}

fn build_dispatcher(
    config: &Config,
    db: Arc<Database>,
    cache: Arc<Cache>,
) -> anyhow::Result<Dispatcher<ServiceContext>> {
    let registry = MethodRegistry::new();
    register_user_server(&registry).context("failed to register user.User")?;

    let svc = Arc::new(ServiceContext::new(config.clone(), db, cache));
    Ok(Dispatcher::new(&registry, interceptors(config), svc))
}

/// The server-wide interceptor chain, outermost first. Recover stays inside
/// tracing and logging.
pub fn interceptors(config: &Config) -> InterceptorChain {
    let mut chain = InterceptorChain::new()
        .with(TracingInterceptor::new())
        .with(LoggingInterceptor::new(config.slow_call_threshold()))
        .with(RecoverInterceptor);

    if config.auth.enabled {
        let tokens = config
            .auth
            .tokens
            .iter()
            .fold(StaticTokens::new(), |tokens, (token, caller)| {
                tokens.with_token(token.clone(), caller.clone())
            });
        chain = chain.with(AuthInterceptor::new(tokens));
    }

    chain.with(TimeoutInterceptor::new(config.call_timeout()))
}
