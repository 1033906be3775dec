use bytes::Bytes;
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState, TracerProvider as _,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
use rpc_lite::server::interceptors::{
    AuthInterceptor, LoggingInterceptor, RecoverInterceptor, StaticTokens, TimeoutInterceptor,
    TracingInterceptor,
};
use rpc_lite::{
    CallContext, CallOptions, Dispatcher, InterceptorChain, Lifecycle, MethodRegistry, RpcClient,
    RpcError, RpcServer, ServerConfig, ServerState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tonic::Code;
use tracing_subscriber::layer::SubscriberExt;

const TOKEN: &str = "test-token";

#[derive(Clone, PartialEq, prost::Message)]
struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
struct Text {
    #[prost(string, tag = "1")]
    value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Sleep {
    #[prost(uint64, tag = "1")]
    millis: u64,
}

#[derive(Default)]
struct Counters {
    finished: AtomicUsize,
}

async fn explode(_: Arc<Counters>, _: CallContext, _: Empty) -> Result<Empty, RpcError> {
    panic!("handler fault")
}

async fn sleep_for(state: Arc<Counters>, ctx: CallContext, req: Sleep) -> Result<Sleep, RpcError> {
    ctx.run(async {
        tokio::time::sleep(Duration::from_millis(req.millis)).await;
        Ok(())
    })
    .await?;
    state.finished.fetch_add(1, Ordering::SeqCst);
    Ok(Sleep { millis: req.millis })
}

fn registry() -> MethodRegistry<Counters> {
    let registry: MethodRegistry<Counters> = MethodRegistry::new();
    registry
        .register_unary("test.Svc/Ping", |_state, _ctx, _req: Empty| async move {
            Ok(Text {
                value: "pong".into(),
            })
        })
        .unwrap();
    registry
        .register_unary("test.Svc/WhoAmI", |_state, ctx: CallContext, _req: Empty| async move {
            Ok(Text {
                value: ctx.caller().unwrap_or_default().to_string(),
            })
        })
        .unwrap();
    registry.register_unary("test.Svc/Sleep", sleep_for).unwrap();
    registry.register_unary("test.Svc/Explode", explode).unwrap();
    registry
}

fn chain() -> InterceptorChain {
    InterceptorChain::new()
        .with(TracingInterceptor::new())
        .with(LoggingInterceptor::default())
        .with(RecoverInterceptor)
        .with(AuthInterceptor::new(StaticTokens::new().with_token(TOKEN, "tester")))
        .with(TimeoutInterceptor::default())
}

async fn start(drain_timeout: Duration) -> (RpcServer, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let dispatcher = Arc::new(Dispatcher::new(&registry(), chain(), Arc::clone(&counters)));
    let config = ServerConfig::builder()
        .listen_on("127.0.0.1:0")
        .drain_timeout(drain_timeout)
        .build();
    let server = RpcServer::bind(config, dispatcher).await.unwrap();
    (server, counters)
}

fn authed() -> CallOptions {
    CallOptions::new().with_token(TOKEN)
}

#[tokio::test]
async fn test_ping_over_tcp() {
    let (server, _) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let pong: Text = client.unary("test.Svc/Ping", &Empty {}, authed()).await.unwrap();
    assert_eq!(pong.value, "pong");

    let me: Text = client.unary("test.Svc/WhoAmI", &Empty {}, authed()).await.unwrap();
    assert_eq!(me.value, "tester");
    assert_eq!(server.active_connections(), 1);

    server.shutdown().await;
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test]
async fn test_trace_context_crosses_the_wire() {
    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));
    let _guard = tracing::subscriber::set_default(subscriber);

    let (server, _) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let trace_id = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
    let parent = SpanContext::new(
        trace_id,
        SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    let cx = opentelemetry::Context::new().with_remote_span_context(parent);

    let options = authed().with_trace_context(&cx);
    let pong: Text = client.unary("test.Svc/Ping", &Empty {}, options).await.unwrap();
    assert_eq!(pong.value, "pong");

    server.shutdown().await;

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "test.Svc/Ping");
    assert_eq!(spans[0].span_context.trace_id(), trace_id);
    assert_eq!(spans[0].parent_span_id, SpanId::from_hex("00f067aa0ba902b7").unwrap());
}

#[tokio::test]
async fn test_unknown_method() {
    let (server, _) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let result = client.call("test.Svc/Echo", Bytes::new(), authed()).await;
    assert!(matches!(result, Err(RpcError::UnknownMethod(name)) if name == "test.Svc/Echo"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_panic_is_reported_as_internal() {
    let (server, _) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let result: Result<Empty, _> = client.unary("test.Svc/Explode", &Empty {}, authed()).await;
    let err = result.unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    // The connection survives the fault.
    let pong: Text = client.unary("test.Svc/Ping", &Empty {}, authed()).await.unwrap();
    assert_eq!(pong.value, "pong");

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_token_is_unauthenticated() {
    let (server, _) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let result: Result<Text, _> = client
        .unary("test.Svc/Ping", &Empty {}, CallOptions::new())
        .await;
    match result {
        Err(RpcError::Handler(status)) => assert_eq!(status.code(), Code::Unauthenticated),
        other => panic!("expected unauthenticated, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let (server, counters) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let result: Result<Sleep, _> = client
        .unary(
            "test.Svc/Sleep",
            &Sleep { millis: 5_000 },
            authed().with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(RpcError::DeadlineExceeded)));

    server.shutdown().await;
    assert_eq!(counters.finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_calls_on_one_connection_run_concurrently() {
    let (server, counters) = start(Duration::from_secs(1)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let slow = client.unary::<_, Sleep>("test.Svc/Sleep", &Sleep { millis: 300 }, authed());
    let fast = async {
        let pong: Text = client.unary("test.Svc/Ping", &Empty {}, authed()).await.unwrap();
        assert!(counters.finished.load(Ordering::SeqCst) == 0);
        pong
    };

    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap().millis, 300);
    assert_eq!(fast.value, "pong");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_calls() {
    let (server, counters) = start(Duration::from_secs(5)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let call = client.unary::<_, Sleep>("test.Svc/Sleep", &Sleep { millis: 100 }, authed());
    let stop = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown().await;
    };

    let (result, ()) = tokio::join!(call, stop);
    assert_eq!(result.unwrap().millis, 100);
    assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
    assert!(RpcClient::connect(server.local_addr()).await.is_err());
}

#[tokio::test]
async fn test_drain_timeout_cancels_stragglers() {
    let (server, counters) = start(Duration::from_millis(50)).await;
    let client = RpcClient::connect(server.local_addr()).await.unwrap();

    let call = client.unary::<_, Sleep>("test.Svc/Sleep", &Sleep { millis: 10_000 }, authed());
    let stop = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown().await;
    };

    let (result, ()) = tokio::join!(call, stop);
    assert!(matches!(result, Err(RpcError::Cancelled)));
    assert_eq!(counters.finished.load(Ordering::SeqCst), 0);
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn test_listener_as_lifecycle_resource() {
    let counters = Arc::new(Counters::default());
    let dispatcher = Arc::new(Dispatcher::new(&registry(), chain(), counters));
    let config = ServerConfig::builder().listen_on("127.0.0.1:0").build();

    let mut lifecycle = Lifecycle::new();
    lifecycle.start().unwrap();
    let server = lifecycle
        .acquire("listener", async move {
            RpcServer::bind(config, dispatcher)
                .await
                .map_err(rpc_lite::BoxError::from)
        })
        .await
        .unwrap();
    lifecycle.running().unwrap();

    let addr = server.local_addr();
    let client = RpcClient::connect(addr).await.unwrap();
    let pong: Text = client.unary("test.Svc/Ping", &Empty {}, authed()).await.unwrap();
    assert_eq!(pong.value, "pong");

    lifecycle.stop().await.unwrap();
    assert_eq!(lifecycle.state(), ServerState::Stopped);
    assert!(RpcClient::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_names_listener() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        &registry(),
        chain(),
        Arc::new(Counters::default()),
    ));
    let config = ServerConfig::builder().listen_on(addr.to_string()).build();

    let mut lifecycle = Lifecycle::new();
    lifecycle.start().unwrap();
    let result = lifecycle
        .acquire("listener", async move {
            RpcServer::bind(config, dispatcher)
                .await
                .map_err(rpc_lite::BoxError::from)
        })
        .await;

    assert!(matches!(result, Err(RpcError::Startup { resource, .. }) if resource == "listener"));
    assert_eq!(lifecycle.state(), ServerState::Stopped);
}
