//! Built-in interceptors for recovery, logging, tracing, authentication and
//! deadlines.

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::{Code, Status};
use tracing::{Instrument, debug, error, field, info, info_span, warn};

use crate::context::CallContext;
use crate::error::RpcError;
use crate::path::split_method_name;
use crate::server::interceptor::{Interceptor, Next};
use crate::server::method::{CallResult, Message};

/// Metadata key carrying the caller's credentials.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// `rpc.system` attribute on call spans.
pub const RPC_SYSTEM: &str = "rpc_lite";

/// Converts a panic anywhere below it into [`RpcError::Internal`].
///
/// Place it inside the tracing and logging interceptors: a panic unwinds
/// through every layer outside recovery, dropping their futures before they
/// record the call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoverInterceptor;

impl Interceptor for RecoverInterceptor {
    fn name(&self) -> &'static str {
        "recover"
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult> {
        let method = ctx.method().to_string();
        let call_id = ctx.call_id();

        // The inner async block makes the synchronous part of `next.run`
        // execute under catch_unwind too.
        AssertUnwindSafe(async move { next.run(ctx, req).await })
            .catch_unwind()
            .map(move |outcome| match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        method = %method,
                        call_id,
                        panic = %message,
                        "Recovered from panic in call"
                    );
                    Err(RpcError::Internal(format!("panic: {message}")))
                }
            })
            .boxed()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Logs every call with its duration and outcome.
#[derive(Debug, Clone, Copy)]
pub struct LoggingInterceptor {
    slow_threshold: Duration,
}

impl LoggingInterceptor {
    /// Calls slower than `slow_threshold` are logged at warn level.
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult> {
        let slow_threshold = self.slow_threshold;
        let method = ctx.method().to_string();
        let call_id = ctx.call_id();
        let caller = ctx.caller().map(str::to_owned);
        let start = Instant::now();

        async move {
            let result = next.run(ctx, req).await;
            let elapsed = start.elapsed();
            let duration_ms = elapsed.as_millis() as u64;

            match &result {
                Ok(_) if elapsed > slow_threshold => warn!(
                    method = %method,
                    call_id,
                    caller = ?caller,
                    duration_ms,
                    "Slow call"
                ),
                Ok(_) => info!(method = %method, call_id, caller = ?caller, duration_ms, "Call completed"),
                Err(e) => warn!(
                    method = %method,
                    call_id,
                    caller = ?caller,
                    duration_ms,
                    code = ?e.code(),
                    error = %e,
                    "Call failed"
                ),
            }

            result
        }
        .boxed()
    }
}

/// Opens an `rpc.call` span per call.
///
/// The span continues the W3C trace context found in the request metadata
/// (`traceparent`, `tracestate`) and carries `otel.*` and `rpc.*` fields, so
/// an OpenTelemetry layer on the subscriber exports it as a server span with
/// the call's status code.
#[derive(Debug, Clone, Default)]
pub struct TracingInterceptor {
    propagator: TraceContextPropagator,
}

impl TracingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult> {
        let (service, method) = split_method_name(ctx.method());
        let remote = self.propagator.extract(ctx.metadata());

        // A span without a current tracing parent is parented to the attached context.
        let span = {
            let _remote = remote.attach();
            info_span!(
                "rpc.call",
                otel.name = %ctx.method(),
                otel.kind = "server",
                otel.status_code = field::Empty,
                otel.status_description = field::Empty,
                rpc.system = RPC_SYSTEM,
                rpc.service = %service,
                rpc.method = %method,
                rpc.grpc.status_code = field::Empty,
                call_id = ctx.call_id(),
            )
        };
        let ctx = ctx.with_span(span.clone());
        let record = span.clone();

        async move {
            let result = next.run(ctx, req).await;

            match &result {
                Ok(_) => {
                    record.record("rpc.grpc.status_code", Code::Ok as i64);
                }
                Err(e) => {
                    let description = e.to_string();
                    record.record("rpc.grpc.status_code", e.code() as i64);
                    record.record("otel.status_code", "error");
                    record.record("otel.status_description", description.as_str());
                }
            }

            result
        }
        .instrument(span)
        .boxed()
    }
}

/// Resolves a credential into a caller identity.
pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, token: &str) -> Option<String>;
}

/// A fixed token → caller table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, caller: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), caller.into());
        self
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Rejects calls without a valid `authorization` token.
///
/// A rejected call never reaches the rest of the chain. Accepted calls
/// continue with the resolved caller identity set on their context.
#[derive(Clone)]
pub struct AuthInterceptor {
    validator: Arc<dyn TokenValidator>,
}

impl AuthInterceptor {
    pub fn new(validator: impl TokenValidator) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult> {
        let token = ctx
            .metadata_value(AUTHORIZATION_KEY)
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim());

        let caller = match token {
            None | Some("") => {
                debug!(method = %ctx.method(), "Rejected call without credentials");
                return futures::future::ready(Err(RpcError::Handler(Status::unauthenticated(
                    "missing credentials",
                ))))
                .boxed();
            }
            Some(token) => match self.validator.validate(token) {
                Some(caller) => caller,
                None => {
                    debug!(method = %ctx.method(), "Rejected call with invalid credentials");
                    return futures::future::ready(Err(RpcError::Handler(
                        Status::unauthenticated("invalid credentials"),
                    )))
                    .boxed();
                }
            },
        };

        next.run(ctx.with_caller(caller), req)
    }
}

/// Bounds every call by its deadline and cancellation signal.
///
/// Calls that arrive without a deadline get `default_timeout`, if set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutInterceptor {
    default_timeout: Option<Duration>,
}

impl TimeoutInterceptor {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }
}

impl Interceptor for TimeoutInterceptor {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult> {
        let ctx = match (ctx.deadline(), self.default_timeout) {
            (None, Some(timeout)) => ctx.with_timeout(timeout),
            _ => ctx,
        };

        async move {
            let inner = ctx.clone();
            ctx.run(next.run(inner, req)).await
        }
        .boxed()
    }
}
