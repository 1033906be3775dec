use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::context::CallContext;
use crate::server::method::{CallResult, Message};

/// A composed handler: the terminal invoke wrapped by zero or more
/// interceptors.
pub type Handler = Arc<dyn Fn(CallContext, Message) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// A cross-cutting wrapper around a method invocation.
///
/// An interceptor receives the call context, the decoded request and a
/// [`Next`] bound to the rest of the chain. It may call `next` (once), derive
/// a new context for it, translate its result, or return early without
/// calling it at all, in which case the terminal handler never runs.
pub trait Interceptor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult>;
}

/// The remaining chain, as seen from one interceptor.
#[derive(Clone)]
pub struct Next {
    inner: Handler,
}

impl Next {
    pub(crate) fn new(inner: Handler) -> Self {
        Self { inner }
    }

    /// Invoke the rest of the chain.
    pub fn run(self, ctx: CallContext, req: Message) -> BoxFuture<'static, CallResult> {
        (self.inner)(ctx, req)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Ordered interceptors, composed around a terminal handler.
///
/// The first interceptor added is the outermost: it runs first on the way in
/// and sees the result last on the way out.
///
/// # Example
/// ```ignore
/// let chain = InterceptorChain::new()
///     .with(RecoverInterceptor)
///     .with(LoggingInterceptor::default())
///     .with(AuthInterceptor::new(tokens));
/// ```
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor inside the ones already added.
    pub fn with<I: Interceptor>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Interceptor names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Fold the interceptors from last to first around `terminal`.
    pub fn build(&self, terminal: Handler) -> Handler {
        self.interceptors
            .iter()
            .rev()
            .fold(terminal, |next, interceptor| {
                let interceptor = Arc::clone(interceptor);
                let handler: Handler = Arc::new(move |ctx: CallContext, req: Message| {
                    interceptor.intercept(ctx, req, Next::new(Arc::clone(&next)))
                });
                handler
            })
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// An interceptor built from a closure.
pub struct FnInterceptor<F> {
    name: &'static str,
    f: F,
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(CallContext, Message, Next) -> BoxFuture<'static, CallResult> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn intercept(&self, ctx: CallContext, req: Message, next: Next) -> BoxFuture<'static, CallResult> {
        (self.f)(ctx, req, next)
    }
}

/// Helper to create an interceptor from a closure.
pub fn fn_interceptor<F>(name: &'static str, f: F) -> FnInterceptor<F>
where
    F: Fn(CallContext, Message, Next) -> BoxFuture<'static, CallResult> + Send + Sync + 'static,
{
    FnInterceptor { name, f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(name: &'static str, log: Log) -> impl Interceptor {
        fn_interceptor(name, move |ctx, req, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}:in"));
                let result = next.run(ctx, req).await;
                log.lock().unwrap().push(format!("{name}:out"));
                result
            }
            .boxed()
        })
    }

    fn terminal(log: Log, invoked: Arc<AtomicBool>) -> Handler {
        Arc::new(move |_ctx: CallContext, _req: Message| -> BoxFuture<'static, CallResult> {
            let log = Arc::clone(&log);
            let invoked = Arc::clone(&invoked);
            async move {
                invoked.store(true, Ordering::SeqCst);
                log.lock().unwrap().push("handler".to_string());
                Ok(Box::new("done") as Message)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log: Log = Arc::default();
        let invoked = Arc::new(AtomicBool::new(false));
        let chain = InterceptorChain::new()
            .with(recording("i1", Arc::clone(&log)))
            .with(recording("i2", Arc::clone(&log)))
            .with(recording("i3", Arc::clone(&log)));

        let handler = chain.build(terminal(Arc::clone(&log), Arc::clone(&invoked)));
        let result = handler(CallContext::new(1, "m"), Box::new(())).await.unwrap();

        assert_eq!(*result.downcast::<&str>().unwrap(), "done");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["i1:in", "i2:in", "i3:in", "handler", "i3:out", "i2:out", "i1:out"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let log: Log = Arc::default();
        let invoked = Arc::new(AtomicBool::new(false));
        let inner_log = Arc::clone(&log);
        let chain = InterceptorChain::new()
            .with(recording("outer", Arc::clone(&log)))
            .with(fn_interceptor("deny", |_ctx, _req, _next| {
                async { Err(RpcError::Handler(tonic::Status::permission_denied("no"))) }.boxed()
            }))
            .with(recording("inner", inner_log));

        let handler = chain.build(terminal(Arc::clone(&log), Arc::clone(&invoked)));
        let result = handler(CallContext::new(1, "m"), Box::new(())).await;

        assert!(matches!(result, Err(RpcError::Handler(s)) if s.code() == tonic::Code::PermissionDenied));
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(*log.lock().unwrap(), vec!["outer:in", "outer:out"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let log: Log = Arc::default();
        let invoked = Arc::new(AtomicBool::new(false));
        let handler = InterceptorChain::new().build(terminal(log, Arc::clone(&invoked)));
        handler(CallContext::new(1, "m"), Box::new(())).await.unwrap();
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new().with(recording("i1", Arc::clone(&log)));
        let failing: Handler = Arc::new(|_ctx: CallContext, _req: Message| -> BoxFuture<'static, CallResult> {
            async { Err(RpcError::Handler(tonic::Status::not_found("user 9"))) }.boxed()
        });

        let result = chain.build(failing)(CallContext::new(1, "m"), Box::new(())).await;
        match result {
            Err(RpcError::Handler(status)) => assert_eq!(status.message(), "user 9"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_names_outermost_first() {
        let chain = InterceptorChain::new()
            .with(fn_interceptor("a", |ctx, req, next| next.run(ctx, req)))
            .with(fn_interceptor("b", |ctx, req, next| next.run(ctx, req)));
        assert_eq!(chain.names(), vec!["a", "b"]);
        assert_eq!(chain.len(), 2);
    }
}
