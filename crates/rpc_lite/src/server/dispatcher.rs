use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::CallContext;
use crate::error::RpcError;
use crate::server::interceptor::{Handler, InterceptorChain};
use crate::server::method::{CallResult, Message, Method};
use crate::server::registry::MethodRegistry;

/// A method with its interceptor chain already composed around it.
struct ComposedMethod<S> {
    method: Method<S>,
    handler: Handler,
}

/// Routes raw calls to their methods through the interceptor chain.
///
/// Building a dispatcher seals the registry: the method table is copied into
/// a plain map that concurrent calls read without synchronisation, and each
/// method's chain is composed exactly once.
pub struct Dispatcher<S> {
    methods: HashMap<String, ComposedMethod<S>, ahash::RandomState>,
    state: Arc<S>,
}

impl<S: Send + Sync + 'static> Dispatcher<S> {
    pub fn new(registry: &MethodRegistry<S>, chain: InterceptorChain, state: Arc<S>) -> Self {
        let mut methods = HashMap::default();

        for method in registry.seal() {
            let invoke = Arc::clone(method.invoke_fn());
            let shared = Arc::clone(&state);
            let terminal: Handler = Arc::new(
                move |ctx: CallContext, req: Message| -> BoxFuture<'static, CallResult> {
                    invoke(Arc::clone(&shared), ctx, req)
                },
            );
            let handler = chain.build(terminal);
            methods.insert(method.name().to_string(), ComposedMethod { method, handler });
        }

        info!(
            methods = methods.len(),
            interceptors = ?chain.names(),
            "Dispatcher ready"
        );

        Self { methods, state }
    }

    /// Dispatch one call.
    ///
    /// Lookup, decode and encode failures are produced here and never reach
    /// the chain. Errors from the chain are returned unchanged.
    pub async fn dispatch(
        &self,
        method: &str,
        raw: Bytes,
        ctx: CallContext,
    ) -> Result<Bytes, RpcError> {
        let composed = self.methods.get(method).ok_or_else(|| {
            debug!(method = %method, "No method registered");
            RpcError::UnknownMethod(method.to_string())
        })?;

        ctx.check()?;

        let req = composed.method.decode(raw)?;
        let resp = (composed.handler)(ctx, req).await?;
        composed.method.encode(resp)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Dispatchable method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// The shared state every handler receives.
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }
}
