use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::context::CallContext;
use crate::error::{BoxError, RpcError};
use crate::server::method::Method;

/// Mapping from method name to its [`Method`].
///
/// Methods are registered during startup. [`seal`](Self::seal) closes
/// registration and returns an immutable snapshot which the dispatcher reads
/// without locking; any later `register` call fails with
/// [`RpcError::ServerAlreadyStarted`].
pub struct MethodRegistry<S> {
    methods: DashMap<String, Method<S>, ahash::RandomState>,
    sealed: AtomicBool,
}

impl<S: Send + Sync + 'static> MethodRegistry<S> {
    pub fn new() -> Self {
        Self {
            methods: DashMap::default(),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a method from plain decode, invoke and encode functions.
    pub fn register<Req, Resp, D, F, Fut, E>(
        &self,
        name: impl Into<String>,
        decode: D,
        invoke: F,
        encode: E,
    ) -> Result<(), RpcError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Bytes) -> Result<Req, BoxError> + Send + Sync + 'static,
        F: Fn(Arc<S>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
        E: Fn(Resp) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        let method = Method::new(name.as_str(), decode, invoke, encode);
        self.insert(name, method)
    }

    /// Register a method whose request and response are protobuf messages.
    ///
    /// # Example
    /// ```ignore
    /// registry.register_unary("user.User/Ping", |_svc, _ctx, _req: Empty| async move {
    ///     Ok(Pong { message: "pong".into() })
    /// })?;
    /// ```
    pub fn register_unary<Req, Resp, F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RpcError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Send + 'static,
        F: Fn(Arc<S>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let name = name.into();
        let method = Method::unary(name.as_str(), handler);
        self.insert(name, method)
    }

    /// Register an already-built method.
    pub fn insert(&self, name: String, method: Method<S>) -> Result<(), RpcError> {
        if self.is_sealed() {
            return Err(RpcError::ServerAlreadyStarted);
        }

        match self.methods.entry(name) {
            Entry::Occupied(slot) => Err(RpcError::DuplicateMethod(slot.key().clone())),
            Entry::Vacant(slot) => {
                let name = slot.key().clone();
                slot.insert(method);

                // A seal racing with this insert must not leave a method behind
                // that the sealed snapshot never saw.
                if self.is_sealed() {
                    self.methods.remove(&name);
                    return Err(RpcError::ServerAlreadyStarted);
                }

                info!(method = %name, "Registered RPC method");
                Ok(())
            }
        }
    }

    /// Look up a method by name.
    pub fn lookup(&self, name: &str) -> Result<Method<S>, RpcError> {
        self.methods
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RpcError::UnknownMethod(name.to_string()))
    }

    /// Close registration and return every registered method.
    pub fn seal(&self) -> Vec<Method<S>> {
        self.sealed.store(true, Ordering::Release);
        let methods: Vec<_> = self.methods.iter().map(|e| e.value().clone()).collect();
        debug!(methods = methods.len(), "Method registry sealed");
        methods
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Check if a method is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Get the number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Check if no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<S: Send + Sync + 'static> Default for MethodRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
