//! A small unary RPC core: method registration, interceptor chains,
//! dispatch, server lifecycle, and a framed TCP transport.
//!
//! Services register typed methods in a [`MethodRegistry`]. Building a
//! [`Dispatcher`] seals the registry and composes the [`InterceptorChain`]
//! around every method once. The [`RpcServer`] feeds framed calls from TCP
//! connections into the dispatcher, and [`Lifecycle`] acquires and releases
//! the server's resources in stack order.

pub mod client;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod path;
pub mod server;
pub mod wire;

pub use client::{CallOptions, RpcClient};
pub use context::{CallContext, Metadata};
pub use error::{BoxError, MethodPathError, RpcError};
pub use lifecycle::{Lifecycle, Resource, ServerState, StateMachine};
pub use path::MethodPath;
pub use server::{
    Dispatcher, Interceptor, InterceptorChain, Method, MethodRegistry, Next, RpcServer,
    ServerConfig,
};
