//! Server-side types for rpc_lite.
//!
//! This module contains the method registry, the interceptor chain and its
//! built-in interceptors, the dispatcher, and the TCP server that drives it.

mod connections;
mod dispatcher;
mod interceptor;
pub mod interceptors;
mod listener;
mod method;
mod registry;

pub use connections::{ConnectionGuard, ConnectionMap};
pub use dispatcher::Dispatcher;
pub use interceptor::{FnInterceptor, Handler, Interceptor, InterceptorChain, Next, fn_interceptor};
pub use listener::{RpcServer, ServerConfig};
pub use method::{CallResult, DecodeFn, EncodeFn, InvokeFn, Message, Method};
pub use registry::MethodRegistry;
