//! External collaborators held by the server for its lifetime.
//!
//! Each one is acquired through [`rpc_lite::Lifecycle::acquire`] and released
//! through its [`rpc_lite::Resource`] impl, in reverse acquisition order.

pub mod cache;
pub mod database;
pub mod log;
pub mod trace;

pub use cache::{Cache, CacheError};
pub use database::{Database, DbError, UserRow};
pub use log::LogSink;
pub use trace::TraceExporter;
