pub mod app;
pub mod config;
pub mod proto;
pub mod resources;
pub mod service;

pub use app::App;
pub use config::Config;
pub use service::ServiceContext;
