use futures::FutureExt;
use futures::future::BoxFuture;
use rpc_lite::{BoxError, Resource};
use std::fs;
use std::sync::Mutex;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, reload};

use crate::config::LogConfig;

pub const LOG_FILE_NAME: &str = "user-rpc.log";

/// An OpenTelemetry layer for the root subscriber.
pub type OtelLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Place in the installed subscriber where the trace exporter plugs its
/// OpenTelemetry layer once it has a tracer.
#[derive(Clone)]
pub struct TracerSlot(reload::Handle<Option<OtelLayer>, Registry>);

impl TracerSlot {
    fn new() -> (reload::Layer<Option<OtelLayer>, Registry>, Self) {
        let (layer, handle) = reload::Layer::new(None);
        (layer, Self(handle))
    }

    /// A slot wired into a fresh subscriber that is not installed globally.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, impl tracing::Subscriber + Send + Sync + 'static) {
        let (layer, slot) = Self::new();
        (slot, tracing_subscriber::registry().with(layer))
    }

    pub fn install(&self, layer: OtelLayer) -> Result<(), reload::Error> {
        self.0.reload(Some(layer))
    }

    pub fn clear(&self) {
        if let Err(e) = self.0.reload(None) {
            debug!(error = %e, "Subscriber already gone, nothing to detach");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.0.with_current(Option::is_some).unwrap_or(false)
    }
}

/// The process-wide `tracing` subscriber.
///
/// Writes to the console, or to `{path}/user-rpc.log` through a non-blocking
/// writer when a path is configured. Releasing the sink drops the writer's
/// guard, which flushes buffered lines.
pub struct LogSink {
    guard: Mutex<Option<WorkerGuard>>,
    slot: Option<TracerSlot>,
}

impl LogSink {
    pub fn open(config: &LogConfig) -> Result<Self, BoxError> {
        let filter = EnvFilter::builder()
            .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone()));
        let (otel, slot) = TracerSlot::new();
        let registry = tracing_subscriber::registry().with(otel).with(filter);

        let (guard, installed) = match &config.path {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let installed = registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(true)
                            .with_ansi(false)
                            .with_writer(non_blocking),
                    )
                    .try_init()
                    .is_ok();
                if installed {
                    info!("File logging enabled to {dir}/{LOG_FILE_NAME}");
                }
                (Some(guard), installed)
            }
            None => {
                let installed = registry
                    .with(tracing_subscriber::fmt::layer().with_target(true))
                    .try_init()
                    .is_ok();
                if installed {
                    info!("Console logging enabled");
                }
                (None, installed)
            }
        };

        // A subscriber installed earlier (tests, embedding) stays in charge.
        if !installed {
            debug!("Global subscriber already installed, log sink is passive");
        }

        Ok(Self {
            guard: Mutex::new(guard),
            slot: installed.then_some(slot),
        })
    }

    /// Slot for the OpenTelemetry layer, `None` when this sink did not
    /// install the global subscriber.
    pub fn tracer_slot(&self) -> Option<TracerSlot> {
        self.slot.clone()
    }
}

impl Resource for LogSink {
    fn name(&self) -> &str {
        "log sink"
    }

    fn release(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            info!("Closing log sink");
            let guard = self
                .guard
                .lock()
                .map_err(|_| BoxError::from("log sink guard poisoned"))?
                .take();
            drop(guard);
            Ok(())
        }
        .boxed()
    }
}
