use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider, SpanExporter,
};
use rpc_lite::{BoxError, Resource};
use tracing::{info, warn};
use tracing_subscriber::Registry;

use crate::config::TelemetryConfig;
use crate::resources::log::{OtelLayer, TracerSlot};

/// `telemetry.endpoint` value that prints spans instead of shipping them.
pub const STDOUT_ENDPOINT: &str = "stdout";

/// Owns the OpenTelemetry tracer provider for the process.
///
/// The provider batches finished spans and hands them to a stdout exporter or
/// an OTLP/gRPC exporter, depending on `telemetry.endpoint`. Its tracer is
/// plugged into the log sink's subscriber, so the per-call `tracing` spans
/// become OpenTelemetry server spans. Without an endpoint the exporter is
/// disabled.
pub struct TraceExporter {
    provider: Option<SdkTracerProvider>,
    slot: Option<TracerSlot>,
}

impl TraceExporter {
    pub async fn open(
        config: &TelemetryConfig,
        service: &str,
        slot: Option<TracerSlot>,
    ) -> Result<Self, BoxError> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            info!("Trace export disabled");
            return Ok(Self::disabled());
        };

        let exporter = if endpoint == STDOUT_ENDPOINT {
            Self::with_exporter(
                service,
                config.batch_size,
                opentelemetry_stdout::SpanExporter::default(),
                slot,
            )
        } else {
            let otlp = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            Self::with_exporter(service, config.batch_size, otlp, slot)
        };

        info!(endpoint = %endpoint, batch_size = config.batch_size, "Trace export enabled");
        Ok(exporter)
    }

    pub fn disabled() -> Self {
        Self {
            provider: None,
            slot: None,
        }
    }

    /// Batch spans into `exporter` and attach the tracer to `slot`.
    pub fn with_exporter<E: SpanExporter + 'static>(
        service: &str,
        batch_size: usize,
        exporter: E,
        slot: Option<TracerSlot>,
    ) -> Self {
        let batch = BatchConfigBuilder::default()
            .with_max_export_batch_size(batch_size.max(1))
            .build();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).with_batch_config(batch).build())
            .with_resource(
                opentelemetry_sdk::Resource::builder()
                    .with_service_name(service.to_string())
                    .build(),
            )
            .build();

        match &slot {
            Some(slot) => {
                let layer: OtelLayer = Box::new(
                    tracing_opentelemetry::layer::<Registry>()
                        .with_tracer(provider.tracer(service.to_string())),
                );
                if let Err(e) = slot.install(layer) {
                    warn!(error = %e, "Failed to attach tracer to subscriber");
                }
            }
            None => warn!("Subscriber not owned by the log sink, call spans will not be exported"),
        }

        Self {
            provider: Some(provider),
            slot,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }
}

impl Resource for TraceExporter {
    fn name(&self) -> &str {
        "trace exporter"
    }

    fn release(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            if let Some(slot) = &self.slot {
                slot.clear();
            }
            let Some(provider) = self.provider.clone() else {
                return Ok(());
            };
            // Shutdown flushes pending batches and blocks until the exporter is done.
            tokio::task::spawn_blocking(move || provider.shutdown()).await??;
            info!("Trace exporter stopped");
            Ok(())
        }
        .boxed()
    }
}
