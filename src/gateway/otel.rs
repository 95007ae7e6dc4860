use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Flushes and shuts the exporter down when the gateway exits.
#[derive(Debug)]
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        let _ = self.provider.shutdown();
    }
}

fn span_provider(
    service_name: &str,
    endpoint: Option<&str>,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error>> {
    let builder = SpanExporter::builder().with_http();
    let exporter = match endpoint {
        Some(endpoint) => builder.with_endpoint(endpoint).build()?,
        None => builder.build()?,
    };
    let resource = Resource::builder_empty()
        .with_service_name(service_name.to_string())
        .build();
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

/// [`super::telemetry::init_tracing`] with gateway spans also exported over OTLP/HTTP.
pub fn init_tracing(
    service_name: &str,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<OtelGuard, Box<dyn std::error::Error>> {
    let provider = span_provider(service_name, endpoint)?;
    opentelemetry::global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());
    let spans = tracing_opentelemetry::layer().with_tracer(tracer);
    super::telemetry::install(spans, json_logs)?;
    Ok(OtelGuard { provider })
}
