use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    logs::LoggerProvider as SdkLoggerProvider,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use std::env;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};

/// Providers installed by [`init_telemetry`]; flushed on [`Telemetry::shutdown`].
#[derive(Default)]
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(meter_provider) = self.meter_provider {
            if let Err(e) = meter_provider.shutdown() {
                error!(error = %e, "Failed to shutdown meter provider");
            }
        }
        if let Some(logger_provider) = self.logger_provider {
            if let Err(e) = logger_provider.shutdown() {
                error!(error = %e, "Failed to shutdown logger provider");
            }
        }
        global::shutdown_tracer_provider();
    }
}

/// Installs the tracing subscriber.
///
/// Console output is always on and filtered by `RUST_LOG` (falling back to
/// `default_filter`). When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, traces,
/// logs and metrics are also exported over OTLP/gRPC.
pub fn init_telemetry(default_service: &str, default_filter: &str) -> Result<Telemetry, anyhow::Error> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let Ok(otlp_endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        Registry::default().with(env_filter).with(fmt_layer).init();
        return Ok(Telemetry::default());
    };

    let service_name = env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service.to_string());

    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.clone())]);

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    // Take the tracer before the provider moves into the global slot.
    let tracer = tracer_provider.tracer(service_name);
    global::set_tracer_provider(tracer_provider);
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter, runtime::Tokio)
        .with_resource(resource.clone())
        .build();
    let log_layer = OpenTelemetryTracingBridge::new(&logger_provider);

    let meter_provider = init_metrics(&otlp_endpoint, resource)?;
    global::set_meter_provider(meter_provider.clone());

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .with(log_layer)
        .init();

    Ok(Telemetry {
        logger_provider: Some(logger_provider),
        meter_provider: Some(meter_provider),
    })
}

fn init_metrics(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, anyhow::Error> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(15))
        .build();

    Ok(MeterProviderBuilder::default()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}
