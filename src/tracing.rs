use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    trace::{SdkTracerProvider, TracerProviderBuilder},
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::{CacheConfig, TelemetryConfig};

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &CacheConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .flatten_event(true)
                .with_writer(std::io::stderr),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr),
    )
}

/// Providers installed by [`setup_tracing`]; flushed on shutdown.
#[derive(Default)]
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(tracer_provider) = self.tracer_provider {
            if let Err(err) = tracer_provider.force_flush() {
                error!("Error flushing traces: {:?}", err);
            }
            if let Err(err) = tracer_provider.shutdown() {
                error!("Error shutting down tracer provider: {:?}", err);
            }
        }
        if let Some(meter_provider) = self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                error!("Error shutting down meter provider: {:?}", err);
            }
        }
    }
}

fn tracer_provider(telemetry: &TelemetryConfig) -> Result<SdkTracerProvider> {
    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_simple_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());
    Ok(tracer_provider)
}

fn meter_provider(telemetry: &TelemetryConfig) -> Result<SdkMeterProvider> {
    let mut metric_exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &telemetry.endpoint {
        metric_exporter = metric_exporter.with_endpoint(endpoint.clone());
    }
    let metric_exporter = metric_exporter.build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();
    global::set_meter_provider(meter_provider.clone());
    Ok(meter_provider)
}

pub fn setup_tracing(config: &CacheConfig) -> Result<Telemetry> {
    let mut telemetry = Telemetry::default();
    if config.telemetry.enable_tracing {
        telemetry.tracer_provider = Some(tracer_provider(&config.telemetry)?);
    }
    if config.telemetry.enable_metrics {
        telemetry.meter_provider = Some(meter_provider(&config.telemetry)?);
    }

    let env_filter_layer = get_env_filter();
    let log_layer = get_log_layer(config);
    let otel_layer = telemetry.tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer("opencache"))
    });
    let subscriber = tracing_subscriber::Registry::default()
        .with(log_layer.with_filter(env_filter_layer))
        .with(otel_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
    Ok(telemetry)
}
