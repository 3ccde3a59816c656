use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging options shared by every service binary.
#[derive(Debug, Clone)]
pub struct LoggingOptions<'a> {
    pub service_name: &'a str,
    pub log_level: &'a str,
    /// Emit one JSON object per event instead of the human-readable format.
    pub json: bool,
    /// OTLP gRPC endpoint; spans are only exported when this is set.
    pub otlp_endpoint: Option<&'a str>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `log_level` when present. Export failures at startup
/// are reported on stderr and the service keeps running with local logs only.
pub fn init_tracing(options: &LoggingOptions<'_>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level));

    let telemetry = options
        .otlp_endpoint
        .and_then(|endpoint| otlp_layer(options.service_name, endpoint));

    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry)
        .with(fmt_layer)
        .init();
}

fn otlp_layer<S>(service_name: &str, endpoint: &str) -> Option<impl Layer<S>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .install_batch(runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            eprintln!(
                "Failed to initialize OTLP tracer for service '{}' at endpoint '{}': {}",
                service_name, endpoint, e
            );
            None
        }
    }
}
