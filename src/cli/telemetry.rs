//! Log output and optional OTLP span export.
//!
//! Spans are exported over gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The
//! resource names this gateway instance and the commit it was built from, so
//! login, session and OIDC spans from several replicas can be told apart.

use crate::cli::commands::logging::{LogFormat, Options};
use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Subscriber, debug};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, registry::LookupSpan,
};
use ulid::Ulid;
use url::Url;

const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// `OTEL_EXPORTER_OTLP_HEADERS` (`k=v,k=v`) as gRPC metadata. Keys are
/// lowercased; empty keys are skipped.
fn metadata_from_env(headers: &str) -> Result<MetadataMap> {
    let mut meta = MetadataMap::new();
    for (key, value) in headers.split(',').filter_map(|pair| pair.split_once('=')) {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
            .map_err(|err| anyhow!("invalid OTLP header {key}: {err}"))?;
        let value: MetadataValue<_> = value
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid value for OTLP header {key}: {err}"))?;
        meta.insert(name, value);
    }
    Ok(meta)
}

/// Collector URL, `https` unless a scheme is given, and the TLS host when it
/// is `https`.
fn collector(endpoint: &str) -> Result<(String, Option<String>)> {
    let endpoint = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    };
    let url = Url::parse(&endpoint).with_context(|| format!("invalid OTLP endpoint {endpoint}"))?;
    let tls_host = url
        .host_str()
        .filter(|_| url.scheme() == "https")
        .map(str::to_string);
    Ok((endpoint, tls_host))
}

fn resource() -> Resource {
    let instance_id = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.namespace", "auth"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance_id),
            KeyValue::new("vcs.revision", crate::GIT_COMMIT_HASH),
        ])
        .build()
}

fn init_tracer(endpoint: &str) -> Result<Tracer> {
    if let Ok(proto) = var("OTEL_EXPORTER_OTLP_PROTOCOL")
        && proto != "grpc"
    {
        debug!("OTEL_EXPORTER_OTLP_PROTOCOL={proto} ignored, spans are sent over grpc");
    }

    let (endpoint, tls_host) = collector(endpoint)?;
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);
    if let Some(host) = tls_host {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(host)
                .with_native_roots(),
        );
    }
    if let Ok(headers) = var("OTEL_EXPORTER_OTLP_HEADERS") {
        builder = builder.with_metadata(metadata_from_env(&headers)?);
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(builder.build()?)
        .with_resource(resource())
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

fn filter(options: Options) -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(options.level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or a subscriber is already set.
pub fn init(options: Options) -> Result<()> {
    let otel = match var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(init_tracer(&endpoint)?)),
        Err(_) => None,
    };
    let subscriber = Registry::default()
        .with(fmt_layer(options.format))
        .with(otel)
        .with(filter(options)?);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Flush and stop span export; a no-op when it was never started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        let _ = provider.shutdown();
    }
}
