use data_encoding::BASE64;
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, runtime, trace as sdktrace, Resource};
use opentelemetry_semantic_conventions::{
    attribute::DEPLOYMENT_ENVIRONMENT,
    resource::{SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use serde::Deserialize;
use tap::Pipe;
use thiserror::Error;
use tonic::metadata::{errors::InvalidMetadataValue, MetadataMap};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Events from the crates used by the OTLP exporter must not loop back into the exporter.
const DEFAULT_FILTER: &str = "info,hyper=error,tonic=error,reqwest=error";

/// An OpenObserve style OTLP endpoint for traces and metrics.
#[derive(Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub organization: String,
    pub stream_name: String,
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    pub deployment_environment: String,
}

fn otlp_metadata(remote: &RemoteConfig) -> Result<MetadataMap, InvalidMetadataValue> {
    let credentials = BASE64.encode(format!("{}:{}", remote.username, remote.password).as_bytes());

    let mut map = MetadataMap::with_capacity(3);
    map.insert("authorization", format!("Basic {credentials}").parse()?);
    map.insert("organization", remote.organization.parse()?);
    map.insert("stream-name", remote.stream_name.parse()?);
    Ok(map)
}

fn resource(config: &Config) -> Resource {
    Resource::from_schema_url(
        [
            KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT, config.deployment_environment.clone()),
        ],
        SCHEMA_URL,
    )
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid metadata value: {0}")]
    InvalidMetadataValue(#[from] InvalidMetadataValue),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Trace error: {0}")]
    Trace(#[from] opentelemetry::trace::TraceError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] opentelemetry::metrics::MetricsError),

    #[error("TryInitError error: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

fn exporter(remote: &RemoteConfig) -> Result<opentelemetry_otlp::TonicExporterBuilder, Error> {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_tls_config(tonic::transport::ClientTlsConfig::new().with_enabled_roots())
        .with_endpoint(remote.endpoint.clone())
        .with_metadata(otlp_metadata(remote)?)
        .pipe(Ok)
}

/// The OTLP pipelines that need flushing on exit.
struct Exporters {
    tracer_provider: sdktrace::TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Exporters {
    fn new(config: &Config, remote: &RemoteConfig) -> Result<Self, Error> {
        let resource = resource(config);

        let tracer_provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter(remote)?)
            .with_trace_config(sdktrace::Config::default().with_resource(resource.clone()))
            .install_batch(runtime::Tokio)?;

        let meter_provider = opentelemetry_otlp::new_pipeline()
            .metrics(runtime::Tokio)
            .with_exporter(exporter(remote)?)
            .with_resource(resource)
            .build()?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

/// Set up logging to stdout, and export traces and metrics if a remote is configured.
///
/// `RUST_LOG` replaces the default filter.
pub fn init_tracing_subscriber(config: &Config) -> Result<OtelGuard, Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    let layer = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let Some(remote) = &config.remote else {
        layer.try_init()?;
        return Ok(OtelGuard { exporters: None });
    };

    let exporters = Exporters::new(config, remote)?;
    let tracer = exporters
        .tracer_provider
        .tracer_builder(env!("CARGO_PKG_NAME"))
        .build();

    layer
        .with(MetricsLayer::new(exporters.meter_provider.clone()))
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;

    Ok(OtelGuard {
        exporters: Some(exporters),
    })
}

/// Flushes the exporters when dropped.
pub struct OtelGuard {
    exporters: Option<Exporters>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        let Some(exporters) = self.exporters.take() else {
            return;
        };

        if let Err(err) = exporters.meter_provider.shutdown() {
            eprintln!("{err:?}");
        }
        drop(exporters.tracer_provider);
        global::shutdown_tracer_provider();
    }
}
