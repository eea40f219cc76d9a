use std::time::Duration;

use anyhow::Context;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::Config;

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> anyhow::Result<Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
        .context("failed to initialize OpenTelemetry tracer")
}

/// Owns the global tracing setup. Shut it down last, so the spans of the shutdown
/// itself are exported.
pub struct Telemetry {
    otel_enabled: bool,
}

impl Telemetry {
    /// Instantiate tracing outputs:
    ///   - stdout, as text or JSON, with a level configured by RUST_LOG (default LOG_LEVEL)
    ///   - OpenTelemetry if OTEL_URL is set, for LOG_LEVEL and higher
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(config: &Config) -> anyhow::Result<Self> {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(config.log_level).into())
            .from_env_lossy();
        let log_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.log_json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer().with_filter(filter).boxed()
        };

        let tracer = config
            .otel_url
            .as_deref()
            .map(|url| init_tracer(url, config.otel_sampling_rate, &config.otel_service_name))
            .transpose()?;
        let otel_enabled = tracer.is_some();
        let otel_layer = tracer
            .map(OpenTelemetryLayer::new)
            .with_filter(LevelFilter::from_level(config.log_level));

        tracing_subscriber::registry()
            .with(log_layer)
            .with(otel_layer)
            .try_init()
            .context("failed to install the tracing subscriber")?;

        Ok(Self { otel_enabled })
    }

    /// Flush pending spans to the collector.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if !self.otel_enabled {
            return Ok(());
        }

        // Blocks until the batch exporter is drained.
        tokio::task::spawn_blocking(opentelemetry::global::shutdown_tracer_provider)
            .await
            .context("tracer shutdown task failed")?;
        info!("telemetry flushed");
        Ok(())
    }
}
