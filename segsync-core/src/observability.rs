//! Logging and OpenTelemetry bootstrap
//!
//! The sync client itself only emits `tracing` events and records OTel
//! instruments through the global meter. Whether those go anywhere is decided
//! here, once, by the host application:
//!
//! - **Logs**: a `tracing-subscriber` fmt layer, JSON or human-readable,
//!   filtered by `RUST_LOG` or the configured level
//! - **Traces**: an OTLP/gRPC span exporter bridged through
//!   `tracing-opentelemetry`
//! - **Metrics**: an OTLP/gRPC meter provider with a periodic reader
//!
//! ```rust,no_run
//! use segsync_core::ObservabilityConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ObservabilityConfig::new("segsync-watch")
//!         .with_endpoint("http://localhost:4317")
//!         .with_log_level("debug");
//!
//!     segsync_core::init_observability(config).expect("telemetry init");
//!     // ...
//!     segsync_core::shutdown_observability();
//! }
//! ```

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How often the meter provider pushes aggregated metrics
const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Telemetry configuration
///
/// Defaults read `OTEL_EXPORTER_OTLP_ENDPOINT` and `RUST_LOG` from the
/// environment. Traces and metrics are off by default so a bare client never
/// tries to reach a collector; logs are on.
///
/// ```rust
/// use segsync_core::ObservabilityConfig;
///
/// let config = ObservabilityConfig::new("dashboard")
///     .with_traces(true)
///     .with_json_logs(false);
/// assert!(config.enable_traces);
/// assert!(!config.enable_metrics);
/// ```
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// `service.name` resource attribute
    pub service_name: String,
    /// `service.version` resource attribute
    pub service_version: String,
    /// OTLP gRPC collector endpoint
    pub otlp_endpoint: String,
    /// Export spans over OTLP
    pub enable_traces: bool,
    /// Export metrics over OTLP
    pub enable_metrics: bool,
    /// Install the local fmt layer
    pub enable_logs: bool,
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "segsync".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_traces: false,
            enable_metrics: false,
            enable_logs: true,
            json_logs: true,
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

impl ObservabilityConfig {
    /// Defaults with a custom service name
    ///
    /// Everything else comes from [`Default`], so the environment still
    /// decides the endpoint and log filter.
    ///
    /// # Arguments
    ///
    /// * `service_name` - Reported as `service.name` on every span and metric
    ///
    /// # Examples
    ///
    /// ```rust
    /// use segsync_core::ObservabilityConfig;
    ///
    /// let config = ObservabilityConfig::new("scoreboard");
    /// assert_eq!(config.service_name, "scoreboard");
    /// assert!(config.enable_logs);
    /// ```
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the OTLP collector endpoint
    ///
    /// Only used when traces or metrics are enabled.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Full gRPC URL, e.g. "http://collector:4317"
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    /// Set the fallback log filter
    ///
    /// `RUST_LOG` wins when it is set.
    ///
    /// # Arguments
    ///
    /// * `level` - An `EnvFilter` directive such as "warn" or
    ///   "segsync_client=debug,info"
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the reported service version
    ///
    /// # Arguments
    ///
    /// * `version` - Reported as `service.version`; defaults to the crate version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// Enable or disable span export
    ///
    /// # Arguments
    ///
    /// * `enable` - true to export `#[instrument]` spans over OTLP
    pub fn with_traces(mut self, enable: bool) -> Self {
        self.enable_traces = enable;
        self
    }

    /// Enable or disable metric export
    ///
    /// The client's request, latency and reconnect instruments only leave the
    /// process when this is on.
    ///
    /// # Arguments
    ///
    /// * `enable` - true to install the OTLP meter provider
    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    /// Enable or disable local log output
    ///
    /// # Arguments
    ///
    /// * `enable` - false installs no fmt layer at all
    pub fn with_logs(mut self, enable: bool) -> Self {
        self.enable_logs = enable;
        self
    }

    /// Choose between JSON and human-readable log lines
    ///
    /// # Arguments
    ///
    /// * `json` - true for one JSON object per line, false for plain text
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes(vec![
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    self.service_name.clone(),
                ),
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    self.service_version.clone(),
                ),
            ])
            .build()
    }
}

/// Install the configured telemetry pipeline
///
/// Sets up the span exporter and the meter provider when enabled, then
/// installs the global `tracing` subscriber with the env filter, the optional
/// OpenTelemetry layer and the log layer.
///
/// Call once at startup. A second call fails because the global subscriber
/// is already set. `ClientBuilder::with_observability` in segsync-client
/// calls this for you.
///
/// # Arguments
///
/// * `config` - What to enable and where to export it
///
/// # Returns
///
/// - `Ok(())`: the subscriber and any requested providers are installed
/// - `Err(e)`: an exporter could not be built, the log filter did not parse,
///   or a global subscriber already exists
///
/// # Examples
///
/// ```rust,no_run
/// use segsync_core::{init_observability, ObservabilityConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// init_observability(
///     ObservabilityConfig::new("scoreboard")
///         .with_json_logs(false)
///         .with_metrics(true),
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn init_observability(config: ObservabilityConfig) -> Result<(), BoxError> {
    let tracer = if config.enable_traces {
        Some(init_tracer(&config)?)
    } else {
        None
    };

    if config.enable_metrics {
        init_metrics(&config)?;
    }

    init_tracing_subscriber(&config, tracer)?;

    tracing::info!(
        service_name = %config.service_name,
        otlp_endpoint = %config.otlp_endpoint,
        traces = config.enable_traces,
        metrics = config.enable_metrics,
        "telemetry initialized"
    );

    Ok(())
}

fn init_tracer(config: &ObservabilityConfig) -> Result<opentelemetry_sdk::trace::Tracer, BoxError> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(config.resource())
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .build();

    let tracer = provider.tracer(config.service_name.clone());
    global::set_tracer_provider(provider);
    Ok(tracer)
}

fn init_metrics(config: &ObservabilityConfig) -> Result<(), BoxError> {
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(METRIC_EXPORT_INTERVAL)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(config.resource())
        .build();

    global::set_meter_provider(provider);
    Ok(())
}

fn init_tracing_subscriber(
    config: &ObservabilityConfig,
    tracer: Option<opentelemetry_sdk::trace::Tracer>,
) -> Result<(), BoxError> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let telemetry_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    let json_layer = (config.enable_logs && config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .json()
    });
    let text_layer = (config.enable_logs && !config.json_logs)
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;

    Ok(())
}

/// Flush and release telemetry providers
///
/// Providers flush on drop in the 0.30 SDK; this only marks the point in the
/// log stream. Safe to call more than once, or without a prior init.
///
/// # Examples
///
/// ```rust
/// segsync_core::shutdown_observability();
/// ```
pub fn shutdown_observability() {
    tracing::info!("telemetry shutdown");
}
