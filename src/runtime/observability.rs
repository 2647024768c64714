//! Structured logging setup and worker metrics.
//!
//! Counters are always kept as atomics for [`MetricsSnapshot`]. With the
//! `observability` feature they are also exported through OpenTelemetry meters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    #[default]
    Compact,
}

/// Logging and metrics configuration.
///
/// ```rust,no_run
/// # use durabletask_worker::runtime::observability::{init_logging, LogFormat, ObservabilityConfig};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// init_logging(&config).ok();
///
/// // OTLP metrics export (requires the `observability` feature)
/// let config = ObservabilityConfig {
///     metrics_enabled: true,
///     metrics_export_endpoint: Some("http://localhost:4317".to_string()),
///     service_name: "order-worker".to_string(),
///     ..Default::default()
/// };
/// ```
///
/// `RUST_LOG`, when set, overrides `log_level`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level for this crate's targets (e.g. "info", "debug").
    pub log_level: String,
    /// Export counters through OpenTelemetry. Ignored without the `observability` feature.
    pub metrics_enabled: bool,
    /// OTLP gRPC endpoint. Without one, meters are recorded but never exported.
    pub metrics_export_endpoint: Option<String>,
    pub metrics_export_interval_ms: u64,
    pub service_name: String,
    pub service_version: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_export_endpoint: None,
            metrics_export_interval_ms: 60_000,
            service_name: "durabletask-worker".to_string(),
            service_version: None,
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,durabletask_worker={level}")
}

/// Install a global `tracing` subscriber.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of the worker's counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub orchestration_turns: u64,
    pub orchestration_completions: u64,
    pub orchestration_failures: u64,
    pub orchestration_abandons: u64,
    pub activity_successes: u64,
    pub activity_failures: u64,
    pub session_hits: u64,
}

#[cfg(feature = "observability")]
mod otel_impl {
    use super::ObservabilityConfig;
    use opentelemetry::KeyValue;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _};
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::metrics::{ManualReader, PeriodicReader, SdkMeterProvider};
    use std::time::Duration;

    /// OpenTelemetry instruments mirroring the worker counters.
    pub(crate) struct OtelMeters {
        meter_provider: SdkMeterProvider,
        orchestration_turns_total: Counter<u64>,
        orchestration_completions_total: Counter<u64>,
        orchestration_abandons_total: Counter<u64>,
        activity_executions_total: Counter<u64>,
        activity_duration_seconds: Histogram<f64>,
        session_hits_total: Counter<u64>,
    }

    impl OtelMeters {
        pub(crate) fn new(config: &ObservabilityConfig) -> Result<Self, String> {
            let resource = Resource::new(vec![
                KeyValue::new("service.name", config.service_name.clone()),
                KeyValue::new(
                    "service.version",
                    config.service_version.clone().unwrap_or_else(|| "unknown".to_string()),
                ),
            ]);

            let meter_provider = if let Some(ref endpoint) = config.metrics_export_endpoint {
                let exporter = opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()
                    .map_err(|e| format!("Failed to create metrics exporter: {e}"))?;
                let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
                    .with_interval(Duration::from_millis(config.metrics_export_interval_ms))
                    .build();
                SdkMeterProvider::builder()
                    .with_reader(reader)
                    .with_resource(resource)
                    .build()
            } else {
                SdkMeterProvider::builder()
                    .with_reader(ManualReader::builder().build())
                    .with_resource(resource)
                    .build()
            };

            let meter = meter_provider.meter("durabletask_worker");
            Ok(Self {
                orchestration_turns_total: meter
                    .u64_counter("durabletask_orchestration_turns_total")
                    .with_description("Orchestration work items executed")
                    .build(),
                orchestration_completions_total: meter
                    .u64_counter("durabletask_orchestration_completions_total")
                    .with_description("Orchestrations that reached a terminal state")
                    .build(),
                orchestration_abandons_total: meter
                    .u64_counter("durabletask_orchestration_abandons_total")
                    .with_description("Orchestration work items handed back to the backend")
                    .build(),
                activity_executions_total: meter
                    .u64_counter("durabletask_activity_executions_total")
                    .with_description("Activity executions by outcome")
                    .build(),
                activity_duration_seconds: meter
                    .f64_histogram("durabletask_activity_duration_seconds")
                    .with_description("Activity execution time (wall clock)")
                    .with_boundaries(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0])
                    .build(),
                session_hits_total: meter
                    .u64_counter("durabletask_session_hits_total")
                    .with_description("Work items served by a cached executor")
                    .build(),
                meter_provider,
            })
        }

        pub(crate) fn record_turn(&self) {
            self.orchestration_turns_total.add(1, &[]);
        }

        pub(crate) fn record_orchestration_outcome(&self, failed: bool) {
            let status = if failed { "failed" } else { "completed" };
            self.orchestration_completions_total
                .add(1, &[KeyValue::new("status", status)]);
        }

        pub(crate) fn record_abandon(&self) {
            self.orchestration_abandons_total.add(1, &[]);
        }

        pub(crate) fn record_activity(&self, name: &str, succeeded: bool, duration: Duration) {
            let outcome = if succeeded { "success" } else { "failure" };
            self.activity_executions_total.add(
                1,
                &[
                    KeyValue::new("activity_name", name.to_string()),
                    KeyValue::new("outcome", outcome),
                ],
            );
            self.activity_duration_seconds.record(
                duration.as_secs_f64(),
                &[KeyValue::new("activity_name", name.to_string())],
            );
        }

        pub(crate) fn record_session_hit(&self) {
            self.session_hits_total.add(1, &[]);
        }

        pub(crate) fn shutdown(&self) -> Result<(), String> {
            self.meter_provider
                .shutdown()
                .map_err(|e| format!("Failed to shutdown metrics provider: {e}"))
        }
    }
}

/// Worker counters. The atomics back [`MetricsSnapshot`]; OpenTelemetry meters,
/// when enabled, receive the same events with labels.
#[derive(Default)]
pub(crate) struct WorkerMetrics {
    orchestration_turns: AtomicU64,
    orchestration_completions: AtomicU64,
    orchestration_failures: AtomicU64,
    orchestration_abandons: AtomicU64,
    activity_successes: AtomicU64,
    activity_failures: AtomicU64,
    session_hits: AtomicU64,
    #[cfg(feature = "observability")]
    otel: Option<otel_impl::OtelMeters>,
}

impl fmt::Debug for WorkerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerMetrics")
            .field("snapshot", &self.snapshot())
            .field("otel", &self.otel_enabled())
            .finish()
    }
}

impl WorkerMetrics {
    /// Counters for a worker started with `config`. Meters are only created when
    /// the `observability` feature is on and `metrics_enabled` is set.
    #[cfg(feature = "observability")]
    pub(crate) fn new(config: Option<&ObservabilityConfig>) -> Self {
        let otel = match config.filter(|c| c.metrics_enabled) {
            Some(config) => match otel_impl::OtelMeters::new(config) {
                Ok(meters) => Some(meters),
                Err(e) => {
                    tracing::warn!(error = %e, "OpenTelemetry metrics disabled");
                    None
                }
            },
            None => None,
        };
        Self {
            otel,
            ..Self::default()
        }
    }

    #[cfg(not(feature = "observability"))]
    pub(crate) fn new(config: Option<&ObservabilityConfig>) -> Self {
        if config.is_some_and(|c| c.metrics_enabled) {
            tracing::debug!("metrics_enabled requires the `observability` feature; keeping in-process counters only");
        }
        Self::default()
    }

    pub(crate) fn otel_enabled(&self) -> bool {
        #[cfg(feature = "observability")]
        {
            self.otel.is_some()
        }
        #[cfg(not(feature = "observability"))]
        {
            false
        }
    }

    pub(crate) fn record_turn(&self) {
        self.orchestration_turns.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "observability")]
        if let Some(otel) = &self.otel {
            otel.record_turn();
        }
    }

    pub(crate) fn record_orchestration_outcome(&self, failed: bool) {
        if failed {
            self.orchestration_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.orchestration_completions.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(feature = "observability")]
        if let Some(otel) = &self.otel {
            otel.record_orchestration_outcome(failed);
        }
    }

    pub(crate) fn record_abandon(&self) {
        self.orchestration_abandons.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "observability")]
        if let Some(otel) = &self.otel {
            otel.record_abandon();
        }
    }

    pub(crate) fn record_activity(&self, name: &str, succeeded: bool, duration: Duration) {
        if succeeded {
            self.activity_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.activity_failures.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(feature = "observability")]
        if let Some(otel) = &self.otel {
            otel.record_activity(name, succeeded, duration);
        }
        #[cfg(not(feature = "observability"))]
        let _ = (name, duration);
    }

    pub(crate) fn record_session_hit(&self) {
        self.session_hits.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "observability")]
        if let Some(otel) = &self.otel {
            otel.record_session_hit();
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orchestration_turns: self.orchestration_turns.load(Ordering::Relaxed),
            orchestration_completions: self.orchestration_completions.load(Ordering::Relaxed),
            orchestration_failures: self.orchestration_failures.load(Ordering::Relaxed),
            orchestration_abandons: self.orchestration_abandons.load(Ordering::Relaxed),
            activity_successes: self.activity_successes.load(Ordering::Relaxed),
            activity_failures: self.activity_failures.load(Ordering::Relaxed),
            session_hits: self.session_hits.load(Ordering::Relaxed),
        }
    }

    /// Flush and stop the meter provider, if any.
    pub(crate) fn shutdown(&self) {
        #[cfg(feature = "observability")]
        if let Some(otel) = &self.otel {
            if let Err(e) = otel.shutdown() {
                tracing::warn!(error = %e, "metrics shutdown failed");
            }
        }
    }
}
