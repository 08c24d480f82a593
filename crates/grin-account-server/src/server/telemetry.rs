//! Structured logging and optional OpenTelemetry metrics.
//!
//! Events are always printed to stdout through `tracing_subscriber::fmt` in
//! the pretty format with thread ids, source locations and RFC 3339 local
//! timestamps. The filter is read from `RUST_LOG` and defaults to `info`.
//!
//! ## Feature matrix
//!
//! - `metrics`: counts rejected calls, recovered panics and ejected
//!   dependency endpoints through an OpenTelemetry meter.
//! - `stdout`: exports those metrics to stdout every five seconds.
//!
//! Without `metrics` every `increment_*` function compiles to a no-op.
//!
//! ```bash
//! cargo run --features metrics,stdout
//! ```

// Disallow using `stdout` without `metrics`
#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires 'metrics' to be enabled.");

use grin_account_core::AuthError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Meter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

/// Exporter handles that must outlive the server so buffered data can be
/// flushed on exit.
pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops every exporter. Failures are logged, not returned.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                tracing::warn!(%err, "failed to flush metrics");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                tracing::warn!(%err, "failed to shut down meter provider");
            }
        }
    }
}

/// Installs the global subscriber and, with `metrics`, the meter provider.
///
/// # Errors
///
/// Fails if a global subscriber was already installed.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        init_metric_handles(&opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let reader = sdkmetrics::PeriodicReader::builder(MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static AUTH_REJECTIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static PANICS_RECOVERED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ENDPOINT_EJECTIONS: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = AUTH_REJECTIONS.set(
        meter
            .u64_counter("auth_rejections")
            .with_description("Calls rejected by the authentication layer")
            .build(),
    );

    let _ = PANICS_RECOVERED.set(
        meter
            .u64_counter("panics_recovered")
            .with_description("Handler panics turned into INTERNAL replies")
            .build(),
    );

    let _ = ENDPOINT_EJECTIONS.set(
        meter
            .u64_counter("endpoint_ejections")
            .with_description("Dependency endpoints taken out of rotation after a failure")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_auth_rejections(reason: AuthError) {
    if let Some(counter) = AUTH_REJECTIONS.get() {
        counter.add(1, &[KeyValue::new("kind", reason.kind())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_auth_rejections(_reason: AuthError) {}

#[cfg(feature = "metrics")]
pub fn increment_panics_recovered(stage: &'static str) {
    if let Some(counter) = PANICS_RECOVERED.get() {
        counter.add(1, &[KeyValue::new("stage", stage)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_panics_recovered(_stage: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_endpoint_ejections(service: &str) {
    if let Some(counter) = ENDPOINT_EJECTIONS.get() {
        counter.add(1, &[KeyValue::new("service", service.to_string())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_endpoint_ejections(_service: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_safe_before_init() {
        increment_auth_rejections(AuthError::Expired);
        increment_panics_recovered("building the response");
        increment_endpoint_ejections("grin-captcha-service");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn counters_record_with_attributes() {
        let provider = sdkmetrics::SdkMeterProvider::builder().build();
        init_metric_handles(&opentelemetry::metrics::MeterProvider::meter(
            &provider, "test",
        ));

        increment_auth_rejections(AuthError::MissingToken);
        increment_panics_recovered("streaming the body");
        increment_endpoint_ejections("grin-captcha-service");

        assert!(AUTH_REJECTIONS.get().is_some());
        assert!(PANICS_RECOVERED.get().is_some());
        assert!(ENDPOINT_EJECTIONS.get().is_some());
        assert!(provider.shutdown().is_ok());
    }
}
