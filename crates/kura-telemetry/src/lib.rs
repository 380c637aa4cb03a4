//! Tracing setup for kura.
//!
//! [`init_tracing`] installs a `tracing_subscriber` registry with an
//! `EnvFilter` (`RUST_LOG`, default `info`) and a formatter writing to stderr.
//!
//! # OpenTelemetry
//!
//! Built with the `telemetry` feature, spans are also exported over OTLP when
//! the standard OTel environment variables ask for it:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 kura ls /
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Check whether OTel export should be enabled.
///
/// Returns `true` when standard OTel env vars indicate export is desired:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }

    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Keeps exporters alive. Hold it until the program exits.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "telemetry")]
    _otel: Option<OtelGuard>,
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard").finish_non_exhaustive()
    }
}

/// Install the global tracing subscriber for `service`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed, or if the OTLP
/// exporter cannot be built.
pub fn init_tracing(service: &str) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    if otel_enabled() {
        let (layer, guard) = otel_layer(service)?;
        registry.with(layer).try_init()?;
        tracing::debug!(service, "tracing initialized with OTLP export");
        return Ok(TelemetryGuard { _otel: Some(guard) });
    }

    registry.try_init()?;
    tracing::debug!(service, "tracing initialized");
    Ok(TelemetryGuard::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Whichever test installs first wins; a second install must error
        let first = init_tracing("kura-test");
        let second = init_tracing("kura-test");
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}
