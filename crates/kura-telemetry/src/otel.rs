//! OTel internals: tracing layer and sampling.
//!
//! The OTLP exporter uses tonic, so [`otel_layer`] must be called from inside
//! a Tokio runtime.

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

/// Shuts down the tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and its guard.
///
/// The layer plugs into `tracing_subscriber::registry()`. Hold the guard for
/// the lifetime of the program so spans get flushed.
pub fn otel_layer<S>(service_name: &str) -> anyhow::Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard)>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(KuraSampler)
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("kura");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((layer, OtelGuard { provider }))
}

/// Sampler with rates picked by span name prefix.
///
/// | Prefix    | Rate | Notes                                  |
/// |-----------|------|----------------------------------------|
/// | `gc.*`    | 100% | Rare, and sweeps are worth seeing       |
/// | `sync.*`  |  1%  | One span per frame, very high volume    |
/// | `fs.*`    | 10%  | File reads and writes                   |
/// | errors    | 100% |                                        |
/// | other     | 10%  |                                        |
#[derive(Debug, Clone)]
struct KuraSampler;

impl KuraSampler {
    fn rate(name: &str) -> f64 {
        if name.starts_with("gc") {
            1.0
        } else if name.starts_with("sync") {
            0.01
        } else {
            0.1
        }
    }
}

impl ShouldSample for KuraSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        // Keep traces whole once the parent is sampled
        if let Some(cx) = parent_context {
            let parent_span = cx.span();
            let parent_ctx = parent_span.span_context();
            if parent_ctx.is_sampled() {
                return SamplingResult {
                    decision: SamplingDecision::RecordAndSample,
                    attributes: vec![],
                    trace_state: parent_ctx.trace_state().clone(),
                };
            }
        }

        let is_error = attributes.iter().any(|kv| {
            (kv.key.as_str() == "otel.status_code" && kv.value.as_str() == "ERROR")
                || (kv.key.as_str() == "error" && kv.value.as_str() == "true")
        });
        if is_error {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: vec![],
                trace_state: TraceState::default(),
            };
        }

        Sampler::TraceIdRatioBased(Self::rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_by_prefix() {
        assert_eq!(KuraSampler::rate("gc.sweep"), 1.0);
        assert_eq!(KuraSampler::rate("sync.push_rx"), 0.01);
        assert_eq!(KuraSampler::rate("fs.write_file"), 0.1);
        assert_eq!(KuraSampler::rate("whatever"), 0.1);
    }

    #[test]
    fn test_errors_always_sampled() {
        let result = KuraSampler.should_sample(
            None,
            TraceId::from_bytes([7; 16]),
            "sync.push_rx",
            &SpanKind::Internal,
            &[KeyValue::new("error", "true")],
            &[],
        );
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }
}
