//! Telemetry lifecycle: tracer provider, tracer, and trace propagators.
//!
//! [`Telemetry`] is an explicitly constructed value, created once at process
//! start and passed into every component that produces spans or moves trace
//! context across the bus. Nothing here touches `opentelemetry::global`;
//! substituting a differently configured instance (or several, in tests
//! simulating separate processes) is always possible.
//!
//! ## Exporters
//!
//! - `stdout`: human-readable span dump via `opentelemetry-stdout`.
//! - `otlp`: OTLP/gRPC export via `opentelemetry-otlp`; the endpoint comes
//!   from the standard `OTEL_EXPORTER_OTLP_*` environment variables.
//!
//! Both can be enabled at once; each gets its own batch processor. Without
//! either, no spans leave the process, but they still carry valid sampled
//! span contexts, so propagation works with zero infrastructure.
//!
//! Tear down with [`Telemetry::shutdown`] to flush batched spans before the
//! process exits.

use crate::propagation::{AttributeExtractor, AttributeInjector};
use calcbus_wire::{Error, Result};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TracerProvider;
use opentelemetry::{Context, InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions as semvcns;
use std::collections::HashMap;

/// Explicitly constructed telemetry context shared by pipeline components.
///
/// Holds the tracer every span goes through and the propagators that encode
/// and decode trace context on envelope attributes.
pub struct Telemetry {
    provider: sdktrace::SdkTracerProvider,
    tracer: sdktrace::SdkTracer,
    trace_propagator: TraceContextPropagator,
    baggage_propagator: BaggagePropagator,
}

impl Telemetry {
    /// Builds the tracer provider, tracer, and propagators for this process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Telemetry`] if a configured exporter cannot be
    /// constructed.
    pub fn new(service_name: impl Into<String>) -> Result<Self> {
        let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name.into()));

        #[cfg(feature = "stdout")]
        let builder = {
            use opentelemetry_stdout::SpanExporter;
            let exporter = SpanExporter::default();
            let batch = sdktrace::BatchSpanProcessor::builder(exporter)
                .with_batch_config(
                    sdktrace::BatchConfigBuilder::default()
                        .with_scheduled_delay(core::time::Duration::from_secs(5))
                        .with_max_queue_size(2048)
                        .build(),
                )
                .build();
            builder.with_span_processor(batch)
        };

        #[cfg(feature = "otlp")]
        let builder = {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .build()
                .map_err(|err| Error::Telemetry {
                    context: format!("failed to build OTLP span exporter: {err}"),
                })?;
            let batch = sdktrace::BatchSpanProcessor::builder(exporter)
                .with_batch_config(
                    sdktrace::BatchConfigBuilder::default()
                        .with_scheduled_delay(core::time::Duration::from_secs(5))
                        .with_max_queue_size(2048)
                        .build(),
                )
                .build();
            builder.with_span_processor(batch)
        };

        let provider = builder.build();

        let scope = InstrumentationScope::builder("calcbus")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        let tracer = provider.tracer_with_scope(scope);

        Ok(Self {
            provider,
            tracer,
            trace_propagator: TraceContextPropagator::new(),
            baggage_propagator: BaggagePropagator::new(),
        })
    }

    /// The tracer all pipeline spans are created from.
    pub fn tracer(&self) -> &sdktrace::SdkTracer {
        &self.tracer
    }

    /// Writes the trace context of `cx` into `attributes`.
    ///
    /// Only the reserved trace keys are written; unrelated attributes are
    /// left untouched. Injecting the same context twice is idempotent.
    pub fn inject_context(&self, cx: &Context, attributes: &mut HashMap<String, String>) {
        let mut carrier = AttributeInjector(attributes);
        self.trace_propagator.inject_context(cx, &mut carrier);
        self.baggage_propagator.inject_context(cx, &mut carrier);
    }

    /// Reads a trace context back out of `attributes`.
    ///
    /// If no trace keys are present, the returned context has no remote
    /// parent and a fresh trace starts downstream.
    pub fn extract_context(&self, attributes: &HashMap<String, String>) -> Context {
        let carrier = AttributeExtractor(attributes);
        let cx = self.trace_propagator.extract(&carrier);
        self.baggage_propagator.extract_with_context(&cx, &carrier)
    }

    /// Flushes batched spans and shuts the provider down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Telemetry`] if the flush or shutdown fails.
    pub fn shutdown(&self) -> Result<()> {
        self.provider.force_flush().map_err(|err| Error::Telemetry {
            context: format!("flush: {err}"),
        })?;
        self.provider.shutdown().map_err(|err| Error::Telemetry {
            context: format!("shutdown: {err}"),
        })
    }
}

fn resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}
