//! Producer side of a bus channel.

use crate::bus::MessageBus;
use crate::telemetry::Telemetry;
use calcbus_wire::{CalculationJob, Envelope, Result};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute as semconv;
use std::sync::Arc;

/// The `messaging.system` span attribute shared by both sides of the bus.
pub(crate) const MESSAGING_SYSTEM_NAME: &str = "calcbus";

/// Publishes calculation jobs to a single named channel.
///
/// Every publish starts a producer span, injects the trace context into the
/// envelope attributes, and resolves only after the bus durably accepts the
/// message. Failures are recorded on the span and returned; retry policy
/// belongs to the caller, never to the publisher.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    telemetry: Arc<Telemetry>,
    channel: String,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        telemetry: Arc<Telemetry>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            telemetry,
            channel: channel.into(),
        }
    }

    /// The channel this publisher sends on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes `job` and returns the bus-assigned message id.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be encoded or the bus refuses the
    /// message. The error is also recorded on the producer span.
    pub async fn publish(&self, cx: &Context, job: &CalculationJob) -> Result<String> {
        self.publish_with_attributes(cx, job, []).await
    }

    /// Publishes `job` with additional domain attributes on the envelope.
    ///
    /// # Errors
    ///
    /// As [`Publisher::publish`]; additionally rejects attributes whose keys
    /// collide with the reserved trace-context namespace.
    pub async fn publish_with_attributes(
        &self,
        cx: &Context,
        job: &CalculationJob,
        attributes: impl IntoIterator<Item = (String, String)>,
    ) -> Result<String> {
        let mut envelope = Envelope::new(job.encode()?);
        for (key, value) in attributes {
            envelope.insert_attribute(key, value)?;
        }

        let tracer = self.telemetry.tracer();
        let span = tracer
            .span_builder(format!("{} send", self.channel))
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new(semconv::MESSAGING_SYSTEM, MESSAGING_SYSTEM_NAME),
                KeyValue::new(semconv::MESSAGING_DESTINATION_NAME, self.channel.clone()),
            ])
            .start_with_context(tracer, cx);
        let send_cx = cx.with_span(span);

        self.telemetry
            .inject_context(&send_cx, envelope.attributes_mut());

        let outcome = self.bus.publish(&self.channel, envelope).await;
        let span = send_cx.span();
        match outcome {
            Ok(message_id) => {
                span.set_attribute(KeyValue::new(
                    semconv::MESSAGING_MESSAGE_ID,
                    message_id.clone(),
                ));
                span.end();
                tracing::debug!(channel = %self.channel, %message_id, id = job.id, "message published");
                Ok(message_id)
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::error(err.to_string()));
                span.end();
                Err(err)
            }
        }
    }
}
